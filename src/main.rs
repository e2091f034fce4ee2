//! Entrypoint: set up tracing, load settings, start the metrics & health
//! server, and run archive passes for the configured account.
//!
//! Settings (`config.rs`) provide:
//!  - `xrpc_host` / `actor`  – where the author feed is read from
//!  - `time_zone`            – zone daily partitions are cut in
//!  - `storage`              – S3 bucket, local directory, or a single file
//!  - `archive_interval`     – repeat period; absent means a single pass
//!  - `server_bind`          – optional HTTP bind for `/metrics` and `/healthz`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};
use tracing_subscriber::{fmt, EnvFilter};

use rust_feed_archiver::config::{Settings, StorageSettings};
use rust_feed_archiver::errors::ArchiveError;
use rust_feed_archiver::http;
use rust_feed_archiver::model::{ArchiveState, Watermark};
use rust_feed_archiver::pipeline::Pipeline;
use rust_feed_archiver::scanner::Scanner;
use rust_feed_archiver::sink::{DailyFileSink, DailyObjectSink, JsonLinesSink, RecordSink};
use rust_feed_archiver::source::XrpcFeedSource;
use rust_feed_archiver::state::{ObjectStateStore, StateStore};
use rust_feed_archiver::store::{FsStore, S3Store};

/// Application entrypoint for the feed archiver.
///
/// **Workflow**:
/// 1. Initialise tracing/logging from `RUST_LOG` (or default to `info`).
/// 2. Load `Config.toml` (and apply any `APP__…` env-var overrides).
/// 3. Wire Ctrl-C to a cancellation token checked between feed pages.
/// 4. Launch the `/metrics` + `/healthz` server if `server_bind` is set.
/// 5. Run an archive pass, then repeat every `archive_interval` if one is set.
#[tokio::main]
async fn main() -> Result<()> {
    // ───────────────────────────────────────────────────────────────
    // 1. Initialise tracing / logging
    // ───────────────────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
    info!("Starting feed archiver…");

    // ───────────────────────────────────────────────────────────────
    // 2. Load configuration
    // ───────────────────────────────────────────────────────────────
    let settings = Settings::new().context("loading configuration")?;
    info!(?settings.storage, actor = %settings.actor, zone = %settings.time_zone, "Loaded configuration");

    // ───────────────────────────────────────────────────────────────
    // 3. Cancellation
    // ───────────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current page");
                cancel.cancel();
            }
        });
    }

    // ───────────────────────────────────────────────────────────────
    // 4. HTTP server for metrics & health
    // ───────────────────────────────────────────────────────────────
    if let Some(bind) = &settings.server_bind {
        let addr: SocketAddr = bind
            .parse()
            .with_context(|| format!("invalid `server_bind` {bind}"))?;
        tokio::spawn(http::serve(addr, cancel.clone()));
    }

    // ───────────────────────────────────────────────────────────────
    // 5. Archive loop
    // ───────────────────────────────────────────────────────────────
    let Some(period) = settings.archive_interval else {
        return archive_once(&settings, &cancel).await;
    };

    let mut ticker = interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }
        match archive_once(&settings, &cancel).await {
            Ok(()) => {}
            Err(e) if matches!(e.downcast_ref::<ArchiveError>(), Some(ArchiveError::Cancelled)) => {
                info!("Archive pass cancelled");
            }
            Err(e) => error!(error = ?e, "Archive pass failed"),
        }
    }

    info!("Feed archiver stopped");
    Ok(())
}

/// One pass: load the watermark, scan the feed into the configured sink,
/// surface touched keys, and persist the next watermark.
async fn archive_once(settings: &Settings, cancel: &CancellationToken) -> Result<()> {
    let pass_start = Instant::now();
    let span = info_span!("archive", actor = %settings.actor);
    let zone = settings.zone()?;
    let base_dir = settings.base_dir();

    let source = XrpcFeedSource::new(&settings.xrpc_host, &settings.actor)?
        .with_access_token(settings.access_token.clone());
    let scanner = Scanner::new(source, info_span!(parent: &span, "scanner"));
    let sink_span = info_span!(parent: &span, "sink");

    // Single-file mode keeps no state: every pass re-downloads the whole feed.
    let (states, sink): (Option<Box<dyn StateStore>>, Box<dyn RecordSink>) =
        match &settings.storage {
            StorageSettings::S3(s3) => {
                let store = Arc::new(S3Store::from_settings(s3).await);
                let states = ObjectStateStore::new(store.clone(), base_dir);
                let watermark = load_watermark(&states, &settings.actor).await?;
                let sink = DailyObjectSink::new(store, base_dir, zone, sink_span)
                    .with_watermark(watermark);
                (
                    Some(Box::new(states) as Box<dyn StateStore>),
                    Box::new(sink) as Box<dyn RecordSink>,
                )
            }
            StorageSettings::Local { dir } => {
                let states = ObjectStateStore::new(FsStore::new(dir), "");
                let watermark = load_watermark(&states, &settings.actor).await?;
                let sink = DailyFileSink::new(dir, zone, sink_span).with_watermark(watermark);
                (
                    Some(Box::new(states) as Box<dyn StateStore>),
                    Box::new(sink) as Box<dyn RecordSink>,
                )
            }
            StorageSettings::SingleFile { path } => {
                let file = tokio::fs::File::create(path)
                    .await
                    .with_context(|| format!("creating {}", path.display()))?;
                let sink = JsonLinesSink::new(path.display().to_string(), file);
                (None, Box::new(sink) as Box<dyn RecordSink>)
            }
        };

    // Local sinks keep a partial pass; S3 partitions wait for the next full one.
    let close_on_failure = !matches!(settings.storage, StorageSettings::S3(_));
    let mut pipeline =
        Pipeline::new(scanner, sink, span.clone()).close_on_failure(close_on_failure);
    let outcome = pipeline.run(cancel).await.context("archive pass")?;

    if let Some(e) = &outcome.close_error {
        // records were consumed; the final partition may be missing until the next pass
        warn!(parent: &span, error = %e, "Final flush failed, continuing");
    }

    if !outcome.touched_keys.is_empty() {
        let paths: Vec<String> = outcome.touched_keys.iter().map(|k| format!("/{k}")).collect();
        info!(parent: &span, count = paths.len(), ?paths, "Paths to invalidate");
    }

    if let (Some(states), Some(first)) = (&states, &outcome.first_record) {
        states
            .save(&ArchiveState::from_watermark(&settings.actor, first))
            .await
            .context("saving archive state")?;
    }

    info!(
        parent: &span,
        appended = outcome.appended,
        latest_cid = ?outcome.first_record.as_ref().map(|w| w.cid.as_str()),
        pass_s = pass_start.elapsed().as_secs_f64(),
        "Archive pass complete"
    );
    Ok(())
}

async fn load_watermark<S: StateStore>(
    states: &S,
    actor: &str,
) -> Result<Option<Watermark>> {
    let state = states.load(actor).await.context("loading archive state")?;
    match &state {
        Some(s) => info!(latest_cid = %s.latest_cid, timestamp = s.timestamp, "Resuming"),
        None => info!("No previous state, archiving full history"),
    }
    Ok(state.map(|s| s.watermark()))
}
