//! Prometheus metrics registry and metric definitions.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Global registry under crate namespace
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("rust_feed_archiver".into()), None)
        .expect("failed to create Prometheus registry")
});

/// Feed pages fetched
pub static PAGES_FETCHED: Lazy<IntCounter> = Lazy::new(|| {
    let opts = Opts::new("pages_fetched_total", "Total number of feed pages fetched");
    let c = IntCounter::with_opts(opts).expect("counter opts");
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

/// Histogram of page fetch+decode durations
pub static FETCH_HISTOGRAM: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "page_fetch_duration_seconds",
        "Duration of feed page fetch+decode in seconds",
    );
    let h = Histogram::with_opts(opts).expect("histogram opts");
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
});

/// Records appended to a partition
pub static RECORDS_APPENDED: Lazy<IntCounter> = Lazy::new(|| {
    let opts = Opts::new("records_appended_total", "Records appended to a partition");
    let c = IntCounter::with_opts(opts).expect("counter opts");
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

/// Records skipped, by reason
pub static RECORDS_SKIPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("records_skipped_total", "Records skipped without archiving");
    let c = IntCounterVec::new(opts, &["reason"]).expect("counter opts");
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

/// Partition flushes to the store
pub static PARTITION_FLUSHES: Lazy<IntCounter> = Lazy::new(|| {
    let opts = Opts::new("partition_flushes_total", "Partitions written back to storage");
    let c = IntCounter::with_opts(opts).expect("counter opts");
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

/// Encode all metrics as text
pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let mf = REGISTRY.gather();
    encoder.encode(&mf, &mut buffer).expect("failed to encode");
    String::from_utf8(buffer).expect("invalid utf8")
}
