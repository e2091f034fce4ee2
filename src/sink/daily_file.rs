//! Daily partitions as local append-mode files: `{dir}/YYYY/MM/DD`.
//!
//! Each record is written and flushed as it arrives, so there is nothing to
//! merge on rotation and no month index.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, Span};

use crate::errors::ArchiveError;
use crate::metrics::{PARTITION_FLUSHES, RECORDS_APPENDED};
use crate::model::{FeedRecord, Watermark};
use crate::partition::{admit, Admission, PartitionDate, Zone};
use crate::sink::{log_skip, RecordSink, RunTracker, SinkSummary};

struct OpenFile {
    date: PartitionDate,
    path: PathBuf,
    file: File,
}

pub struct DailyFileSink {
    dir: PathBuf,
    zone: Zone,
    watermark: Option<Watermark>,
    open: Option<OpenFile>,
    tracker: RunTracker,
    span: Span,
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await
}

impl DailyFileSink {
    pub fn new(dir: impl Into<PathBuf>, zone: Zone, span: Span) -> Self {
        DailyFileSink {
            dir: dir.into(),
            zone,
            watermark: None,
            open: None,
            tracker: RunTracker::default(),
            span,
        }
    }

    pub fn with_watermark(mut self, watermark: Option<Watermark>) -> Self {
        self.watermark = watermark;
        self
    }

    async fn ensure_file(&mut self, date: PartitionDate) -> Result<(), ArchiveError> {
        if self.open.as_ref().map(|o| o.date) == Some(date) {
            return Ok(());
        }
        self.close().await?;

        let base = self.dir.to_string_lossy();
        let path = PathBuf::from(date.key(&base));
        let io_err = |e| ArchiveError::Io(path.display().to_string(), e);

        let file = match open_append(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
                }
                open_append(&path).await.map_err(io_err)?
            }
            Err(e) => return Err(io_err(e)),
        };

        self.tracker.touch(&path.display().to_string());
        self.open = Some(OpenFile { date, path, file });
        Ok(())
    }
}

#[async_trait]
impl RecordSink for DailyFileSink {
    async fn consume(&mut self, record: &FeedRecord) -> Result<(), ArchiveError> {
        let admitted = match admit(record, &self.zone, self.watermark.as_ref()) {
            Admission::Admit(admitted) => admitted,
            Admission::Skip(reason) => {
                log_skip(&self.span, record, &reason);
                return Ok(());
            }
        };

        if let Err(e) = self.ensure_file(admitted.date).await {
            error!(
                parent: &self.span,
                dir = %self.dir.display(),
                time = %admitted.local,
                error = %e,
                "ensure partition file failed"
            );
            return Err(e);
        }

        let line = record.to_json_line()?;
        if let Some(open) = self.open.as_mut() {
            let io_err = |e| ArchiveError::Io(open.path.display().to_string(), e);
            open.file.write_all(&line).await.map_err(io_err)?;
            open.file.flush().await.map_err(io_err)?;
        }
        self.tracker.appended(admitted.timestamp, &record.cid);
        RECORDS_APPENDED.inc();

        info!(parent: &self.span, time = ?record.created_at, cid = %record.cid, "consumed");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ArchiveError> {
        if let Some(open) = self.open.take() {
            open.file
                .sync_all()
                .await
                .map_err(|e| ArchiveError::Io(open.path.display().to_string(), e))?;
            PARTITION_FLUSHES.inc();
        }
        Ok(())
    }

    fn summary(&self) -> SinkSummary {
        self.tracker.summary()
    }
}
