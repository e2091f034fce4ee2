//! Daily partitions on an object store.
//!
//! Records for the currently open day are buffered in memory. When the day
//! changes, or on `close`, the buffer is appended to whatever the store
//! already holds for that day (read, concatenate, overwrite) and the month's
//! `day,count` index is rewritten. No locking: one archiver per account.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{debug, error, info, Span};

use crate::errors::ArchiveError;
use crate::metrics::{PARTITION_FLUSHES, RECORDS_APPENDED};
use crate::model::{FeedRecord, Watermark};
use crate::partition::{admit, Admission, MonthIndex, PartitionDate, Zone};
use crate::sink::{log_skip, RecordSink, RunTracker, SinkSummary};
use crate::store::{get_optional, PartitionStore};

struct OpenPartition {
    date: PartitionDate,
    key: String,
    buf: Vec<u8>,
    /// Set once `buf` has been merged into the stored object. A retried
    /// flush then only rewrites the index.
    written: bool,
    merged_from_existing: bool,
    prior_bytes: usize,
}

struct OpenIndex {
    date: PartitionDate,
    key: String,
    index: MonthIndex,
}

pub struct DailyObjectSink<S> {
    store: S,
    base_dir: String,
    zone: Zone,
    watermark: Option<Watermark>,
    partition: Option<OpenPartition>,
    index: Option<OpenIndex>,
    tracker: RunTracker,
    span: Span,
}

impl<S: PartitionStore> DailyObjectSink<S> {
    pub fn new(store: S, base_dir: impl Into<String>, zone: Zone, span: Span) -> Self {
        DailyObjectSink {
            store,
            base_dir: base_dir.into(),
            zone,
            watermark: None,
            partition: None,
            index: None,
            tracker: RunTracker::default(),
            span,
        }
    }

    /// Records at or before this watermark, or with its cid, are skipped.
    pub fn with_watermark(mut self, watermark: Option<Watermark>) -> Self {
        self.watermark = watermark;
        self
    }

    /// Key of the partition currently buffered, if any.
    pub fn open_key(&self) -> Option<&str> {
        self.partition.as_ref().map(|p| p.key.as_str())
    }

    async fn ensure_partition(&mut self, date: PartitionDate) -> Result<(), ArchiveError> {
        if self.partition.as_ref().map(|p| p.date) == Some(date) {
            return Ok(());
        }

        self.flush().await?;

        let month_loaded = self
            .index
            .as_ref()
            .map_or(false, |open| open.date.same_month(&date));
        if !month_loaded {
            self.index = Some(self.load_index(date).await?);
        }

        let key = date.key(&self.base_dir);
        debug!(parent: &self.span, key = %key, "opening partition");
        self.partition = Some(OpenPartition {
            date,
            key,
            buf: Vec::new(),
            written: false,
            merged_from_existing: false,
            prior_bytes: 0,
        });
        Ok(())
    }

    async fn load_index(&mut self, date: PartitionDate) -> Result<OpenIndex, ArchiveError> {
        let key = date.index_key(&self.base_dir);
        let index = match get_optional(&self.store, &key).await {
            Ok(Some(data)) => {
                self.tracker.touch(&key);
                MonthIndex::parse(&key, &data)?
            }
            Ok(None) => MonthIndex::new(),
            Err(e) => {
                error!(parent: &self.span, key = %key, error = %e, "failed to read month index");
                return Err(e.into());
            }
        };
        Ok(OpenIndex { date, key, index })
    }

    /// Append the open partition to its stored object and rewrite the month
    /// index. A failed read or partition write keeps the buffer untouched; a
    /// failed index write keeps the partition marked as written. Either way a
    /// retry appends the buffered records exactly once.
    async fn flush(&mut self) -> Result<(), ArchiveError> {
        let span = &self.span;
        let Some(partition) = self.partition.as_mut() else {
            return Ok(());
        };

        if !partition.written {
            let existing = get_optional(&self.store, &partition.key)
                .await
                .map_err(|e| {
                    error!(parent: span, key = %partition.key, error = %e, "failed to read partition");
                    ArchiveError::from(e)
                })?;

            let merged_from_existing = existing.is_some();
            let prior = existing.unwrap_or_default();
            let mut merged = BytesMut::with_capacity(prior.len() + partition.buf.len());
            merged.extend_from_slice(&prior);
            merged.extend_from_slice(&partition.buf);

            self.store
                .put(&partition.key, merged.freeze())
                .await
                .map_err(|e| {
                    error!(parent: span, key = %partition.key, error = %e, "failed to write partition");
                    ArchiveError::from(e)
                })?;
            partition.written = true;
            partition.merged_from_existing = merged_from_existing;
            partition.prior_bytes = prior.len();
        }

        let mut day_count = 0;
        if let Some(open) = &self.index {
            let table = open.index.to_csv(&open.key)?;
            self.store
                .put(&open.key, Bytes::from(table))
                .await
                .map_err(|e| {
                    error!(parent: span, key = %open.key, error = %e, "failed to write month index");
                    ArchiveError::from(e)
                })?;
            if partition.merged_from_existing {
                self.tracker.touch(&open.key);
            }
            day_count = open.index.count(partition.date.day);
        }
        if partition.merged_from_existing {
            self.tracker.touch(&partition.key);
        }

        PARTITION_FLUSHES.inc();
        info!(
            parent: span,
            key = %partition.key,
            bytes = partition.buf.len(),
            prior_bytes = partition.prior_bytes,
            day_count,
            "partition flushed"
        );
        self.partition = None;
        Ok(())
    }
}

#[async_trait]
impl<S: PartitionStore> RecordSink for DailyObjectSink<S> {
    async fn consume(&mut self, record: &FeedRecord) -> Result<(), ArchiveError> {
        let admitted = match admit(record, &self.zone, self.watermark.as_ref()) {
            Admission::Admit(admitted) => admitted,
            Admission::Skip(reason) => {
                log_skip(&self.span, record, &reason);
                return Ok(());
            }
        };

        if let Err(e) = self.ensure_partition(admitted.date).await {
            error!(
                parent: &self.span,
                base_dir = %self.base_dir,
                time = %admitted.local,
                error = %e,
                "ensure partition failed"
            );
            return Err(e);
        }

        let line = record.to_json_line()?;
        if let Some(partition) = self.partition.as_mut() {
            partition.buf.extend_from_slice(&line);
        }
        if let Some(open) = self.index.as_mut() {
            open.index.increment(admitted.date.day);
        }
        self.tracker.appended(admitted.timestamp, &record.cid);
        RECORDS_APPENDED.inc();

        info!(
            parent: &self.span,
            time = ?record.created_at,
            cid = %record.cid,
            "consumed"
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ArchiveError> {
        self.flush().await
    }

    fn summary(&self) -> SinkSummary {
        self.tracker.summary()
    }
}
