//! Record sinks: where consumed feed records end up.
//!
//! Every variant shares the same capability (`consume` one record at a time,
//! `close` to finalize) and reports what it did through `SinkSummary` instead
//! of callbacks: the first record appended this run (the next run's
//! watermark) and every storage key written or merged from.

use async_trait::async_trait;
use tracing::{warn, Span};

use crate::errors::ArchiveError;
use crate::metrics::RECORDS_SKIPPED;
use crate::model::{FeedRecord, Watermark};
use crate::partition::SkipReason;

pub mod daily_file;
pub mod daily_object;
pub mod json_lines;

pub use daily_file::DailyFileSink;
pub use daily_object::DailyObjectSink;
pub use json_lines::JsonLinesSink;

#[async_trait]
pub trait RecordSink: Send {
    /// Archive one record. Records that can't or shouldn't be archived are
    /// skipped without error; only storage failures are returned.
    async fn consume(&mut self, record: &FeedRecord) -> Result<(), ArchiveError>;

    /// Flush whatever is still buffered. Safe to call when nothing is open.
    async fn close(&mut self) -> Result<(), ArchiveError>;

    fn summary(&self) -> SinkSummary;
}

#[async_trait]
impl RecordSink for Box<dyn RecordSink> {
    async fn consume(&mut self, record: &FeedRecord) -> Result<(), ArchiveError> {
        (**self).consume(record).await
    }

    async fn close(&mut self) -> Result<(), ArchiveError> {
        (**self).close().await
    }

    fn summary(&self) -> SinkSummary {
        (**self).summary()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkSummary {
    /// First record appended this run, or `None` if nothing new was seen.
    pub first_record: Option<Watermark>,
    /// Keys written over existing content or read for a merge, without duplicates.
    pub touched_keys: Vec<String>,
    pub appended: usize,
}

/// Accumulates a `SinkSummary` as a sink works.
#[derive(Debug, Default)]
pub(crate) struct RunTracker {
    summary: SinkSummary,
}

impl RunTracker {
    /// Only the first call sets the watermark.
    pub(crate) fn appended(&mut self, timestamp: i64, cid: &str) {
        if self.summary.first_record.is_none() {
            self.summary.first_record = Some(Watermark::new(timestamp, cid));
        }
        self.summary.appended += 1;
    }

    pub(crate) fn touch(&mut self, key: &str) {
        if !self.summary.touched_keys.iter().any(|k| k == key) {
            self.summary.touched_keys.push(key.to_string());
        }
    }

    pub(crate) fn summary(&self) -> SinkSummary {
        self.summary.clone()
    }
}

pub(crate) fn log_skip(span: &Span, record: &FeedRecord, reason: &SkipReason) {
    RECORDS_SKIPPED.with_label_values(&[reason.label()]).inc();
    match reason {
        SkipReason::NotPost => {
            warn!(parent: span, cid = %record.cid, kind = ?record.kind, "record is not post type")
        }
        SkipReason::BadTimestamp(err) => warn!(
            parent: span,
            cid = %record.cid,
            created_at = ?record.created_at,
            error = %err,
            "time parse error"
        ),
        SkipReason::Watermark => {
            tracing::debug!(parent: span, cid = %record.cid, "already archived")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_keeps_first_record_and_dedups_keys() {
        let mut tracker = RunTracker::default();
        tracker.appended(20, "newest");
        tracker.appended(10, "older");
        tracker.touch("a/2026/01/02");
        tracker.touch("a/2026/01/index");
        tracker.touch("a/2026/01/02");

        let summary = tracker.summary();
        assert_eq!(summary.first_record, Some(Watermark::new(20, "newest")));
        assert_eq!(summary.appended, 2);
        assert_eq!(summary.touched_keys, vec!["a/2026/01/02", "a/2026/01/index"]);
    }
}
