//! Pipeline: binds one scanner to one sink and runs an archive pass.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Span};

use crate::errors::ArchiveError;
use crate::model::{FeedRecord, Watermark};
use crate::scanner::{BatchHandler, Scanner};
use crate::sink::RecordSink;
use crate::source::{FeedFilter, FeedSource};

/// What a completed pass produced.
#[derive(Debug, Default)]
pub struct RunOutcome {
    /// Next run's watermark; `None` when nothing new was archived.
    pub first_record: Option<Watermark>,
    pub touched_keys: Vec<String>,
    pub appended: usize,
    /// Final flush failure. The records were consumed but the last partition
    /// may not have reached storage.
    pub close_error: Option<ArchiveError>,
}

struct Feeder<'a, K: ?Sized> {
    sink: &'a mut K,
}

#[async_trait]
impl<'a, K: RecordSink + ?Sized> BatchHandler for Feeder<'a, K> {
    async fn handle(&mut self, batch: Vec<FeedRecord>) -> Result<(), ArchiveError> {
        for record in &batch {
            self.sink.consume(record).await?;
        }
        Ok(())
    }
}

pub struct Pipeline<S, K> {
    scanner: Scanner<S>,
    sink: K,
    close_on_failure: bool,
    span: Span,
}

impl<S: FeedSource, K: RecordSink> Pipeline<S, K> {
    pub fn new(scanner: Scanner<S>, sink: K, span: Span) -> Self {
        Pipeline {
            scanner,
            sink,
            close_on_failure: false,
            span,
        }
    }

    /// Close the sink even when the pass fails, keeping whatever was
    /// consumed. Suited to local sinks that write as they go.
    pub fn close_on_failure(mut self, yes: bool) -> Self {
        self.close_on_failure = yes;
        self
    }

    /// Scan posts and replies (pins excluded) into the sink, then close it.
    ///
    /// Fetch and consume errors abort the pass. The sink is left unclosed
    /// unless `close_on_failure` was set. A failed close after a clean scan
    /// is reported in the outcome rather than as an error.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<RunOutcome, ArchiveError> {
        let mut feeder = Feeder {
            sink: &mut self.sink,
        };
        let scanned = self
            .scanner
            .scan(cancel, FeedFilter::PostsWithReplies, false, &mut feeder)
            .await;
        if let Err(e) = scanned {
            if self.close_on_failure {
                if let Err(close_err) = self.sink.close().await {
                    warn!(parent: &self.span, error = %close_err, "closing sink after failed pass");
                }
            }
            return Err(e);
        }

        let close_error = match self.sink.close().await {
            Ok(()) => None,
            Err(e) => {
                warn!(parent: &self.span, error = %e, "closing sink failed");
                Some(e)
            }
        };

        let summary = self.sink.summary();
        info!(
            parent: &self.span,
            appended = summary.appended,
            touched = summary.touched_keys.len(),
            "archive pass complete"
        );
        Ok(RunOutcome {
            first_record: summary.first_record,
            touched_keys: summary.touched_keys,
            appended: summary.appended,
            close_error,
        })
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{JsonLinesSink, SinkSummary};
    use crate::source::FeedPage;
    use serde_json::json;

    struct OnePage(Vec<FeedRecord>);

    #[async_trait]
    impl FeedSource for OnePage {
        async fn fetch_page(
            &self,
            _cursor: Option<&str>,
            filter: FeedFilter,
            include_pins: bool,
            _limit: u32,
        ) -> Result<FeedPage, ArchiveError> {
            assert_eq!(filter, FeedFilter::PostsWithReplies);
            assert!(!include_pins);
            Ok(FeedPage {
                records: self.0.clone(),
                cursor: None,
            })
        }
    }

    #[derive(Default)]
    struct Recording {
        seen: Vec<String>,
        fail_consume: bool,
        fail_close: bool,
        closed: usize,
    }

    #[async_trait]
    impl RecordSink for Recording {
        async fn consume(&mut self, record: &FeedRecord) -> Result<(), ArchiveError> {
            if self.fail_consume {
                return Err(ArchiveError::Index("k".into(), "consume".into()));
            }
            self.seen.push(record.cid.clone());
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ArchiveError> {
            self.closed += 1;
            if self.fail_close {
                return Err(ArchiveError::Index("k".into(), "close".into()));
            }
            Ok(())
        }

        fn summary(&self) -> SinkSummary {
            SinkSummary {
                first_record: self.seen.first().map(|c| Watermark::new(0, c.clone())),
                touched_keys: vec![],
                appended: self.seen.len(),
            }
        }
    }

    fn records() -> Vec<FeedRecord> {
        ["x", "y"]
            .iter()
            .map(|c| FeedRecord::from_value(json!({"post": {"cid": c}})).unwrap())
            .collect()
    }

    fn pipeline(sink: Recording) -> Pipeline<OnePage, Recording> {
        Pipeline::new(
            Scanner::new(OnePage(records()), Span::none()),
            sink,
            Span::none(),
        )
    }

    #[tokio::test]
    async fn consumes_everything_then_closes() {
        let mut p = pipeline(Recording::default());
        let outcome = p.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(p.sink().seen, vec!["x", "y"]);
        assert_eq!(p.sink().closed, 1);
        assert_eq!(outcome.appended, 2);
        assert_eq!(outcome.first_record.unwrap().cid, "x");
        assert!(outcome.close_error.is_none());
    }

    #[tokio::test]
    async fn close_failure_is_reported_not_returned() {
        let mut p = pipeline(Recording {
            fail_close: true,
            ..Default::default()
        });
        let outcome = p.run(&CancellationToken::new()).await.unwrap();
        assert!(outcome.close_error.is_some());
        assert_eq!(outcome.appended, 2);
    }

    #[tokio::test]
    async fn consume_failure_aborts_without_closing() {
        let mut p = pipeline(Recording {
            fail_consume: true,
            ..Default::default()
        });
        tokio_test::assert_err!(p.run(&CancellationToken::new()).await);
        assert_eq!(p.sink().closed, 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_fetches_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let mut p = pipeline(Recording::default());
        let err = p.run(&token).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
        assert!(p.sink().seen.is_empty());
    }

    /// One good page pointing at a second page that always fails.
    struct SecondPageFails(Vec<FeedRecord>);

    #[async_trait]
    impl FeedSource for SecondPageFails {
        async fn fetch_page(
            &self,
            cursor: Option<&str>,
            _filter: FeedFilter,
            _include_pins: bool,
            _limit: u32,
        ) -> Result<FeedPage, ArchiveError> {
            match cursor {
                None => Ok(FeedPage {
                    records: self.0.clone(),
                    cursor: Some("page2".into()),
                }),
                Some(_) => Err(ArchiveError::Status("host".into(), 502, "bad gateway".into())),
            }
        }
    }

    #[tokio::test]
    async fn failed_pass_still_flushes_single_file_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        let file = tokio::fs::File::create(&path).await.unwrap();

        let mut p = Pipeline::new(
            Scanner::new(SecondPageFails(records()), Span::none()),
            JsonLinesSink::new("feed.jsonl", file),
            Span::none(),
        )
        .close_on_failure(true);
        let err = p.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Status(_, 502, _)));

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "{\"post\":{\"cid\":\"x\"}}\n{\"post\":{\"cid\":\"y\"}}\n"
        );
    }

    #[tokio::test]
    async fn consume_failure_closes_when_asked() {
        let mut p = pipeline(Recording {
            fail_consume: true,
            ..Default::default()
        })
        .close_on_failure(true);
        tokio_test::assert_err!(p.run(&CancellationToken::new()).await);
        assert_eq!(p.sink().closed, 1);
    }
}
