//! Scanner: walks a `FeedSource` page by page until the cursor runs out.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Span};

use crate::errors::ArchiveError;
use crate::model::FeedRecord;
use crate::source::{FeedFilter, FeedSource};

/// Records requested per page.
pub const PAGE_SIZE: u32 = 100;

/// Receives each page of records in order. An error aborts the scan.
#[async_trait]
pub trait BatchHandler: Send {
    async fn handle(&mut self, batch: Vec<FeedRecord>) -> Result<(), ArchiveError>;
}

pub struct Scanner<S> {
    source: S,
    page_size: u32,
    span: Span,
}

impl<S: FeedSource> Scanner<S> {
    pub fn new(source: S, span: Span) -> Self {
        Scanner {
            source,
            page_size: PAGE_SIZE,
            span,
        }
    }

    /// Fetch pages starting from an empty cursor, handing each to `handler`.
    ///
    /// Cancellation is observed only before a page is requested; a page that
    /// is already being fetched or handled runs to completion.
    pub async fn scan(
        &self,
        cancel: &CancellationToken,
        filter: FeedFilter,
        include_pins: bool,
        handler: &mut dyn BatchHandler,
    ) -> Result<(), ArchiveError> {
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;
        loop {
            if cancel.is_cancelled() {
                debug!(parent: &self.span, pages, "scan cancelled");
                return Err(ArchiveError::Cancelled);
            }

            let page = match self
                .source
                .fetch_page(cursor.as_deref(), filter, include_pins, self.page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    error!(
                        parent: &self.span,
                        cursor = ?cursor,
                        filter = %filter,
                        include_pins,
                        limit = self.page_size,
                        error = %e,
                        "fetch_page failed"
                    );
                    return Err(e);
                }
            };
            pages += 1;
            debug!(parent: &self.span, pages, count = page.records.len(), "fetched page");

            handler.handle(page.records).await?;

            match page.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FeedPage;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Serves canned pages and remembers the cursors it was asked for.
    struct PagedSource {
        pages: Mutex<VecDeque<Result<FeedPage, ArchiveError>>>,
        cursors: Mutex<Vec<Option<String>>>,
    }

    impl PagedSource {
        fn new(pages: Vec<Result<FeedPage, ArchiveError>>) -> Self {
            PagedSource {
                pages: Mutex::new(pages.into()),
                cursors: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FeedSource for PagedSource {
        async fn fetch_page(
            &self,
            cursor: Option<&str>,
            _filter: FeedFilter,
            _include_pins: bool,
            limit: u32,
        ) -> Result<FeedPage, ArchiveError> {
            assert_eq!(limit, PAGE_SIZE);
            self.cursors.lock().unwrap().push(cursor.map(str::to_string));
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(FeedPage::default()))
        }
    }

    fn page(cids: &[&str], cursor: Option<&str>) -> Result<FeedPage, ArchiveError> {
        Ok(FeedPage {
            records: cids
                .iter()
                .map(|cid| FeedRecord::from_value(json!({"post": {"cid": cid}})).unwrap())
                .collect(),
            cursor: cursor.map(str::to_string),
        })
    }

    #[derive(Default)]
    struct Collect {
        batches: Vec<Vec<String>>,
        fail_on: Option<usize>,
        cancel_after_first: Option<CancellationToken>,
    }

    #[async_trait]
    impl BatchHandler for Collect {
        async fn handle(&mut self, batch: Vec<FeedRecord>) -> Result<(), ArchiveError> {
            if self.fail_on == Some(self.batches.len()) {
                return Err(ArchiveError::Index("k".into(), "boom".into()));
            }
            self.batches
                .push(batch.into_iter().map(|r| r.cid).collect());
            if let Some(token) = &self.cancel_after_first {
                token.cancel();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn follows_cursor_until_exhausted() {
        let source = PagedSource::new(vec![
            page(&["a", "b"], Some("c1")),
            page(&["c"], Some("c2")),
            page(&["d"], None),
        ]);
        let scanner = Scanner::new(source, Span::none());
        let mut handler = Collect::default();

        scanner
            .scan(&CancellationToken::new(), FeedFilter::PostsWithReplies, false, &mut handler)
            .await
            .unwrap();

        assert_eq!(handler.batches, vec![vec!["a", "b"], vec!["c"], vec!["d"]]);
        assert_eq!(
            *scanner.source.cursors.lock().unwrap(),
            vec![None, Some("c1".to_string()), Some("c2".to_string())]
        );
    }

    #[tokio::test]
    async fn handler_error_aborts_scan() {
        let source = PagedSource::new(vec![page(&["a"], Some("c1")), page(&["b"], None)]);
        let scanner = Scanner::new(source, Span::none());
        let mut handler = Collect {
            fail_on: Some(1),
            ..Default::default()
        };

        let err = scanner
            .scan(&CancellationToken::new(), FeedFilter::PostsWithReplies, false, &mut handler)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Index(_, _)));
        assert_eq!(handler.batches, vec![vec!["a"]]);
    }

    #[tokio::test]
    async fn source_error_is_returned_unchanged() {
        let source = PagedSource::new(vec![Err(ArchiveError::Status("u".into(), 502, "bad".into()))]);
        let scanner = Scanner::new(source, Span::none());
        let mut handler = Collect::default();

        let err = scanner
            .scan(&CancellationToken::new(), FeedFilter::PostsWithReplies, false, &mut handler)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Status(_, 502, _)));
        assert!(handler.batches.is_empty());
    }

    #[tokio::test]
    async fn cancellation_is_checked_between_pages() {
        let token = CancellationToken::new();
        let source = PagedSource::new(vec![page(&["a"], Some("c1")), page(&["b"], None)]);
        let scanner = Scanner::new(source, Span::none());
        let mut handler = Collect {
            cancel_after_first: Some(token.clone()),
            ..Default::default()
        };

        let err = scanner
            .scan(&token, FeedFilter::PostsWithReplies, false, &mut handler)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
        assert_eq!(handler.batches, vec![vec!["a"]]);
        assert_eq!(scanner.source.cursors.lock().unwrap().len(), 1);
    }
}
