//! Feed Source: paginated, read-only access to one account's author feed.

use std::fmt;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::errors::ArchiveError;
use crate::metrics::{FETCH_HISTOGRAM, PAGES_FETCHED};
use crate::model::FeedRecord;

/// Upstream filter for which posts the author feed includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFilter {
    PostsWithReplies,
    PostsNoReplies,
    PostsWithMedia,
    PostsAndAuthorThreads,
}

impl FeedFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedFilter::PostsWithReplies => "posts_with_replies",
            FeedFilter::PostsNoReplies => "posts_no_replies",
            FeedFilter::PostsWithMedia => "posts_with_media",
            FeedFilter::PostsAndAuthorThreads => "posts_and_author_threads",
        }
    }
}

impl fmt::Display for FeedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One page of records plus the cursor for the next one, if any.
#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub records: Vec<FeedRecord>,
    pub cursor: Option<String>,
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        filter: FeedFilter,
        include_pins: bool,
        limit: u32,
    ) -> Result<FeedPage, ArchiveError>;
}

#[derive(Deserialize)]
struct AuthorFeedResponse {
    #[serde(default)]
    cursor: Option<String>,
    feed: Vec<Value>,
}

/// `app.bsky.feed.getAuthorFeed` over XRPC.
pub struct XrpcFeedSource {
    client: Client,
    host: String,
    actor: String,
    access_token: Option<String>,
}

impl XrpcFeedSource {
    pub fn new(host: impl Into<String>, actor: impl Into<String>) -> Result<Self, ArchiveError> {
        let host = host.into();
        let client = Client::builder()
            .user_agent(concat!("rust-feed-archiver/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ArchiveError::Fetch(host.clone(), e))?;
        Ok(XrpcFeedSource {
            client,
            host,
            actor: actor.into(),
            access_token: None,
        })
    }

    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token;
        self
    }

    fn page_url(
        &self,
        cursor: Option<&str>,
        filter: FeedFilter,
        include_pins: bool,
        limit: u32,
    ) -> String {
        let base = format!(
            "{}/xrpc/app.bsky.feed.getAuthorFeed",
            self.host.trim_end_matches('/')
        );
        let mut url = match Url::parse(&base) {
            Ok(url) => url,
            Err(_) => return base,
        };
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("actor", &self.actor)
                .append_pair("limit", &limit.to_string())
                .append_pair("filter", filter.as_str())
                .append_pair("includePins", if include_pins { "true" } else { "false" });
            if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
                query.append_pair("cursor", cursor);
            }
        }
        url.to_string()
    }
}

#[async_trait]
impl FeedSource for XrpcFeedSource {
    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        filter: FeedFilter,
        include_pins: bool,
        limit: u32,
    ) -> Result<FeedPage, ArchiveError> {
        PAGES_FETCHED.inc();
        let start = Instant::now();
        let url = self.page_url(cursor, filter, include_pins, limit);

        let mut request = self.client.get(&url);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| ArchiveError::Fetch(url.clone(), e))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| ArchiveError::Fetch(url.clone(), e))?;
        if !status.is_success() {
            let snippet: String = String::from_utf8_lossy(&body).chars().take(256).collect();
            return Err(ArchiveError::Status(url, status.as_u16(), snippet));
        }

        let page: AuthorFeedResponse =
            serde_json::from_slice(&body).map_err(|e| ArchiveError::Decode(url.clone(), e))?;
        let records = page
            .feed
            .into_iter()
            .map(FeedRecord::from_value)
            .collect::<Result<Vec<_>, _>>()?;

        FETCH_HISTOGRAM.observe(start.elapsed().as_secs_f64());

        Ok(FeedPage {
            records,
            cursor: page.cursor.filter(|c| !c.is_empty()),
        })
    }
}
