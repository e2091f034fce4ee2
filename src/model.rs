//! Feed records as the archiver sees them, plus the resumption watermark.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ArchiveError;

/// Record type of a regular post. Anything else is skipped by the daily sinks.
pub const POST_KIND: &str = "app.bsky.feed.post";

/// One feed item: the identifying fields pulled out of the feed-view object,
/// with the whole object kept as the payload that gets archived.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRecord {
    pub cid: String,
    pub kind: Option<String>,
    pub created_at: Option<String>,
    pub payload: Value,
}

#[derive(Deserialize)]
struct FeedViewHead {
    post: PostHead,
}

#[derive(Deserialize)]
struct PostHead {
    cid: String,
    #[serde(default)]
    record: Option<RecordHead>,
}

#[derive(Deserialize)]
struct RecordHead {
    #[serde(rename = "$type", default)]
    kind: Option<String>,
    #[serde(rename = "createdAt", default)]
    created_at: Option<String>,
}

impl FeedRecord {
    /// Decode a feed-view object. A missing `post.cid` means the page itself is
    /// malformed; a missing record type or timestamp is left for the sink to skip.
    pub fn from_value(payload: Value) -> Result<Self, ArchiveError> {
        let head = FeedViewHead::deserialize(&payload)
            .map_err(|e| ArchiveError::Decode("feed view post".to_string(), e))?;
        let (kind, created_at) = match head.post.record {
            Some(r) => (r.kind, r.created_at),
            None => (None, None),
        };
        Ok(FeedRecord {
            cid: head.post.cid,
            kind,
            created_at,
            payload,
        })
    }

    pub fn is_post(&self) -> bool {
        self.kind.as_deref() == Some(POST_KIND)
    }

    /// Payload as one compact JSON line, newline included.
    pub fn to_json_line(&self) -> Result<Vec<u8>, ArchiveError> {
        let mut line = serde_json::to_vec(&self.payload)
            .map_err(|e| ArchiveError::Encode(self.cid.clone(), e))?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Most recently archived record of a run: `(unix seconds, cid)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub timestamp: i64,
    pub cid: String,
}

impl Watermark {
    pub fn new(timestamp: i64, cid: impl Into<String>) -> Self {
        Watermark {
            timestamp,
            cid: cid.into(),
        }
    }

    /// True when a record at `timestamp` with `cid` was already archived by a
    /// previous run.
    pub fn covers(&self, timestamp: i64, cid: &str) -> bool {
        self.cid == cid || timestamp <= self.timestamp
    }
}

/// Persisted resumption state for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveState {
    pub did: String,
    pub latest_cid: String,
    pub timestamp: i64,
}

impl ArchiveState {
    pub fn watermark(&self) -> Watermark {
        Watermark::new(self.timestamp, self.latest_cid.clone())
    }

    pub fn from_watermark(did: impl Into<String>, watermark: &Watermark) -> Self {
        ArchiveState {
            did: did.into(),
            latest_cid: watermark.cid.clone(),
            timestamp: watermark.timestamp,
        }
    }
}
