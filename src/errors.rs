//! Centralised error types for the archiver.

use thiserror::Error;

/// Errors raised by a `PartitionStore`.
///
/// `NotFound` is kept apart from every other failure so callers can treat a
/// missing partition or index object as empty.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage operation on {key} failed: {message}")]
    Backend { key: String, message: String },
}

impl StoreError {
    pub fn backend(key: &str, message: impl ToString) -> Self {
        StoreError::Backend {
            key: key.to_string(),
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("HTTP error fetching {0}: {1}")]
    Fetch(String, #[source] reqwest::Error),

    #[error("Feed endpoint {0} returned {1}: {2}")]
    Status(String, u16, String),

    #[error("Decode error for {0}: {1}")]
    Decode(String, #[source] serde_json::Error),

    #[error("Encode error for record {0}: {1}")]
    Encode(String, #[source] serde_json::Error),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error on {0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("Malformed month index {0}: {1}")]
    Index(String, String),

    #[error("State at {key} belongs to {found}, expected {expected}")]
    StateMismatch {
        key: String,
        expected: String,
        found: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Scan cancelled")]
    Cancelled,
}
