//! Error types for archiver operations.
//!
//! Defines the error types shared across subsystems:
//! - Upstream and media HTTP fetches (with transient/fatal classification)
//! - Storage, discovery-config and notification collaborators
//! - Per-item stage processing
//! - Whole-pipeline supervision

use thiserror::Error;

use crate::pipeline::config::ConfigError;
use crate::upstream::retry::{Classify, FailureKind};

/// Errors that can occur while talking to the upstream API or a media host.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Rate limited by {url}")]
    RateLimited { url: String },

    #[error("Invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("Unexpected HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    MaxAttemptsExceeded {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    pub fn invalid(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        if err.is_timeout() {
            FetchError::Timeout(url)
        } else if err.is_decode() || err.is_body() {
            FetchError::invalid(url, err.to_string())
        } else if err.is_connect() || err.is_request() {
            FetchError::Connection(err.to_string())
        } else {
            FetchError::Request(err.to_string())
        }
    }
}

impl Classify for FetchError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            FetchError::RateLimited { .. }
            | FetchError::InvalidResponse { .. }
            | FetchError::Status { .. }
            | FetchError::Connection(_)
            | FetchError::Timeout(_) => FailureKind::Transient,
            FetchError::Request(_) | FetchError::MaxAttemptsExceeded { .. } => FailureKind::Fatal,
        }
    }

    fn max_attempts_exceeded(attempts: u32, last: Self) -> Self {
        FetchError::MaxAttemptsExceeded {
            attempts,
            last: Box::new(last),
        }
    }
}

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid storage path: {0}")]
    InvalidPath(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised when handing an item to the notification collaborator.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Failed to deliver '{item_id}': {reason}")]
    Delivery { item_id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single item inside a single stage.
///
/// These never escape the worker boundary: the pool turns them into a
/// failure fragment on the item's `StageResult`.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed item: {0}")]
    MalformedItem(String),
}

/// Errors that abort a whole pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Discovery failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Cursor stalled at {cursor}: page ended at {last}")]
    CursorStalled { cursor: i64, last: i64 },

    #[error("Worker allocation failed: {0}")]
    Allocation(String),

    #[error("Producer task aborted: {0}")]
    ProducerAborted(String),

    #[error("{count} published items were never processed")]
    StrandedItems { count: usize },

    #[error("Report aggregator aborted: {0}")]
    AggregatorAborted(String),
}
