//! Core records passed between the producer, stage pools and the report.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Position in the upstream discovery stream: a `created_utc` timestamp.
///
/// Only the producer advances it. A failed run that leaves items unprocessed
/// moves it back before them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub i64);

impl Cursor {
    pub fn as_secs(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reads `created_utc` from an upstream record. Pushshift emits it as an
/// integer but older dumps carry floats.
pub fn created_utc_of(record: &Value) -> Option<i64> {
    let value = record.get("created_utc")?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|secs| secs.trunc() as i64))
}

/// A discovered submission. Immutable once built; shared between stage
/// queues behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    id: String,
    created_utc: i64,
    record: Value,
}

impl WorkItem {
    /// Builds an item from a raw upstream record. Returns `None` when the
    /// record lacks an `id` or `created_utc`.
    pub fn from_record(record: Value) -> Option<Self> {
        let id = record.get("id").and_then(Value::as_str)?.to_string();
        if id.is_empty() {
            return None;
        }
        let created_utc = created_utc_of(&record)?;
        Some(Self {
            id,
            created_utc,
            record,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_utc(&self) -> i64 {
        self.created_utc
    }

    /// The record exactly as the upstream returned it.
    pub fn record(&self) -> &Value {
        &self.record
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.record.get(name).filter(|v| !v.is_null())
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }
}

/// One independent archival concern applied to every item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Submission,
    Comments,
    Media,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [StageKind::Submission, StageKind::Comments, StageKind::Media];

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Submission => "submission",
            StageKind::Comments => "comments",
            StageKind::Media => "media",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one stage for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StageOutcome {
    Success { fragment: Value },
    Failure { error: String },
}

/// Result fragment produced exactly once per (item, stage) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub item_id: String,
    pub stage: StageKind,
    pub outcome: StageOutcome,
    pub completed_at: DateTime<Utc>,
}

impl StageResult {
    pub fn success(item_id: impl Into<String>, stage: StageKind, fragment: Value) -> Self {
        Self {
            item_id: item_id.into(),
            stage,
            outcome: StageOutcome::Success { fragment },
            completed_at: Utc::now(),
        }
    }

    pub fn failure(item_id: impl Into<String>, stage: StageKind, error: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            stage,
            outcome: StageOutcome::Failure {
                error: error.into(),
            },
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StageOutcome::Success { .. })
    }
}
