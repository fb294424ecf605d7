//! Job report and the single-writer aggregator that builds it.
//!
//! Stage pools finish items concurrently and in any order. Every result is
//! sent over a channel to one aggregation task, which is the only code that
//! ever mutates the [`JobReport`] during a run.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{Cursor, StageKind, StageResult};
use crate::error::{PipelineError, StorageError};
use crate::storage::Storage;

/// Lifecycle status recorded in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Aggregate outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub after_utc: Option<Cursor>,
    pub before_utc: Option<Cursor>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Item id -> stage -> result.
    pub submissions: BTreeMap<String, BTreeMap<StageKind, StageResult>>,
}

impl JobReport {
    pub fn new(after_utc: Option<Cursor>, before_utc: Option<Cursor>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            started: Utc::now(),
            finished: None,
            after_utc,
            before_utc,
            status: JobStatus::Running,
            error: None,
            submissions: BTreeMap::new(),
        }
    }

    /// Adds a result without touching other stages of the same item.
    ///
    /// Returns `false`, leaving the report unchanged, if this (item, stage)
    /// pair already has a result.
    pub fn merge(&mut self, result: StageResult) -> bool {
        let stages = self.submissions.entry(result.item_id.clone()).or_default();
        if stages.contains_key(&result.stage) {
            return false;
        }
        stages.insert(result.stage, result);
        true
    }

    /// Sets the terminal status. Only the first call has any effect.
    pub fn finalize(&mut self, status: JobStatus, error: Option<String>) {
        if self.finished.is_some() {
            return;
        }
        self.status = status;
        self.error = error;
        self.finished = Some(Utc::now());
    }

    pub fn is_finalized(&self) -> bool {
        self.finished.is_some()
    }

    /// Storage path the report is persisted under.
    pub fn file_name(&self) -> String {
        format!("report-{}.json", self.started.timestamp())
    }

    pub fn result_count(&self) -> usize {
        self.submissions.values().map(BTreeMap::len).sum()
    }

    pub fn failure_count(&self) -> usize {
        self.submissions
            .values()
            .flat_map(BTreeMap::values)
            .filter(|r| !r.is_success())
            .count()
    }
}

/// Cloneable sender side of the aggregator.
#[derive(Debug, Clone)]
pub struct ReportHandle {
    tx: mpsc::UnboundedSender<StageResult>,
}

impl ReportHandle {
    /// Queues a result for merging. Returns `false` if the aggregator has
    /// already finished.
    pub fn merge(&self, result: StageResult) -> bool {
        self.tx.send(result).is_ok()
    }
}

/// Owns the [`JobReport`] for the duration of a run.
pub struct ReportAggregator {
    handle: ReportHandle,
    task: JoinHandle<JobReport>,
}

impl ReportAggregator {
    /// Starts the aggregation task.
    pub fn spawn(report: JobReport) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(aggregate(report, rx));
        Self {
            handle: ReportHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> ReportHandle {
        self.handle.clone()
    }

    /// Stops accepting results and returns the report once every queued
    /// result has been merged. All handles must be dropped first.
    pub async fn finish(self) -> Result<JobReport, PipelineError> {
        let ReportAggregator { handle, task } = self;
        drop(handle);
        task.await
            .map_err(|e| PipelineError::AggregatorAborted(e.to_string()))
    }
}

async fn aggregate(mut report: JobReport, mut rx: mpsc::UnboundedReceiver<StageResult>) -> JobReport {
    while let Some(result) = rx.recv().await {
        let item_id = result.item_id.clone();
        let stage = result.stage;
        if report.merge(result) {
            debug!(item_id = %item_id, stage = %stage, "Merged stage result");
        } else {
            warn!(item_id = %item_id, stage = %stage, "Duplicate stage result ignored");
        }
    }
    report
}

/// Writes the report to storage as pretty JSON. Returns the path written.
pub async fn persist_report(storage: &dyn Storage, report: &JobReport) -> Result<String, StorageError> {
    let path = report.file_name();
    let body = serde_json::to_string_pretty(report)?;
    storage.write(&path, &body).await?;
    info!(
        path = %path,
        status = %report.status,
        submissions = report.submissions.len(),
        failures = report.failure_count(),
        "Job report persisted"
    );
    Ok(path)
}
