//! Pipeline orchestrator: runs one archive job end to end.
//!
//! The orchestrator allocates the shared rate limiter and one worker pool per
//! stage, starts discovery in the background and drains every pool into the
//! report aggregator. Whatever happens, the job report is finalized and
//! persisted before [`Orchestrator::run`] returns.
//!
//! ```text
//! Idle -> Allocating -> Running -> Draining -> Completed
//!              \            \          \
//!               +------------+----------+---> Failed
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use futures::stream::{Stream, StreamExt};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::config::ArchiverConfig;
use super::producer::Producer;
use super::report::{persist_report, JobReport, JobStatus, ReportAggregator, ReportHandle};
use super::types::{Cursor, StageKind, StageResult};
use crate::error::PipelineError;
use crate::scheduler::queue::{FanOut, WorkQueue};
use crate::scheduler::worker_pool::{WorkerPool, WorkerPoolConfig};
use crate::stages::{CommentsStage, MediaStage, SubmissionStage};
use crate::storage::{ConfigStore, Storage};
use crate::upstream::client::UpstreamClient;
use crate::upstream::rate_limiter::RateLimiter;

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Allocating,
    Running,
    Draining,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Allocating => "allocating",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Results merged per stage during one run.
#[derive(Debug, Clone, Copy, Default)]
struct DrainCounts {
    submission: usize,
    comments: usize,
    media: usize,
}

/// Coordinates producer, stage pools and report for one job.
pub struct Orchestrator {
    config: ArchiverConfig,
    storage: Arc<dyn Storage>,
    config_store: Arc<dyn ConfigStore>,
    state: watch::Sender<PipelineState>,
}

impl Orchestrator {
    pub fn new(
        config: ArchiverConfig,
        storage: Arc<dyn Storage>,
        config_store: Arc<dyn ConfigStore>,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            config,
            storage,
            config_store,
            state,
        }
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    fn transition(&self, next: PipelineState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Pipeline state changed");
        }
    }

    /// Runs the job to completion and returns the persisted report.
    ///
    /// # Errors
    ///
    /// Returns the error that failed the job. The report, with status
    /// `failed` and the error text, has still been written to storage.
    pub async fn run(&self) -> Result<JobReport, PipelineError> {
        let aggregator =
            ReportAggregator::spawn(JobReport::new(self.config.after, self.config.before));

        let mut outcome = self.supervise(aggregator.handle()).await;

        let mut report = match aggregator.finish().await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Report aggregator lost; persisting an empty report");
                if outcome.is_ok() {
                    outcome = Err(PipelineError::AggregatorAborted(e.to_string()));
                }
                JobReport::new(self.config.after, self.config.before)
            }
        };

        match &outcome {
            Ok(()) => {
                report.finalize(JobStatus::Completed, None);
                self.transition(PipelineState::Completed);
            }
            Err(e) => {
                error!(error = %e, "Pipeline failed");
                report.finalize(JobStatus::Failed, Some(e.to_string()));
                self.transition(PipelineState::Failed);
            }
        }

        // Not retried: the next run overwrites the same kind of report.
        if let Err(e) = persist_report(self.storage.as_ref(), &report).await {
            error!(error = %e, job_id = %report.job_id, "Failed to persist job report");
        }

        outcome.map(|()| report)
    }

    async fn supervise(&self, reports: ReportHandle) -> Result<(), PipelineError> {
        self.transition(PipelineState::Allocating);
        self.config.validate()?;

        let limiter = Arc::new(RateLimiter::new(self.config.rate_limit, self.config.burst)?);
        let fan_out = FanOut::new(&StageKind::ALL);

        let submission_pool =
            WorkerPool::allocate(StageKind::Submission, self.pool_config(StageKind::Submission), |_| {
                Ok::<_, Infallible>(SubmissionStage::new(Arc::clone(&self.storage)))
            })
            .map_err(|e| PipelineError::Allocation(e.to_string()))?;

        let comments_pool =
            WorkerPool::allocate(StageKind::Comments, self.pool_config(StageKind::Comments), |_| {
                self.upstream_client(&limiter).map(|client| {
                    CommentsStage::new(Arc::new(client), Arc::clone(&self.storage))
                })
            })
            .map_err(|e| PipelineError::Allocation(e.to_string()))?;

        let media_pool =
            WorkerPool::allocate(StageKind::Media, self.pool_config(StageKind::Media), |_| {
                MediaStage::new(
                    Arc::clone(&limiter),
                    self.config.media_retry(),
                    Arc::clone(&self.storage),
                    self.config.http_timeout,
                )
            })
            .map_err(|e| PipelineError::Allocation(e.to_string()))?;

        let discovery_client = self
            .upstream_client(&limiter)
            .map_err(|e| PipelineError::Allocation(e.to_string()))?;
        let producer = Producer::new(
            Arc::new(discovery_client),
            Arc::clone(&self.config_store),
            &self.config,
        );

        let stats = [
            (StageKind::Submission, submission_pool.num_workers(), submission_pool.stats_handle()),
            (StageKind::Comments, comments_pool.num_workers(), comments_pool.stats_handle()),
            (StageKind::Media, media_pool.num_workers(), media_pool.stats_handle()),
        ];

        let submission_queue = stage_queue(&fan_out, StageKind::Submission)?;
        let comments_queue = stage_queue(&fan_out, StageKind::Comments)?;
        let media_queue = stage_queue(&fan_out, StageKind::Media)?;

        self.transition(PipelineState::Running);

        // Observed through end-of-queue; joined only after the pools drain.
        // The guard lives inside the task, so pools keep pulling until
        // discovery has really ended.
        let producer_task = {
            let fan_out = fan_out.clone();
            let guard = fan_out.attach_producer();
            tokio::spawn(async move {
                let _guard = guard;
                producer.run(&fan_out).await
            })
        };

        let drained = async move {
            let (submission, comments, media) = tokio::join!(
                drain(submission_pool.run(submission_queue), reports.clone()),
                drain(comments_pool.run(comments_queue), reports.clone()),
                drain(media_pool.run(media_queue), reports),
            );
            DrainCounts {
                submission,
                comments,
                media,
            }
        };
        tokio::pin!(drained);

        let finished_early = tokio::select! {
            biased;
            () = all_closed(&fan_out) => None,
            counts = &mut drained => Some(counts),
        };
        let counts = match finished_early {
            Some(counts) => counts,
            None => {
                self.transition(PipelineState::Draining);
                drained.await
            }
        };

        for (stage, num_workers, handle) in &stats {
            let snapshot = handle.snapshot(*num_workers);
            info!(
                stage = %stage,
                succeeded = snapshot.items_succeeded,
                failed = snapshot.items_failed,
                success_rate = snapshot.success_rate(),
                peak_in_flight = snapshot.peak_in_flight,
                avg_item_ms = snapshot.average_item_duration.as_millis() as u64,
                "Stage pool drained"
            );
        }
        info!(
            submission = counts.submission,
            comments = counts.comments,
            media = counts.media,
            "All stage pools drained"
        );

        // Pools stop pulling only after the producer guard is gone, so
        // discovery has already returned here.
        let discovery = producer_task.await;
        let stranded = settle_stranded(&fan_out, self.config_store.as_ref()).await?;

        let summary = match discovery {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(PipelineError::ProducerAborted(e.to_string())),
        };
        if stranded > 0 {
            return Err(PipelineError::StrandedItems { count: stranded });
        }

        info!(
            pages = summary.pages,
            published = summary.published,
            cursor = ?summary.cursor,
            "Discovery complete"
        );
        Ok(())
    }

    fn pool_config(&self, stage: StageKind) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.config.workers_for(stage))
            .with_queue_timeout(self.config.queue_timeout)
    }

    fn upstream_client(
        &self,
        limiter: &Arc<RateLimiter>,
    ) -> Result<UpstreamClient, crate::error::FetchError> {
        UpstreamClient::new(
            &self.config.upstream_url,
            Arc::clone(limiter),
            self.config.upstream_retry(),
            self.config.http_timeout,
        )
    }
}

fn stage_queue(fan_out: &FanOut, stage: StageKind) -> Result<Arc<WorkQueue>, PipelineError> {
    fan_out
        .queue(stage)
        .ok_or_else(|| PipelineError::Allocation(format!("no queue for {stage} stage")))
}

/// Takes every item no pool picked up and moves the persisted cursor back
/// before the earliest of them, so the next run discovers them again.
/// Returns how many distinct items were stranded.
async fn settle_stranded(
    fan_out: &FanOut,
    config_store: &dyn ConfigStore,
) -> Result<usize, PipelineError> {
    let mut stranded: HashMap<String, i64> = HashMap::new();
    for queue in fan_out.queues() {
        let remaining = queue.take_remaining();
        if !remaining.is_empty() {
            warn!(stage = %queue.stage(), count = remaining.len(), "Items left in stage queue");
        }
        for item in remaining {
            stranded.insert(item.id().to_string(), item.created_utc());
        }
    }

    let Some(earliest) = stranded.values().min().copied() else {
        return Ok(0);
    };
    let rewind_to = Cursor(earliest - 1);
    let mut state = config_store.get_config().await?;
    if state.cursor.is_some_and(|cursor| cursor > rewind_to) {
        warn!(from = ?state.cursor, to = ?rewind_to, "Rewinding cursor before stranded items");
        state.cursor = Some(rewind_to);
        config_store.put_config(&state).await?;
    }
    Ok(stranded.len())
}

async fn all_closed(fan_out: &FanOut) {
    for queue in fan_out.queues() {
        queue.wait_closed().await;
    }
}

/// Forwards every result of one pool into the report. Returns how many.
async fn drain<S>(results: S, reports: ReportHandle) -> usize
where
    S: Stream<Item = StageResult>,
{
    tokio::pin!(results);
    let mut merged = 0;
    while let Some(result) = results.next().await {
        if !reports.merge(result) {
            warn!("Report aggregator closed; dropping stage result");
            continue;
        }
        merged += 1;
    }
    merged
}
