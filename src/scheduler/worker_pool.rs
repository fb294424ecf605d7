//! Bounded worker pool draining one stage queue.
//!
//! A pool owns `W` stage workers. [`WorkerPool::run`] pulls items from the
//! stage's [`WorkQueue`] while a worker is free, runs each item on its own
//! task, and yields a [`StageResult`] as soon as that item finishes,
//! regardless of submission order.
//!
//! # Features
//!
//! - At most `W` items in flight at any moment
//! - Per-item failure isolation: errors and panics become failure results
//! - Queue pulls bounded by a timeout once no producer is attached, so a dead
//!   producer cannot hang the pool
//! - Drains in-flight work after end-of-queue, then ends the stream
//! - Pool statistics tracking

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::pipeline::types::{StageKind, StageResult, WorkItem};
use crate::stages::Stage;

use super::queue::{Dequeued, WorkQueue};

/// Errors that can occur while allocating a worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A pool needs at least one worker.
    #[error("Pool for {0} needs at least one worker")]
    NoWorkers(StageKind),

    /// Worker initialization failed.
    #[error("Worker initialization failed for {stage}: {reason}")]
    WorkerInitFailed { stage: StageKind, reason: String },
}

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub num_workers: usize,
    /// How long a pull may wait on an idle queue before the pool drains.
    pub queue_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            queue_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the queue pull timeout.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }
}

/// Statistics about a worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub num_workers: usize,
    /// Items currently being processed.
    pub in_flight: usize,
    /// Highest number of items processed at once.
    pub peak_in_flight: usize,
    pub items_succeeded: u64,
    pub items_failed: u64,
    pub average_item_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of items processed (succeeded + failed).
    pub fn total_processed(&self) -> u64 {
        self.items_succeeded + self.items_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.items_succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared counters behind [`PoolStats`]; outlive the pool's result stream.
#[derive(Debug, Default)]
pub struct SharedPoolStats {
    items_succeeded: AtomicU64,
    items_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

impl SharedPoolStats {
    fn record(&self, result: &StageResult, duration: Duration) {
        if result.is_success() {
            self.items_succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            self.items_failed.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_in_flight(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn decrement_in_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self, num_workers: usize) -> PoolStats {
        let succeeded = self.items_succeeded.load(Ordering::SeqCst);
        let failed = self.items_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = succeeded + failed;
        let average_item_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            in_flight: self.in_flight.load(Ordering::SeqCst) as usize,
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst) as usize,
            items_succeeded: succeeded,
            items_failed: failed,
            average_item_duration,
        }
    }
}

/// What woke the dispatch loop.
enum Event<S> {
    Finished(Arc<S>, StageResult),
    Pulled(Dequeued),
}

/// Pool of stage workers consuming one queue.
///
/// Each worker is allocated once and reused for every item it picks up. When
/// the result stream ends (or is dropped) the workers, and any connection
/// they own, are released.
pub struct WorkerPool<S: Stage> {
    stage: StageKind,
    config: WorkerPoolConfig,
    workers: Vec<Arc<S>>,
    stats: Arc<SharedPoolStats>,
}

impl<S: Stage> WorkerPool<S> {
    /// Allocates `config.num_workers` workers with `factory`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NoWorkers` for an empty pool, or
    /// `PoolError::WorkerInitFailed` if any worker fails to build. Workers
    /// already built are dropped.
    pub fn allocate<F, E>(
        stage: StageKind,
        config: WorkerPoolConfig,
        mut factory: F,
    ) -> Result<Self, PoolError>
    where
        F: FnMut(usize) -> Result<S, E>,
        E: std::fmt::Display,
    {
        if config.num_workers == 0 {
            return Err(PoolError::NoWorkers(stage));
        }

        let mut workers = Vec::with_capacity(config.num_workers);
        for slot in 0..config.num_workers {
            let worker = factory(slot).map_err(|e| PoolError::WorkerInitFailed {
                stage,
                reason: e.to_string(),
            })?;
            workers.push(Arc::new(worker));
        }

        debug!(stage = %stage, num_workers = workers.len(), "Worker pool allocated");
        Ok(Self {
            stage,
            config,
            workers,
            stats: Arc::new(SharedPoolStats::default()),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Handle to the pool's counters, readable after `run` consumed the pool.
    pub fn stats_handle(&self) -> Arc<SharedPoolStats> {
        Arc::clone(&self.stats)
    }

    /// Consumes `queue` and yields one result per pulled item, in completion
    /// order. The stream ends after end-of-queue (or an idle timeout) once
    /// every in-flight item has finished.
    pub fn run(self, queue: Arc<WorkQueue>) -> impl Stream<Item = StageResult> + Send + 'static {
        let WorkerPool {
            stage,
            config,
            workers,
            stats,
        } = self;

        stream! {
            let num_workers = workers.len();
            let mut idle = workers;
            let mut in_flight = FuturesUnordered::new();
            let mut pulling = true;

            info!(stage = %stage, num_workers = num_workers, "Worker pool started");

            loop {
                let event = if pulling && !idle.is_empty() {
                    tokio::select! {
                        Some((worker, result)) = in_flight.next(), if !in_flight.is_empty() => {
                            Event::Finished(worker, result)
                        }
                        pulled = queue.dequeue(config.queue_timeout) => Event::Pulled(pulled),
                    }
                } else {
                    match in_flight.next().await {
                        Some((worker, result)) => Event::Finished(worker, result),
                        None => break,
                    }
                };

                match event {
                    Event::Finished(worker, result) => {
                        idle.push(worker);
                        yield result;
                    }
                    Event::Pulled(Dequeued::Item(item)) => {
                        if let Some(worker) = idle.pop() {
                            in_flight.push(dispatch(worker, item, Arc::clone(&stats)));
                        }
                    }
                    Event::Pulled(Dequeued::Closed) => {
                        debug!(stage = %stage, "End of queue, draining");
                        pulling = false;
                    }
                    Event::Pulled(Dequeued::TimedOut) => {
                        warn!(
                            stage = %stage,
                            timeout_secs = config.queue_timeout.as_secs(),
                            "Queue idle past timeout with no producer, draining"
                        );
                        pulling = false;
                    }
                }
            }

            let summary = stats.snapshot(num_workers);
            info!(
                stage = %stage,
                succeeded = summary.items_succeeded,
                failed = summary.items_failed,
                peak_in_flight = summary.peak_in_flight,
                "Worker pool finished"
            );
        }
    }
}

/// Starts `item` on its own task and resolves to the worker and its result.
///
/// The task boundary catches panics, so a crashing item still yields a
/// failure result and the worker slot returns to the pool.
fn dispatch<S: Stage>(
    worker: Arc<S>,
    item: Arc<WorkItem>,
    stats: Arc<SharedPoolStats>,
) -> impl Future<Output = (Arc<S>, StageResult)> + Send {
    let stage = worker.kind();
    stats.increment_in_flight();
    let started = Instant::now();

    let task = tokio::spawn({
        let worker = Arc::clone(&worker);
        let item = Arc::clone(&item);
        async move { worker.process(&item).await }
    });

    async move {
        let result = match task.await {
            Ok(Ok(fragment)) => StageResult::success(item.id(), stage, fragment),
            Ok(Err(e)) => {
                warn!(stage = %stage, item_id = %item.id(), error = %e, "Item failed");
                StageResult::failure(item.id(), stage, e.to_string())
            }
            Err(e) => {
                error!(stage = %stage, item_id = %item.id(), error = %e, "Worker task panicked");
                StageResult::failure(item.id(), stage, format!("worker task aborted: {e}"))
            }
        };

        let duration = started.elapsed();
        stats.decrement_in_flight();
        stats.record(&result, duration);
        debug!(
            stage = %stage,
            item_id = %item.id(),
            success = result.is_success(),
            duration_ms = duration.as_millis() as u64,
            "Item finished"
        );
        (worker, result)
    }
}
