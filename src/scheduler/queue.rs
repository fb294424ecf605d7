//! In-process stage queues with atomic fan-out.
//!
//! Every stage consumes its own [`WorkQueue`]. The producer publishes through
//! a [`FanOut`], which holds every stage queue's lock while it appends a
//! batch, so no consumer can see an item in one queue before it is present in
//! all of them.
//!
//! # End of queue
//!
//! Closing a queue is the end-of-queue signal. Consumers drain whatever is
//! still buffered and then observe [`Dequeued::Closed`].
//!
//! # Duplicates
//!
//! A queue remembers every item id it has accepted during its lifetime and
//! silently skips repeats, so an item reaches each stage at most once per run
//! even when discovery re-reads a page after a restart.
//!
//! # Idle timeout
//!
//! A pull gives up after its timeout only when no producer is attached. While
//! a [`ProducerGuard`] is alive a slow discovery page just extends the wait,
//! so a consumer never stops ahead of items that are still on their way.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::pipeline::types::{StageKind, WorkItem};

/// Result of one pull from a [`WorkQueue`].
#[derive(Debug, Clone)]
pub enum Dequeued {
    Item(Arc<WorkItem>),
    /// The queue was closed and is empty.
    Closed,
    /// Nothing arrived within the pull timeout.
    TimedOut,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Arc<WorkItem>>,
    seen: HashSet<String>,
    closed: bool,
}

/// Unbounded FIFO of work items for one stage.
#[derive(Debug)]
pub struct WorkQueue {
    stage: StageKind,
    state: Mutex<QueueState>,
    notify: Notify,
    enqueued: AtomicU64,
    producers: AtomicUsize,
}

impl WorkQueue {
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            enqueued: AtomicU64::new(0),
            producers: AtomicUsize::new(0),
        }
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends items while the caller holds the lock. Returns how many were new.
    fn push_locked(&self, state: &mut QueueState, items: &[Arc<WorkItem>]) -> usize {
        if state.closed {
            return 0;
        }
        let mut added = 0;
        for item in items {
            if state.seen.insert(item.id().to_string()) {
                state.items.push_back(Arc::clone(item));
                added += 1;
            } else {
                debug!(stage = %self.stage, item_id = %item.id(), "Skipping duplicate item");
            }
        }
        self.enqueued.fetch_add(added as u64, Ordering::SeqCst);
        added
    }

    /// Enqueues items directly into this queue only.
    pub fn enqueue(&self, items: &[Arc<WorkItem>]) -> usize {
        let added = {
            let mut state = self.lock();
            self.push_locked(&mut state, items)
        };
        if added > 0 {
            self.notify.notify_waiters();
        }
        added
    }

    /// Marks the end of the queue and wakes every waiting consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn try_pop(&self) -> Option<Dequeued> {
        let mut state = self.lock();
        match state.items.pop_front() {
            Some(item) => Some(Dequeued::Item(item)),
            None if state.closed => Some(Dequeued::Closed),
            None => None,
        }
    }

    /// Waits up to `timeout` for the next item.
    ///
    /// The timeout restarts instead of firing while a producer is attached.
    /// Cancel safe: dropping the future before it resolves never loses an item.
    pub async fn dequeue(&self, timeout: Duration) -> Dequeued {
        let mut deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a publish between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            if let Some(pulled) = self.try_pop() {
                return pulled;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                if !self.has_producer() {
                    return Dequeued::TimedOut;
                }
                debug!(stage = %self.stage, "Queue idle while discovery is running");
                deadline = Instant::now() + timeout;
            }
        }
    }

    /// Whether a live producer may still publish into this queue.
    pub fn has_producer(&self) -> bool {
        self.producers.load(Ordering::SeqCst) > 0
    }

    /// Removes and returns everything still buffered.
    pub fn take_remaining(&self) -> Vec<Arc<WorkItem>> {
        self.lock().items.drain(..).collect()
    }

    /// Resolves once the queue has been closed.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Total distinct items accepted since creation.
    pub fn enqueued_total(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst)
    }
}

/// Publishes each item to every stage queue at once.
#[derive(Debug, Clone)]
pub struct FanOut {
    queues: Vec<Arc<WorkQueue>>,
}

impl FanOut {
    /// Creates one queue per stage, in the given order.
    pub fn new(stages: &[StageKind]) -> Self {
        Self {
            queues: stages
                .iter()
                .map(|stage| Arc::new(WorkQueue::new(*stage)))
                .collect(),
        }
    }

    pub fn queue(&self, stage: StageKind) -> Option<Arc<WorkQueue>> {
        self.queues.iter().find(|q| q.stage() == stage).cloned()
    }

    pub fn queues(&self) -> &[Arc<WorkQueue>] {
        &self.queues
    }

    /// Appends `items` to every queue. All queue locks are held for the
    /// duration of the append, always taken in construction order.
    pub fn publish(&self, items: &[Arc<WorkItem>]) {
        if items.is_empty() {
            return;
        }
        {
            let mut guards: Vec<_> = self.queues.iter().map(|q| q.lock()).collect();
            for (queue, state) in self.queues.iter().zip(guards.iter_mut()) {
                queue.push_locked(state, items);
            }
        }
        for queue in &self.queues {
            queue.notify.notify_waiters();
        }
    }

    /// Signals end-of-queue to every stage.
    pub fn close(&self) {
        for queue in &self.queues {
            queue.close();
        }
    }

    /// Attaches a producer to every queue until the guard is dropped.
    pub fn attach_producer(&self) -> ProducerGuard {
        for queue in &self.queues {
            queue.producers.fetch_add(1, Ordering::SeqCst);
        }
        ProducerGuard {
            queues: self.queues.clone(),
        }
    }
}

/// Keeps idle pulls waiting while the producer holding it is alive.
///
/// Dropped when discovery returns, fails or its task is aborted; waiting
/// consumers are woken so they can re-check the queue.
#[derive(Debug)]
pub struct ProducerGuard {
    queues: Vec<Arc<WorkQueue>>,
}

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        for queue in &self.queues {
            queue.producers.fetch_sub(1, Ordering::SeqCst);
            queue.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, created_utc: i64) -> Arc<WorkItem> {
        Arc::new(
            WorkItem::from_record(json!({"id": id, "created_utc": created_utc})).expect("item"),
        )
    }

    #[tokio::test]
    async fn test_fifo_then_closed() {
        let queue = WorkQueue::new(StageKind::Submission);
        queue.enqueue(&[item("a", 1), item("b", 2)]);
        queue.close();

        let timeout = Duration::from_millis(10);
        assert!(matches!(queue.dequeue(timeout).await, Dequeued::Item(i) if i.id() == "a"));
        assert!(matches!(queue.dequeue(timeout).await, Dequeued::Item(i) if i.id() == "b"));
        assert!(matches!(queue.dequeue(timeout).await, Dequeued::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_queue_times_out() {
        let queue = WorkQueue::new(StageKind::Comments);
        let start = Instant::now();
        assert!(matches!(
            queue.dequeue(Duration::from_secs(30)).await,
            Dequeued::TimedOut
        ));
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_consumer_woken_by_publish() {
        let fan_out = FanOut::new(&StageKind::ALL);
        let queue = fan_out.queue(StageKind::Media).expect("media queue");

        let consumer = tokio::spawn(async move { queue.dequeue(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        fan_out.publish(&[item("late", 5)]);

        match consumer.await.expect("consumer") {
            Dequeued::Item(i) => assert_eq!(i.id(), "late"),
            other => panic!("unexpected pull: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attached_producer_keeps_idle_pull_waiting() {
        let fan_out = FanOut::new(&[StageKind::Comments]);
        let queue = fan_out.queue(StageKind::Comments).expect("queue");
        let guard = fan_out.attach_producer();
        assert!(queue.has_producer());

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(1)).await })
        };
        // Several timeouts pass while discovery is still fetching.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!consumer.is_finished());

        fan_out.publish(&[item("slow-page", 7)]);
        match consumer.await.expect("consumer") {
            Dequeued::Item(i) => assert_eq!(i.id(), "slow-page"),
            other => panic!("unexpected pull: {other:?}"),
        }

        drop(guard);
        assert!(!queue.has_producer());
        let start = Instant::now();
        assert!(matches!(
            queue.dequeue(Duration::from_secs(1)).await,
            Dequeued::TimedOut
        ));
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_take_remaining_empties_queue() {
        let fan_out = FanOut::new(&[StageKind::Media]);
        fan_out.publish(&[item("a", 1), item("b", 2)]);
        let queue = fan_out.queue(StageKind::Media).expect("queue");

        let ids: Vec<String> = queue
            .take_remaining()
            .iter()
            .map(|i| i.id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(queue.is_empty());
        assert_eq!(queue.enqueued_total(), 2);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_stage_once() {
        let fan_out = FanOut::new(&StageKind::ALL);
        fan_out.publish(&[item("a", 1), item("b", 2)]);
        // A re-read page must not enqueue the same ids again.
        fan_out.publish(&[item("b", 2), item("c", 3)]);

        for queue in fan_out.queues() {
            assert_eq!(queue.enqueued_total(), 3, "{}", queue.stage());
            assert_eq!(queue.len(), 3);
        }
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_new_items() {
        let fan_out = FanOut::new(&[StageKind::Submission]);
        fan_out.close();
        fan_out.publish(&[item("a", 1)]);

        let queue = fan_out.queue(StageKind::Submission).expect("queue");
        assert!(queue.is_closed());
        assert!(queue.is_empty());
        assert!(matches!(
            queue.dequeue(Duration::from_millis(1)).await,
            Dequeued::Closed
        ));
    }
}
