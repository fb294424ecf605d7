//! In-process scheduling: stage queues and bounded worker pools.
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      └──────┬───────┘
//!                             │ FanOut (atomic)
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!   ┌────────────┐      ┌────────────┐      ┌────────────┐
//!   │ submission │      │  comments  │      │   media    │
//!   │   queue    │      │   queue    │      │   queue    │
//!   └─────┬──────┘      └─────┬──────┘      └─────┬──────┘
//!         ▼                   ▼                   ▼
//!    WorkerPool(W)       WorkerPool(W)       WorkerPool(W)
//! ```
//!
//! - **WorkQueue**: unbounded FIFO per stage, closed to signal end-of-queue
//! - **FanOut**: publishes each discovered batch to every queue at once
//! - **ProducerGuard**: keeps idle pulls waiting while discovery is alive
//! - **WorkerPool**: at most `W` items in flight, results in completion order

pub mod queue;
pub mod worker_pool;

// Re-export main types for convenience
pub use queue::{Dequeued, FanOut, ProducerGuard, WorkQueue};
pub use worker_pool::{PoolError, PoolStats, SharedPoolStats, WorkerPool, WorkerPoolConfig};
