//! post_archiver: rate-limited crawl-and-archive pipeline for subreddit posts.
//!
//! A producer pages through the Pushshift search API and fans every matching
//! submission out to three independent stages (post body, comment tree,
//! media), each drained by a bounded worker pool. All upstream traffic shares
//! one leaky-bucket rate limiter, and every run ends with a persisted job
//! report.

pub mod cli;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod scheduler;
pub mod stages;
pub mod storage;
pub mod upstream;

// Re-export commonly used error types
pub use error::{FetchError, NotifyError, PipelineError, StageError, StorageError};
