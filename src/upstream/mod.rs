//! Upstream access: rate limiting, retries and the search API client.
//!
//! Every outbound request in the process, discovery and media alike, first
//! takes a token from the one shared [`RateLimiter`] and runs inside a
//! [`RetryPolicy`].

pub mod client;
pub mod rate_limiter;
pub mod retry;

pub use client::{QueryFilters, UpstreamApi, UpstreamClient, DEFAULT_BASE_URL, PAGE_SIZE};
pub use rate_limiter::RateLimiter;
pub use retry::{Classify, FailureKind, RetryPolicy};
