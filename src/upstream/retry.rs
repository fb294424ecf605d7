//! Randomized exponential backoff around fallible async operations.
//!
//! Attempt `i` (zero based) that fails transiently waits
//! `base × (2^i + |N(0, 0.33 × 2^i)|)` before the next attempt. The jitter
//! keeps many callers that hit the limit together from retrying in lockstep.

use std::future::Future;
use std::time::Duration;

use rand_distr::{Distribution, Normal};
use tracing::warn;

/// Default number of attempts for upstream API calls.
pub const DEFAULT_UPSTREAM_ATTEMPTS: u32 = 5;

/// Default number of attempts for media fetches.
pub const DEFAULT_MEDIA_ATTEMPTS: u32 = 6;

/// How a failure should be treated by [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth another attempt after a backoff delay.
    Transient,
    /// Propagate immediately.
    Fatal,
}

/// Classifier consulted by [`RetryPolicy::execute`].
pub trait Classify: Sized {
    /// Maps this failure onto a retry decision.
    fn failure_kind(&self) -> FailureKind;

    /// Builds the error returned once the attempt budget is spent.
    fn max_attempts_exceeded(attempts: u32, last: Self) -> Self;
}

/// Retry configuration. Cheap to copy; never shared between calls at runtime.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MEDIA_ATTEMPTS,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy making at most `max_attempts` attempts (minimum 1).
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Sets the unit the exponential schedule is expressed in.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Computes the jittered delay to wait after failed attempt `attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.min(30) as i32);
        let noise = Normal::new(0.0, 0.33 * exp)
            .map(|normal| normal.sample(&mut rand::rng()).abs())
            .unwrap_or(0.0);
        let factor = ((exp + noise) * 1000.0).round() / 1000.0;
        self.base_delay.mul_f64(factor)
    }

    /// Runs `operation` until it succeeds, fails fatally, or the attempt
    /// budget is exhausted.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        E: Classify + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.failure_kind() == FailureKind::Fatal {
                return Err(err);
            }

            attempt += 1;
            if attempt >= self.max_attempts {
                warn!(attempts = attempt, error = %err, "Retry budget exhausted");
                return Err(E::max_attempts_exceeded(attempt, err));
            }

            let delay = self.backoff_delay(attempt - 1);
            warn!(
                attempt = attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
