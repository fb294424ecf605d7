//! Process-wide leaky-bucket rate limiter for upstream calls.
//!
//! Tokens live in a fair [`Semaphore`]: callers queue in arrival order and a
//! background task tops the bucket up at `rate` tokens per second, never past
//! `capacity`. Acquiring consumes the token for good (the permit is
//! forgotten), so the only source of new tokens is the refill task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::pipeline::config::ConfigError;

/// Shortest refill period, so very high rates don't spin the refill task.
const MIN_REFILL_PERIOD: Duration = Duration::from_millis(100);

/// Leaky-bucket token scheduler shared by every caller in the process.
#[derive(Debug)]
pub struct RateLimiter {
    tokens: Arc<Semaphore>,
    refill: JoinHandle<()>,
}

impl RateLimiter {
    /// Creates a full bucket of `capacity` tokens refilled at `rate` per second.
    ///
    /// Must be called from within a Tokio runtime, which hosts the refill task.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if `rate` is not a positive
    /// finite number or `capacity` is zero.
    pub fn new(rate: f64, capacity: usize) -> Result<Self, ConfigError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::ValidationFailed(format!(
                "rate limit must be positive, got {rate}"
            )));
        }
        if capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "rate limiter capacity must be at least 1".to_string(),
            ));
        }

        let tokens = Arc::new(Semaphore::new(capacity));
        let refill = tokio::spawn(refill_bucket(Arc::clone(&tokens), rate, capacity));
        debug!(rate = rate, capacity = capacity, "Rate limiter started");

        Ok(Self { tokens, refill })
    }

    /// Waits for a token and consumes it. Never fails, only delays.
    pub async fn acquire(&self) {
        match self.tokens.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => warn!("Rate limiter bucket closed, continuing unthrottled"),
        }
    }

    /// Tokens available right now.
    pub fn available(&self) -> usize {
        self.tokens.available_permits()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.refill.abort();
    }
}

async fn refill_bucket(tokens: Arc<Semaphore>, rate: f64, capacity: usize) {
    let period = Duration::from_secs_f64(1.0 / rate).max(MIN_REFILL_PERIOD);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut updated_at = Instant::now();
    let mut fraction = 0.0_f64;

    loop {
        ticker.tick().await;

        let now = Instant::now();
        let accrued = rate * now.duration_since(updated_at).as_secs_f64() + fraction;
        updated_at = now;

        let room = capacity.saturating_sub(tokens.available_permits());
        if room == 0 {
            fraction = 0.0;
            continue;
        }

        let whole = accrued.floor();
        fraction = accrued - whole;
        let add = (whole as usize).min(room);
        if add > 0 {
            tokens.add_permits(add);
        }
    }
}
