//! Archiver configuration.
//!
//! This module provides configuration options for an archive run, including
//! the upstream endpoint and filter, rate limiting, retry budgets, timeouts
//! and the per-stage worker counts.

use std::time::Duration;
use thiserror::Error;

use crate::pipeline::types::{Cursor, StageKind};
use crate::upstream::client::DEFAULT_BASE_URL;
use crate::upstream::retry::{RetryPolicy, DEFAULT_MEDIA_ATTEMPTS, DEFAULT_UPSTREAM_ATTEMPTS};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// A metadata query asked for a (partition, sort) pair with no index.
    #[error("Unsupported metadata query: partition '{partition}' sorted by '{sort}'")]
    UnsupportedIndex { partition: String, sort: String },
}

/// Configuration for one archive run.
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    // Upstream settings
    /// Root URL of the upstream API.
    pub upstream_url: String,
    /// Subreddit to discover submissions in.
    pub subreddit: String,
    /// Only submissions whose flair contains this text are archived.
    pub flair: Option<String>,
    /// Discovery starts strictly after this point unless a cursor was persisted.
    pub after: Option<Cursor>,
    /// Optional upper bound passed upstream.
    pub before: Option<Cursor>,

    // Rate limiting and retries
    /// Upstream tokens granted per second.
    pub rate_limit: f64,
    /// Token bucket capacity.
    pub burst: usize,
    pub upstream_max_attempts: u32,
    pub media_max_attempts: u32,
    /// Unit of the exponential backoff schedule.
    pub backoff_base: Duration,

    // Timeouts
    pub http_timeout: Duration,
    /// How long an idle stage queue is waited on before the pool drains.
    pub queue_timeout: Duration,

    // Worker pools
    pub submission_workers: usize,
    pub comments_workers: usize,
    pub media_workers: usize,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            upstream_url: DEFAULT_BASE_URL.to_string(),
            subreddit: "superstonk".to_string(),
            flair: None,
            after: None,
            before: None,

            rate_limit: 1.0,
            burst: 2,
            upstream_max_attempts: DEFAULT_UPSTREAM_ATTEMPTS,
            media_max_attempts: DEFAULT_MEDIA_ATTEMPTS,
            backoff_base: Duration::from_secs(1),

            http_timeout: Duration::from_secs(30),
            queue_timeout: Duration::from_secs(30),

            submission_workers: 1,
            comments_workers: 2,
            media_workers: 2,
        }
    }
}

impl ArchiverConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `ARCHIVER_UPSTREAM_URL`: Upstream API root (default: https://api.pushshift.io/reddit/)
    /// - `ARCHIVER_SUBREDDIT`: Subreddit to crawl (default: superstonk)
    /// - `ARCHIVER_FLAIR`: Flair substring filter (default: none)
    /// - `ARCHIVER_RATE_LIMIT`: Upstream requests per second (default: 1.0)
    /// - `ARCHIVER_BURST`: Token bucket capacity (default: 2)
    /// - `ARCHIVER_UPSTREAM_MAX_ATTEMPTS`: Attempts per upstream call (default: 5)
    /// - `ARCHIVER_MEDIA_MAX_ATTEMPTS`: Attempts per media fetch (default: 6)
    /// - `ARCHIVER_BACKOFF_BASE_MS`: Backoff unit in milliseconds (default: 1000)
    /// - `ARCHIVER_HTTP_TIMEOUT_SECS`: Per-request timeout (default: 30)
    /// - `ARCHIVER_QUEUE_TIMEOUT_SECS`: Idle queue timeout (default: 30)
    /// - `ARCHIVER_SUBMISSION_WORKERS`: Submission pool size (default: 1)
    /// - `ARCHIVER_COMMENTS_WORKERS`: Comments pool size (default: 2)
    /// - `ARCHIVER_MEDIA_WORKERS`: Media pool size (default: 2)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Upstream settings
        if let Ok(val) = std::env::var("ARCHIVER_UPSTREAM_URL") {
            config.upstream_url = val;
        }
        if let Ok(val) = std::env::var("ARCHIVER_SUBREDDIT") {
            config.subreddit = val;
        }
        if let Ok(val) = std::env::var("ARCHIVER_FLAIR") {
            config.flair = Some(val).filter(|f| !f.is_empty());
        }

        // Rate limiting and retries
        if let Ok(val) = std::env::var("ARCHIVER_RATE_LIMIT") {
            config.rate_limit = parse_env_value(&val, "ARCHIVER_RATE_LIMIT")?;
        }
        if let Ok(val) = std::env::var("ARCHIVER_BURST") {
            config.burst = parse_env_value(&val, "ARCHIVER_BURST")?;
        }
        if let Ok(val) = std::env::var("ARCHIVER_UPSTREAM_MAX_ATTEMPTS") {
            config.upstream_max_attempts = parse_env_value(&val, "ARCHIVER_UPSTREAM_MAX_ATTEMPTS")?;
        }
        if let Ok(val) = std::env::var("ARCHIVER_MEDIA_MAX_ATTEMPTS") {
            config.media_max_attempts = parse_env_value(&val, "ARCHIVER_MEDIA_MAX_ATTEMPTS")?;
        }
        if let Ok(val) = std::env::var("ARCHIVER_BACKOFF_BASE_MS") {
            let millis: u64 = parse_env_value(&val, "ARCHIVER_BACKOFF_BASE_MS")?;
            config.backoff_base = Duration::from_millis(millis);
        }

        // Timeouts
        if let Ok(val) = std::env::var("ARCHIVER_HTTP_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "ARCHIVER_HTTP_TIMEOUT_SECS")?;
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("ARCHIVER_QUEUE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "ARCHIVER_QUEUE_TIMEOUT_SECS")?;
            config.queue_timeout = Duration::from_secs(secs);
        }

        // Worker pools
        if let Ok(val) = std::env::var("ARCHIVER_SUBMISSION_WORKERS") {
            config.submission_workers = parse_env_value(&val, "ARCHIVER_SUBMISSION_WORKERS")?;
        }
        if let Ok(val) = std::env::var("ARCHIVER_COMMENTS_WORKERS") {
            config.comments_workers = parse_env_value(&val, "ARCHIVER_COMMENTS_WORKERS")?;
        }
        if let Ok(val) = std::env::var("ARCHIVER_MEDIA_WORKERS") {
            config.media_workers = parse_env_value(&val, "ARCHIVER_MEDIA_WORKERS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "upstream_url cannot be empty".to_string(),
            ));
        }
        if self.subreddit.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "subreddit cannot be empty".to_string(),
            ));
        }
        if let (Some(after), Some(before)) = (self.after, self.before) {
            if before <= after {
                return Err(ConfigError::ValidationFailed(format!(
                    "before ({before}) must be later than after ({after})"
                )));
            }
        }

        if !self.rate_limit.is_finite() || self.rate_limit <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "rate_limit must be greater than 0".to_string(),
            ));
        }
        if self.burst == 0 {
            return Err(ConfigError::ValidationFailed(
                "burst must be at least 1".to_string(),
            ));
        }
        if self.upstream_max_attempts == 0 || self.media_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max attempts must be at least 1".to_string(),
            ));
        }

        if self.http_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "http_timeout must be greater than 0".to_string(),
            ));
        }
        if self.queue_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "queue_timeout must be greater than 0".to_string(),
            ));
        }

        for stage in StageKind::ALL {
            if self.workers_for(stage) == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{stage} workers must be greater than 0"
                )));
            }
        }

        Ok(())
    }

    /// Pool size for `stage`.
    pub fn workers_for(&self, stage: StageKind) -> usize {
        match stage {
            StageKind::Submission => self.submission_workers,
            StageKind::Comments => self.comments_workers,
            StageKind::Media => self.media_workers,
        }
    }

    pub fn upstream_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.upstream_max_attempts).with_base_delay(self.backoff_base)
    }

    pub fn media_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.media_max_attempts).with_base_delay(self.backoff_base)
    }

    /// Builder method to set the upstream URL.
    pub fn with_upstream_url(mut self, url: impl Into<String>) -> Self {
        self.upstream_url = url.into();
        self
    }

    /// Builder method to set the subreddit.
    pub fn with_subreddit(mut self, subreddit: impl Into<String>) -> Self {
        self.subreddit = subreddit.into();
        self
    }

    /// Builder method to set the flair filter.
    pub fn with_flair(mut self, flair: impl Into<String>) -> Self {
        self.flair = Some(flair.into());
        self
    }

    /// Builder method to set the discovery window.
    pub fn with_window(mut self, after: Option<Cursor>, before: Option<Cursor>) -> Self {
        self.after = after;
        self.before = before;
        self
    }

    /// Builder method to set the rate limit.
    pub fn with_rate_limit(mut self, rate: f64, burst: usize) -> Self {
        self.rate_limit = rate;
        self.burst = burst;
        self
    }

    /// Builder method to set the retry budgets.
    pub fn with_max_attempts(mut self, upstream: u32, media: u32) -> Self {
        self.upstream_max_attempts = upstream;
        self.media_max_attempts = media;
        self
    }

    /// Builder method to set the backoff unit.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Builder method to set the HTTP timeout.
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Builder method to set the queue pull timeout.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Builder method to set the pool size of one stage.
    pub fn with_workers(mut self, stage: StageKind, workers: usize) -> Self {
        match stage {
            StageKind::Submission => self.submission_workers = workers,
            StageKind::Comments => self.comments_workers = workers,
            StageKind::Media => self.media_workers = workers,
        }
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ArchiverConfig::default();
        assert_eq!(config.upstream_url, "https://api.pushshift.io/reddit/");
        assert_eq!(config.subreddit, "superstonk");
        assert!(config.flair.is_none());
        assert!((config.rate_limit - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.burst, 2);
        assert_eq!(config.upstream_max_attempts, 5);
        assert_eq!(config.media_max_attempts, 6);
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.queue_timeout, Duration::from_secs(30));
        assert_eq!(config.workers_for(StageKind::Submission), 1);
        assert_eq!(config.workers_for(StageKind::Comments), 2);
        assert_eq!(config.workers_for(StageKind::Media), 2);
    }

    #[test]
    fn test_config_builder() {
        let config = ArchiverConfig::new()
            .with_upstream_url("http://localhost:9000/")
            .with_subreddit("rust")
            .with_flair("DD")
            .with_window(Some(Cursor(10)), Some(Cursor(20)))
            .with_rate_limit(4.0, 8)
            .with_max_attempts(2, 3)
            .with_backoff_base(Duration::from_millis(5))
            .with_workers(StageKind::Media, 7);

        assert_eq!(config.upstream_url, "http://localhost:9000/");
        assert_eq!(config.subreddit, "rust");
        assert_eq!(config.flair.as_deref(), Some("DD"));
        assert_eq!(config.after, Some(Cursor(10)));
        assert_eq!(config.burst, 8);
        assert_eq!(config.upstream_retry().max_attempts(), 2);
        assert_eq!(config.media_retry().max_attempts(), 3);
        assert_eq!(config.workers_for(StageKind::Media), 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(ArchiverConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_invalid_rate() {
        let config = ArchiverConfig::default().with_rate_limit(0.0, 2);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("rate_limit"));

        let config = ArchiverConfig::default().with_rate_limit(f64::INFINITY, 2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_burst() {
        let config = ArchiverConfig::default().with_rate_limit(1.0, 0);
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("burst"));
    }

    #[test]
    fn test_validation_zero_workers() {
        let config = ArchiverConfig::default().with_workers(StageKind::Comments, 0);
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("comments workers"));
    }

    #[test]
    fn test_validation_zero_timeouts() {
        let config = ArchiverConfig::default().with_queue_timeout(Duration::ZERO);
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("queue_timeout"));

        let config = ArchiverConfig::default().with_http_timeout(Duration::ZERO);
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("http_timeout"));
    }

    #[test]
    fn test_validation_inverted_window() {
        let config = ArchiverConfig::default().with_window(Some(Cursor(50)), Some(Cursor(50)));
        assert!(config.validate().unwrap_err().to_string().contains("before"));
    }

    #[test]
    fn test_parse_env_value() {
        let n: usize = parse_env_value(" 4 ", "ARCHIVER_MEDIA_WORKERS").unwrap();
        assert_eq!(n, 4);

        let err = parse_env_value::<f64>("fast", "ARCHIVER_RATE_LIMIT").unwrap_err();
        assert!(err.to_string().contains("ARCHIVER_RATE_LIMIT"));
        assert!(err.to_string().contains("fast"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "ARCHIVER_BURST".to_string(),
            message: "bad value".to_string(),
        };
        assert!(err.to_string().contains("ARCHIVER_BURST"));

        let err = ConfigError::UnsupportedIndex {
            partition: "title".to_string(),
            sort: "score".to_string(),
        };
        assert!(err.to_string().contains("title"));
        assert!(err.to_string().contains("score"));
    }
}
