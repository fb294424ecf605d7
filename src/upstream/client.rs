//! Paginated, filtered queries against the upstream content API.
//!
//! Every request takes a token from the shared [`RateLimiter`] and runs under
//! the client's [`RetryPolicy`]. A `200` whose body has an empty `data` array
//! is end-of-stream; a body without a `data` array is an invalid response and
//! gets retried like any other transient failure.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::pipeline::types::Cursor;

use super::rate_limiter::RateLimiter;
use super::retry::RetryPolicy;

/// Default upstream API root.
pub const DEFAULT_BASE_URL: &str = "https://api.pushshift.io/reddit/";

/// Fixed page size for discovery queries.
pub const PAGE_SIZE: usize = 100;

pub const SUBMISSION_SEARCH: &str = "search/submission";
pub const COMMENT_SEARCH: &str = "search/comment";

/// Endpoint listing the comment ids of one submission.
pub fn comment_ids_endpoint(submission_id: &str) -> String {
    format!("submission/comment_ids/{submission_id}")
}

/// Caller-supplied query parameters. Keys set here override the defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilters(BTreeMap<String, String>);

impl QueryFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    /// Adds the parameter only when `value` is present.
    pub fn with_opt(self, key: impl Into<String>, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Query capability the producer and comments stage depend on.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Fetches one page of records ascending by creation time, strictly
    /// after `after` when given.
    async fn query(
        &self,
        endpoint: &str,
        filters: &QueryFilters,
        after: Option<Cursor>,
    ) -> Result<Vec<Value>, FetchError>;

    /// Looks up a single submission by id.
    async fn fetch_submission(&self, id: &str) -> Result<Option<Value>, FetchError> {
        let filters = QueryFilters::new().with("ids", id);
        let mut records = self.query(SUBMISSION_SEARCH, &filters, None).await?;
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(records.swap_remove(0)))
    }
}

/// HTTP implementation of [`UpstreamApi`].
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    base_url: Url,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl UpstreamClient {
    /// Creates a client rooted at `base_url` (a trailing `/` is added if
    /// missing so endpoints resolve beneath it).
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Request` for an unparsable URL or if the HTTP
    /// client cannot be built.
    pub fn new(
        base_url: &str,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| FetchError::Request(format!("invalid base URL '{base_url}': {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Request(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            limiter,
            retry,
        })
    }

    /// Resolves the full request URL including default parameters.
    pub fn request_url(
        &self,
        endpoint: &str,
        filters: &QueryFilters,
        after: Option<Cursor>,
    ) -> Result<Url, FetchError> {
        let mut url = self
            .base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| FetchError::Request(format!("invalid endpoint '{endpoint}': {e}")))?;

        let mut params: BTreeMap<&str, String> = BTreeMap::new();
        params.insert("sort", "asc".to_string());
        params.insert("sort_type", "created_utc".to_string());
        params.insert("size", PAGE_SIZE.to_string());
        if let Some(after) = after {
            params.insert("after", after.to_string());
        }
        for (key, value) in filters.iter() {
            params.insert(key, value.to_string());
        }

        url.query_pairs_mut().extend_pairs(params.iter());
        Ok(url)
    }

    async fn fetch_page(&self, url: Url) -> Result<Vec<Value>, FetchError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited {
                url: url.to_string(),
            });
        }
        if status != StatusCode::OK {
            warn!(url = %url, status = status.as_u16(), "Upstream returned non-200");
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body: Value = response.json().await?;
        debug!(url = %url, status = status.as_u16(), "Upstream page received");

        match body {
            Value::Object(mut map) => match map.remove("data") {
                Some(Value::Array(records)) => Ok(records),
                Some(other) => Err(FetchError::invalid(
                    url.as_str(),
                    format!("'data' is not an array: {other}"),
                )),
                None => Err(FetchError::invalid(url.as_str(), "missing 'data' field")),
            },
            _ => Err(FetchError::invalid(url.as_str(), "body is not a JSON object")),
        }
    }
}

#[async_trait]
impl UpstreamApi for UpstreamClient {
    async fn query(
        &self,
        endpoint: &str,
        filters: &QueryFilters,
        after: Option<Cursor>,
    ) -> Result<Vec<Value>, FetchError> {
        let url = self.request_url(endpoint, filters, after)?;
        self.retry
            .execute(|| {
                let url = url.clone();
                async move {
                    self.limiter.acquire().await;
                    self.fetch_page(url).await
                }
            })
            .await
    }
}
