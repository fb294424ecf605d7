//! Downloads the media attached to a submission.
//!
//! The kind is inferred in fixed priority: gallery (a media map is present),
//! then hosted video, then image (both by `post_hint`), otherwise none.
//! Every fetch shares the process-wide rate limiter and runs under the media
//! retry policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{base_fragment, Stage};
use crate::error::{FetchError, StageError};
use crate::pipeline::types::{StageKind, WorkItem};
use crate::storage::Storage;
use crate::upstream::rate_limiter::RateLimiter;
use crate::upstream::retry::RetryPolicy;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0";

/// Media category of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Gallery,
    Video,
    Image,
    None,
}

/// Picks the media kind from the record's fields.
pub fn infer_media_kind(item: &WorkItem) -> MediaKind {
    if item.field("media_metadata").is_some() {
        return MediaKind::Gallery;
    }
    match item.str_field("post_hint") {
        Some("hosted:video") => MediaKind::Video,
        Some("image") => MediaKind::Image,
        _ => MediaKind::None,
    }
}

/// Resolves the downloadable URL of every valid gallery entry, in map order.
///
/// Entries whose status is not `valid` or that carry no source URL are
/// skipped. Preview hosts are rewritten to the original image host and query
/// strings dropped.
pub fn resolve_gallery_urls(media_metadata: &Value) -> Vec<String> {
    let Some(entries) = media_metadata.as_object() else {
        return Vec::new();
    };

    entries
        .values()
        .filter(|entry| entry.get("status").and_then(Value::as_str) == Some("valid"))
        .filter_map(|entry| {
            let source = entry.get("s")?;
            source
                .get("u")
                .or_else(|| source.get("gif"))
                .and_then(Value::as_str)
        })
        .map(|url| {
            let url = url.split('?').next().unwrap_or(url);
            url.replace("preview.redd.it", "i.redd.it")
        })
        .collect()
}

/// Last path segment of `url`, used as the stored file name.
fn file_name(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    path.rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Media stage worker. Owns one HTTP connection pool for its lifetime.
pub struct MediaStage {
    client: Client,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    storage: Arc<dyn Storage>,
}

impl MediaStage {
    /// # Errors
    ///
    /// Returns `FetchError::Request` if the HTTP client cannot be built.
    pub fn new(
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        storage: Arc<dyn Storage>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            limiter,
            retry,
            storage,
        })
    }

    /// One rate-limited GET. `optional` maps 403/404 to `Ok(None)`.
    async fn get_once(&self, url: &str, optional: bool) -> Result<Option<Vec<u8>>, FetchError> {
        self.limiter.acquire().await;
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        debug!(url = %url, status = status.as_u16(), "Media response");
        match status {
            StatusCode::OK => Ok(Some(response.bytes().await?.to_vec())),
            StatusCode::TOO_MANY_REQUESTS => Err(FetchError::RateLimited {
                url: url.to_string(),
            }),
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND if optional => Ok(None),
            _ => Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    async fn fetch(&self, url: &str, optional: bool) -> Result<Option<Vec<u8>>, FetchError> {
        self.retry.execute(|| self.get_once(url, optional)).await
    }

    async fn fetch_required(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        // Only optional fetches may come back empty.
        self.fetch(url, false)
            .await?
            .ok_or_else(|| FetchError::invalid(url, "empty response"))
    }

    async fn fetch_json(&self, url: &str) -> Result<Value, FetchError> {
        self.retry
            .execute(|| async move {
                let bytes = self
                    .get_once(url, false)
                    .await?
                    .ok_or_else(|| FetchError::invalid(url, "empty response"))?;
                serde_json::from_slice(&bytes).map_err(|e| FetchError::invalid(url, e.to_string()))
            })
            .await
    }

    async fn image(&self, url: &str) -> Result<Vec<(String, Vec<u8>)>, StageError> {
        let name = file_name(url)
            .ok_or_else(|| StageError::MalformedItem(format!("no file name in '{url}'")))?;
        let bytes = self.fetch_required(url).await?;
        Ok(vec![(name, bytes)])
    }

    async fn gallery(&self, item: &WorkItem) -> Result<Vec<(String, Vec<u8>)>, StageError> {
        let urls = item
            .field("media_metadata")
            .map(resolve_gallery_urls)
            .unwrap_or_default();

        let mut media = Vec::with_capacity(urls.len());
        for url in urls {
            match file_name(&url) {
                Some(name) => media.push((name, self.fetch_required(&url).await?)),
                None => warn!(item_id = %item.id(), url = %url, "Skipping gallery entry without file name"),
            }
        }
        Ok(media)
    }

    async fn video(&self, item: &WorkItem) -> Result<Vec<(String, Vec<u8>)>, StageError> {
        let full_link = item
            .str_field("full_link")
            .ok_or_else(|| StageError::MalformedItem("video without full_link".to_string()))?;
        let document = self.fetch_json(&format!("{full_link}.json")).await?;

        let details = document
            .pointer("/0/data/children/0/data/secure_media/reddit_video")
            .ok_or_else(|| StageError::MalformedItem("no reddit_video details".to_string()))?;

        if details.get("transcoding_status").and_then(Value::as_str) != Some("completed") {
            info!(item_id = %item.id(), "Video still transcoding, nothing to archive");
            return Ok(Vec::new());
        }

        let video_url = details
            .get("fallback_url")
            .and_then(Value::as_str)
            .ok_or_else(|| StageError::MalformedItem("video without fallback_url".to_string()))?;
        let mut media = vec![("video.mp4".to_string(), self.fetch_required(video_url).await?)];

        if let Some(base) = item.str_field("url") {
            let audio_url = format!("{}/DASH_audio.mp4", base.trim_end_matches('/'));
            match self.fetch(&audio_url, true).await? {
                Some(audio) => media.push(("audio.mp4".to_string(), audio)),
                None => debug!(item_id = %item.id(), "Video has no separate audio stream"),
            }
        }
        Ok(media)
    }
}

#[async_trait]
impl Stage for MediaStage {
    fn kind(&self) -> StageKind {
        StageKind::Media
    }

    async fn process(&self, item: &WorkItem) -> Result<Value, StageError> {
        let kind = infer_media_kind(item);
        info!(item_id = %item.id(), kind = ?kind, "Archiving media");

        let media = match kind {
            MediaKind::Gallery => self.gallery(item).await?,
            MediaKind::Video => self.video(item).await?,
            MediaKind::Image => {
                let url = item
                    .str_field("url")
                    .ok_or_else(|| StageError::MalformedItem("image without url".to_string()))?;
                self.image(url).await?
            }
            MediaKind::None => Vec::new(),
        };

        if !media.is_empty() {
            self.storage.mkdir(item.id()).await?;
            for (name, bytes) in &media {
                self.storage
                    .write_raw(&format!("{}/{}", item.id(), name), bytes)
                    .await?;
            }
        }

        let mut fragment = base_fragment(item.id());
        fragment["media"] = media.iter().map(|(name, _)| Value::from(name.as_str())).collect();
        Ok(fragment)
    }
}
