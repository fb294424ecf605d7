//! Archives the comment tree of a submission.
//!
//! The upstream lists a submission's comment ids; bodies are then fetched in
//! chunks of [`COMMENT_CHUNK_SIZE`] ids and concatenated in request order.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{base_fragment, write_json, Stage};
use crate::error::StageError;
use crate::pipeline::types::{StageKind, WorkItem};
use crate::storage::Storage;
use crate::upstream::client::{comment_ids_endpoint, QueryFilters, UpstreamApi, COMMENT_SEARCH};

/// Comment ids requested per upstream call.
pub const COMMENT_CHUNK_SIZE: usize = 256;

pub struct CommentsStage {
    upstream: Arc<dyn UpstreamApi>,
    storage: Arc<dyn Storage>,
}

impl CommentsStage {
    pub fn new(upstream: Arc<dyn UpstreamApi>, storage: Arc<dyn Storage>) -> Self {
        Self { upstream, storage }
    }

    async fn comment_ids(&self, item_id: &str) -> Result<Vec<String>, StageError> {
        let raw = self
            .upstream
            .query(&comment_ids_endpoint(item_id), &QueryFilters::new(), None)
            .await?;

        let ids: Vec<String> = raw
            .iter()
            .filter_map(|id| match id {
                Value::String(s) => Some(s.clone()),
                other => {
                    warn!(item_id = %item_id, value = %other, "Ignoring non-string comment id");
                    None
                }
            })
            .collect();
        Ok(ids)
    }

    async fn fetch_comments(&self, item_id: &str, ids: &[String]) -> Result<Vec<Value>, StageError> {
        let mut comments = Vec::with_capacity(ids.len());
        for (n, chunk) in ids.chunks(COMMENT_CHUNK_SIZE).enumerate() {
            let filters = QueryFilters::new()
                .with("ids", chunk.join(","))
                .with("size", chunk.len());
            let page = self.upstream.query(COMMENT_SEARCH, &filters, None).await?;
            debug!(
                item_id = %item_id,
                chunk = n,
                requested = chunk.len(),
                received = page.len(),
                "Fetched comment chunk"
            );
            comments.extend(page);
        }
        Ok(comments)
    }
}

#[async_trait]
impl Stage for CommentsStage {
    fn kind(&self) -> StageKind {
        StageKind::Comments
    }

    async fn process(&self, item: &WorkItem) -> Result<Value, StageError> {
        info!(item_id = %item.id(), "Archiving comments");

        let ids = self.comment_ids(item.id()).await?;
        let comments = self.fetch_comments(item.id(), &ids).await?;
        write_json(self.storage.as_ref(), item.id(), "comments.json", &comments).await?;

        let mut fragment = base_fragment(item.id());
        fragment["comment_count"] = Value::from(comments.len());
        Ok(fragment)
    }
}
