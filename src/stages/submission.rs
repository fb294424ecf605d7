//! Persists the discovered submission record verbatim.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{base_fragment, write_json, Stage};
use crate::error::StageError;
use crate::pipeline::types::{StageKind, WorkItem};
use crate::storage::Storage;

pub struct SubmissionStage {
    storage: Arc<dyn Storage>,
}

impl SubmissionStage {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Stage for SubmissionStage {
    fn kind(&self) -> StageKind {
        StageKind::Submission
    }

    async fn process(&self, item: &WorkItem) -> Result<Value, StageError> {
        info!(item_id = %item.id(), "Archiving submission");
        write_json(self.storage.as_ref(), item.id(), "post.json", item.record()).await?;
        Ok(base_fragment(item.id()))
    }
}
