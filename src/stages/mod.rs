//! Stage workers: the per-item archival concerns.
//!
//! - **Submission**: persists the discovered record as `<id>/post.json`
//! - **Comments**: fetches the comment tree and persists `<id>/comments.json`
//! - **Media**: downloads gallery images, hosted video or a linked image
//!
//! Every worker is allocated once per pool slot and processes many items. A
//! worker's `process` error never escapes the pool; it becomes the failure
//! fragment of that item's [`StageResult`](crate::pipeline::types::StageResult).

pub mod comments;
pub mod media;
pub mod submission;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{StageError, StorageError};
use crate::pipeline::types::{StageKind, WorkItem};
use crate::storage::Storage;

pub use comments::{CommentsStage, COMMENT_CHUNK_SIZE};
pub use media::{infer_media_kind, resolve_gallery_urls, MediaKind, MediaStage};
pub use submission::SubmissionStage;

/// One archival concern applied to every discovered item.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    fn kind(&self) -> StageKind;

    /// Archives `item` and returns the success fragment for the job report.
    async fn process(&self, item: &WorkItem) -> Result<Value, StageError>;
}

/// Fragment fields every stage reports.
pub(crate) fn base_fragment(item_id: &str) -> Value {
    json!({
        "submission_id": item_id,
        "last_updated": Utc::now().timestamp(),
    })
}

/// Creates the item's directory and writes `value` as pretty JSON beneath it.
pub(crate) async fn write_json<T: Serialize + ?Sized>(
    storage: &dyn Storage,
    item_id: &str,
    file_name: &str,
    value: &T,
) -> Result<(), StorageError> {
    storage.mkdir(item_id).await?;
    let body = serde_json::to_string_pretty(value)?;
    storage.write(&format!("{item_id}/{file_name}"), &body).await
}
