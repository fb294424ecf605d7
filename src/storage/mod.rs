//! Storage, discovery-config and notification collaborators.
//!
//! The pipeline only talks to these through traits:
//! - **Storage**: archived posts, comments, media and job reports
//! - **ConfigStore**: the discovery cursor and metadata backfill progress
//! - **Notifier**: hands discovered item ids to out-of-process stage workers
//!
//! # Usage
//!
//! ```rust,ignore
//! use post_archiver::storage::{list_dirs, LocalStorage, Storage};
//! use futures::StreamExt;
//!
//! let storage = LocalStorage::open("./archive").await?;
//! storage.mkdir("abc123").await?;
//! storage.write("abc123/post.json", "{}").await?;
//!
//! let mut dirs = list_dirs(&storage, None);
//! while let Some(dir) = dirs.next().await {
//!     println!("{}", dir?);
//! }
//! ```

pub mod config_store;
pub mod local;
pub mod memory;
pub mod notifier;

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::StorageError;

// Re-export main types for convenience
pub use config_store::{
    ConfigStore, DiscoveryConfig, JsonFileConfigStore, MemoryConfigStore, MetadataCommand,
};
pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use notifier::{LogNotifier, Notifier, SpoolNotifier};

/// Directory names fetched per `list_dirs_page` call.
pub const LIST_PAGE_SIZE: usize = 1000;

/// Key/value object storage addressed by `/`-separated relative paths.
///
/// Implementations must be safe for concurrent use by many stage workers.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Creates a directory. Succeeds if it already exists, including when
    /// another worker created it concurrently.
    async fn mkdir(&self, path: &str) -> Result<(), StorageError>;

    async fn write(&self, path: &str, text: &str) -> Result<(), StorageError>;

    async fn write_raw(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Returns `None` when nothing is stored at `path`.
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Returns up to `limit` top-level directory names sorted ascending,
    /// strictly after `start_after` when given.
    async fn list_dirs_page(
        &self,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StorageError>;
}

/// Lazily lists every top-level directory after `start_after`, fetching one
/// page of [`LIST_PAGE_SIZE`] names at a time.
pub fn list_dirs<'a, S>(
    storage: &'a S,
    start_after: Option<String>,
) -> BoxStream<'a, Result<String, StorageError>>
where
    S: Storage + ?Sized,
{
    Box::pin(stream! {
        let mut after = start_after;
        loop {
            let page = match storage.list_dirs_page(after.as_deref(), LIST_PAGE_SIZE).await {
                Ok(page) => page,
                Err(e) => {
                    yield Err(e);
                    break;
                }
            };
            let exhausted = page.len() < LIST_PAGE_SIZE;
            after = page.last().cloned();
            for dir in page {
                yield Ok(dir);
            }
            if exhausted {
                break;
            }
        }
    })
}

/// Rejects absolute paths and parent-directory components.
pub(crate) fn validate_path(path: &str) -> Result<(), StorageError> {
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(StorageError::InvalidPath(format!("absolute path '{path}'")));
    }
    if path.split(['/', '\\']).any(|part| part == "..") {
        return Err(StorageError::InvalidPath(format!(
            "parent component in '{path}'"
        )));
    }
    Ok(())
}
