//! In-memory storage for dry runs and tests.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{validate_path, Storage};
use crate::error::StorageError;

#[derive(Debug, Default)]
struct Contents {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

/// Storage held entirely in process memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    contents: RwLock<Contents>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored file path, sorted.
    pub async fn paths(&self) -> Vec<String> {
        self.contents.read().await.files.keys().cloned().collect()
    }

    /// Reads and parses a stored JSON document.
    pub async fn read_json(&self, path: &str) -> Result<Option<serde_json::Value>, StorageError> {
        match self.read(path).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn mkdir(&self, path: &str) -> Result<(), StorageError> {
        validate_path(path)?;
        let path = path.trim_end_matches('/');
        if !path.is_empty() {
            self.contents.write().await.dirs.insert(path.to_string());
        }
        Ok(())
    }

    async fn write(&self, path: &str, text: &str) -> Result<(), StorageError> {
        self.write_raw(path, text.as_bytes()).await
    }

    async fn write_raw(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        validate_path(path)?;
        self.contents
            .write()
            .await
            .files
            .insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_path(path)?;
        Ok(self.contents.read().await.files.get(path).cloned())
    }

    async fn list_dirs_page(
        &self,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        let contents = self.contents.read().await;
        Ok(contents
            .dirs
            .iter()
            .filter(|dir| !dir.contains('/'))
            .filter(|dir| start_after.map_or(true, |after| dir.as_str() > after))
            .take(limit)
            .cloned()
            .collect())
    }
}
