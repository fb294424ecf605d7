//! Directory-tree storage on the local filesystem.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{validate_path, Storage};
use crate::error::StorageError;

/// Storage rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Opens (creating if needed) a storage root.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::io(root.display().to_string(), e))?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn mkdir(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        match fs::create_dir_all(&full).await {
            Ok(()) => Ok(()),
            // Another worker won the race.
            Err(e) if e.kind() == ErrorKind::AlreadyExists && full.is_dir() => Ok(()),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn write(&self, path: &str, text: &str) -> Result<(), StorageError> {
        self.write_raw(path, text.as_bytes()).await
    }

    async fn write_raw(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        fs::write(&full, bytes)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        debug!(path = %path, bytes = bytes.len(), "Wrote file");
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let full = self.resolve(path)?;
        match fs::read(&full).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn list_dirs_page(
        &self,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        let root = self.root.display().to_string();
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| StorageError::io(root.clone(), e))?;

        let mut dirs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(root.clone(), e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StorageError::io(root.clone(), e))?;
            if !file_type.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if start_after.map_or(true, |after| name > after) {
                    dirs.push(name.to_string());
                }
            }
        }

        dirs.sort();
        dirs.truncate(limit);
        Ok(dirs)
    }
}
