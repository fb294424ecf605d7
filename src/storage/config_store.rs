//! Persisted discovery configuration.
//!
//! Holds the producer's cursor plus the metadata backfill's progress marker
//! and control command. A restarted process must read back exactly what it
//! last wrote, so the file store replaces its document atomically.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StorageError;
use crate::pipeline::types::Cursor;

/// Control command for the metadata backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataCommand {
    /// Regenerate every record from the beginning.
    Rebuild,
    /// Continue after `last_generated_metadata`.
    Resume,
}

/// The discovery-config document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Creation time of the last record discovered.
    #[serde(rename = "after_utc", default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_generated_metadata: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_command: Option<MetadataCommand>,
}

/// Read-after-write consistent store for [`DiscoveryConfig`].
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Returns the stored config, or the default when nothing was stored yet.
    async fn get_config(&self) -> Result<DiscoveryConfig, StorageError>;

    async fn put_config(&self, config: &DiscoveryConfig) -> Result<(), StorageError>;
}

/// Config kept in a JSON file, replaced by write-then-rename.
#[derive(Debug, Clone)]
pub struct JsonFileConfigStore {
    path: PathBuf,
}

impl JsonFileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn display(&self) -> String {
        self.path.display().to_string()
    }
}

#[async_trait]
impl ConfigStore for JsonFileConfigStore {
    async fn get_config(&self) -> Result<DiscoveryConfig, StorageError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(DiscoveryConfig::default()),
            Err(e) => Err(StorageError::io(self.display(), e)),
        }
    }

    async fn put_config(&self, config: &DiscoveryConfig) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent.display().to_string(), e))?;
        }

        let body = serde_json::to_vec_pretty(config)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, body)
            .await
            .map_err(|e| StorageError::io(tmp.display().to_string(), e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StorageError::io(self.display(), e))?;

        debug!(path = %self.display(), cursor = ?config.cursor, "Discovery config saved");
        Ok(())
    }
}

/// Config held in memory.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    config: RwLock<DiscoveryConfig>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DiscoveryConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get_config(&self) -> Result<DiscoveryConfig, StorageError> {
        Ok(self.config.read().await.clone())
    }

    async fn put_config(&self, config: &DiscoveryConfig) -> Result<(), StorageError> {
        *self.config.write().await = config.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_reads_default() {
        let tmp = TempDir::new().expect("tempdir");
        let store = JsonFileConfigStore::new(tmp.path().join("state.json"));
        assert_eq!(
            store.get_config().await.expect("get"),
            DiscoveryConfig::default()
        );
    }

    #[tokio::test]
    async fn test_read_after_write_across_instances() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("nested").join("state.json");

        let config = DiscoveryConfig {
            cursor: Some(Cursor(1630450800)),
            last_generated_metadata: Some("pabc12".to_string()),
            metadata_command: Some(MetadataCommand::Resume),
        };
        JsonFileConfigStore::new(&path)
            .put_config(&config)
            .await
            .expect("put");

        // A fresh instance stands in for a restarted process.
        let reread = JsonFileConfigStore::new(&path)
            .get_config()
            .await
            .expect("get");
        assert_eq!(reread, config);
        assert!(!tmp.path().join("nested").join("state.json.tmp").exists());

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(raw["after_utc"], 1630450800);
        assert_eq!(raw["metadata_command"], "resume");
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryConfigStore::new();
        let mut config = store.get_config().await.expect("get");
        assert!(config.cursor.is_none());

        config.cursor = Some(Cursor(42));
        store.put_config(&config).await.expect("put");
        assert_eq!(
            store.get_config().await.expect("get").cursor,
            Some(Cursor(42))
        );
    }
}
