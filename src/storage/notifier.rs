//! Hand-off of discovered item ids to independently run stage workers.
//!
//! Delivery is at-least-once: a stage worker receiving the same id twice just
//! overwrites its earlier output.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::NotifyError;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Announces one discovered item.
    async fn send(&self, item_id: &str) -> Result<(), NotifyError>;
}

/// Appends one id per line to a spool file that stage workers consume.
#[derive(Debug)]
pub struct SpoolNotifier {
    path: PathBuf,
    // Serializes appends so concurrent sends never interleave lines.
    write_lock: Mutex<()>,
}

impl SpoolNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl Notifier for SpoolNotifier {
    async fn send(&self, item_id: &str) -> Result<(), NotifyError> {
        if item_id.is_empty() || item_id.contains(['\n', '\r']) {
            return Err(NotifyError::Delivery {
                item_id: item_id.to_string(),
                reason: "id is empty or spans lines".to_string(),
            });
        }

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{item_id}\n").as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Only logs each id. Used when no spool is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, item_id: &str) -> Result<(), NotifyError> {
        info!(item_id = %item_id, "Archival requested");
        Ok(())
    }
}
