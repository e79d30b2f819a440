//! Persistence boundary: one record per processed query, write-only.

use crate::core_types::HistoryRecord;
use crate::errors::PipelineError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, record: &HistoryRecord) -> Result<(), PipelineError>;
}

pub struct NoopHistorySink;

#[async_trait]
impl HistorySink for NoopHistorySink {
    async fn record(&self, _record: &HistoryRecord) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Appends records as JSON lines.
pub struct JsonlHistorySink {
    path: PathBuf,
    // Serializes appends from concurrent queries.
    lock: Mutex<()>,
}

impl JsonlHistorySink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistorySink for JsonlHistorySink {
    async fn record(&self, record: &HistoryRecord) -> Result<(), PipelineError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
