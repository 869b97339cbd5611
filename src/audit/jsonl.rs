//! JSON-lines audit sink
//!
//! One JSON object per line, appended to a single file. The file is only
//! ever opened in append mode and each append is synced to disk before it
//! returns; export parses it read-only and skips lines that do not parse.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use super::{AuditEntry, AuditError, AuditQuery, AuditSink};

/// Append-only audit file
#[derive(Debug, Clone)]
pub struct JsonlAuditSink {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let line = serde_json::to_string(entry)? + "\n";

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        // Durable before the writer reports success
        file.sync_data().await?;
        Ok(())
    }

    async fn export(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (number, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(path = %self.path.display(), line = number + 1, error = %e, "Skipping unreadable audit line"),
            }
        }
        Ok(query.apply(entries))
    }
}
