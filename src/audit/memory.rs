//! In-memory audit sink

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{AuditEntry, AuditError, AuditQuery, AuditSink};

/// Audit sink that keeps entries in process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Entries in append order
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn export(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError> {
        let entries = self.entries.read().await.clone();
        Ok(query.apply(entries))
    }
}
