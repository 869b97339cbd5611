//! Audit Trail
//!
//! Append-only record of every submission the gateway sees: executed,
//! served from cache, rejected, throttled or refused for lack of a valid
//! credential. Entries are never edited or removed through this module.
//!
//! # Features
//!
//! - **Arrival ordering**: sequence numbers are assigned when an entry is recorded
//! - **Sealed payloads**: the redacted command line is encrypted before storage
//! - **Non-blocking**: a single background worker writes, callers never wait on storage
//! - **Bounded retry**: failed writes back off exponentially with jitter, then alert
//!
//! # Architecture
//!
//! ```text
//! record() ──▶ [bounded queue] ──▶ worker ──▶ AuditSink::append
//!                                    │ retries exhausted
//!                                    ▼
//!                     alert + audit-incomplete flag
//! ```

pub mod jsonl;
pub mod memory;
pub mod recorder;
pub mod redact;
pub mod retry;

pub use jsonl::JsonlAuditSink;
pub use memory::MemoryAuditSink;
pub use recorder::{AuditDraft, AuditRecorder, ALERT_TARGET, PAYLOAD_PURPOSE};
pub use redact::{redact_arguments, RedactedCommand, REDACTED};
pub use retry::{RetryDecision, RetryPolicy};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::crypto::SealedPayload;

/// Audit errors
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(String),

    #[error("audit serialization error: {0}")]
    Serialization(String),

    #[error("audit sink unavailable: {0}")]
    Unavailable(String),

    #[error("audit queue is full")]
    QueueFull,

    #[error("audit recorder is closed")]
    Closed,

    #[error("audit payload could not be opened: {0}")]
    Crypto(String),
}

impl From<std::io::Error> for AuditError {
    fn from(err: std::io::Error) -> Self {
        AuditError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        AuditError::Serialization(err.to_string())
    }
}

/// What happened to a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Ran and exited successfully
    Succeeded,
    /// Served from the result cache
    CacheHit,
    /// Rejected by the validator
    Rejected,
    /// Denied by the rate limiter
    Throttled,
    /// No valid credential could be obtained
    CredentialFailed,
    /// Ran and failed (non-zero exit, crash, auth failure)
    Failed,
    /// Killed at its deadline
    TimedOut,
    /// Cancelled by the caller
    Cancelled,
    /// Turned away because the execution queue was full
    Backpressure,
    /// Internal fault
    Error,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Succeeded => "succeeded",
            AuditOutcome::CacheHit => "cache_hit",
            AuditOutcome::Rejected => "rejected",
            AuditOutcome::Throttled => "throttled",
            AuditOutcome::CredentialFailed => "credential_failed",
            AuditOutcome::Failed => "failed",
            AuditOutcome::TimedOut => "timed_out",
            AuditOutcome::Cancelled => "cancelled",
            AuditOutcome::Backpressure => "backpressure",
            AuditOutcome::Error => "error",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    /// Arrival order within this process
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub principal: String,
    /// Operation name
    pub action: String,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    /// Sealed redacted command line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<SealedPayload>,
    /// Set instead of `payload` when sealing failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_error: Option<String>,
}

/// Filter for [`AuditSink::export`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditQuery {
    /// Only entries at or after this instant
    pub since: Option<DateTime<Utc>>,
    pub principal: Option<String>,
    /// Keep only the most recent `limit` matches
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.since.is_none_or(|since| entry.timestamp >= since)
            && self
                .principal
                .as_deref()
                .is_none_or(|p| entry.principal == p)
    }

    /// Filter, order by time then sequence, and apply the limit
    pub fn apply(&self, entries: impl IntoIterator<Item = AuditEntry>) -> Vec<AuditEntry> {
        let mut matched: Vec<AuditEntry> = entries.into_iter().filter(|e| self.matches(e)).collect();
        matched.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        if let Some(limit) = self.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }
}

/// Append-only audit storage
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Durably append one entry
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError>;

    /// Time-ordered, read-only view of stored entries
    async fn export(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError>;
}

/// Audit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON lines file; entries are kept in memory when unset
    pub path: Option<PathBuf>,
    /// Entries allowed to wait for the writer
    pub queue_capacity: usize,
    /// Audit-incomplete ids kept before the oldest are dropped
    pub incomplete_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            queue_capacity: 1024,
            incomplete_capacity: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(sequence: u64, principal: &str, timestamp: DateTime<Utc>) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4(),
            sequence,
            timestamp,
            principal: principal.to_string(),
            action: "list-servers".to_string(),
            outcome: AuditOutcome::Succeeded,
            reason: None,
            execution_id: None,
            payload: None,
            payload_error: None,
        }
    }

    #[test]
    fn test_query_orders_and_limits() {
        let now = Utc::now();
        let entries = vec![
            entry(3, "alice", now),
            entry(1, "alice", now - Duration::seconds(20)),
            entry(2, "bob", now - Duration::seconds(10)),
            entry(4, "alice", now),
        ];

        let all = AuditQuery::all().apply(entries.clone());
        let sequences: Vec<u64> = all.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);

        let alice = AuditQuery::all().principal("alice").limit(2).apply(entries.clone());
        let sequences: Vec<u64> = alice.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![3, 4]);

        let recent = AuditQuery::all().since(now - Duration::seconds(15)).apply(entries);
        assert_eq!(recent.len(), 3);
    }

    #[test]
    fn test_entry_json_shape() {
        let e = entry(7, "alice", Utc::now());
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["outcome"], "succeeded");
        assert!(json.get("payload").is_none());
        assert!(json.get("executionId").is_none());

        let back: AuditEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }
}
