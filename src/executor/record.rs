//! Execution Records
//!
//! A [`PendingExecution`] is opened when a subprocess is about to start and
//! consumed by [`PendingExecution::finish`], which yields the immutable
//! [`ExecutionRecord`]. Records have no setters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

use crate::command::CommandRequest;

/// How an execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    NonZeroExit { code: i32 },
    Timeout,
    /// Killed by a signal, or never started
    Crashed,
    Cancelled,
    /// Non-zero exit that reported an authorization failure
    Unauthorized,
}

impl Outcome {
    /// Stable label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::NonZeroExit { .. } => "non_zero_exit",
            Outcome::Timeout => "timeout",
            Outcome::Crashed => "crashed",
            Outcome::Cancelled => "cancelled",
            Outcome::Unauthorized => "unauthorized",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::NonZeroExit { code } => write!(f, "non_zero_exit({})", code),
            other => f.write_str(other.as_str()),
        }
    }
}

/// An execution that has started but not finished
#[derive(Debug)]
pub struct PendingExecution {
    execution_id: Uuid,
    request_id: Uuid,
    principal: String,
    operation: String,
    started_at: DateTime<Utc>,
    clock: Instant,
}

impl PendingExecution {
    pub fn start(request: &CommandRequest) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            request_id: request.id(),
            principal: request.principal().to_string(),
            operation: request.operation().to_string(),
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Finalize into an immutable record
    pub fn finish(
        self,
        outcome: Outcome,
        exit_code: Option<i32>,
        protocol_bytes: usize,
        diagnostic_bytes: usize,
        truncated: bool,
    ) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: self.execution_id,
            request_id: self.request_id,
            principal: self.principal,
            operation: self.operation,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: self.clock.elapsed().as_millis() as u64,
            exit_code,
            protocol_bytes,
            diagnostic_bytes,
            truncated,
            outcome,
        }
    }
}

/// Finalized record of one subprocess run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    execution_id: Uuid,
    request_id: Uuid,
    principal: String,
    operation: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    duration_ms: u64,
    exit_code: Option<i32>,
    protocol_bytes: usize,
    diagnostic_bytes: usize,
    truncated: bool,
    outcome: Outcome,
}

impl ExecutionRecord {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn protocol_bytes(&self) -> usize {
        self.protocol_bytes
    }

    pub fn diagnostic_bytes(&self) -> usize {
        self.diagnostic_bytes
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "{} {} ({}ms, {} protocol bytes, {} diagnostic bytes{})",
            self.operation,
            self.outcome,
            self.duration_ms,
            self.protocol_bytes,
            self.diagnostic_bytes,
            if self.truncated { ", truncated" } else { "" }
        )
    }
}
