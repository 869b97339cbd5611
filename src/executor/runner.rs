//! Process Runner
//!
//! [`ProcessRunner`] is the seam between the executor and the operating
//! system. [`TokioProcessRunner`] spawns the tool directly (never through a
//! shell) with a scrubbed environment, captures both pipes concurrently and
//! enforces the deadline and cancellation by killing and reaping the child.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as TokioCommand;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::output::{BoundedBuffer, Captured};
use crate::identity::SecretString;

/// Everything needed to start one subprocess
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Complete child environment; nothing else is inherited
    pub env: Vec<(String, SecretString)>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub drain_timeout: Duration,
}

/// How the child stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own with a status code
    Exited(i32),
    /// Terminated by a signal
    Signaled,
    /// Killed at the deadline
    TimedOut,
    /// Killed because the caller cancelled
    Cancelled,
}

/// Raw result of a run
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub stdout: Captured,
    pub stderr: Captured,
    pub termination: Termination,
}

impl RawOutput {
    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited(code) => Some(code),
            _ => None,
        }
    }
}

/// Runner errors
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to start '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("failed waiting for child: {0}")]
    Wait(String),

    #[error("execution queue is full (limit {max_queued})")]
    Backpressure { max_queued: usize },

    #[error("cancelled while waiting for an execution slot")]
    Cancelled,

    #[error("execution pool is closed")]
    Closed,
}

/// Starts subprocesses
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion, deadline or cancellation
    ///
    /// Implementations must not return before a killed child has been reaped.
    async fn run(&self, invocation: Invocation, cancel: CancellationToken) -> Result<RawOutput, ExecutorError>;
}

/// Runner backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, invocation: Invocation, cancel: CancellationToken) -> Result<RawOutput, ExecutorError> {
        let mut process = TokioCommand::new(&invocation.program);
        process
            .args(&invocation.args)
            .env_clear()
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.expose())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            process.current_dir(dir);
        }

        let mut child = process.spawn().map_err(|e| ExecutorError::Spawn {
            program: invocation.program.clone(),
            reason: e.to_string(),
        })?;
        debug!(program = %invocation.program, pid = ?child.id(), "Spawned child");

        let stdout_buf = BoundedBuffer::new(invocation.max_output_bytes);
        let stderr_buf = BoundedBuffer::new(invocation.max_output_bytes);
        let stdout_reader = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(stdout_buf.clone().fill(pipe)));
        let stderr_reader = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(stderr_buf.clone().fill(pipe)));

        let termination = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| ExecutorError::Wait(e.to_string()))?;
                match status.code() {
                    Some(code) => Termination::Exited(code),
                    None => Termination::Signaled,
                }
            }
            _ = tokio::time::sleep(invocation.timeout) => {
                warn!(program = %invocation.program, timeout_ms = invocation.timeout.as_millis() as u64, "Child timed out; killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed out child");
                }
                Termination::TimedOut
            }
            _ = cancel.cancelled() => {
                debug!(program = %invocation.program, "Cancelled; killing child");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill cancelled child");
                }
                Termination::Cancelled
            }
        };

        // Grandchildren can keep a pipe open after the child is gone.
        for reader in [stdout_reader, stderr_reader].into_iter().flatten() {
            let abort = reader.abort_handle();
            match tokio::time::timeout(invocation.drain_timeout, reader).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => debug!(error = %e, "Output reader failed"),
                Ok(Err(e)) => debug!(error = %e, "Output reader task failed"),
                Err(_) => {
                    debug!("Output reader did not finish; aborting");
                    abort.abort();
                }
            }
        }

        Ok(RawOutput {
            stdout: stdout_buf.snapshot(),
            stderr: stderr_buf.snapshot(),
            termination,
        })
    }
}
