//! Gateway Error Types
//!
//! Caller-facing failure taxonomy. Every variant maps to a stable
//! classification string via [`GatewayError::code`] and a reason via
//! [`GatewayError::public_message`] that never includes credentials, keys or
//! internal state.

use std::time::Duration;

use crate::command::Rejection;
use crate::gateway::CommandResponse;
use crate::rate_limit::RateScope;

/// Errors returned by [`crate::gateway::Gateway::submit`] and friends
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Schema violation or injection pattern; never executed
    #[error("validation failed: {0}")]
    Validation(Rejection),

    /// Rate limit exhausted for the scope
    #[error("rate limited for {scope}; retry after {}s", .retry_after.as_secs())]
    RateLimited {
        retry_after: Duration,
        scope: RateScope,
    },

    /// Credential could not be refreshed; session is invalid until re-authentication
    #[error("credential refresh failed: {reason}")]
    CredentialRefreshFailed { reason: String },

    /// Subprocess killed at its deadline; carries the partial output
    #[error("execution timed out")]
    ExecutionTimeout(Box<CommandResponse>),

    /// Subprocess ran and reported failure
    #[error("execution failed")]
    ExecutionFailed(Box<CommandResponse>),

    /// Caller cancelled the request
    #[error("execution cancelled")]
    Cancelled(Option<Box<CommandResponse>>),

    /// Execution pool and its wait queue are full
    #[error("too many queued executions (limit {max_queued})")]
    Backpressure { max_queued: usize },

    /// Audit trail could not be written or read
    #[error("audit failure: {0}")]
    AuditWriteFailure(String),

    /// Encryption or decryption failed; no data is returned
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    /// Unexpected internal fault
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable classification for clients and metrics labels
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation_error",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::CredentialRefreshFailed { .. } => "credential_refresh_failed",
            GatewayError::ExecutionTimeout(_) => "execution_timeout",
            GatewayError::ExecutionFailed(_) => "execution_failed",
            GatewayError::Cancelled(_) => "cancelled",
            GatewayError::Backpressure { .. } => "backpressure",
            GatewayError::AuditWriteFailure(_) => "audit_write_failure",
            GatewayError::CryptoFailure(_) => "crypto_failure",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Human-readable reason safe to show to the caller
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Validation(rejection) => rejection.to_string(),
            GatewayError::RateLimited { retry_after, scope } => format!(
                "rate limit exceeded for operation class '{}'; retry after {}s",
                scope.class,
                retry_after.as_secs().max(1)
            ),
            GatewayError::CredentialRefreshFailed { .. } => {
                "credential refresh failed; re-authentication required".to_string()
            }
            GatewayError::ExecutionTimeout(_) => {
                "command exceeded its timeout and was terminated".to_string()
            }
            GatewayError::ExecutionFailed(response) => {
                match response.record.as_ref().and_then(|r| r.exit_code()) {
                    Some(code) => format!("command exited with status {}", code),
                    None => "command terminated abnormally".to_string(),
                }
            }
            GatewayError::Cancelled(_) => "command was cancelled".to_string(),
            GatewayError::Backpressure { .. } => {
                "gateway is at capacity; try again shortly".to_string()
            }
            GatewayError::AuditWriteFailure(_) => "audit trail unavailable".to_string(),
            GatewayError::CryptoFailure(_) => "integrity check failed".to_string(),
            GatewayError::Internal(_) => "internal error".to_string(),
        }
    }

    /// Captured output for failures that ran a process
    pub fn response(&self) -> Option<&CommandResponse> {
        match self {
            GatewayError::ExecutionTimeout(response) | GatewayError::ExecutionFailed(response) => {
                Some(response)
            }
            GatewayError::Cancelled(response) => response.as_deref(),
            _ => None,
        }
    }

    /// Retry-after hint for rate-limited requests
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<crate::crypto::CryptoError> for GatewayError {
    fn from(err: crate::crypto::CryptoError) -> Self {
        GatewayError::CryptoFailure(err.to_string())
    }
}

impl From<crate::oauth::RefreshError> for GatewayError {
    fn from(err: crate::oauth::RefreshError) -> Self {
        GatewayError::CredentialRefreshFailed {
            reason: err.to_string(),
        }
    }
}

impl From<crate::audit::AuditError> for GatewayError {
    fn from(err: crate::audit::AuditError) -> Self {
        GatewayError::AuditWriteFailure(err.to_string())
    }
}
