//! Command Requests
//!
//! A [`CommandRequest`] is built once from untrusted input and never mutated
//! afterwards; every accessor hands out shared references.

use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::identity::Identity;

/// A request to run one gateway operation
#[derive(Debug, Clone)]
pub struct CommandRequest {
    id: Uuid,
    operation: String,
    args: Vec<String>,
    context: Option<String>,
    timeout: Option<Duration>,
    identity: Identity,
    bypass_cache: bool,
    submitted_at: DateTime<Utc>,
}

impl CommandRequest {
    /// Create a request for `operation` with positional `args`
    pub fn new<I, S>(identity: Identity, operation: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            args: args.into_iter().map(Into::into).collect(),
            context: None,
            timeout: None,
            identity,
            bypass_cache: false,
            submitted_at: Utc::now(),
        }
    }

    /// Set the working context (target server name)
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Request a specific timeout (clamped by the executor)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Skip the result cache and force a fresh execution
    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn principal(&self) -> &str {
        &self.identity.principal
    }

    pub fn wants_fresh(&self) -> bool {
        self.bypass_cache
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }
}
