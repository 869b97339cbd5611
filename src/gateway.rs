//! Gateway Pipeline
//!
//! Entry point for every command submission. A request passes, in order:
//!
//! ```text
//! RateLimiter ─▶ CommandValidator ─▶ ResultCache ─▶ OAuthInterceptor ─▶ Executor
//!      │                │                 │ hit            (refresh, retry once)
//!      └────────────────┴─────────────────┴──────────────────────┴──▶ AuditRecorder
//! ```
//!
//! Whatever the path, exactly one audit entry is recorded per submission and
//! the caller gets either a [`CommandResponse`] or a classified
//! [`GatewayError`].

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{
    AuditDraft, AuditEntry, AuditError, AuditOutcome, AuditQuery, AuditRecorder, AuditSink,
    JsonlAuditSink, MemoryAuditSink, RedactedCommand,
};
use crate::cache::MemoryCacheStore;
use crate::command::{CommandRequest, CommandValidator, ValidationResult};
use crate::config::Config;
use crate::crypto::SecretBox;
use crate::error::GatewayError;
use crate::executor::{Execution, Executor, ExecutorError, ExecutionRecord, Outcome};
use crate::identity::{CredentialPair, Identity};
use crate::metrics;
use crate::oauth::{
    Attempt, DisabledRefreshClient, HttpRefreshClient, OAuthInterceptor, RefreshClient, Session,
    SessionRegistry,
};
use crate::rate_limit::{RateLimitDecision, RateLimiter, WindowStats};

/// Successful result of a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// Record of the run; `None` when served from the cache
    pub record: Option<ExecutionRecord>,
    /// Structured result data
    pub protocol: String,
    /// Human-readable status text
    pub diagnostics: String,
    pub cached: bool,
}

impl CommandResponse {
    fn from_execution(execution: Execution) -> Self {
        Self {
            record: Some(execution.record),
            protocol: execution.channels.protocol,
            diagnostics: execution.channels.diagnostics,
            cached: false,
        }
    }

    pub fn execution_id(&self) -> Option<Uuid> {
        self.record.as_ref().map(|r| r.execution_id())
    }
}

/// The command-execution gateway
pub struct Gateway {
    validator: CommandValidator,
    limiter: RateLimiter,
    interceptor: OAuthInterceptor,
    executor: Executor,
    audit: Arc<AuditRecorder>,
    sessions: SessionRegistry,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("executor", &self.executor)
            .field("limiter", &self.limiter)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(
        validator: CommandValidator,
        limiter: RateLimiter,
        interceptor: OAuthInterceptor,
        executor: Executor,
        audit: Arc<AuditRecorder>,
    ) -> Self {
        Self {
            validator,
            limiter,
            interceptor,
            executor,
            audit,
            sessions: SessionRegistry::new(),
        }
    }

    /// Assemble a gateway from configuration; must run inside a tokio runtime
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let registry = Arc::new(config.registry());
        let validator = CommandValidator::new(registry)
            .with_max_json_depth(config.validation.max_json_depth)
            .with_max_arg_len(config.validation.max_arg_len)
            .with_max_timeout(config.executor.max_timeout());

        let refresh_client: Arc<dyn RefreshClient> = if config.oauth.token_url.is_some() {
            Arc::new(HttpRefreshClient::from_config(&config.oauth).context("Failed to build refresh client")?)
        } else {
            debug!("No token endpoint configured; credential refresh disabled");
            Arc::new(DisabledRefreshClient)
        };
        let interceptor = OAuthInterceptor::with_config(refresh_client, &config.oauth);

        let mut executor = Executor::with_tokio_runner(config.executor.clone());
        if config.cache.enabled {
            let cache = MemoryCacheStore::new();
            if config.cache.sweep_interval_secs > 0 {
                cache.spawn_sweeper(Duration::from_secs(config.cache.sweep_interval_secs));
            }
            executor = executor.with_cache(Arc::new(cache), config.cache.ttl());
        }

        let sealer = match SecretBox::from_env(&config.crypto.key_env) {
            Ok(sealer) => sealer,
            Err(crate::crypto::CryptoError::MissingKey(var)) => {
                warn!(key_env = %var, "Audit key not set; generated a per-process key");
                SecretBox::generate().0
            }
            Err(e) => return Err(e).context("Failed to load audit key"),
        };
        let sink: Arc<dyn AuditSink> = match &config.audit.path {
            Some(path) => Arc::new(JsonlAuditSink::new(path)),
            None => Arc::new(MemoryAuditSink::new()),
        };
        let audit = Arc::new(AuditRecorder::new(sink, Arc::new(sealer), &config.audit));

        let limiter = RateLimiter::new(config.rate_limit.clone());
        limiter.spawn_pruner(config.rate_limit.window());

        Ok(Self::new(
            validator,
            limiter,
            interceptor,
            executor,
            audit,
        ))
    }

    /// Open (or replace) the session for an identity
    pub fn open_session(&self, identity: Identity, credential: CredentialPair) -> Arc<Session> {
        self.sessions.open(identity, credential)
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Dry-run validation; no side effects
    pub fn validate(&self, request: &CommandRequest) -> ValidationResult {
        self.validator.validate(request)
    }

    /// Run a request through the full pipeline
    pub async fn submit(
        &self,
        session: &Arc<Session>,
        request: CommandRequest,
        cancel: CancellationToken,
    ) -> Result<CommandResponse, GatewayError> {
        let result = self.process(session, &request, &cancel).await;

        let audit_id = self.record_audit(&request, &result);
        let outcome = match &result {
            Ok(response) if response.cached => "cache_hit",
            Ok(_) => "success",
            Err(e) => e.code(),
        };
        metrics::record_request(request.operation(), outcome);
        info!(
            request_id = %request.id(),
            principal = %request.principal(),
            operation = %request.operation(),
            outcome,
            audit_id = %audit_id,
            "Request completed"
        );
        result
    }

    async fn process(
        &self,
        session: &Arc<Session>,
        request: &CommandRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandResponse, GatewayError> {
        if session.principal() != request.principal() {
            return Err(GatewayError::Internal(
                "session does not belong to the requesting principal".to_string(),
            ));
        }

        let registry = self.validator.registry();
        let class = registry.rate_class(request.operation());
        if let RateLimitDecision::Deny { retry_after, scope } = self.limiter.admit(request.identity(), &class) {
            return Err(GatewayError::RateLimited { retry_after, scope });
        }

        if let ValidationResult::Rejected(rejection) = self.validator.validate(request) {
            warn!(
                principal = %request.principal(),
                operation = %request.operation(),
                class = %rejection.class,
                index = ?rejection.offending_index(),
                "Request rejected"
            );
            return Err(GatewayError::Validation(rejection));
        }
        let schema = registry
            .get(request.operation())
            .ok_or_else(|| GatewayError::Internal("validated operation has no schema".to_string()))?;

        if let Some(entry) = self.executor.lookup_cached(request, schema).await {
            debug!(operation = %request.operation(), version = entry.version, "Serving cached result");
            return Ok(CommandResponse {
                record: None,
                protocol: entry.value,
                diagnostics: String::new(),
                cached: true,
            });
        }

        let executor = &self.executor;
        let execution = self
            .interceptor
            .call(session, |credential| async move {
                let execution = executor
                    .execute(request, schema, &credential, cancel)
                    .await
                    .map_err(executor_error)?;
                Ok::<_, GatewayError>(if execution.is_unauthorized() {
                    Attempt::Unauthorized(execution)
                } else {
                    Attempt::Completed(execution)
                })
            })
            .await?;

        let outcome = execution.record.outcome();
        let response = CommandResponse::from_execution(execution);
        match outcome {
            Outcome::Success => Ok(response),
            Outcome::Timeout => Err(GatewayError::ExecutionTimeout(Box::new(response))),
            Outcome::Cancelled => Err(GatewayError::Cancelled(Some(Box::new(response)))),
            Outcome::NonZeroExit { .. } | Outcome::Crashed | Outcome::Unauthorized => {
                Err(GatewayError::ExecutionFailed(Box::new(response)))
            }
        }
    }

    fn record_audit(&self, request: &CommandRequest, result: &Result<CommandResponse, GatewayError>) -> Uuid {
        let (outcome, reason, execution_id) = match result {
            Ok(response) if response.cached => (AuditOutcome::CacheHit, None, None),
            Ok(response) => (AuditOutcome::Succeeded, None, response.execution_id()),
            Err(e) => {
                let outcome = match e {
                    GatewayError::Validation(_) => AuditOutcome::Rejected,
                    GatewayError::RateLimited { .. } => AuditOutcome::Throttled,
                    GatewayError::CredentialRefreshFailed { .. } => AuditOutcome::CredentialFailed,
                    GatewayError::ExecutionTimeout(_) => AuditOutcome::TimedOut,
                    GatewayError::ExecutionFailed(_) => AuditOutcome::Failed,
                    GatewayError::Cancelled(_) => AuditOutcome::Cancelled,
                    GatewayError::Backpressure { .. } => AuditOutcome::Backpressure,
                    _ => AuditOutcome::Error,
                };
                let execution_id = e.response().and_then(|r| r.execution_id());
                (outcome, Some(e.public_message()), execution_id)
            }
        };

        let mut draft = AuditDraft::new(request.principal(), request.operation(), outcome)
            .with_command(request.args(), request.context());
        if let Some(reason) = reason {
            draft = draft.with_reason(reason);
        }
        if let Some(execution_id) = execution_id {
            draft = draft.with_execution(execution_id);
        }
        self.audit.record(draft)
    }

    /// Time-ordered audit entries
    pub async fn export_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, GatewayError> {
        Ok(self.audit.export(query).await?)
    }

    /// Decrypt an audit entry's command line; fails closed
    pub fn open_audit_payload(&self, entry: &AuditEntry) -> Result<Option<RedactedCommand>, GatewayError> {
        self.audit.open_payload(entry).map_err(|e| match e {
            AuditError::Crypto(reason) => GatewayError::CryptoFailure(reason),
            other => other.into(),
        })
    }

    /// Wait for queued audit writes
    pub async fn flush_audit(&self) -> Result<(), GatewayError> {
        Ok(self.audit.flush().await?)
    }

    /// Whether the audit trail is missing the entry for an execution
    pub fn is_audit_incomplete(&self, id: Uuid) -> bool {
        self.audit.is_incomplete(id)
    }

    /// Take the ids flagged audit-incomplete so far
    pub fn drain_audit_incomplete(&self) -> Vec<Uuid> {
        self.audit.drain_incomplete()
    }

    /// Open rate-limit windows for a principal
    pub fn rate_limit_stats(&self, principal: &str) -> Vec<WindowStats> {
        self.limiter.stats(principal)
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}

fn executor_error(err: ExecutorError) -> GatewayError {
    match err {
        ExecutorError::Backpressure { max_queued } => GatewayError::Backpressure { max_queued },
        ExecutorError::Cancelled => GatewayError::Cancelled(None),
        other => GatewayError::Internal(other.to_string()),
    }
}
