//! Process Executor
//!
//! Supervises every invocation of the wrapped tool. The executor never goes
//! through a shell: the validated arguments are appended to the operation's
//! fixed sub-command prefix and handed to a [`ProcessRunner`] as an argv list.
//!
//! # Features
//!
//! - **Bounded pool**: at most `max_concurrent` children, FIFO waiters, backpressure past `max_queued`
//! - **Deadline and cancellation**: the child is killed and reaped, partial output is kept and marked truncated
//! - **Channel separation**: protocol output only ever carries well-formed JSON
//! - **Scrubbed environment**: allow-listed host variables plus the access token
//! - **Cache effects**: fresh reads are stored, successful mutations invalidate
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │ ExecutionPool│──▶│ ProcessRunner│──▶│  demultiplex()   │
//! │  (semaphore) │   │ (tokio child)│   │ protocol / diag  │
//! └──────────────┘   └──────────────┘   └────────┬─────────┘
//!                                                │
//!                         ┌──────────────────────┴──────┐
//!                         ▼                             ▼
//!                  ExecutionRecord               CacheStore
//! ```
//!
//! The executor does not write audit entries; the gateway writes exactly one
//! per submission, whatever the number of runs behind it.

pub mod config;
pub mod output;
pub mod pool;
pub mod record;
pub mod runner;

pub use config::ExecutorConfig;
pub use output::{demultiplex, Captured, Channels, REDIRECTED_PREFIX};
pub use pool::{ExecutionPool, ExecutionSlot};
pub use record::{ExecutionRecord, Outcome, PendingExecution};
pub use runner::{ExecutorError, Invocation, ProcessRunner, RawOutput, Termination, TokioProcessRunner};

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheKey, CacheStore, GLOBAL_SCOPE};
use crate::command::{CommandRequest, OperationSchema};
use crate::identity::{CredentialPair, SecretString};
use crate::metrics;

/// A finished run: its record and its two output channels
#[derive(Debug, Clone)]
pub struct Execution {
    pub record: ExecutionRecord,
    pub channels: Channels,
}

impl Execution {
    /// Whether the tool rejected the credential
    pub fn is_unauthorized(&self) -> bool {
        self.record.outcome() == Outcome::Unauthorized
    }
}

/// Runs validated requests as subprocesses
#[derive(Clone)]
pub struct Executor {
    config: ExecutorConfig,
    runner: Arc<dyn ProcessRunner>,
    pool: ExecutionPool,
    cache: Option<Arc<dyn CacheStore>>,
    cache_ttl: Duration,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("cache", &self.cache.is_some())
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(config: ExecutorConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        let pool = ExecutionPool::new(config.max_concurrent, config.max_queued);
        Self {
            config,
            runner,
            pool,
            cache: None,
            cache_ttl: Duration::from_secs(30),
        }
    }

    /// Executor backed by real child processes
    pub fn with_tokio_runner(config: ExecutorConfig) -> Self {
        Self::new(config, Arc::new(TokioProcessRunner::new()))
    }

    /// Attach a result cache
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        self.cache = Some(cache);
        self.cache_ttl = ttl;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn pool(&self) -> &ExecutionPool {
        &self.pool
    }

    pub fn cache(&self) -> Option<&Arc<dyn CacheStore>> {
        self.cache.as_ref()
    }

    /// Fresh cached result for a cacheable read, unless the caller bypasses the cache
    pub async fn lookup_cached(
        &self,
        request: &CommandRequest,
        schema: &OperationSchema,
    ) -> Option<CacheEntry> {
        let cache = self.cache.as_ref()?;
        if !schema.cacheable || request.wants_fresh() {
            return None;
        }
        let entry = cache.get(&Self::cache_key(request)).await;
        metrics::record_cache_lookup(entry.is_some());
        entry
    }

    fn cache_key(request: &CommandRequest) -> CacheKey {
        CacheKey::new(request.context(), request.operation(), request.args())
    }

    /// Run one validated request with `credential`
    ///
    /// Fails only when no run took place (full queue, cancelled while
    /// waiting). Anything that happened to the child, including a failed
    /// spawn, is reported through the record's outcome.
    pub async fn execute(
        &self,
        request: &CommandRequest,
        schema: &OperationSchema,
        credential: &CredentialPair,
        cancel: &CancellationToken,
    ) -> Result<Execution, ExecutorError> {
        let _slot = self.pool.acquire(cancel).await?;
        let pending = PendingExecution::start(request);
        let execution_id = pending.execution_id();

        let invocation = Invocation {
            program: self.config.program.clone(),
            args: schema.command_line(request.args()),
            env: self.child_environment(credential),
            working_dir: self.config.working_dir.clone(),
            timeout: self.config.effective_timeout(request.timeout()),
            max_output_bytes: self.config.max_output_bytes,
            drain_timeout: self.config.drain_timeout(),
        };
        debug!(
            %execution_id,
            principal = %request.principal(),
            operation = %request.operation(),
            timeout_ms = invocation.timeout.as_millis() as u64,
            "Starting execution"
        );

        // Taken before the run so a mutation finishing meanwhile wins
        let cache_epoch = match (&self.cache, schema.cacheable) {
            (Some(cache), true) => Some(cache.epoch(&Self::cache_key(request)).await),
            _ => None,
        };

        let (channels, outcome, exit_code, truncated) =
            match self.runner.run(invocation, cancel.clone()).await {
                Ok(raw) => {
                    let mut channels = demultiplex(&raw.stdout, &raw.stderr, schema.protocol_output);
                    let outcome = self.classify(&raw.termination, &channels);
                    let interrupted = match raw.termination {
                        Termination::TimedOut => Some("terminated at deadline"),
                        Termination::Cancelled => Some("cancelled"),
                        _ => None,
                    };
                    if let Some(cause) = interrupted {
                        channels.note(&output::interruption_marker(cause));
                    }
                    let truncated =
                        raw.stdout.truncated || raw.stderr.truncated || interrupted.is_some();
                    (channels, outcome, raw.exit_code(), truncated)
                }
                Err(e) => {
                    warn!(%execution_id, error = %e, "Execution did not start");
                    let channels = Channels {
                        protocol: String::new(),
                        diagnostics: format!("{}\n", e),
                    };
                    (channels, Outcome::Crashed, None, false)
                }
            };

        let record = pending.finish(
            outcome,
            exit_code,
            channels.protocol.len(),
            channels.diagnostics.len(),
            truncated,
        );

        metrics::observe_execution(
            record.operation(),
            outcome.as_str(),
            record.duration_ms() as f64 / 1000.0,
        );
        if truncated {
            metrics::OUTPUT_TRUNCATED_TOTAL.inc();
        }
        info!(
            %execution_id,
            principal = %record.principal(),
            operation = %record.operation(),
            outcome = %outcome,
            duration_ms = record.duration_ms(),
            truncated,
            "Execution finished"
        );

        let execution = Execution { record, channels };
        self.apply_cache_effects(request, schema, &execution, cache_epoch).await;
        Ok(execution)
    }

    fn classify(&self, termination: &Termination, channels: &Channels) -> Outcome {
        match termination {
            Termination::Exited(0) => Outcome::Success,
            Termination::Exited(code) => {
                if self.config.is_auth_failure(&channels.diagnostics) {
                    Outcome::Unauthorized
                } else {
                    Outcome::NonZeroExit { code: *code }
                }
            }
            Termination::Signaled => Outcome::Crashed,
            Termination::TimedOut => Outcome::Timeout,
            Termination::Cancelled => Outcome::Cancelled,
        }
    }

    /// Allow-listed host variables plus the access token
    fn child_environment(&self, credential: &CredentialPair) -> Vec<(String, SecretString)> {
        let mut env: Vec<(String, SecretString)> = self
            .config
            .env_allowlist
            .iter()
            .filter(|name| **name != self.config.credential_env)
            .filter_map(|name| {
                std::env::var(name)
                    .ok()
                    .map(|value| (name.clone(), SecretString::new(value)))
            })
            .collect();
        if !self.config.credential_env.is_empty() && !credential.access_token.is_empty() {
            env.push((
                self.config.credential_env.clone(),
                credential.access_token.clone(),
            ));
        }
        env
    }

    async fn apply_cache_effects(
        &self,
        request: &CommandRequest,
        schema: &OperationSchema,
        execution: &Execution,
        epoch: Option<u64>,
    ) {
        let Some(cache) = &self.cache else {
            return;
        };
        if !execution.record.outcome().is_success() {
            return;
        }

        if let Some(epoch) = epoch.filter(|_| schema.cacheable && !execution.record.truncated()) {
            let version = cache
                .set_if_current(
                    Self::cache_key(request),
                    execution.channels.protocol.clone(),
                    self.cache_ttl,
                    epoch,
                )
                .await;
            match version {
                Some(version) => debug!(operation = %request.operation(), version, "Cached result"),
                None => debug!(operation = %request.operation(), "Result superseded by a mutation; not cached"),
            }
        }

        if schema.mutating {
            let mut invalidated = 0;
            for operation in &schema.invalidates {
                invalidated += match request.context() {
                    Some(context) => {
                        cache.invalidate_operation(Some(context), operation).await
                            + cache.invalidate_operation(Some(GLOBAL_SCOPE), operation).await
                    }
                    None => cache.invalidate_operation(None, operation).await,
                };
            }
            debug!(operation = %request.operation(), invalidated, "Invalidated stale cache entries");
        }
    }
}
