//! Executor Configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default wrapped tool
pub const DEFAULT_PROGRAM: &str = "docker";

/// Default timeout for one execution in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Largest timeout a request may ask for in seconds
pub const MAX_TIMEOUT_SECS: u64 = 600;

/// Maximum bytes kept per output stream (1MB)
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Environment variable the access token is passed in
pub const DEFAULT_CREDENTIAL_ENV: &str = "DOCKER_MCP_ACCESS_TOKEN";

/// Configuration for process execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Tool binary (resolved through the allow-listed `PATH`)
    pub program: String,

    /// Timeout when the request does not ask for one
    pub default_timeout_secs: u64,

    /// Upper bound on any timeout
    pub max_timeout_secs: u64,

    /// Bytes kept per stream before truncation
    pub max_output_bytes: usize,

    /// Subprocesses allowed to run at once
    pub max_concurrent: usize,

    /// Requests allowed to wait for a slot; beyond this, backpressure
    pub max_queued: usize,

    /// Host environment variables copied into the child
    pub env_allowlist: Vec<String>,

    /// Variable the access token is injected under
    pub credential_env: String,

    /// Working directory for the child
    pub working_dir: Option<PathBuf>,

    /// Case-insensitive diagnostic markers that indicate an auth failure
    pub auth_failure_markers: Vec<String>,

    /// How long to wait for output readers after the child is gone
    pub drain_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_timeout_secs: MAX_TIMEOUT_SECS,
            max_output_bytes: MAX_OUTPUT_SIZE,
            max_concurrent: 8,
            max_queued: 64,
            env_allowlist: ["PATH", "HOME", "LANG", "LC_ALL", "DOCKER_HOST", "DOCKER_CONFIG", "XDG_RUNTIME_DIR"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            credential_env: DEFAULT_CREDENTIAL_ENV.to_string(),
            working_dir: None,
            auth_failure_markers: vec!["unauthorized".to_string(), "401".to_string()],
            drain_timeout_ms: 500,
        }
    }
}

impl ExecutorConfig {
    /// Config for a different tool binary
    pub fn for_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    pub fn with_max_output_size(mut self, size: usize) -> Self {
        self.max_output_bytes = size;
        self
    }

    pub fn with_concurrency(mut self, max_concurrent: usize, max_queued: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self.max_queued = max_queued;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Timeout for a request: its own (clamped to the maximum) or the default
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or_else(|| self.default_timeout())
            .min(self.max_timeout())
    }

    /// Whether diagnostic text reports an authorization failure
    pub fn is_auth_failure(&self, diagnostics: &str) -> bool {
        let lowered = diagnostics.to_lowercase();
        self.auth_failure_markers
            .iter()
            .any(|marker| lowered.contains(&marker.to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.program, "docker");
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
        assert!(config.env_allowlist.contains(&"PATH".to_string()));
        assert_eq!(config.credential_env, DEFAULT_CREDENTIAL_ENV);
    }

    #[test]
    fn test_effective_timeout() {
        let config = ExecutorConfig::default().with_timeout(5);
        assert_eq!(config.effective_timeout(None), Duration::from_secs(5));
        assert_eq!(
            config.effective_timeout(Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            config.effective_timeout(Some(Duration::from_secs(10_000))),
            Duration::from_secs(MAX_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_auth_failure_markers() {
        let config = ExecutorConfig::default();
        assert!(config.is_auth_failure("Error: UNAUTHORIZED: token expired"));
        assert!(config.is_auth_failure("request failed with status 401"));
        assert!(!config.is_auth_failure("server not found"));
    }
}
