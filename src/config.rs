// Configuration File Support
//
// TOML configuration for the gateway with environment variable overrides.
// Configuration files are loaded from the XDG config directory:
// ~/.config/execgate/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::audit::AuditConfig;
use crate::cache::CacheConfig;
use crate::command::validator::{DEFAULT_MAX_ARG_LEN, DEFAULT_MAX_JSON_DEPTH};
use crate::command::{OperationSchema, SchemaRegistry};
use crate::executor::ExecutorConfig;
use crate::oauth::OAuthConfig;
use crate::rate_limit::RateLimitConfig;

/// Default environment variable holding the base64 audit key
pub const DEFAULT_KEY_ENV: &str = "EXECGATE_AUDIT_KEY";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Subprocess execution
    pub executor: ExecutorConfig,

    /// Argument validation limits
    pub validation: ValidationConfig,

    /// Per-principal admission control
    pub rate_limit: RateLimitConfig,

    /// Credential refresh
    pub oauth: OAuthConfig,

    /// Audit trail
    pub audit: AuditConfig,

    /// Result cache
    pub cache: CacheConfig,

    /// Key material
    pub crypto: CryptoConfig,

    /// Extra operation schemas, keyed by operation name
    pub operations: HashMap<String, OperationSchema>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Argument validation limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Deepest nesting accepted in JSON object arguments
    pub max_json_depth: usize,

    /// Longest accepted argument in bytes
    pub max_arg_len: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_json_depth: DEFAULT_MAX_JSON_DEPTH,
            max_arg_len: DEFAULT_MAX_ARG_LEN,
        }
    }
}

/// Key material configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CryptoConfig {
    /// Environment variable holding the base64 32-byte key; a per-process
    /// key is generated when it is unset
    pub key_env: String,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_env: DEFAULT_KEY_ENV.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or is
    /// invalid. If the config file does not exist, returns the defaults.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// Environment overrides are applied whether or not the file exists.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/execgate/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "execgate", "execgate") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("execgate").join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - EXECGATE_LOG_LEVEL, EXECGATE_LOG_FORMAT
    /// - EXECGATE_PROGRAM, EXECGATE_MAX_CONCURRENT, EXECGATE_TIMEOUT_SECS
    /// - EXECGATE_RATE_LIMIT_ENABLED, EXECGATE_RATE_LIMIT, EXECGATE_RATE_LIMIT_WINDOW_SECS
    /// - EXECGATE_TOKEN_URL
    /// - EXECGATE_AUDIT_PATH
    /// - EXECGATE_KEY_ENV
    ///
    /// Values that do not parse or are out of range are ignored.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("EXECGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("EXECGATE_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(program) = std::env::var("EXECGATE_PROGRAM") {
            if !program.trim().is_empty() {
                self.executor.program = program;
            }
        }
        if let Ok(max) = std::env::var("EXECGATE_MAX_CONCURRENT") {
            if let Ok(max) = max.parse::<usize>() {
                if max > 0 {
                    self.executor.max_concurrent = max;
                }
            }
        }
        if let Ok(timeout) = std::env::var("EXECGATE_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                if timeout > 0 && timeout <= self.executor.max_timeout_secs {
                    self.executor.default_timeout_secs = timeout;
                }
            }
        }

        self.rate_limit.apply_env();

        if let Ok(url) = std::env::var("EXECGATE_TOKEN_URL") {
            if !url.trim().is_empty() {
                self.oauth.token_url = Some(url);
            }
        }
        if let Ok(path) = std::env::var("EXECGATE_AUDIT_PATH") {
            if !path.trim().is_empty() {
                self.audit.path = Some(PathBuf::from(path));
            }
        }
        if let Ok(key_env) = std::env::var("EXECGATE_KEY_ENV") {
            if !key_env.trim().is_empty() {
                self.crypto.key_env = key_env;
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", self.logging.level),
        }
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!("Invalid log format: {}. Must be one of: json, pretty, compact", self.logging.format),
        }

        let executor = &self.executor;
        if executor.program.trim().is_empty() {
            anyhow::bail!("Executor program must not be empty");
        }
        if executor.max_concurrent == 0 {
            anyhow::bail!("Executor max_concurrent must be > 0");
        }
        if executor.max_output_bytes == 0 {
            anyhow::bail!("Executor max_output_bytes must be > 0");
        }
        if executor.default_timeout_secs == 0 {
            anyhow::bail!("Executor default timeout must be > 0");
        }
        if executor.default_timeout_secs > executor.max_timeout_secs {
            anyhow::bail!(
                "Executor default timeout ({}s) exceeds max timeout ({}s)",
                executor.default_timeout_secs,
                executor.max_timeout_secs
            );
        }
        if executor.credential_env.contains('=') {
            anyhow::bail!("Executor credential_env is not a valid variable name");
        }

        if self.validation.max_json_depth == 0 {
            anyhow::bail!("Validation max_json_depth must be > 0");
        }
        if self.validation.max_arg_len == 0 {
            anyhow::bail!("Validation max_arg_len must be > 0");
        }

        if self.rate_limit.window_secs == 0 {
            anyhow::bail!("Rate limit window must be > 0 seconds");
        }
        if self.rate_limit.enabled && self.rate_limit.default_limit == 0 {
            anyhow::bail!("Rate limit must be > 0 when rate limiting is enabled");
        }

        if let Some(url) = &self.oauth.token_url {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                anyhow::bail!("OAuth token_url must be an http(s) URL");
            }
        }
        if self.oauth.refresh_timeout_secs == 0 {
            anyhow::bail!("OAuth refresh timeout must be > 0");
        }

        if self.audit.queue_capacity == 0 {
            anyhow::bail!("Audit queue capacity must be > 0");
        }
        if self.audit.incomplete_capacity == 0 {
            anyhow::bail!("Audit incomplete_capacity must be > 0");
        }
        if self.cache.enabled && self.cache.ttl_secs == 0 {
            anyhow::bail!("Cache TTL must be > 0 when the cache is enabled");
        }
        if self.crypto.key_env.trim().is_empty() {
            anyhow::bail!("Crypto key_env must not be empty");
        }

        let registry = self.registry();
        for (name, schema) in &self.operations {
            if schema.argv.is_empty() {
                anyhow::bail!("Operation '{}' has an empty argv", name);
            }
            if let Some(variadic) = &schema.variadic {
                if variadic.min > variadic.max {
                    anyhow::bail!("Operation '{}' has variadic min > max", name);
                }
            }
            for target in &schema.invalidates {
                if registry.get(target).is_none() {
                    anyhow::bail!("Operation '{}' invalidates unknown operation '{}'", name, target);
                }
            }
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging.level.to_lowercase().parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// Built-in operations plus the configured ones
    pub fn registry(&self) -> SchemaRegistry {
        let mut registry = SchemaRegistry::docker_mcp();
        for (name, schema) in &self.operations {
            let mut schema = schema.clone();
            schema.name = name.clone();
            registry.register(schema);
        }
        registry
    }
}
