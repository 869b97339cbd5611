//! Rate Limit Configuration
//!
//! Configuration for per-principal, per-operation-class admission windows.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default requests per window
pub const DEFAULT_LIMIT: u32 = 60;

/// Default window length in seconds
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// Rate limit configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Requests admitted per window for classes without an override
    pub default_limit: u32,

    /// Window length in seconds
    pub window_secs: u64,

    /// Per operation-class limit overrides
    pub class_limits: HashMap<String, u32>,

    /// Principals exempt from limits
    pub exempt_principals: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_limit: DEFAULT_LIMIT,
            window_secs: DEFAULT_WINDOW_SECS,
            class_limits: HashMap::new(),
            exempt_principals: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    /// Create a new rate limit configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration admitting `limit` requests per `window`
    pub fn per_window(limit: u32, window: Duration) -> Self {
        Self {
            default_limit: limit,
            window_secs: window.as_secs().max(1),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `EXECGATE_RATE_LIMIT*` overrides; unparsable values are ignored
    pub fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("EXECGATE_RATE_LIMIT_ENABLED") {
            if let Ok(enabled) = val.parse() {
                self.enabled = enabled;
            }
        }

        if let Ok(val) = std::env::var("EXECGATE_RATE_LIMIT") {
            if let Ok(limit) = val.parse() {
                self.default_limit = limit;
            }
        }

        if let Ok(val) = std::env::var("EXECGATE_RATE_LIMIT_WINDOW_SECS") {
            if let Ok(secs) = val.parse() {
                self.window_secs = secs;
            }
        }
    }

    /// Window length
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Limit for an operation class
    pub fn limit_for(&self, class: &str) -> u32 {
        self.class_limits
            .get(class)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Override the limit for one operation class
    pub fn with_class_limit(mut self, class: &str, limit: u32) -> Self {
        self.class_limits.insert(class.to_string(), limit);
        self
    }

    /// Whether a principal bypasses limits
    pub fn is_exempt(&self, principal: &str) -> bool {
        self.exempt_principals.iter().any(|p| p == principal)
    }

    /// Disable rate limiting (for testing)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}
