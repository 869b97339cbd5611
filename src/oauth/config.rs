//! OAuth Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default client id sent to the token endpoint
pub const DEFAULT_CLIENT_ID: &str = "execgate";

/// Default upper bound on a single refresh call
pub const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 10;

/// Default window before expiry in which a token already counts as expired
pub const DEFAULT_EXPIRY_SKEW_SECS: u64 = 30;

/// Token refresh configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Token endpoint; refresh is disabled when unset
    pub token_url: Option<String>,

    /// Client id for the refresh grant
    pub client_id: String,

    /// Environment variable holding the client secret, if the client is confidential
    pub client_secret_env: Option<String>,

    /// Upper bound on one refresh call in seconds
    pub refresh_timeout_secs: u64,

    /// Seconds before expiry at which a token is treated as expired
    pub expiry_skew_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            token_url: None,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_secret_env: None,
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT_SECS,
            expiry_skew_secs: DEFAULT_EXPIRY_SKEW_SECS,
        }
    }
}

impl OAuthConfig {
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn expiry_skew(&self) -> Duration {
        Duration::from_secs(self.expiry_skew_secs)
    }
}
