//! Identities and Credentials
//!
//! The session layer owns identities; the gateway only reads them and, on
//! refresh, swaps in a new [`CredentialPair`]. Pairs are never mutated in
//! place: every refresh produces a fresh value with a higher generation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A secret string whose `Debug` and `Display` output is redacted
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the underlying secret
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the secret is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Authenticated principal issuing requests
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Principal identifier (e.g. "alice")
    pub principal: String,

    /// Roles or claims attached by the session layer
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Identity {
    /// Create an identity with no roles
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            roles: Vec::new(),
        }
    }

    /// Attach a role
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    /// Check whether the identity carries a role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Access/refresh token pair with expiry
#[derive(Debug, Clone)]
pub struct CredentialPair {
    /// Bearer token attached to outbound calls
    pub access_token: SecretString,

    /// Token used to obtain a new pair (absent for non-refreshable sessions)
    pub refresh_token: Option<SecretString>,

    /// When the access token stops being valid
    pub expires_at: DateTime<Utc>,

    /// Incremented on every replacement; lets waiters detect a completed refresh
    pub generation: u64,
}

impl CredentialPair {
    /// Create the initial pair for a session
    pub fn new(
        access_token: impl Into<SecretString>,
        refresh_token: Option<SecretString>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at,
            generation: 0,
        }
    }

    /// Whether the access token is expired, treating anything inside `skew` as expired
    pub fn is_expired(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        let skew = ChronoDuration::from_std(skew).unwrap_or_else(|_| ChronoDuration::zero());
        self.expires_at <= now + skew
    }

    /// Build the successor pair from a refresh grant
    ///
    /// The previous refresh token is kept when the endpoint does not rotate it.
    pub fn successor(
        &self,
        access_token: SecretString,
        refresh_token: Option<SecretString>,
        expires_in: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let expires_in = ChronoDuration::from_std(expires_in).unwrap_or_else(|_| ChronoDuration::zero());
        Self {
            access_token,
            refresh_token: refresh_token.or_else(|| self.refresh_token.clone()),
            expires_at: now + expires_in,
            generation: self.generation + 1,
        }
    }
}
