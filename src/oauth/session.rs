//! Sessions
//!
//! A [`Session`] ties an identity to its current credential pair and the
//! refresh state machine:
//!
//! ```text
//!   VALID ──expired / unauthorized──▶ REFRESHING ──ok──▶ VALID
//!                                          │
//!                                          └──error──▶ FAILED ──reauthenticate──▶ VALID
//! ```
//!
//! The credential is held as an `Arc` and swapped whole, so a reader that
//! captured the old pair keeps a complete (if stale) value.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::identity::{CredentialPair, Identity};

/// Refresh state of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RefreshState {
    Valid,
    Refreshing,
    Failed { reason: String },
}

impl RefreshState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshState::Valid => "valid",
            RefreshState::Refreshing => "refreshing",
            RefreshState::Failed { .. } => "failed",
        }
    }
}

/// An authenticated session
#[derive(Debug)]
pub struct Session {
    identity: Identity,
    credential: RwLock<Arc<CredentialPair>>,
    state: RwLock<RefreshState>,
    /// Held for the duration of a refresh; later callers queue behind it
    pub(crate) flight: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(identity: Identity, credential: CredentialPair) -> Self {
        Self {
            identity,
            credential: RwLock::new(Arc::new(credential)),
            state: RwLock::new(RefreshState::Valid),
            flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn principal(&self) -> &str {
        &self.identity.principal
    }

    /// Current credential pair
    pub fn credential(&self) -> Arc<CredentialPair> {
        self.credential
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn state(&self) -> RefreshState {
        self.state.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Whether the session can still be used without re-authentication
    pub fn is_valid(&self) -> bool {
        !matches!(self.state(), RefreshState::Failed { .. })
    }

    pub(crate) fn set_state(&self, state: RefreshState) {
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Swap in a new pair and mark the session valid
    pub(crate) fn install(&self, credential: Arc<CredentialPair>) {
        *self.credential.write().unwrap_or_else(|p| p.into_inner()) = credential;
        self.set_state(RefreshState::Valid);
    }

    /// Mark the session failed until re-authentication
    pub(crate) fn fail(&self, reason: impl Into<String>) {
        self.set_state(RefreshState::Failed {
            reason: reason.into(),
        });
    }

    /// Reset after external re-authentication
    ///
    /// The new pair's generation is moved past the current one so callers
    /// waiting on a stale generation pick it up.
    pub fn reauthenticate(&self, mut credential: CredentialPair) {
        let current = self.credential();
        credential.generation = credential.generation.max(current.generation + 1);
        self.install(Arc::new(credential));
    }
}

/// Concurrency-safe map of principal to session
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or replace) the session for an identity
    pub fn open(&self, identity: Identity, credential: CredentialPair) -> Arc<Session> {
        let session = Arc::new(Session::new(identity, credential));
        self.sessions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(session.principal().to_string(), session.clone());
        session
    }

    pub fn get(&self, principal: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(principal)
            .cloned()
    }

    pub fn remove(&self, principal: &str) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(principal)
    }

    /// Install a fresh pair on an existing session
    pub fn reauthenticate(&self, principal: &str, credential: CredentialPair) -> Option<Arc<Session>> {
        let session = self.get(principal)?;
        session.reauthenticate(credential);
        Some(session)
    }

    /// Principals whose sessions need re-authentication
    pub fn invalid_principals(&self) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(|p| p.into_inner());
        let mut principals: Vec<String> = sessions
            .values()
            .filter(|s| !s.is_valid())
            .map(|s| s.principal().to_string())
            .collect();
        principals.sort();
        principals
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
