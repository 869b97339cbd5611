//! Fixed Admission Windows
//!
//! A window opens at the first admitted call for its scope and admits up to
//! `limit` calls until `opened + length`. A denied call reports the time left
//! until the window closes.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// What a window counts: one principal's calls to one operation class
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RateScope {
    pub principal: String,
    pub class: String,
}

impl RateScope {
    pub fn new(principal: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            class: class.into(),
        }
    }
}

impl fmt::Display for RateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.principal, self.class)
    }
}

/// A single counting window
#[derive(Debug, Clone)]
pub struct Window {
    opened: Instant,
    length: Duration,
    limit: u32,
    admitted: u32,
    denied: u64,
}

impl Window {
    /// Open a window at `now`
    pub fn open(now: Instant, length: Duration, limit: u32) -> Self {
        Self {
            opened: now,
            length,
            limit,
            admitted: 0,
            denied: 0,
        }
    }

    /// Whether the window has closed at `now`
    pub fn is_closed(&self, now: Instant) -> bool {
        now >= self.opened + self.length
    }

    /// Time until the window closes
    pub fn remaining_time(&self, now: Instant) -> Duration {
        (self.opened + self.length).saturating_duration_since(now)
    }

    /// Count a call; returns remaining slots, or the time until the window closes
    pub fn try_admit(&mut self, now: Instant) -> Result<u32, Duration> {
        if self.admitted < self.limit {
            self.admitted += 1;
            Ok(self.limit - self.admitted)
        } else {
            self.denied += 1;
            Err(self.remaining_time(now))
        }
    }

    pub fn stats(&self, scope: &RateScope, now: Instant) -> WindowStats {
        WindowStats {
            principal: scope.principal.clone(),
            class: scope.class.clone(),
            limit: self.limit,
            admitted: self.admitted,
            denied: self.denied,
            resets_in_secs: self.remaining_time(now).as_secs(),
        }
    }
}

/// Snapshot of a window for introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowStats {
    pub principal: String,
    pub class: String,
    pub limit: u32,
    pub admitted: u32,
    pub denied: u64,
    pub resets_in_secs: u64,
}

impl WindowStats {
    /// Usage as a percentage of the limit
    pub fn usage_percentage(&self) -> f64 {
        if self.limit == 0 {
            return 100.0;
        }
        (self.admitted as f64 / self.limit as f64) * 100.0
    }
}
