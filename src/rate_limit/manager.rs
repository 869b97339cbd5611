//! Rate Limiter
//!
//! Central admission check. `admit` never blocks on I/O or waits for
//! capacity: it answers immediately from the window store.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::config::RateLimitConfig;
use super::store::WindowStore;
use super::window::{RateScope, WindowStats};
use crate::identity::Identity;

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Call admitted; `remaining` slots are left in the window
    Allow { remaining: u32 },

    /// Call denied until the window closes
    Deny {
        retry_after: Duration,
        scope: RateScope,
    },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allow { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitDecision::Deny { retry_after, .. } => Some(*retry_after),
            RateLimitDecision::Allow { .. } => None,
        }
    }
}

/// Per-principal, per-operation-class rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Configuration
    config: Arc<RwLock<RateLimitConfig>>,

    /// Window store
    store: WindowStore,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            store: WindowStore::new(),
        }
    }

    /// Create with default configuration
    pub fn default_config() -> Self {
        Self::new(RateLimitConfig::default())
    }

    /// Create a disabled rate limiter (for testing)
    pub fn disabled() -> Self {
        Self::new(RateLimitConfig::disabled())
    }

    fn read_config(&self) -> RateLimitConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Decide whether `identity` may run an operation of `class` now
    pub fn admit(&self, identity: &Identity, class: &str) -> RateLimitDecision {
        let config = self.read_config();
        if !config.enabled || config.is_exempt(&identity.principal) {
            return RateLimitDecision::Allow {
                remaining: u32::MAX,
            };
        }

        let scope = RateScope::new(identity.principal.clone(), class);
        let limit = config.limit_for(class);

        match self.store.admit(&scope, limit, config.window(), Instant::now()) {
            Ok(remaining) => {
                debug!(principal = %scope.principal, class = %scope.class, remaining, "Rate limit admitted");
                RateLimitDecision::Allow { remaining }
            }
            Err(retry_after) => {
                warn!(
                    principal = %scope.principal,
                    class = %scope.class,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rate limit exceeded"
                );
                crate::metrics::record_rate_limited(class);
                RateLimitDecision::Deny { retry_after, scope }
            }
        }
    }

    /// Usage statistics for a principal's open windows
    pub fn stats(&self, principal: &str) -> Vec<WindowStats> {
        self.store.principal_stats(principal, Instant::now())
    }

    /// Usage statistics for every open window
    pub fn all_stats(&self) -> Vec<WindowStats> {
        self.store.all_stats(Instant::now())
    }

    /// Drop windows that have closed
    pub fn prune(&self) -> usize {
        self.store.prune(Instant::now())
    }

    /// Prune closed windows every `interval` until the handle is aborted
    pub fn spawn_pruner(&self, interval: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let pruned = limiter.prune();
                if pruned > 0 {
                    debug!(pruned, "Pruned closed rate limit windows");
                }
            }
        })
    }

    /// Forget a scope's window so its next call opens a fresh one
    pub fn reset(&self, principal: &str, class: &str) -> bool {
        self.store.reset(&RateScope::new(principal, class))
    }

    /// Exempt a principal from limits
    pub fn add_exempt(&self, principal: &str) {
        let mut config = self.config.write().unwrap_or_else(|p| p.into_inner());
        if !config.is_exempt(principal) {
            config.exempt_principals.push(principal.to_string());
        }
    }

    /// Remove an exemption
    pub fn remove_exempt(&self, principal: &str) {
        let mut config = self.config.write().unwrap_or_else(|p| p.into_inner());
        config.exempt_principals.retain(|p| p != principal);
    }

    /// Update configuration; open windows keep the limit they opened with
    pub fn update_config(&self, config: RateLimitConfig) {
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = config;
    }

    /// Get current configuration
    pub fn config(&self) -> RateLimitConfig {
        self.read_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity::new("alice")
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_request_in_window_is_denied() {
        let limiter = RateLimiter::new(RateLimitConfig::per_window(3, Duration::from_secs(60)));

        for _ in 0..3 {
            assert!(limiter.admit(&alice(), "list-servers").is_allowed());
            tokio::time::advance(Duration::from_secs(3)).await;
        }
        tokio::time::advance(Duration::from_secs(1)).await;

        match limiter.admit(&alice(), "list-servers") {
            RateLimitDecision::Deny { retry_after, scope } => {
                assert_eq!(retry_after, Duration::from_secs(50));
                assert_eq!(scope, RateScope::new("alice", "list-servers"));
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_after_window_elapses() {
        let limiter = RateLimiter::new(RateLimitConfig::per_window(1, Duration::from_secs(60)));

        assert!(limiter.admit(&alice(), "list-servers").is_allowed());
        let retry = limiter.admit(&alice(), "list-servers").retry_after().unwrap();

        tokio::time::advance(retry).await;
        assert!(limiter.admit(&alice(), "list-servers").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_principals_do_not_share_windows() {
        let limiter = RateLimiter::new(RateLimitConfig::per_window(1, Duration::from_secs(60)));
        assert!(limiter.admit(&alice(), "list-servers").is_allowed());
        assert!(limiter.admit(&Identity::new("bob"), "list-servers").is_allowed());
        assert!(!limiter.admit(&alice(), "list-servers").is_allowed());
    }

    #[test]
    fn test_disabled_allows_all() {
        let limiter = RateLimiter::disabled();
        for _ in 0..200 {
            assert!(limiter.admit(&alice(), "list-servers").is_allowed());
        }
    }

    #[test]
    fn test_exempt_principal() {
        let limiter = RateLimiter::new(RateLimitConfig::per_window(1, Duration::from_secs(60)));
        limiter.add_exempt("ops");
        for _ in 0..10 {
            assert!(limiter.admit(&Identity::new("ops"), "reset-servers").is_allowed());
        }
        limiter.remove_exempt("ops");
        assert!(limiter.admit(&Identity::new("ops"), "reset-servers").is_allowed());
        assert!(!limiter.admit(&Identity::new("ops"), "reset-servers").is_allowed());
    }

    #[test]
    fn test_class_limit_override() {
        let config = RateLimitConfig::per_window(10, Duration::from_secs(60))
            .with_class_limit("server-state", 1);
        let limiter = RateLimiter::new(config);

        assert!(limiter.admit(&alice(), "server-state").is_allowed());
        assert!(!limiter.admit(&alice(), "server-state").is_allowed());
        assert!(limiter.admit(&alice(), "list-servers").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_and_prune() {
        let limiter = RateLimiter::new(RateLimitConfig::per_window(5, Duration::from_secs(60)));
        limiter.admit(&alice(), "list-servers");
        limiter.admit(&alice(), "list-servers");

        let stats = limiter.stats("alice");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].admitted, 2);
        assert_eq!(stats[0].limit, 5);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.stats("alice").is_empty());
        assert_eq!(limiter.prune(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pruner_drops_closed_windows() {
        let limiter = RateLimiter::new(RateLimitConfig::per_window(5, Duration::from_secs(60)));
        for i in 0..20 {
            limiter.admit(&Identity::new(format!("user-{}", i)), "list-tools");
        }
        assert_eq!(limiter.store.count(), 20);
        let pruner = limiter.spawn_pruner(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(limiter.store.count(), 0);
        pruner.abort();
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_budget() {
        let limiter = RateLimiter::new(RateLimitConfig::per_window(10, Duration::from_secs(60)));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.admit(&Identity::new("alice"), "list-tools").is_allowed() })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }
}
