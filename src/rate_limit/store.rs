//! Window Store
//!
//! Concurrency-safe map of open windows. The check and the increment happen
//! under one lock acquisition, so two callers can never both take the last
//! slot of a window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use super::window::{RateScope, Window, WindowStats};

/// In-memory window store
#[derive(Debug, Clone, Default)]
pub struct WindowStore {
    windows: Arc<Mutex<HashMap<RateScope, Window>>>,
}

impl WindowStore {
    /// Create a new window store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RateScope, Window>> {
        // A panic while holding the lock cannot leave a window half-updated.
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count one call against `scope`, opening a fresh window when needed
    pub fn admit(
        &self,
        scope: &RateScope,
        limit: u32,
        length: Duration,
        now: Instant,
    ) -> Result<u32, Duration> {
        let mut windows = self.lock();
        let window = windows
            .entry(scope.clone())
            .and_modify(|w| {
                if w.is_closed(now) {
                    *w = Window::open(now, length, limit);
                }
            })
            .or_insert_with(|| Window::open(now, length, limit));
        window.try_admit(now)
    }

    /// Stats for every open window of a principal
    pub fn principal_stats(&self, principal: &str, now: Instant) -> Vec<WindowStats> {
        let windows = self.lock();
        let mut stats: Vec<WindowStats> = windows
            .iter()
            .filter(|(scope, w)| scope.principal == principal && !w.is_closed(now))
            .map(|(scope, w)| w.stats(scope, now))
            .collect();
        stats.sort_by(|a, b| a.class.cmp(&b.class));
        stats
    }

    /// Stats for every open window
    pub fn all_stats(&self, now: Instant) -> Vec<WindowStats> {
        let windows = self.lock();
        windows
            .iter()
            .filter(|(_, w)| !w.is_closed(now))
            .map(|(scope, w)| w.stats(scope, now))
            .collect()
    }

    /// Drop closed windows; returns how many were removed
    pub fn prune(&self, now: Instant) -> usize {
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, w| !w.is_closed(now));
        before - windows.len()
    }

    /// Remove one scope's window
    pub fn reset(&self, scope: &RateScope) -> bool {
        self.lock().remove(scope).is_some()
    }

    /// Clear all windows
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of tracked windows
    pub fn count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_scopes_are_independent() {
        let store = WindowStore::new();
        let now = Instant::now();
        let a = RateScope::new("alice", "list-servers");
        let b = RateScope::new("alice", "server-state");
        let c = RateScope::new("bob", "list-servers");

        assert_eq!(store.admit(&a, 1, MINUTE, now), Ok(0));
        assert!(store.admit(&a, 1, MINUTE, now).is_err());
        assert_eq!(store.admit(&b, 1, MINUTE, now), Ok(0));
        assert_eq!(store.admit(&c, 1, MINUTE, now), Ok(0));
        assert_eq!(store.count(), 3);
    }

    #[test]
    fn test_closed_window_reopens() {
        let store = WindowStore::new();
        let now = Instant::now();
        let scope = RateScope::new("alice", "list-servers");

        store.admit(&scope, 1, MINUTE, now).unwrap();
        assert!(store.admit(&scope, 1, MINUTE, now + Duration::from_secs(30)).is_err());
        assert_eq!(store.admit(&scope, 1, MINUTE, now + MINUTE), Ok(0));
    }

    #[test]
    fn test_prune_and_stats() {
        let store = WindowStore::new();
        let now = Instant::now();
        store
            .admit(&RateScope::new("alice", "a"), 5, MINUTE, now)
            .unwrap();
        store
            .admit(&RateScope::new("alice", "b"), 5, Duration::from_secs(10), now)
            .unwrap();

        let later = now + Duration::from_secs(20);
        let stats = store.principal_stats("alice", later);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].class, "a");
        assert_eq!(stats[0].resets_in_secs, 40);

        assert_eq!(store.prune(later), 1);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        let store = WindowStore::new();
        let scope = RateScope::new("alice", "list-servers");
        let now = Instant::now();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let scope = scope.clone();
                std::thread::spawn(move || store.admit(&scope, 5, MINUTE, now).is_ok())
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 5);
    }
}
