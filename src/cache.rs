//! Result Cache
//!
//! Last known results of read operations, keyed by target context,
//! operation and arguments. Entries carry a monotonically increasing version
//! and a TTL; expired entries are never returned (checked on read) and can
//! also be swept in the background.
//!
//! Every invalidation advances an epoch for the affected (scope, operation).
//! A reader takes the epoch before it runs the tool and stores its result
//! with [`CacheStore::set_if_current`], which drops the write when a mutation
//! landed in between.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Scope used for requests without a working context
pub const GLOBAL_SCOPE: &str = "*";

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Lifetime of an entry in seconds
    pub ttl_secs: u64,
    /// Background sweep interval; 0 disables the sweeper
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 30,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Key derived from target, operation and arguments
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    pub scope: String,
    pub operation: String,
    pub args: Vec<String>,
}

impl CacheKey {
    pub fn new(context: Option<&str>, operation: &str, args: &[String]) -> Self {
        Self {
            scope: context.unwrap_or(GLOBAL_SCOPE).to_string(),
            operation: operation.to_string(),
            args: args.to_vec(),
        }
    }
}

/// A cached value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: String,
    pub version: u64,
    pub stored_at: Instant,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Cache backend
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fresh entry for `key`, if any
    async fn get(&self, key: &CacheKey) -> Option<CacheEntry>;

    /// Store `value`; returns the entry's version
    async fn set(&self, key: CacheKey, value: String, ttl: Duration) -> u64;

    /// Invalidation epoch of `key`'s scope and operation
    async fn epoch(&self, key: &CacheKey) -> u64;

    /// Store `value` unless `key` was invalidated since `epoch` was read
    async fn set_if_current(&self, key: CacheKey, value: String, ttl: Duration, epoch: u64) -> Option<u64>;

    /// Remove one key
    async fn invalidate(&self, key: &CacheKey) -> bool;

    /// Remove every entry of `operation`, in one scope or (with `None`) all scopes
    async fn invalidate_operation(&self, scope: Option<&str>, operation: &str) -> usize;

    /// Remove expired entries
    async fn purge_expired(&self) -> usize;
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Invalidations per (scope, operation)
    scoped_epochs: HashMap<(String, String), u64>,
    /// Invalidations of an operation across all scopes
    operation_epochs: HashMap<String, u64>,
}

impl CacheState {
    fn epoch(&self, key: &CacheKey) -> u64 {
        let scoped = self
            .scoped_epochs
            .get(&(key.scope.clone(), key.operation.clone()))
            .copied()
            .unwrap_or(0);
        let global = self.operation_epochs.get(&key.operation).copied().unwrap_or(0);
        scoped + global
    }

    fn bump(&mut self, scope: Option<&str>, operation: &str) {
        match scope {
            Some(scope) => {
                *self
                    .scoped_epochs
                    .entry((scope.to_string(), operation.to_string()))
                    .or_insert(0) += 1
            }
            None => *self.operation_epochs.entry(operation.to_string()).or_insert(0) += 1,
        }
    }

    fn insert(&mut self, key: CacheKey, value: String, ttl: Duration, version: u64) {
        let now = Instant::now();
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                version,
                stored_at: now,
                expires_at: now + ttl,
            },
        );
    }
}

/// In-memory cache
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStore {
    state: Arc<RwLock<CacheState>>,
    next_version: Arc<AtomicU64>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Purge expired entries every `interval` until the handle is aborted
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = store.purge_expired().await;
                if purged > 0 {
                    debug!(purged, "Swept expired cache entries");
                }
            }
        })
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let state = self.state.read().await;
        state
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .cloned()
    }

    async fn set(&self, key: CacheKey, value: String, ttl: Duration) -> u64 {
        let mut state = self.state.write().await;
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        state.insert(key, value, ttl, version);
        version
    }

    async fn epoch(&self, key: &CacheKey) -> u64 {
        self.state.read().await.epoch(key)
    }

    async fn set_if_current(&self, key: CacheKey, value: String, ttl: Duration, epoch: u64) -> Option<u64> {
        let mut state = self.state.write().await;
        let current = state.epoch(&key);
        if current != epoch {
            debug!(operation = %key.operation, scope = %key.scope, epoch, current, "Dropping cache write older than an invalidation");
            return None;
        }
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        state.insert(key, value, ttl, version);
        Some(version)
    }

    async fn invalidate(&self, key: &CacheKey) -> bool {
        let mut state = self.state.write().await;
        state.bump(Some(key.scope.as_str()), &key.operation);
        state.entries.remove(key).is_some()
    }

    async fn invalidate_operation(&self, scope: Option<&str>, operation: &str) -> usize {
        let mut state = self.state.write().await;
        state.bump(scope, operation);
        let before = state.entries.len();
        state.entries.retain(|key, _| {
            let scope_matches = scope.is_none_or(|s| key.scope == s);
            !(scope_matches && key.operation == operation)
        });
        before - state.entries.len()
    }

    async fn purge_expired(&self) -> usize {
        let mut state = self.state.write().await;
        let now = Instant::now();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(now));
        before - state.entries.len()
    }
}
