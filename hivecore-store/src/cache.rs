//! Two-tier read-through cache: bounded local LRU over the shared
//! key-value store over an optional loader.
//!
//! Shared-tier keys are `cache:{namespace}:{key}` so every node sees the
//! same entry; the local tier holds deserialized JSON values with its own
//! shorter TTL. Cross-node coherence comes from the [`EvictBroadcast`]
//! hook: `evict` announces the key cluster-wide and every node clears its
//! local tier inside the event-propagation window.

// Layer 1: Standard library
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Layer 2: Third-party
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

// Layer 3: Internal
use crate::contract::KeyValueStore;
use crate::error::StoreError;
use hivecore_shared::metrics::{keys, MetricsSink, NoopMetrics};

/// Default local tier capacity.
pub const DEFAULT_LOCAL_CAPACITY: usize = 10_000;

/// Default local tier TTL (5 minutes).
pub const DEFAULT_LOCAL_TTL: Duration = Duration::from_secs(300);

/// Default shared tier TTL (30 minutes).
pub const DEFAULT_SHARED_TTL: Duration = Duration::from_secs(1800);

/// Loader type for `get` calls that do not load anything. Names the
/// otherwise-uninferable future type: `cache.get(ns, key, None::<NoLoader<T>>)`.
pub type NoLoader<T> = fn() -> std::future::Ready<Result<Option<T>, StoreError>>;

/// Announces evictions to the rest of the cluster.
///
/// The node wiring implements this over the distributed event bus; the
/// cache itself stays transport-agnostic. `key = None` means the whole
/// namespace.
pub trait EvictBroadcast: Send + Sync + 'static {
    fn broadcast_evict(&self, namespace: &str, key: Option<&str>);
}

/// Broadcast hook that announces nothing (single-node runs, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvictBroadcast;

impl EvictBroadcast for NoopEvictBroadcast {
    fn broadcast_evict(&self, _namespace: &str, _key: Option<&str>) {}
}

#[derive(Debug, Clone)]
struct LocalEntry {
    value: Value,
    expires_at: Instant,
}

/// Bounded LRU with per-entry TTL; the local tier.
pub struct LocalCache {
    entries: Mutex<LruCache<String, LocalEntry>>,
    ttl: Duration,
}

impl LocalCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Get and touch; expired entries are dropped on the way out.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    pub fn put(&self, key: String, value: Value) {
        let entry = LocalEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.lock().put(key, entry);
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().pop(key);
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn remove_prefix(&self, prefix: &str) {
        let mut entries = self.entries.lock();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            entries.pop(&key);
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The two-tier read-through cache.
///
/// Concurrent misses for one key are single-flighted: the first caller
/// loads, the rest re-check the filled tiers once the gate opens.
pub struct TieredCache {
    local: LocalCache,
    shared: Arc<dyn KeyValueStore>,
    shared_ttl: Duration,
    metrics: Arc<dyn MetricsSink>,
    broadcast: Arc<dyn EvictBroadcast>,
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl TieredCache {
    pub fn new(shared: Arc<dyn KeyValueStore>) -> Self {
        Self {
            local: LocalCache::new(DEFAULT_LOCAL_CAPACITY, DEFAULT_LOCAL_TTL),
            shared,
            shared_ttl: DEFAULT_SHARED_TTL,
            metrics: Arc::new(NoopMetrics),
            broadcast: Arc::new(NoopEvictBroadcast),
            in_flight: DashMap::new(),
        }
    }

    pub fn with_local(mut self, capacity: usize, local_ttl: Duration) -> Self {
        self.local = LocalCache::new(capacity, local_ttl);
        self
    }

    pub fn with_shared_ttl(mut self, ttl: Duration) -> Self {
        self.shared_ttl = ttl;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_broadcast(mut self, broadcast: Arc<dyn EvictBroadcast>) -> Self {
        self.broadcast = broadcast;
        self
    }

    fn full_key(namespace: &str, key: &str) -> String {
        format!("cache:{namespace}:{key}")
    }

    /// Read through local tier, shared tier, then `loader`.
    ///
    /// Returns `Ok(None)` when the key is absent everywhere and the loader
    /// (if any) produced nothing; negative caching stays the loader's call.
    pub async fn get<T, L, Fut>(
        &self,
        namespace: &str,
        key: &str,
        loader: Option<L>,
    ) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned + Serialize,
        L: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, StoreError>>,
    {
        let full = Self::full_key(namespace, key);

        if let Some(value) = self.local.get(&full) {
            self.metrics.incr(keys::CACHE_LOCAL_HIT);
            return Ok(Some(serde_json::from_value(value)?));
        }

        // Single-flight gate per key: one loader runs, the rest re-check
        // the tiers the winner filled.
        let gate = self
            .in_flight
            .entry(full.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = gate.lock().await;

        let result = self.get_slow(namespace, key, &full, loader).await;

        drop(guard);
        self.in_flight.remove(&full);
        result
    }

    async fn get_slow<T, L, Fut>(
        &self,
        namespace: &str,
        key: &str,
        full: &str,
        loader: Option<L>,
    ) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned + Serialize,
        L: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, StoreError>>,
    {
        if let Some(value) = self.local.get(full) {
            self.metrics.incr(keys::CACHE_LOCAL_HIT);
            return Ok(Some(serde_json::from_value(value)?));
        }

        if let Some(raw) = self.shared.get(full).await? {
            let value: Value = serde_json::from_str(&raw)?;
            self.local.put(full.to_string(), value.clone());
            self.metrics.incr(keys::CACHE_SHARED_HIT);
            return Ok(Some(serde_json::from_value(value)?));
        }

        self.metrics.incr(keys::CACHE_MISS);
        let Some(loader) = loader else {
            return Ok(None);
        };
        match loader().await? {
            Some(loaded) => {
                self.put(namespace, key, &loaded).await?;
                Ok(Some(loaded))
            }
            None => Ok(None),
        }
    }

    /// Write both tiers. Does not broadcast; only eviction does.
    pub async fn put<T: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let full = Self::full_key(namespace, key);
        let json = serde_json::to_value(value)?;
        self.shared
            .set_with_ttl(&full, json.to_string(), self.shared_ttl)
            .await?;
        self.local.put(full, json);
        Ok(())
    }

    /// Remove from both tiers and announce the eviction cluster-wide.
    pub async fn evict(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let full = Self::full_key(namespace, key);
        self.local.remove(&full);
        self.shared.delete(&full).await?;
        debug!(namespace, key, "cache entry evicted");
        self.broadcast.broadcast_evict(namespace, Some(key));
        Ok(())
    }

    /// Drop one key from the local tier only (remote-eviction delivery).
    pub fn evict_local_key(&self, namespace: &str, key: &str) {
        self.local.remove(&Self::full_key(namespace, key));
    }

    /// Drop a whole namespace from the local tier only.
    pub fn evict_local(&self, namespace: &str) {
        self.local.remove_prefix(&format!("cache:{namespace}:"));
    }

    /// Drop the entire local tier.
    pub fn evict_all_local(&self) {
        self.local.clear();
    }

    /// Entries currently held locally, handy in tests.
    pub fn local_len(&self) -> usize {
        self.local.len()
    }
}
