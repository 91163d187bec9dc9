//! Metrics sink contract with atomic and no-op implementations.
//!
//! The core reports counters (dropped messages, mailbox rejections, cache
//! hits) and millisecond timings (handler latency, RPC round-trips) through
//! a [`MetricsSink`]. Hosts plug their exporter in at bootstrap; tests read
//! the atomic default back directly.

// Layer 1: Standard library
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// Layer 2: Third-party
use dashmap::DashMap;

// Layer 3: Internal
// (none)

/// Sink for core runtime metrics.
///
/// Implementations must be cheap and lock-light: these methods sit on the
/// dispatch hot path.
pub trait MetricsSink: Send + Sync + 'static {
    /// Increment a named counter by one.
    fn incr(&self, key: &'static str) {
        self.incr_by(key, 1);
    }

    /// Increment a named counter.
    fn incr_by(&self, key: &'static str, n: u64);

    /// Record one observation of a millisecond timing.
    fn observe_millis(&self, key: &'static str, millis: u64);
}

/// Well-known counter keys emitted by the core.
pub mod keys {
    pub const SESSION_PENDING_DROPPED: &str = "session.pending.dropped";
    pub const SESSION_KICKED: &str = "session.kicked";
    pub const MAILBOX_REJECTED: &str = "actor.mailbox.rejected";
    pub const ACTOR_EVICTED: &str = "actor.evicted";
    pub const ACTOR_SAVE_FAILED: &str = "actor.save.failed";
    pub const DISPATCH_SLOW: &str = "dispatch.slow";
    pub const DISPATCH_ERROR: &str = "dispatch.error";
    pub const CACHE_LOCAL_HIT: &str = "cache.local.hit";
    pub const CACHE_SHARED_HIT: &str = "cache.shared.hit";
    pub const CACHE_MISS: &str = "cache.miss";
    pub const RPC_FAILURE: &str = "rpc.failure";
    pub const EVENT_DROPPED: &str = "event.dropped";
    pub const COMPENSATION_MANUAL: &str = "compensation.manual_required";
}

/// Lock-free in-memory sink backed by atomic counters.
///
/// Timings are folded into `{key}.count` / `{key}.total_ms` counters, which
/// is all the core's own tests and the slow-handler warning need.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    counters: DashMap<String, AtomicU64>,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a counter back; absent counters read zero.
    pub fn get(&self, key: &str) -> u64 {
        self.counters
            .get(key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn add(&self, key: String, n: u64) {
        self.counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }
}

impl MetricsSink for AtomicMetrics {
    fn incr_by(&self, key: &'static str, n: u64) {
        self.add(key.to_string(), n);
    }

    fn observe_millis(&self, key: &'static str, millis: u64) {
        self.add(format!("{key}.count"), 1);
        self.add(format!("{key}.total_ms"), millis);
    }
}

/// Sink that discards every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_by(&self, _key: &'static str, _n: u64) {}

    fn observe_millis(&self, _key: &'static str, _millis: u64) {}
}

/// Shared handle type the rest of the workspace passes around.
pub type SharedMetrics = Arc<dyn MetricsSink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_counter_accumulates() {
        let metrics = AtomicMetrics::new();
        metrics.incr(keys::CACHE_MISS);
        metrics.incr(keys::CACHE_MISS);
        metrics.incr_by(keys::CACHE_MISS, 3);
        assert_eq!(metrics.get(keys::CACHE_MISS), 5);
    }

    #[test]
    fn test_absent_counter_reads_zero() {
        let metrics = AtomicMetrics::new();
        assert_eq!(metrics.get("never.touched"), 0);
    }

    #[test]
    fn test_observe_folds_count_and_total() {
        let metrics = AtomicMetrics::new();
        metrics.observe_millis("dispatch.latency", 40);
        metrics.observe_millis("dispatch.latency", 60);
        assert_eq!(metrics.get("dispatch.latency.count"), 2);
        assert_eq!(metrics.get("dispatch.latency.total_ms"), 100);
    }

    #[test]
    fn test_noop_accepts_everything() {
        let metrics = NoopMetrics;
        metrics.incr("whatever");
        metrics.observe_millis("whatever", 1);
    }

    #[test]
    fn test_shared_handle_is_object_safe() {
        let shared: SharedMetrics = Arc::new(AtomicMetrics::new());
        shared.incr(keys::RPC_FAILURE);
    }
}
