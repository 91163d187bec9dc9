//! Durable persistence contracts the core consumes.
//!
//! These four traits are the complete storage surface of the runtime: a
//! key-value object store, a sorted-set index, a pub/sub channel, and a
//! document store for entity state. Adapters for concrete engines
//! implement them outside the core; [`crate::memory`] ships in-process
//! implementations.

// Layer 1: Standard library
use std::time::Duration;

// Layer 2: Third-party
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

// Layer 3: Internal
use crate::error::StoreError;

/// Key-value object store with optional per-key TTL.
///
/// Values are opaque strings; callers serialize. An absent key is `None`,
/// which is distinct from a present key holding an empty or null payload.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Returns `true` when a key existed and was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// Sorted-set index: members ordered by descending score, ties ordered
/// ascending-lexicographic on the member id.
///
/// Ranks and ranges are 0-based here; half-open `[start, end)`. The
/// [`crate::rank::RankIndex`] facade translates to the 1-based surface
/// callers see.
#[async_trait]
pub trait SortedSetStore: Send + Sync + 'static {
    /// Insert or replace a member's score.
    async fn add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Returns `true` when the member existed and was removed.
    async fn remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;

    /// 0-based position in descending-score order.
    async fn rank_desc(&self, key: &str, member: &str) -> Result<Option<u64>, StoreError>;

    /// Members and scores for positions `[start, end)` in descending order.
    async fn range_desc_with_scores(
        &self,
        key: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<(String, f64)>, StoreError>;

    /// Add `delta` to a member's score (inserting at `delta` if absent);
    /// returns the new score.
    async fn increment_by(&self, key: &str, member: &str, delta: f64)
        -> Result<f64, StoreError>;

    async fn cardinality(&self, key: &str) -> Result<u64, StoreError>;

    /// Remove members at positions `[start, end)` in descending order;
    /// returns how many were removed.
    async fn remove_range_desc(&self, key: &str, start: u64, end: u64)
        -> Result<u64, StoreError>;
}

/// A live subscription returned by [`PubSubChannel::subscribe`].
///
/// Messages arrive in publish order per channel; a subscriber that cannot
/// keep up loses messages (the adapter logs a warn). Dropping the
/// subscription unsubscribes.
pub struct Subscription {
    pub channel: String,
    pub receiver: mpsc::Receiver<String>,
}

impl Subscription {
    /// Receive the next message, or `None` once the channel closes.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

/// Fire-and-forget pub/sub channel between nodes.
#[async_trait]
pub trait PubSubChannel: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}

/// Document store for entity state, keyed by `(system, id)`.
#[async_trait]
pub trait EntityStore: Send + Sync + 'static {
    async fn load(&self, system: &str, id: &str) -> Result<Option<Value>, StoreError>;

    async fn save(&self, system: &str, id: &str, state: &Value) -> Result<(), StoreError>;

    /// Returns `true` when a document existed and was removed.
    async fn delete(&self, system: &str, id: &str) -> Result<bool, StoreError>;
}
