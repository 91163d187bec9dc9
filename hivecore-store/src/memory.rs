//! In-memory adapters for the storage contracts.
//!
//! These back the test suites and single-node deployments; a clustered
//! deployment swaps in adapters over a shared engine. Semantics match the
//! contracts exactly, TTLs included.

// Layer 1: Standard library
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

// Layer 2: Third-party
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

// Layer 3: Internal
use crate::contract::{EntityStore, KeyValueStore, PubSubChannel, SortedSetStore, Subscription};
use crate::error::StoreError;

const SUBSCRIPTION_BUFFER: usize = 1024;

/// In-process [`KeyValueStore`] with lazy TTL expiry.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: DashMap<String, KvEntry>,
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if let Some(entry) = self.entries.get(key) {
            if let Some(expiry) = entry.expires_at {
                if Instant::now() >= expiry {
                    drop(entry);
                    self.entries.remove(key);
                    return Ok(None);
                }
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }
}

/// Ordering key for the sorted set: descending score, ties ascending
/// lexicographic on the member id.
#[derive(Debug, Clone)]
struct Entry {
    score: f64,
    member: String,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.member.cmp(&other.member))
    }
}

#[derive(Debug, Default)]
struct SetState {
    scores: HashMap<String, f64>,
    ordered: BTreeSet<Entry>,
}

impl SetState {
    fn put(&mut self, member: &str, score: f64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&Entry {
                score: old,
                member: member.to_string(),
            });
        }
        self.ordered.insert(Entry {
            score,
            member: member.to_string(),
        });
    }

    fn take(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(old) => {
                self.ordered.remove(&Entry {
                    score: old,
                    member: member.to_string(),
                });
                true
            }
            None => false,
        }
    }
}

/// In-process [`SortedSetStore`].
#[derive(Debug, Default)]
pub struct MemorySortedSet {
    sets: Mutex<HashMap<String, SetState>>,
}

impl MemorySortedSet {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SortedSetStore for MemorySortedSet {
    async fn add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut sets = self.sets.lock();
        sets.entry(key.to_string()).or_default().put(member, score);
        Ok(())
    }

    async fn remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut sets = self.sets.lock();
        let (removed, now_empty) = match sets.get_mut(key) {
            Some(state) => (state.take(member), state.scores.is_empty()),
            None => (false, false),
        };
        if removed && now_empty {
            sets.remove(key);
        }
        Ok(removed)
    }

    async fn score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let sets = self.sets.lock();
        Ok(sets.get(key).and_then(|s| s.scores.get(member).copied()))
    }

    async fn rank_desc(&self, key: &str, member: &str) -> Result<Option<u64>, StoreError> {
        let sets = self.sets.lock();
        let Some(state) = sets.get(key) else {
            return Ok(None);
        };
        if !state.scores.contains_key(member) {
            return Ok(None);
        }
        let position = state
            .ordered
            .iter()
            .position(|e| e.member == member)
            .map(|p| p as u64);
        Ok(position)
    }

    async fn range_desc_with_scores(
        &self,
        key: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        if end <= start {
            return Ok(Vec::new());
        }
        let sets = self.sets.lock();
        let Some(state) = sets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(state
            .ordered
            .iter()
            .skip(start as usize)
            .take((end - start) as usize)
            .map(|e| (e.member.clone(), e.score))
            .collect())
    }

    async fn increment_by(
        &self,
        key: &str,
        member: &str,
        delta: f64,
    ) -> Result<f64, StoreError> {
        let mut sets = self.sets.lock();
        let state = sets.entry(key.to_string()).or_default();
        let new_score = state.scores.get(member).copied().unwrap_or(0.0) + delta;
        state.put(member, new_score);
        Ok(new_score)
    }

    async fn cardinality(&self, key: &str) -> Result<u64, StoreError> {
        let sets = self.sets.lock();
        Ok(sets.get(key).map(|s| s.scores.len() as u64).unwrap_or(0))
    }

    async fn remove_range_desc(
        &self,
        key: &str,
        start: u64,
        end: u64,
    ) -> Result<u64, StoreError> {
        if end <= start {
            return Ok(0);
        }
        let mut sets = self.sets.lock();
        let (removed, now_empty) = {
            let Some(state) = sets.get_mut(key) else {
                return Ok(0);
            };
            let doomed: Vec<String> = state
                .ordered
                .iter()
                .skip(start as usize)
                .take((end - start) as usize)
                .map(|e| e.member.clone())
                .collect();
            for member in &doomed {
                state.take(member);
            }
            (doomed.len() as u64, state.scores.is_empty())
        };
        if now_empty {
            sets.remove(key);
        }
        Ok(removed)
    }
}

/// In-process [`PubSubChannel`] fanning out over tokio channels.
///
/// A subscriber whose buffer is full loses the message; the adapter logs a
/// warn and keeps going, matching the fire-and-forget contract.
#[derive(Debug, Default)]
pub struct MemoryPubSub {
    channels: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSubChannel for MemoryPubSub {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError> {
        let mut channels = self.channels.lock();
        if let Some(senders) = channels.get_mut(channel) {
            senders.retain(|sender| match sender.try_send(payload.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(channel, "pub/sub subscriber lagging, message dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            if senders.is_empty() {
                channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_string())
            .or_default()
            .push(sender);
        Ok(Subscription {
            channel: channel.to_string(),
            receiver,
        })
    }
}

/// In-process [`EntityStore`].
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    documents: DashMap<(String, String), Value>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents, handy in tests.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn load(&self, system: &str, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .documents
            .get(&(system.to_string(), id.to_string()))
            .map(|doc| doc.clone()))
    }

    async fn save(&self, system: &str, id: &str, state: &Value) -> Result<(), StoreError> {
        self.documents
            .insert((system.to_string(), id.to_string()), state.clone());
        Ok(())
    }

    async fn delete(&self, system: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .documents
            .remove(&(system.to_string(), id.to_string()))
            .is_some())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests are allowed to use unwrap for simplicity
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_kv_absent_vs_present() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get("missing").await.unwrap(), None);
        kv.set("k", "".to_string()).await.unwrap();
        // An empty value is still a present entry.
        assert_eq!(kv.get("k").await.unwrap(), Some("".to_string()));
    }

    #[tokio::test]
    async fn test_kv_ttl_expires() {
        let kv = MemoryKv::new();
        kv.set_with_ttl("k", "v".to_string(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_kv_delete_reports_presence() {
        let kv = MemoryKv::new();
        kv.set("k", "v".to_string()).await.unwrap();
        assert!(kv.delete("k").await.unwrap());
        assert!(!kv.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_sorted_set_orders_desc_with_lex_ties() {
        let set = MemorySortedSet::new();
        set.add("board", "bob", 50.0).await.unwrap();
        set.add("board", "alice", 100.0).await.unwrap();
        set.add("board", "carol", 50.0).await.unwrap();

        let range = set.range_desc_with_scores("board", 0, 10).await.unwrap();
        let members: Vec<&str> = range.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_sorted_set_rank_and_update() {
        let set = MemorySortedSet::new();
        set.add("board", "a", 10.0).await.unwrap();
        set.add("board", "b", 20.0).await.unwrap();
        assert_eq!(set.rank_desc("board", "a").await.unwrap(), Some(1));

        // Updating a score repositions, never duplicates.
        set.add("board", "a", 30.0).await.unwrap();
        assert_eq!(set.rank_desc("board", "a").await.unwrap(), Some(0));
        assert_eq!(set.cardinality("board").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sorted_set_increment() {
        let set = MemorySortedSet::new();
        assert_eq!(set.increment_by("board", "a", 5.0).await.unwrap(), 5.0);
        assert_eq!(set.increment_by("board", "a", 2.5).await.unwrap(), 7.5);
        assert_eq!(set.score("board", "a").await.unwrap(), Some(7.5));
    }

    #[tokio::test]
    async fn test_sorted_set_remove_range() {
        let set = MemorySortedSet::new();
        for (member, score) in [("a", 4.0), ("b", 3.0), ("c", 2.0), ("d", 1.0)] {
            set.add("board", member, score).await.unwrap();
        }
        // Keep top two, drop the tail.
        let removed = set.remove_range_desc("board", 2, u64::MAX).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(set.cardinality("board").await.unwrap(), 2);
        assert_eq!(set.rank_desc("board", "c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pubsub_fan_out_in_publish_order() {
        let bus = MemoryPubSub::new();
        let mut sub_a = bus.subscribe("events").await.unwrap();
        let mut sub_b = bus.subscribe("events").await.unwrap();

        bus.publish("events", "one".to_string()).await.unwrap();
        bus.publish("events", "two".to_string()).await.unwrap();

        assert_eq!(sub_a.recv().await.unwrap(), "one");
        assert_eq!(sub_a.recv().await.unwrap(), "two");
        assert_eq!(sub_b.recv().await.unwrap(), "one");
        assert_eq!(sub_b.recv().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn test_pubsub_dropped_subscriber_is_pruned() {
        let bus = MemoryPubSub::new();
        let sub = bus.subscribe("events").await.unwrap();
        drop(sub);
        // Publishing to a channel with only dead subscribers must not error.
        bus.publish("events", "x".to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn test_entity_store_round_trip() {
        let store = MemoryEntityStore::new();
        let doc = json!({"gold": 100, "level": 3});
        store.save("player", "42", &doc).await.unwrap();
        assert_eq!(store.load("player", "42").await.unwrap(), Some(doc));
        assert!(store.delete("player", "42").await.unwrap());
        assert_eq!(store.load("player", "42").await.unwrap(), None);
    }
}
