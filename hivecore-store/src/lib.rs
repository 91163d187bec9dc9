//! # hivecore-store
//!
//! Storage substrate for the hivecore workspace: the durable-store
//! contracts the core consumes (key-value, sorted-set, pub/sub, entity
//! documents), in-memory adapters for tests and single-node runs, the
//! two-tier read-through cache, and the rank index facade.
//!
//! Concrete backing engines (Redis, MongoDB, ...) live outside the core;
//! an adapter only has to satisfy the contracts in [`contract`].

pub mod cache;
pub mod contract;
pub mod error;
pub mod memory;
pub mod rank;

pub use cache::{EvictBroadcast, LocalCache, NoLoader, NoopEvictBroadcast, TieredCache};
pub use contract::{EntityStore, KeyValueStore, PubSubChannel, SortedSetStore, Subscription};
pub use error::StoreError;
pub use memory::{MemoryEntityStore, MemoryKv, MemoryPubSub, MemorySortedSet};
pub use rank::{RankEntry, RankIndex};
