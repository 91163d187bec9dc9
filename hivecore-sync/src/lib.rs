//! # hivecore-sync
//!
//! Cross-node consistency primitives: the typed event bus (local and
//! distributed), the compensation-record engine for retrying failed
//! cross-service writes, and the saga orchestrator for multi-step writes
//! with reverse-order compensation.

pub mod bus;
pub mod compensation;
pub mod error;
pub mod event;
pub mod remote;
pub mod saga;

pub use bus::{LocalEventBus, SubscriptionId};
pub use compensation::{
    CompensationEngine, CompensationHandler, CompensationOptions, CompensationRecord,
    RecordStatus,
};
pub use error::SyncError;
pub use event::CoreEvent;
pub use remote::{DistributedEventBus, BROADCAST_CHANNEL};
pub use saga::{Saga, SagaResult, SagaStep};
