//! State loading and write-behind flushing contract.

// Layer 1: Standard library
// (none)

// Layer 2: Third-party
use async_trait::async_trait;
use thiserror::Error;

// Layer 3: Internal
// (none)

/// The runtime's view of durable actor state.
///
/// `load` runs at most once per actor lifetime, before the first message.
/// `save` runs from the write-behind scanner, on idle eviction, and on
/// graceful stop; a failed save is logged and retried on the next
/// interval, never silently dropped.
#[async_trait]
pub trait StateStore<S>: Send + Sync + 'static {
    async fn load(&self, actor_id: &str) -> Result<Option<S>, StateStoreError>;

    async fn save(&self, actor_id: &str, state: &S) -> Result<(), StateStoreError>;
}

/// Failure in a state store adapter.
#[derive(Debug, Error)]
#[error("state store failure: {0}")]
pub struct StateStoreError(pub String);

impl StateStoreError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Store for actors with no durable state: loads nothing, saves nowhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStateStore;

#[async_trait]
impl<S: Send + Sync + 'static> StateStore<S> for NullStateStore {
    async fn load(&self, _actor_id: &str) -> Result<Option<S>, StateStoreError> {
        Ok(None)
    }

    async fn save(&self, _actor_id: &str, _state: &S) -> Result<(), StateStoreError> {
        Ok(())
    }
}
