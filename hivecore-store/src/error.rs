// Layer 1: Standard library
// (none)

// Layer 2: Third-party
use thiserror::Error;

// Layer 3: Internal
// (none)

/// Errors surfaced by storage contracts and the caches built on them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing engine rejected or failed the operation.
    #[error("backend failure: {0}")]
    Backend(String),

    /// A stored value could not be (de)serialized.
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store (or a subscription on it) has shut down.
    #[error("store closed")]
    Closed,
}

impl StoreError {
    /// Convenience constructor for adapter implementations.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}
