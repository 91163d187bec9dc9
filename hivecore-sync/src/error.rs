// Layer 1: Standard library
// (none)

// Layer 2: Third-party
use thiserror::Error;

// Layer 3: Internal
use hivecore_shared::error::BusinessError;
use hivecore_store::StoreError;

/// Errors surfaced by the consistency primitives (bus, compensation, saga).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("event codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("no compensation handler registered for type {0}")]
    MissingHandler(String),

    /// Typed business failure raised inside an action or step.
    #[error(transparent)]
    Business(#[from] BusinessError),

    /// Any other action failure, carried as text.
    #[error("action failed: {0}")]
    Action(String),
}

impl SyncError {
    pub fn action(msg: impl Into<String>) -> Self {
        Self::Action(msg.into())
    }
}
