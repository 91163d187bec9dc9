// Layer 1: Standard library
use std::time::Duration;

// Layer 2: Third-party
use thiserror::Error;

// Layer 3: Internal
use hivecore_shared::error::{BusinessError, ErrorCode};

/// Errors surfaced by the actor runtime itself.
#[derive(Debug, Error)]
pub enum ActorError {
    /// The mailbox stayed full past the caller's wait budget.
    #[error("mailbox full for actor {actor_id}")]
    MailboxFull { actor_id: String },

    /// The actor is stopping or stopped; enqueues are rejected.
    #[error("actor {actor_id} is not accepting messages")]
    Stopped { actor_id: String },

    /// `ask` did not complete within the deadline. The handler is not
    /// interrupted; its late result is discarded.
    #[error("ask timed out after {timeout:?} for actor {actor_id}")]
    AskTimeout { actor_id: String, timeout: Duration },

    /// The state loader failed; the actor never reached Running.
    #[error("state load failed for actor {actor_id}: {reason}")]
    LoadFailed { actor_id: String, reason: String },

    /// The handler reported a failure; carried into the ask completion slot.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The system has shut down.
    #[error("actor system {system} is shut down")]
    SystemDown { system: String },
}

impl ActorError {
    /// Wire code the gateway surfaces for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::MailboxFull { .. } | Self::Stopped { .. } | Self::SystemDown { .. } => {
                ErrorCode::SystemError
            }
            Self::AskTimeout { .. } => ErrorCode::RpcTimeout,
            Self::LoadFailed { .. } => ErrorCode::SystemError,
            Self::Handler(err) => err.error_code(),
        }
    }
}

/// Failure produced by a message handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Typed business failure; answered to the client as-is, never retried.
    #[error(transparent)]
    Business(#[from] BusinessError),

    /// The handler needs loaded state and the actor has none.
    #[error("actor state not loaded")]
    StateMissing,

    /// No handler is registered for the message type.
    #[error("no handler for message type {0}")]
    UnknownMessageType(String),

    /// Anything else; logged and surfaced as a system error.
    #[error("handler failure: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Business(err) => err.code,
            Self::StateMissing | Self::Internal(_) => ErrorCode::SystemError,
            Self::UnknownMessageType(_) => ErrorCode::IllegalOperation,
        }
    }
}
