// Layer 1: Standard library
use std::time::Duration;

// Layer 2: Third-party
use thiserror::Error;

// Layer 3: Internal
use hivecore_shared::error::ErrorCode;

/// Errors surfaced by the cluster layer (ring, topology, RPC transport).
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("transport i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("rpc codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    /// No discovered node hosts the requested actor system.
    #[error("no nodes available for system {system}")]
    NoNodes { system: String },

    /// The mock provider answers this until a real endpoint is discovered.
    #[error("service unavailable: {service}")]
    ServiceUnavailable { service: String },

    #[error("rpc timed out after {timeout:?}")]
    RpcTimeout { timeout: Duration },

    /// The peer executed the call and reported a typed failure.
    #[error("remote failure {code}: {message}")]
    Remote { code: ErrorCode, message: String },

    /// The connection died mid-call.
    #[error("peer connection to {peer} lost")]
    ConnectionLost { peer: String },
}

impl ClusterError {
    /// Wire code surfaced to clients when this failure reaches a response.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::RpcTimeout { .. } => ErrorCode::RpcTimeout,
            Self::Remote { code, .. } => *code,
            Self::NoNodes { .. } | Self::ServiceUnavailable { .. } => {
                ErrorCode::ServiceUnavailable
            }
            Self::Io(_) | Self::Codec(_) | Self::ConnectionLost { .. } => ErrorCode::SystemError,
        }
    }

    /// Transient failures are safe to retry for read-only calls.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RpcTimeout { .. } | Self::ConnectionLost { .. } | Self::Io(_)
        )
    }
}
