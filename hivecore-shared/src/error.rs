//! Wire error taxonomy shared by every layer.
//!
//! Policy per kind: protocol errors close the connection, authorization and
//! business errors answer with a typed code and keep it open, transient
//! remote errors are caller-configurable, capacity errors shed load as
//! `SystemError`, fatal errors escalate through the registered error sink.

// Layer 1: Standard library
use std::fmt::{self, Display};

// Layer 2: Third-party
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Layer 3: Internal
// (none)

/// Numeric error codes carried on every RESPONSE frame.
///
/// Code space: 0 success, 1xx protocol, 2xx authorization, 3xx business,
/// 4xx transient-remote, 5xx capacity/system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Success = 0,

    // Protocol - connection is closed after surfacing these.
    FrameOverflow = 101,
    ParseError = 102,
    IllegalOperation = 103,

    // Authorization - respond, keep the connection.
    TokenInvalid = 201,
    Forbidden = 202,

    // Business - respond, no retry.
    ValidationFailed = 301,
    ResourceMissing = 302,
    NotEnoughCurrency = 303,
    Duplicate = 304,

    // Transient-remote - reads may retry once, writes go through compensation.
    RpcTimeout = 401,
    ServiceUnavailable = 402,
    CircuitOpen = 403,

    // Capacity / system.
    SystemError = 500,
}

impl ErrorCode {
    /// Raw wire value.
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Decode a wire value; unknown codes collapse to `SystemError` so a
    /// newer peer never crashes an older one.
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0 => Self::Success,
            101 => Self::FrameOverflow,
            102 => Self::ParseError,
            103 => Self::IllegalOperation,
            201 => Self::TokenInvalid,
            202 => Self::Forbidden,
            301 => Self::ValidationFailed,
            302 => Self::ResourceMissing,
            303 => Self::NotEnoughCurrency,
            304 => Self::Duplicate,
            401 => Self::RpcTimeout,
            402 => Self::ServiceUnavailable,
            403 => Self::CircuitOpen,
            _ => Self::SystemError,
        }
    }

    /// Whether the gateway must close the connection after responding.
    pub fn closes_connection(&self) -> bool {
        matches!(self, Self::FrameOverflow | Self::ParseError)
    }

    /// Default human-readable message for this code.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Success => "ok",
            Self::FrameOverflow => "frame exceeds maximum length",
            Self::ParseError => "malformed payload",
            Self::IllegalOperation => "unknown protocol",
            Self::TokenInvalid => "invalid or expired token",
            Self::Forbidden => "operation not permitted",
            Self::ValidationFailed => "validation failed",
            Self::ResourceMissing => "resource not found",
            Self::NotEnoughCurrency => "insufficient currency",
            Self::Duplicate => "duplicate operation",
            Self::RpcTimeout => "remote call timed out",
            Self::ServiceUnavailable => "service unavailable",
            Self::CircuitOpen => "circuit open",
            Self::SystemError => "internal error",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u16())
    }
}

/// Typed business failure a handler returns to the dispatcher.
///
/// Carries the wire code plus an operator-facing message; the dispatcher
/// copies both onto the RESPONSE frame.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct BusinessError {
    pub code: ErrorCode,
    pub message: String,
}

impl BusinessError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand with the code's default message.
    pub fn of(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.message().to_string(),
        }
    }
}
