//! # hivecore-gate
//!
//! The front-door gateway: length-prefixed binary framing over TCP,
//! session lifecycle with reconnection tokens, per-session buffering, and
//! dispatch of decoded requests to registered protocol handlers.

pub mod codec;
pub mod dispatcher;
pub mod protocol;
pub mod server;
pub mod session;

pub use codec::{CodecError, GameCodec, GameMessage};
pub use dispatcher::{
    DispatchOutcome, Dispatcher, FnHandler, ProtocolHandler, Registration,
    SLOW_HANDLER_THRESHOLD,
};
pub use server::{register_builtin_handlers, GateError, GateServer};
pub use session::{BoundRole, ConnHandle, Session, SessionRegistry, PENDING_QUEUE_LIMIT};
