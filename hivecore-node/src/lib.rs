//! # hivecore-node
//!
//! Composition of the core into one runnable node: `bootstrap()` wires
//! cache, events, actors, transport and gateway in dependency order and
//! hands back a [`CoreRuntime`]; `CoreRuntime::shutdown()` reverses it.
//! No CLI lives here; launchers wrap this crate and translate
//! [`BootstrapError`] into the published exit codes.

pub mod runtime;
pub mod state_adapter;

pub use runtime::{
    bootstrap, BootstrapError, BootstrapOptions, CoreRuntime, StoreBundle, EXIT_CLEAN,
    EXIT_RUNTIME_FAILURE, EXIT_STARTUP_FAILURE,
};
pub use state_adapter::EntityStateStore;
