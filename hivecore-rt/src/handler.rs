//! Handler sets: the tagged dispatch table an actor system runs on.
//!
//! Instead of a deep actor base-class, a system is configured with one
//! `HandlerSet<S>`: message handlers keyed by type tag, an optional
//! catch-all, and lifecycle hooks. Handlers are plain `fn` items or
//! closures returning boxed futures; domain state `S` flows through
//! `ActorCell<S>` mutably under the single-writer guarantee.

// Layer 1: Standard library
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

// Layer 2: Third-party
use serde_json::Value;

// Layer 3: Internal
use crate::cell::ActorCell;
use crate::error::HandlerError;
use crate::message::MessageContext;

/// Value produced by a handler; `ask` callers receive it verbatim.
pub type HandlerResult = Result<Value, HandlerError>;

/// Boxed handler future borrowing the cell for its duration.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>>;

/// Boxed lifecycle-hook future.
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// A message handler for state type `S`.
///
/// Blanket-implemented for matching `Fn`s, so `fn` items register
/// directly:
///
/// ```rust
/// use hivecore_rt::handler::{HandlerFuture, HandlerSet};
/// use hivecore_rt::cell::ActorCell;
/// use hivecore_rt::message::MessageContext;
/// use serde_json::{json, Value};
///
/// fn ping<'a>(
///     _cell: &'a mut ActorCell<u64>,
///     _payload: Value,
///     _ctx: MessageContext,
/// ) -> HandlerFuture<'a> {
///     Box::pin(async move { Ok(json!("pong")) })
/// }
///
/// let handlers = HandlerSet::new().on("ping", ping);
/// assert!(handlers.handles("ping"));
/// ```
pub trait MessageHandler<S>: Send + Sync {
    fn call<'a>(
        &'a self,
        cell: &'a mut ActorCell<S>,
        payload: Value,
        ctx: MessageContext,
    ) -> HandlerFuture<'a>;
}

impl<S, F> MessageHandler<S> for F
where
    F: for<'a> Fn(&'a mut ActorCell<S>, Value, MessageContext) -> HandlerFuture<'a>
        + Send
        + Sync,
{
    fn call<'a>(
        &'a self,
        cell: &'a mut ActorCell<S>,
        payload: Value,
        ctx: MessageContext,
    ) -> HandlerFuture<'a> {
        (self)(cell, payload, ctx)
    }
}

/// A lifecycle hook for state type `S`.
pub trait LifecycleHook<S>: Send + Sync {
    fn call<'a>(&'a self, cell: &'a mut ActorCell<S>) -> HookFuture<'a>;
}

impl<S, F> LifecycleHook<S> for F
where
    F: for<'a> Fn(&'a mut ActorCell<S>) -> HookFuture<'a> + Send + Sync,
{
    fn call<'a>(&'a self, cell: &'a mut ActorCell<S>) -> HookFuture<'a> {
        (self)(cell)
    }
}

/// Dispatch table for one actor system.
pub struct HandlerSet<S> {
    handlers: HashMap<String, Arc<dyn MessageHandler<S>>>,
    fallback: Option<Arc<dyn MessageHandler<S>>>,
    pre_start: Option<Arc<dyn LifecycleHook<S>>>,
    post_stop: Option<Arc<dyn LifecycleHook<S>>>,
}

impl<S> Default for HandlerSet<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> HandlerSet<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: None,
            pre_start: None,
            post_stop: None,
        }
    }

    /// Register a handler for one message type; later registrations for
    /// the same tag replace earlier ones.
    pub fn on(mut self, message_type: impl Into<String>, handler: impl MessageHandler<S> + 'static) -> Self {
        self.handlers.insert(message_type.into(), Arc::new(handler));
        self
    }

    /// Register the catch-all invoked for tags with no dedicated handler.
    pub fn on_any(mut self, handler: impl MessageHandler<S> + 'static) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    /// Hook run after state load, before the first message. Failures are
    /// logged and do not stop the actor.
    pub fn on_pre_start(mut self, hook: impl LifecycleHook<S> + 'static) -> Self {
        self.pre_start = Some(Arc::new(hook));
        self
    }

    /// Hook run after the final flush on stop. Failures are logged.
    pub fn on_post_stop(mut self, hook: impl LifecycleHook<S> + 'static) -> Self {
        self.post_stop = Some(Arc::new(hook));
        self
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type) || self.fallback.is_some()
    }

    pub(crate) fn resolve(&self, message_type: &str) -> Option<&Arc<dyn MessageHandler<S>>> {
        self.handlers.get(message_type).or(self.fallback.as_ref())
    }

    pub(crate) fn pre_start_hook(&self) -> Option<&Arc<dyn LifecycleHook<S>>> {
        self.pre_start.as_ref()
    }

    pub(crate) fn post_stop_hook(&self) -> Option<&Arc<dyn LifecycleHook<S>>> {
        self.post_stop.as_ref()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests are allowed to use unwrap for simplicity
mod tests {
    use super::*;
    use crate::message::SystemRef;
    use serde_json::json;

    struct NullSystem;

    impl SystemRef for NullSystem {
        fn system_name(&self) -> &str {
            "null"
        }

        fn tell(&self, _actor_id: &str, _message_type: &str, _payload: Value) -> bool {
            false
        }
    }

    fn ctx() -> MessageContext {
        MessageContext {
            actor_id: "a-1".to_string(),
            trace: None,
            system: Arc::new(NullSystem),
        }
    }

    fn double<'a>(
        cell: &'a mut ActorCell<i64>,
        payload: Value,
        _ctx: MessageContext,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let n = payload["n"].as_i64().unwrap_or(0);
            if let Some(state) = cell.state_mut() {
                *state += n;
            }
            Ok(json!({ "n": n * 2 }))
        })
    }

    fn echo_type<'a>(
        _cell: &'a mut ActorCell<i64>,
        payload: Value,
        _ctx: MessageContext,
    ) -> HandlerFuture<'a> {
        Box::pin(async move { Ok(payload) })
    }

    #[tokio::test]
    async fn test_resolve_dedicated_handler() {
        let set = HandlerSet::new().on("double", double);
        let mut cell = ActorCell::new("a-1".to_string());
        cell.install_loaded(0i64);

        let handler = set.resolve("double").unwrap();
        let out = handler.call(&mut cell, json!({"n": 21}), ctx()).await.unwrap();
        assert_eq!(out["n"], 42);
        assert_eq!(cell.state(), Some(&21));
        assert!(cell.is_dirty());
    }

    #[tokio::test]
    async fn test_fallback_catches_unknown_types() {
        let set = HandlerSet::new().on("double", double).on_any(echo_type);
        assert!(set.handles("anything"));
        let mut cell = ActorCell::new("a-1".to_string());
        let handler = set.resolve("mystery").unwrap();
        let out = handler.call(&mut cell, json!("x"), ctx()).await.unwrap();
        assert_eq!(out, json!("x"));
    }

    #[test]
    fn test_no_handler_no_fallback() {
        let set: HandlerSet<i64> = HandlerSet::new().on("double", double);
        assert!(!set.handles("mystery"));
        assert!(set.resolve("mystery").is_none());
    }

    #[test]
    fn test_later_registration_replaces() {
        let set = HandlerSet::new().on("x", double).on("x", echo_type);
        // Still exactly one handler for "x".
        assert!(set.handles("x"));
        assert_eq!(set.handlers.len(), 1);
    }
}
