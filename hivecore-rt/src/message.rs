//! Messages flowing through actor mailboxes.

// Layer 1: Standard library
use std::sync::Arc;

// Layer 2: Third-party
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;

// Layer 3: Internal
use crate::error::ActorError;
use hivecore_shared::trace::TraceContext;

/// Completion slot for `ask`; `tell` leaves it empty.
pub type ReplySlot = oneshot::Sender<Result<Value, ActorError>>;

/// One message addressed to an actor.
///
/// The payload is opaque JSON: the runtime routes by `message_type` and
/// never inspects the body, which is what lets remote `tell`/`ask` carry
/// the same envelope across nodes.
#[derive(Debug)]
pub struct ActorMessage {
    pub message_type: String,
    pub payload: Value,
    pub reply: Option<ReplySlot>,
    pub trace: Option<TraceContext>,
    pub enqueued_at: DateTime<Utc>,
}

impl ActorMessage {
    /// Fire-and-forget message, capturing the caller's trace context.
    pub fn tell(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            reply: None,
            trace: TraceContext::current(),
            enqueued_at: Utc::now(),
        }
    }

    /// Request message wired to a completion slot.
    pub fn ask(
        message_type: impl Into<String>,
        payload: Value,
    ) -> (Self, oneshot::Receiver<Result<Value, ActorError>>) {
        let (tx, rx) = oneshot::channel();
        let message = Self {
            message_type: message_type.into(),
            payload,
            reply: Some(tx),
            trace: TraceContext::current(),
            enqueued_at: Utc::now(),
        };
        (message, rx)
    }
}

/// Re-entrant access back into the owning system, handed to handlers.
///
/// Only non-blocking operations: a handler that filled its own mailbox must
/// see `false`, not deadlock behind itself.
pub trait SystemRef: Send + Sync {
    fn system_name(&self) -> &str;

    /// Enqueue without waiting; creates the target actor if absent.
    /// Returns `false` when the mailbox is full or the target is stopping.
    fn tell(&self, actor_id: &str, message_type: &str, payload: Value) -> bool;
}

/// Per-message context a handler receives alongside the payload.
#[derive(Clone)]
pub struct MessageContext {
    pub actor_id: String,
    pub trace: Option<TraceContext>,
    pub system: Arc<dyn SystemRef>,
}

impl MessageContext {
    /// Re-entrant send; from inside a handler of the same actor this lands
    /// at the back of the current mailbox and is processed in the same
    /// drain loop.
    pub fn tell(&self, actor_id: &str, message_type: &str, payload: Value) -> bool {
        self.system.tell(actor_id, message_type, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tell_has_no_reply_slot() {
        let message = ActorMessage::tell("ping", json!({}));
        assert!(message.reply.is_none());
        assert_eq!(message.message_type, "ping");
    }

    #[tokio::test]
    async fn test_ask_completes_through_slot() {
        let (message, rx) = ActorMessage::ask("ping", json!({"n": 1}));
        let reply = message.reply;
        if let Some(slot) = reply {
            let _ = slot.send(Ok(json!({"n": 2})));
        }
        let result = rx.await;
        assert!(matches!(result, Ok(Ok(value)) if value["n"] == 2));
    }

    #[tokio::test]
    async fn test_message_captures_current_trace() {
        let ctx = TraceContext::from_parts("t-1".to_string(), None);
        let message = ctx
            .scope(async { ActorMessage::tell("ping", json!({})) })
            .await;
        assert_eq!(message.trace.map(|t| t.trace_id), Some("t-1".to_string()));
    }
}
