//! Per-request trace context.
//!
//! A `TraceContext` is minted when a frame enters the gateway and travels
//! with the request through local async handoffs (task-local scope) and
//! remote calls (a serialized attachment on the RPC envelope). Handlers
//! read it back with [`TraceContext::current`]; there is no global mutable
//! state involved.

// Layer 1: Standard library
use std::fmt::{self, Display};

// Layer 2: Third-party
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Layer 3: Internal
use crate::ids::RoleId;

tokio::task_local! {
    static CURRENT_TRACE: TraceContext;
}

/// Identifies one request end-to-end across nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// Globally unique id for this request.
    pub trace_id: String,
    /// The acting role, once authentication has bound one.
    pub role_id: Option<RoleId>,
}

impl TraceContext {
    /// Mint a fresh context with a random trace id.
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            role_id: None,
        }
    }

    /// Rebuild a context received from a peer (RPC attachment).
    pub fn from_parts(trace_id: String, role_id: Option<RoleId>) -> Self {
        Self { trace_id, role_id }
    }

    /// Attach the acting role.
    pub fn with_role(mut self, role_id: RoleId) -> Self {
        self.role_id = Some(role_id);
        self
    }

    /// The context of the running task, if one was scoped.
    pub fn current() -> Option<TraceContext> {
        CURRENT_TRACE.try_with(|t| t.clone()).ok()
    }

    /// Run `fut` with this context installed as the task-local current one.
    ///
    /// Nested scopes shadow outer ones, matching how a handler that fans out
    /// sub-requests re-scopes each of them.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: std::future::Future,
    {
        CURRENT_TRACE.scope(self, fut).await
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role_id {
            Some(role) => write!(f, "{}/{}", self.trace_id, role),
            None => write!(f, "{}", self.trace_id),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests are allowed to use unwrap for simplicity
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_current_outside_scope_is_none() {
        assert!(TraceContext::current().is_none());
    }

    #[tokio::test]
    async fn test_scope_installs_context() {
        let ctx = TraceContext::new().with_role(RoleId::from_u64(9));
        let expected = ctx.clone();
        ctx.scope(async move {
            let seen = TraceContext::current().unwrap();
            assert_eq!(seen, expected);
        })
        .await;
        assert!(TraceContext::current().is_none());
    }

    #[tokio::test]
    async fn test_nested_scope_shadows() {
        let outer = TraceContext::from_parts("outer".to_string(), None);
        let inner = TraceContext::from_parts("inner".to_string(), None);
        outer
            .scope(async move {
                assert_eq!(TraceContext::current().unwrap().trace_id, "outer");
                inner
                    .scope(async {
                        assert_eq!(TraceContext::current().unwrap().trace_id, "inner");
                    })
                    .await;
                assert_eq!(TraceContext::current().unwrap().trace_id, "outer");
            })
            .await;
    }

    #[test]
    fn test_serialized_attachment_round_trip() {
        let ctx = TraceContext::new().with_role(RoleId::from_u64(3));
        let json = serde_json::to_string(&ctx).unwrap();
        let back: TraceContext = serde_json::from_str(&json).unwrap();
        assert_eq!(ctx, back);
    }
}
