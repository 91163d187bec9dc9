//! Dispatcher and handler registry.
//!
//! Handlers are registered explicitly at startup under their protocol id;
//! there is no runtime scanning. Dispatch looks the handler up, gates on login,
//! parses the payload, invokes, and answers with a typed RESPONSE. Sync
//! handlers run on the connection's read task, so all of a session's sync
//! handlers complete before its next frame is dispatched; async handlers
//! are punted to the worker pool and may interleave.

// Layer 1: Standard library
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Layer 2: Third-party
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{error, warn};

// Layer 3: Internal
use crate::codec::GameMessage;
use crate::protocol;
use crate::session::Session;
use hivecore_shared::error::{BusinessError, ErrorCode};
use hivecore_shared::metrics::{keys, MetricsSink, NoopMetrics};
use hivecore_shared::trace::TraceContext;

/// Handlers slower than this are logged and counted.
pub const SLOW_HANDLER_THRESHOLD: Duration = Duration::from_millis(100);

/// Payload parser: raw frame bytes to the handler's input value.
pub type ParserFn = Arc<dyn Fn(&[u8]) -> Result<Value, String> + Send + Sync>;

/// One protocol handler.
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        session: Arc<Session>,
        payload: Value,
    ) -> Result<Value, BusinessError>;
}

/// Adapter letting plain async closures register as handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ProtocolHandler for FnHandler<F>
where
    F: Fn(Arc<Session>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BusinessError>> + Send + 'static,
{
    async fn handle(
        &self,
        session: Arc<Session>,
        payload: Value,
    ) -> Result<Value, BusinessError> {
        (self.0)(session, payload).await
    }
}

/// The default parser: payload is JSON; empty payload reads as `{}`.
fn json_parser(raw: &[u8]) -> Result<Value, String> {
    if raw.is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_slice(raw).map_err(|err| err.to_string())
}

/// One registration: metadata plus parser plus handler.
pub struct Registration {
    pub protocol_id: u16,
    pub description: String,
    pub require_login: bool,
    /// Hand off to the worker pool instead of the read task.
    pub async_mode: bool,
    parser: ParserFn,
    handler: Arc<dyn ProtocolHandler>,
}

impl Registration {
    pub fn new(
        protocol_id: u16,
        description: impl Into<String>,
        handler: impl ProtocolHandler,
    ) -> Self {
        Self {
            protocol_id,
            description: description.into(),
            require_login: true,
            async_mode: false,
            parser: Arc::new(json_parser),
            handler: Arc::new(handler),
        }
    }

    /// Allow unauthenticated sessions (login-family protocols get this
    /// implicitly).
    pub fn public(mut self) -> Self {
        self.require_login = false;
        self
    }

    /// Run on the worker pool; ordering against other protocols of the
    /// same session is then not guaranteed.
    pub fn asynchronous(mut self) -> Self {
        self.async_mode = true;
        self
    }

    pub fn with_parser(mut self, parser: ParserFn) -> Self {
        self.parser = parser;
        self
    }
}

/// Outcome the connection loop acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    KeepOpen,
    /// Protocol-class failure: answer already sent, now drop the link.
    Close,
}

/// The registry + dispatch pipeline.
pub struct Dispatcher {
    handlers: DashMap<u16, Arc<Registration>>,
    metrics: Arc<dyn MetricsSink>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Register one handler; later registrations replace earlier ones.
    pub fn register(&self, registration: Registration) {
        self.handlers
            .insert(registration.protocol_id, Arc::new(registration));
    }

    pub fn is_registered(&self, protocol_id: u16) -> bool {
        self.handlers.contains_key(&protocol_id)
    }

    pub fn registered_count(&self) -> usize {
        self.handlers.len()
    }

    /// Run one request through the pipeline. Responses (success and error)
    /// go out through `session.send`.
    pub async fn dispatch(
        &self,
        session: Arc<Session>,
        protocol_id: u16,
        seq_id: u32,
        raw_payload: &[u8],
    ) -> DispatchOutcome {
        session.touch();

        let Some(registration) = self
            .handlers
            .get(&protocol_id)
            .map(|r| Arc::clone(r.value()))
        else {
            warn!(protocol = format_args!("{protocol_id:#06x}"), "unknown protocol");
            session.send(GameMessage::error_response(
                protocol_id,
                seq_id,
                ErrorCode::IllegalOperation,
            ));
            return DispatchOutcome::KeepOpen;
        };

        if registration.require_login
            && !session.is_authenticated()
            && !protocol::is_login_family(protocol_id)
        {
            session.send(GameMessage::error_response(
                protocol_id,
                seq_id,
                ErrorCode::TokenInvalid,
            ));
            return DispatchOutcome::KeepOpen;
        }

        let payload = match (registration.parser)(raw_payload) {
            Ok(payload) => payload,
            Err(reason) => {
                warn!(
                    protocol = format_args!("{protocol_id:#06x}"),
                    %reason,
                    "payload parse failed"
                );
                session.send(GameMessage::error_response(
                    protocol_id,
                    seq_id,
                    ErrorCode::ParseError,
                ));
                // Protocol-class error: the connection goes away.
                return DispatchOutcome::Close;
            }
        };

        let mut trace = TraceContext::new();
        if let Some(bound) = session.role() {
            trace = trace.with_role(bound.role_id);
        }

        if registration.async_mode {
            let metrics = Arc::clone(&self.metrics);
            tokio::spawn(async move {
                let work = Self::invoke(&registration, session, protocol_id, seq_id, payload, metrics);
                trace.scope(work).await;
            });
            DispatchOutcome::KeepOpen
        } else {
            let work = Self::invoke(
                &registration,
                session,
                protocol_id,
                seq_id,
                payload,
                Arc::clone(&self.metrics),
            );
            trace.scope(work).await;
            DispatchOutcome::KeepOpen
        }
    }

    async fn invoke(
        registration: &Registration,
        session: Arc<Session>,
        protocol_id: u16,
        seq_id: u32,
        payload: Value,
        metrics: Arc<dyn MetricsSink>,
    ) {
        let started = Instant::now();
        let result = registration
            .handler
            .handle(Arc::clone(&session), payload)
            .await;
        let elapsed = started.elapsed();
        metrics.observe_millis("dispatch.latency", elapsed.as_millis() as u64);
        if elapsed > SLOW_HANDLER_THRESHOLD {
            metrics.incr(keys::DISPATCH_SLOW);
            warn!(
                protocol = format_args!("{protocol_id:#06x}"),
                description = %registration.description,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow handler"
            );
        }

        let response = match result {
            Ok(value) => {
                let payload = match value {
                    Value::Null => Vec::new(),
                    other => other.to_string().into_bytes(),
                };
                GameMessage::ok_response(protocol_id, seq_id, payload)
            }
            Err(business) => {
                metrics.incr(keys::DISPATCH_ERROR);
                if business.code == ErrorCode::SystemError {
                    error!(
                        protocol = format_args!("{protocol_id:#06x}"),
                        error = %business,
                        "handler system error"
                    );
                }
                let body = serde_json::json!({
                    "code": business.code.as_u16(),
                    "message": business.message,
                });
                GameMessage::Response {
                    protocol_id,
                    seq_id,
                    error_code: business.code,
                    payload: body.to_string().into_bytes(),
                }
            }
        };
        session.send(response);
    }
}
