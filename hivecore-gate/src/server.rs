//! The front-door TCP server: framed connections, session lifecycle,
//! dispatch.
//!
//! Each accepted socket gets a provisional session and a write task. The
//! read loop decodes frames and hands requests to the dispatcher; sync
//! handlers finish before the next frame of the same connection is read,
//! which is the per-session ordering guarantee. Reconnection is resolved
//! here, before dispatch, because it swaps which session the connection
//! belongs to. Protocol-class failures (frame overflow, malformed frames,
//! parse errors) drop the connection; the session survives into its grace
//! window for reconnection.

// Layer 1: Standard library
use std::sync::Arc;

// Layer 2: Third-party
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// Layer 3: Internal
use crate::codec::{CodecError, GameCodec, GameMessage};
use crate::dispatcher::{DispatchOutcome, Dispatcher, FnHandler, Registration};
use crate::protocol;
use crate::session::{Session, SessionRegistry};
use hivecore_shared::config::GatewayConfig;
use hivecore_shared::error::{BusinessError, ErrorCode};
use hivecore_shared::validate::require_str;

/// Outbound queue depth per connection.
const OUTBOUND_BUFFER: usize = 256;

/// Gate-level failures.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("gateway i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// The listening gateway.
pub struct GateServer {
    local_addr: std::net::SocketAddr,
    accept_task: JoinHandle<()>,
}

impl GateServer {
    /// Bind and start accepting. Registers the built-in login-family
    /// handlers (handshake, heartbeat) on the dispatcher.
    pub async fn bind(
        addr: &str,
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<Dispatcher>,
        config: &GatewayConfig,
    ) -> Result<Self, GateError> {
        register_builtin_handlers(&dispatcher);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let max_frame_length = config.max_frame_length;
        info!(%local_addr, "gateway listening");

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        let registry = Arc::clone(&registry);
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(async move {
                            serve_connection(stream, registry, dispatcher, max_frame_length)
                                .await;
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections; established ones drain naturally.
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for GateServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Install handshake and heartbeat. Login and enter-game are business
/// handlers the host registers itself.
pub fn register_builtin_handlers(dispatcher: &Dispatcher) {
    if !dispatcher.is_registered(protocol::HANDSHAKE) {
        dispatcher.register(
            Registration::new(protocol::HANDSHAKE, "handshake", FnHandler(handshake)).public(),
        );
    }
    if !dispatcher.is_registered(protocol::HEARTBEAT) {
        dispatcher.register(
            Registration::new(protocol::HEARTBEAT, "heartbeat", FnHandler(heartbeat)).public(),
        );
    }
}

async fn handshake(session: Arc<Session>, payload: Value) -> Result<Value, BusinessError> {
    for key in ["client_version", "platform", "device_id"] {
        let Some(value) = payload.get(key) else {
            continue;
        };
        if let Some(text) = value.as_str() {
            require_str(key, text, 64)
                .map_err(|err| BusinessError::new(ErrorCode::ValidationFailed, err.to_string()))?;
        }
        session.set_attribute(key, value.clone());
    }
    Ok(json!({
        "server_time": Utc::now().timestamp_millis(),
        "session_key": session.reconnect_token().as_str(),
        "need_update": false,
    }))
}

async fn heartbeat(_session: Arc<Session>, payload: Value) -> Result<Value, BusinessError> {
    Ok(json!({
        "client_time": payload.get("client_time").cloned().unwrap_or(Value::Null),
        "server_time": Utc::now().timestamp_millis(),
    }))
}

async fn serve_connection(
    stream: TcpStream,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    max_frame_length: usize,
) {
    let framed = tokio_util::codec::Framed::new(stream, GameCodec::new(max_frame_length));
    let (mut sink, mut source) = framed.split();
    let (out_tx, mut out_rx) = mpsc::channel::<GameMessage>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let (mut session, mut conn_id) = registry.create_session(out_tx.clone());

    while let Some(frame) = source.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(CodecError::FrameOverflow { declared, max }) => {
                warn!(
                    session = %session.session_id(),
                    declared,
                    max,
                    "frame overflow, closing connection"
                );
                break;
            }
            Err(err) => {
                warn!(
                    session = %session.session_id(),
                    error = %err,
                    "framing error, closing connection"
                );
                break;
            }
        };

        let GameMessage::Request {
            protocol_id,
            seq_id,
            payload,
        } = message
        else {
            // Clients only originate requests.
            warn!(session = %session.session_id(), "non-request frame from client");
            continue;
        };

        if protocol_id == protocol::RECONNECT {
            let (next_session, next_conn, outcome) = handle_reconnect(
                &registry,
                session,
                conn_id,
                seq_id,
                &payload,
                out_tx.clone(),
            );
            session = next_session;
            conn_id = next_conn;
            if outcome == DispatchOutcome::Close {
                break;
            }
            continue;
        }

        let outcome = dispatcher
            .dispatch(Arc::clone(&session), protocol_id, seq_id, &payload)
            .await;
        if outcome == DispatchOutcome::Close {
            break;
        }
    }

    registry.mark_disconnected(conn_id);
    drop(out_tx);
    let _ = writer.await;
    debug!(session = %session.session_id(), "connection closed");
}

/// Swap this connection onto the session owning the presented token.
/// Returns the session/conn pair the connection speaks for afterwards,
/// plus whether the read loop should drop the link.
fn handle_reconnect(
    registry: &Arc<SessionRegistry>,
    current: Arc<Session>,
    current_conn: u64,
    seq_id: u32,
    payload: &[u8],
    sender: mpsc::Sender<GameMessage>,
) -> (Arc<Session>, u64, DispatchOutcome) {
    let token = serde_json::from_slice::<Value>(payload)
        .ok()
        .and_then(|v| v.get("session_key").and_then(|k| k.as_str()).map(String::from));

    let Some(token) = token else {
        current.send(GameMessage::error_response(
            protocol::RECONNECT,
            seq_id,
            ErrorCode::ParseError,
        ));
        // Protocol-class error: the connection goes away.
        return (current, current_conn, DispatchOutcome::Close);
    };

    match registry.try_reconnect(&token, sender) {
        Some((resumed, new_conn)) => {
            // The provisional session this connection started with is
            // superseded; drop it entirely.
            registry.purge(&current);
            resumed.send(GameMessage::ok_response(
                protocol::RECONNECT,
                seq_id,
                json!({ "session_id": resumed.session_id().as_u64() })
                    .to_string()
                    .into_bytes(),
            ));
            (resumed, new_conn, DispatchOutcome::KeepOpen)
        }
        None => {
            // Authorization-class failure: respond, keep the connection so
            // the client can fall back to a fresh login.
            current.send(GameMessage::error_response(
                protocol::RECONNECT,
                seq_id,
                ErrorCode::TokenInvalid,
            ));
            (current, current_conn, DispatchOutcome::KeepOpen)
        }
    }
}
