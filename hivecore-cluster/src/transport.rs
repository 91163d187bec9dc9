//! Remote actor transport: `tell`/`ask` across nodes.
//!
//! Wire format: length-delimited frames carrying JSON request/response
//! envelopes. The server side delivers into the local
//! [`ActorSystemRegistry`]; the client side picks a target node per its
//! load-balancing policy, short-circuiting calls whose owner is this node
//! straight into the local registry. A mock provider stands in wherever no
//! remote endpoint has been discovered, so dependencies are never null at
//! bootstrap.

// Layer 1: Standard library
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

// Layer 3: Internal
use crate::error::ClusterError;
use crate::ring::HashRing;
use hivecore_rt::registry::ActorSystemRegistry;
use hivecore_shared::error::ErrorCode;
use hivecore_shared::ids::NodeId;
use hivecore_shared::metrics::{keys, MetricsSink, NoopMetrics};
use hivecore_shared::trace::TraceContext;

/// Default RPC timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// How a call picks its target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancePolicy {
    /// Route by entity id over the ring; the default for per-entity calls.
    ConsistentHash,
    /// Rotate over the nodes hosting the system; for stateless services.
    RoundRobin,
    /// Invoke on every node hosting the system, aggregating numeric
    /// returns.
    Broadcast,
}

/// Per-call options.
#[derive(Debug, Clone, Copy)]
pub struct RpcOptions {
    pub timeout: Duration,
    /// Extra attempts on transient failure. Keep 0 for mutating calls;
    /// read-only callers may set 1.
    pub retries: u32,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RPC_TIMEOUT,
            retries: 0,
        }
    }
}

/// The cross-node actor contract.
#[async_trait]
pub trait RemoteActor: Send + Sync + 'static {
    async fn tell(
        &self,
        system: &str,
        actor_id: &str,
        message_type: &str,
        payload: Value,
    ) -> Result<bool, ClusterError>;

    async fn ask(
        &self,
        system: &str,
        actor_id: &str,
        message_type: &str,
        payload: Value,
        ask_timeout: Duration,
    ) -> Result<Value, ClusterError>;

    async fn has_actor(&self, system: &str, actor_id: &str) -> Result<bool, ClusterError>;

    /// Tell many actors of one system; returns how many enqueues succeeded.
    async fn batch_tell(
        &self,
        system: &str,
        actor_ids: &[String],
        message_type: &str,
        payload: Value,
    ) -> Result<u64, ClusterError>;

    async fn list_systems(&self) -> Result<Vec<String>, ClusterError>;
}

/// Stand-in provider answering `ServiceUnavailable` until discovery finds
/// a real endpoint.
#[derive(Debug, Clone)]
pub struct MockRemoteActor {
    service: String,
}

impl MockRemoteActor {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn unavailable(&self) -> ClusterError {
        ClusterError::ServiceUnavailable {
            service: self.service.clone(),
        }
    }
}

#[async_trait]
impl RemoteActor for MockRemoteActor {
    async fn tell(
        &self,
        _system: &str,
        _actor_id: &str,
        _message_type: &str,
        _payload: Value,
    ) -> Result<bool, ClusterError> {
        Err(self.unavailable())
    }

    async fn ask(
        &self,
        _system: &str,
        _actor_id: &str,
        _message_type: &str,
        _payload: Value,
        _ask_timeout: Duration,
    ) -> Result<Value, ClusterError> {
        Err(self.unavailable())
    }

    async fn has_actor(&self, _system: &str, _actor_id: &str) -> Result<bool, ClusterError> {
        Err(self.unavailable())
    }

    async fn batch_tell(
        &self,
        _system: &str,
        _actor_ids: &[String],
        _message_type: &str,
        _payload: Value,
    ) -> Result<u64, ClusterError> {
        Err(self.unavailable())
    }

    async fn list_systems(&self) -> Result<Vec<String>, ClusterError> {
        Err(self.unavailable())
    }
}

// ---------------------------------------------------------------------------
// Wire envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct RpcRequest {
    id: u64,
    trace: Option<TraceContext>,
    call: RpcCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum RpcCall {
    Tell {
        system: String,
        actor_id: String,
        message_type: String,
        payload: Value,
    },
    Ask {
        system: String,
        actor_id: String,
        message_type: String,
        payload: Value,
        timeout_ms: u64,
    },
    HasActor {
        system: String,
        actor_id: String,
    },
    BatchTell {
        system: String,
        actor_ids: Vec<String>,
        message_type: String,
        payload: Value,
    },
    ListSystems,
}

#[derive(Debug, Serialize, Deserialize)]
struct RpcError {
    code: u16,
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RpcResponse {
    id: u64,
    ok: Option<Value>,
    error: Option<RpcError>,
}

impl RpcResponse {
    fn success(id: u64, value: Value) -> Self {
        Self {
            id,
            ok: Some(value),
            error: None,
        }
    }

    fn failure(id: u64, code: ErrorCode, message: String) -> Self {
        Self {
            id,
            ok: None,
            error: Some(RpcError {
                code: code.as_u16(),
                message,
            }),
        }
    }

    fn into_result(self) -> Result<Value, ClusterError> {
        match (self.ok, self.error) {
            (Some(value), _) => Ok(value),
            (None, Some(err)) => Err(ClusterError::Remote {
                code: ErrorCode::from_u16(err.code),
                message: err.message,
            }),
            (None, None) => Ok(Value::Null),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// TCP server delivering remote calls into the local registry.
pub struct RpcServer {
    local_addr: std::net::SocketAddr,
    accept_task: JoinHandle<()>,
}

impl RpcServer {
    pub async fn bind(
        addr: &str,
        registry: Arc<ActorSystemRegistry>,
    ) -> Result<Self, ClusterError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "rpc connection accepted");
                        let registry = Arc::clone(&registry);
                        tokio::spawn(async move {
                            Self::serve_connection(stream, registry).await;
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "rpc accept failed");
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

    pub fn shutdown(&self) {
        self.accept_task.abort();
    }

    async fn serve_connection(stream: TcpStream, registry: Arc<ActorSystemRegistry>) {
        let framed = Framed::new(stream, LengthDelimitedCodec::new());
        let (mut sink, mut source) = framed.split();
        let (response_tx, mut response_rx) = mpsc::channel::<RpcResponse>(256);

        let writer = tokio::spawn(async move {
            while let Some(response) = response_rx.recv().await {
                let Ok(encoded) = serde_json::to_vec(&response) else {
                    continue;
                };
                if sink.send(encoded.into()).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = source.next().await {
            let Ok(frame) = frame else { break };
            let request: RpcRequest = match serde_json::from_slice(&frame) {
                Ok(request) => request,
                Err(err) => {
                    warn!(error = %err, "dropping undecodable rpc frame");
                    continue;
                }
            };
            // Each request executes concurrently; asks must not head-of-line
            // block the connection.
            let registry = Arc::clone(&registry);
            let response_tx = response_tx.clone();
            tokio::spawn(async move {
                let trace = request.trace.clone();
                let work = Self::execute(registry, request);
                let response = match trace {
                    Some(trace) => trace.scope(work).await,
                    None => work.await,
                };
                let _ = response_tx.send(response).await;
            });
        }
        writer.abort();
    }

    async fn execute(registry: Arc<ActorSystemRegistry>, request: RpcRequest) -> RpcResponse {
        let id = request.id;
        match request.call {
            RpcCall::Tell {
                system,
                actor_id,
                message_type,
                payload,
            } => match registry.get(&system) {
                Some(handle) => {
                    let accepted = handle.tell_json(&actor_id, &message_type, payload).await;
                    RpcResponse::success(id, Value::Bool(accepted))
                }
                None => RpcResponse::failure(
                    id,
                    ErrorCode::ServiceUnavailable,
                    format!("unknown actor system {system}"),
                ),
            },
            RpcCall::Ask {
                system,
                actor_id,
                message_type,
                payload,
                timeout_ms,
            } => match registry.get(&system) {
                Some(handle) => {
                    let wait = Duration::from_millis(timeout_ms);
                    match handle.ask_json(&actor_id, &message_type, payload, wait).await {
                        Ok(value) => RpcResponse::success(id, value),
                        Err(err) => RpcResponse::failure(id, err.error_code(), err.to_string()),
                    }
                }
                None => RpcResponse::failure(
                    id,
                    ErrorCode::ServiceUnavailable,
                    format!("unknown actor system {system}"),
                ),
            },
            RpcCall::HasActor { system, actor_id } => match registry.get(&system) {
                Some(handle) => {
                    RpcResponse::success(id, Value::Bool(handle.has_actor(&actor_id)))
                }
                None => RpcResponse::success(id, Value::Bool(false)),
            },
            RpcCall::BatchTell {
                system,
                actor_ids,
                message_type,
                payload,
            } => match registry.get(&system) {
                Some(handle) => {
                    let mut accepted = 0u64;
                    for actor_id in &actor_ids {
                        if handle
                            .tell_json(actor_id, &message_type, payload.clone())
                            .await
                        {
                            accepted += 1;
                        }
                    }
                    RpcResponse::success(id, Value::from(accepted))
                }
                None => RpcResponse::failure(
                    id,
                    ErrorCode::ServiceUnavailable,
                    format!("unknown actor system {system}"),
                ),
            },
            RpcCall::ListSystems => {
                let names = registry.names();
                RpcResponse::success(id, Value::from(names))
            }
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct PeerConn {
    frame_tx: mpsc::Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

/// One multiplexed connection to a peer node, lazily established.
struct PeerClient {
    peer: NodeId,
    conn: tokio::sync::Mutex<Option<PeerConn>>,
    pending: Arc<DashMap<u64, oneshot::Sender<RpcResponse>>>,
    next_id: AtomicU64,
}

impl PeerClient {
    fn new(peer: NodeId) -> Self {
        Self {
            peer,
            conn: tokio::sync::Mutex::new(None),
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, call: RpcCall, wait: Duration) -> Result<RpcResponse, ClusterError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            id,
            trace: TraceContext::current(),
            call,
        };
        let encoded = serde_json::to_vec(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let sent = {
            let mut conn = self.conn.lock().await;
            if conn.as_ref().map(|c| c.closed.load(Ordering::SeqCst)) != Some(false) {
                match self.connect().await {
                    Ok(fresh) => *conn = Some(fresh),
                    Err(err) => {
                        self.pending.remove(&id);
                        return Err(err);
                    }
                }
            }
            match conn.as_ref() {
                Some(active) => active.frame_tx.send(encoded).await.is_ok(),
                None => false,
            }
        };
        if !sent {
            self.pending.remove(&id);
            return Err(ClusterError::ConnectionLost {
                peer: self.peer.to_string(),
            });
        }

        match timeout(wait, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClusterError::ConnectionLost {
                peer: self.peer.to_string(),
            }),
            Err(_) => {
                self.pending.remove(&id);
                Err(ClusterError::RpcTimeout { timeout: wait })
            }
        }
    }

    async fn connect(&self) -> Result<PeerConn, ClusterError> {
        let stream = TcpStream::connect(self.peer.as_str()).await?;
        let framed = Framed::new(stream, LengthDelimitedCodec::new());
        let (mut sink, mut source) = framed.split();
        let closed = Arc::new(AtomicBool::new(false));
        let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(256);

        let writer_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if sink.send(frame.into()).await.is_err() {
                    break;
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
        });

        let reader_closed = Arc::clone(&closed);
        let pending = Arc::clone(&self.pending);
        let peer = self.peer.clone();
        tokio::spawn(async move {
            while let Some(Ok(frame)) = source.next().await {
                let response: RpcResponse = match serde_json::from_slice(&frame) {
                    Ok(response) => response,
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable rpc response");
                        continue;
                    }
                };
                if let Some((_, slot)) = pending.remove(&response.id) {
                    let _ = slot.send(response);
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            debug!(peer = %peer, "rpc connection closed");
        });

        Ok(PeerConn { frame_tx, closed })
    }
}

/// Ring-routed client implementing the [`RemoteActor`] contract.
pub struct RemoteActorClient {
    self_node: NodeId,
    registry: Arc<ActorSystemRegistry>,
    ring: Arc<HashRing>,
    peers: DashMap<NodeId, Arc<PeerClient>>,
    policy: LoadBalancePolicy,
    options: RpcOptions,
    metrics: Arc<dyn MetricsSink>,
    round_robin: AtomicU64,
}

impl RemoteActorClient {
    pub fn new(
        self_node: NodeId,
        registry: Arc<ActorSystemRegistry>,
        ring: Arc<HashRing>,
    ) -> Self {
        Self {
            self_node,
            registry,
            ring,
            peers: DashMap::new(),
            policy: LoadBalancePolicy::ConsistentHash,
            options: RpcOptions::default(),
            metrics: Arc::new(NoopMetrics),
            round_robin: AtomicU64::new(rand::thread_rng().gen()),
        }
    }

    pub fn with_policy(mut self, policy: LoadBalancePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_options(mut self, options: RpcOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    fn peer(&self, node: &NodeId) -> Arc<PeerClient> {
        self.peers
            .entry(node.clone())
            .or_insert_with(|| Arc::new(PeerClient::new(node.clone())))
            .clone()
    }

    fn pick_node(&self, system: &str, actor_id: &str) -> Result<NodeId, ClusterError> {
        match self.policy {
            LoadBalancePolicy::ConsistentHash | LoadBalancePolicy::Broadcast => self
                .ring
                .route_for_system(system, actor_id)
                .ok_or_else(|| ClusterError::NoNodes {
                    system: system.to_string(),
                }),
            LoadBalancePolicy::RoundRobin => {
                let nodes = self.ring.nodes_for_system(system);
                if nodes.is_empty() {
                    return Err(ClusterError::NoNodes {
                        system: system.to_string(),
                    });
                }
                let index = self.round_robin.fetch_add(1, Ordering::Relaxed) as usize;
                Ok(nodes[index % nodes.len()].clone())
            }
        }
    }

    async fn call_node(
        &self,
        node: &NodeId,
        call: RpcCall,
        wait: Duration,
    ) -> Result<Value, ClusterError> {
        if *node == self.self_node {
            // Local owner: skip the wire entirely.
            let request = RpcRequest {
                id: 0,
                trace: TraceContext::current(),
                call,
            };
            return RpcServer::execute(Arc::clone(&self.registry), request)
                .await
                .into_result();
        }
        let mut attempts = self.options.retries + 1;
        loop {
            let result = self.peer(node).call(call.clone(), wait).await;
            match result {
                Ok(response) => return response.into_result(),
                Err(err) => {
                    attempts -= 1;
                    if attempts == 0 || !err.is_transient() {
                        self.metrics.incr(keys::RPC_FAILURE);
                        return Err(err);
                    }
                    debug!(peer = %node, error = %err, "transient rpc failure, retrying");
                }
            }
        }
    }

    fn broadcast_targets(&self, system: &str) -> Result<Vec<NodeId>, ClusterError> {
        let nodes = self.ring.nodes_for_system(system);
        if nodes.is_empty() {
            return Err(ClusterError::NoNodes {
                system: system.to_string(),
            });
        }
        Ok(nodes)
    }
}

#[async_trait]
impl RemoteActor for RemoteActorClient {
    async fn tell(
        &self,
        system: &str,
        actor_id: &str,
        message_type: &str,
        payload: Value,
    ) -> Result<bool, ClusterError> {
        let call = RpcCall::Tell {
            system: system.to_string(),
            actor_id: actor_id.to_string(),
            message_type: message_type.to_string(),
            payload,
        };
        let node = self.pick_node(system, actor_id)?;
        let value = self.call_node(&node, call, self.options.timeout).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn ask(
        &self,
        system: &str,
        actor_id: &str,
        message_type: &str,
        payload: Value,
        ask_timeout: Duration,
    ) -> Result<Value, ClusterError> {
        if self.policy == LoadBalancePolicy::Broadcast {
            // Aggregate numeric returns over every hosting node.
            let mut total = 0f64;
            let mut saw_number = false;
            let mut last = Value::Null;
            for node in self.broadcast_targets(system)? {
                let call = RpcCall::Ask {
                    system: system.to_string(),
                    actor_id: actor_id.to_string(),
                    message_type: message_type.to_string(),
                    payload: payload.clone(),
                    timeout_ms: ask_timeout.as_millis() as u64,
                };
                let value = self
                    .call_node(&node, call, ask_timeout + self.options.timeout)
                    .await?;
                if let Some(n) = value.as_f64() {
                    total += n;
                    saw_number = true;
                }
                last = value;
            }
            return Ok(if saw_number {
                serde_json::json!(total)
            } else {
                last
            });
        }
        let call = RpcCall::Ask {
            system: system.to_string(),
            actor_id: actor_id.to_string(),
            message_type: message_type.to_string(),
            payload,
            timeout_ms: ask_timeout.as_millis() as u64,
        };
        let node = self.pick_node(system, actor_id)?;
        // The wire wait covers the remote handler plus transit slack.
        self.call_node(&node, call, ask_timeout + self.options.timeout)
            .await
    }

    async fn has_actor(&self, system: &str, actor_id: &str) -> Result<bool, ClusterError> {
        let call = RpcCall::HasActor {
            system: system.to_string(),
            actor_id: actor_id.to_string(),
        };
        let node = self
            .ring
            .route_for_system(system, actor_id)
            .ok_or_else(|| ClusterError::NoNodes {
                system: system.to_string(),
            })?;
        let value = self.call_node(&node, call, self.options.timeout).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn batch_tell(
        &self,
        system: &str,
        actor_ids: &[String],
        message_type: &str,
        payload: Value,
    ) -> Result<u64, ClusterError> {
        // Group ids by their ring owner; one call per owning node.
        let mut by_node: std::collections::HashMap<NodeId, Vec<String>> =
            std::collections::HashMap::new();
        for actor_id in actor_ids {
            let node = self
                .ring
                .route_for_system(system, actor_id)
                .ok_or_else(|| ClusterError::NoNodes {
                    system: system.to_string(),
                })?;
            by_node.entry(node).or_default().push(actor_id.clone());
        }
        let mut accepted = 0u64;
        for (node, ids) in by_node {
            let call = RpcCall::BatchTell {
                system: system.to_string(),
                actor_ids: ids,
                message_type: message_type.to_string(),
                payload: payload.clone(),
            };
            let value = self.call_node(&node, call, self.options.timeout).await?;
            accepted += value.as_u64().unwrap_or(0);
        }
        Ok(accepted)
    }

    async fn list_systems(&self) -> Result<Vec<String>, ClusterError> {
        let mut names: std::collections::BTreeSet<String> =
            self.registry.names().into_iter().collect();
        for node in self.ring.nodes() {
            names.extend(node.systems.iter().cloned());
        }
        Ok(names.into_iter().collect())
    }
}
