//! Session registry: live connections, reconnect tokens, pending queues.
//!
//! A session outlives its connection: on disconnect it is retained for the
//! grace period, buffering outbound messages, and a reconnect carrying the
//! session's token rebinds a fresh connection and flushes the buffer in
//! enqueue order. Exactly one session is live per role at any time; a
//! second successful login evicts the older session with a KICK push.

// Layer 1: Standard library
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// Layer 3: Internal
use crate::codec::GameMessage;
use crate::protocol;
use hivecore_shared::config::SessionConfig;
use hivecore_shared::ids::{ReconnectToken, RoleId, SessionId, SessionIdGenerator};
use hivecore_shared::metrics::{keys, MetricsSink, NoopMetrics};
use hivecore_sync::{CoreEvent, LocalEventBus};

/// Cap on buffered messages per disconnected session.
pub const PENDING_QUEUE_LIMIT: usize = 10_000;

/// Default cadence of the expiry sweeper.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound half of a connection: the write task's queue.
#[derive(Clone)]
pub struct ConnHandle {
    pub conn_id: u64,
    pub sender: mpsc::Sender<GameMessage>,
}

/// The role identity bound after login + enter-game.
#[derive(Debug, Clone)]
pub struct BoundRole {
    pub role_id: RoleId,
    pub role_name: String,
}

/// One client session.
pub struct Session {
    session_id: SessionId,
    reconnect_token: ReconnectToken,
    conn: RwLock<Option<ConnHandle>>,
    role: RwLock<Option<BoundRole>>,
    account_id: AtomicU64,
    server_id: AtomicU32,
    attributes: Mutex<HashMap<String, Value>>,
    pending: Mutex<VecDeque<GameMessage>>,
    seq: AtomicU32,
    last_active_ms: AtomicI64,
    /// 0 while live.
    disconnect_at_ms: AtomicI64,
    metrics: Arc<dyn MetricsSink>,
}

impl Session {
    fn new(
        session_id: SessionId,
        conn: ConnHandle,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            session_id,
            reconnect_token: ReconnectToken::generate(),
            conn: RwLock::new(Some(conn)),
            role: RwLock::new(None),
            account_id: AtomicU64::new(0),
            server_id: AtomicU32::new(0),
            attributes: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            seq: AtomicU32::new(0),
            last_active_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            disconnect_at_ms: AtomicI64::new(0),
            metrics,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn reconnect_token(&self) -> &ReconnectToken {
        &self.reconnect_token
    }

    pub fn role(&self) -> Option<BoundRole> {
        self.role.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.account_id.load(Ordering::Acquire) != 0
    }

    /// Set by the host's login handler once the account checks out.
    pub fn set_account(&self, account_id: u64, server_id: u32) {
        self.account_id.store(account_id, Ordering::Release);
        self.server_id.store(server_id, Ordering::Release);
    }

    pub fn account_id(&self) -> Option<u64> {
        match self.account_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn server_id(&self) -> u32 {
        self.server_id.load(Ordering::Acquire)
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: Value) {
        self.attributes.lock().insert(key.into(), value);
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes.lock().get(key).cloned()
    }

    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn touch(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.conn.read().is_some()
    }

    fn conn_id(&self) -> Option<u64> {
        self.conn.read().as_ref().map(|c| c.conn_id)
    }

    /// Deliver now if connected, otherwise buffer for the reconnect.
    ///
    /// Buffering is bounded: past the cap the oldest entry is dropped with
    /// a warn and a metric tick.
    pub fn send(&self, message: GameMessage) {
        let sender = self.conn.read().as_ref().map(|c| c.sender.clone());
        match sender {
            Some(sender) => {
                if let Err(err) = sender.try_send(message) {
                    match err {
                        mpsc::error::TrySendError::Full(message) => {
                            warn!(
                                session = %self.session_id,
                                "outbound queue full, buffering to pending"
                            );
                            self.buffer(message);
                        }
                        mpsc::error::TrySendError::Closed(message) => self.buffer(message),
                    }
                }
            }
            None => self.buffer(message),
        }
    }

    fn buffer(&self, message: GameMessage) {
        let mut pending = self.pending.lock();
        if pending.len() >= PENDING_QUEUE_LIMIT {
            pending.pop_front();
            self.metrics.incr(keys::SESSION_PENDING_DROPPED);
            warn!(
                session = %self.session_id,
                "pending queue full, dropped oldest message"
            );
        }
        pending.push_back(message);
    }

    fn detach_conn(&self) {
        *self.conn.write() = None;
        self.disconnect_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    fn attach_conn(&self, conn: ConnHandle) {
        *self.conn.write() = Some(conn);
        self.disconnect_at_ms.store(0, Ordering::SeqCst);
        self.touch();
    }

    /// Flush the pending queue into the live connection, enqueue order.
    fn flush_pending(&self) {
        let sender = self.conn.read().as_ref().map(|c| c.sender.clone());
        let Some(sender) = sender else { return };
        let mut pending = self.pending.lock();
        while let Some(message) = pending.pop_front() {
            if let Err(mpsc::error::TrySendError::Full(message)) = sender.try_send(message) {
                pending.push_front(message);
                break;
            }
        }
    }

    fn disconnected_since_ms(&self) -> Option<i64> {
        match self.disconnect_at_ms.load(Ordering::SeqCst) {
            0 => None,
            at => Some(at),
        }
    }
}

/// Registry of every session on this node.
pub struct SessionRegistry {
    sessions: DashMap<u64, Arc<Session>>,
    by_conn: DashMap<u64, u64>,
    by_role: DashMap<RoleId, u64>,
    by_token: DashMap<String, u64>,
    id_gen: SessionIdGenerator,
    conn_gen: AtomicU64,
    grace: Duration,
    metrics: Arc<dyn MetricsSink>,
    events: Option<Arc<LocalEventBus>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(config: &SessionConfig, node_index: u16) -> Self {
        Self {
            sessions: DashMap::new(),
            by_conn: DashMap::new(),
            by_role: DashMap::new(),
            by_token: DashMap::new(),
            id_gen: SessionIdGenerator::new(node_index),
            conn_gen: AtomicU64::new(0),
            grace: config.reconnect_grace(),
            metrics: Arc::new(NoopMetrics),
            events: None,
            sweeper: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Publish `PlayerOnline`/`PlayerOffline` on role bind/unbind.
    pub fn with_events(mut self, events: Arc<LocalEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Register a fresh connection; returns the session and its conn id.
    pub fn create_session(
        &self,
        sender: mpsc::Sender<GameMessage>,
    ) -> (Arc<Session>, u64) {
        let conn_id = self.conn_gen.fetch_add(1, Ordering::Relaxed) + 1;
        let session_id = self.id_gen.next_id();
        let session = Arc::new(Session::new(
            session_id,
            ConnHandle { conn_id, sender },
            Arc::clone(&self.metrics),
        ));
        self.sessions.insert(session_id.as_u64(), Arc::clone(&session));
        self.by_conn.insert(conn_id, session_id.as_u64());
        self.by_token
            .insert(session.reconnect_token.as_str().to_string(), session_id.as_u64());
        debug!(session = %session_id, conn = conn_id, "session created");
        (session, conn_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn lookup(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.sessions
            .get(&session_id.as_u64())
            .map(|s| Arc::clone(s.value()))
    }

    pub fn lookup_by_role(&self, role_id: RoleId) -> Option<Arc<Session>> {
        let session_id = *self.by_role.get(&role_id)?;
        self.sessions.get(&session_id).map(|s| Arc::clone(s.value()))
    }

    pub fn lookup_by_channel(&self, conn_id: u64) -> Option<Arc<Session>> {
        let session_id = *self.by_conn.get(&conn_id)?;
        self.sessions.get(&session_id).map(|s| Arc::clone(s.value()))
    }

    /// Bind an authenticated role to a session. A role already live on
    /// another session evicts it: the older session gets a KICK push and
    /// is closed.
    pub fn bind_role(&self, session: &Arc<Session>, role_id: RoleId, role_name: &str) {
        let new_id = session.session_id.as_u64();
        if let Some(old_id) = self.by_role.insert(role_id, new_id) {
            if old_id != new_id {
                if let Some(older) = self.sessions.get(&old_id).map(|s| Arc::clone(s.value())) {
                    info!(
                        role = %role_id,
                        old_session = old_id,
                        new_session = new_id,
                        "duplicate login, kicking older session"
                    );
                    self.metrics.incr(keys::SESSION_KICKED);
                    older.send(GameMessage::push(
                        protocol::PUSH_KICK,
                        br#"{"reason":"duplicate_login"}"#.to_vec(),
                    ));
                    *older.role.write() = None;
                    self.purge(&older);
                }
            }
        }
        *session.role.write() = Some(BoundRole {
            role_id,
            role_name: role_name.to_string(),
        });
        if let Some(events) = &self.events {
            events.publish(&CoreEvent::PlayerOnline {
                role_id,
                server_id: session.server_id(),
            });
        }
    }

    pub fn unbind_role(&self, session: &Arc<Session>) {
        let bound = session.role.write().take();
        if let Some(bound) = bound {
            self.by_role
                .remove_if(&bound.role_id, |_, id| *id == session.session_id.as_u64());
            if let Some(events) = &self.events {
                events.publish(&CoreEvent::PlayerOffline {
                    role_id: bound.role_id,
                    server_id: session.server_id(),
                });
            }
        }
    }

    /// The connection dropped: start the grace clock, keep the session.
    pub fn mark_disconnected(&self, conn_id: u64) -> Option<Arc<Session>> {
        let session_id = self.by_conn.remove(&conn_id).map(|(_, id)| id)?;
        let session = self.sessions.get(&session_id).map(|s| Arc::clone(s.value()))?;
        // Only detach if this conn is still the session's current one (a
        // reconnect may already have attached a newer conn).
        if session.conn_id() == Some(conn_id) {
            session.detach_conn();
            debug!(session = %session.session_id, conn = conn_id, "session disconnected");
        }
        Some(session)
    }

    /// Resume a session inside the grace window; flushes the pending queue
    /// into the new connection before returning.
    pub fn try_reconnect(
        &self,
        token: &str,
        sender: mpsc::Sender<GameMessage>,
    ) -> Option<(Arc<Session>, u64)> {
        let session_id = *self.by_token.get(token)?;
        let session = self.sessions.get(&session_id).map(|s| Arc::clone(s.value()))?;

        let disconnected_at = session.disconnected_since_ms()?;
        let grace_ms = self.grace.as_millis() as i64;
        if Utc::now().timestamp_millis() - disconnected_at >= grace_ms {
            return None;
        }

        let conn_id = self.conn_gen.fetch_add(1, Ordering::Relaxed) + 1;
        session.attach_conn(ConnHandle {
            conn_id,
            sender,
        });
        self.by_conn.insert(conn_id, session_id);
        session.flush_pending();
        info!(session = %session.session_id, conn = conn_id, "session reconnected");
        Some((session, conn_id))
    }

    /// Drop a session entirely: indexes, pending queue, everything.
    pub fn purge(&self, session: &Arc<Session>) {
        let session_id = session.session_id.as_u64();
        self.sessions.remove(&session_id);
        self.by_token.remove(session.reconnect_token.as_str());
        if let Some(conn_id) = session.conn_id() {
            self.by_conn.remove(&conn_id);
        }
        let bound = session.role.write().take();
        if let Some(bound) = bound {
            self.by_role
                .remove_if(&bound.role_id, |_, id| *id == session_id);
            if let Some(events) = &self.events {
                events.publish(&CoreEvent::PlayerOffline {
                    role_id: bound.role_id,
                    server_id: session.server_id(),
                });
            }
        }
        session.detach_conn();
        session.pending.lock().clear();
        debug!(session = %session.session_id, "session purged");
    }

    /// Purge sessions disconnected longer than the grace period.
    pub fn sweep_expired(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let grace_ms = self.grace.as_millis() as i64;
        let expired: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .disconnected_since_ms()
                    .map(|at| now_ms - at >= grace_ms)
                    .unwrap_or(false)
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let count = expired.len();
        for session in expired {
            info!(session = %session.session_id, "disconnect grace expired, purging");
            self.purge(&session);
        }
        count
    }

    /// Run `sweep_expired` on a fixed cadence.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let registry = Arc::clone(self);
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep_expired();
            }
        }));
    }

    pub fn stop_sweeper(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }
    }
}
