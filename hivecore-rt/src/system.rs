//! The actor system: sharded, single-writer-per-entity runtime.
//!
//! Every actor is one [`ActorCell`] owned by one spawned worker task that
//! drains a bounded FIFO mailbox. At most one message is in flight per
//! actor; re-entrant sends from inside a handler land at the back of the
//! same mailbox and are processed in the same drain loop. A housekeeping
//! task per system drives idle eviction and write-behind flushing.

// Layer 1: Standard library
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

// Layer 3: Internal
use crate::cell::{ActorCell, ActorStatus};
use crate::error::{ActorError, HandlerError};
use crate::handler::HandlerSet;
use crate::message::{ActorMessage, MessageContext, SystemRef};
use crate::state::StateStore;
use hivecore_shared::config::ActorConfig;
use hivecore_shared::metrics::{keys, MetricsSink, NoopMetrics};

/// Default bounded wait before `tell` reports a full mailbox.
pub const DEFAULT_TELL_WAIT: Duration = Duration::from_millis(100);

/// Default deadline for draining a stopping actor's mailbox.
pub const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Default cadence of the per-system housekeeping scan.
pub const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

/// Default actor capacity per system.
pub const DEFAULT_MAX_ACTORS: usize = 10_000;

/// Tunables for one actor system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemOptions {
    /// Bounded mailbox capacity.
    pub mailbox_capacity: usize,
    /// Actor capacity; the least-recently-active actor is evicted when full.
    pub max_actors: usize,
    /// Idle threshold before an actor is stopped and removed.
    pub idle_timeout: Duration,
    /// Write-behind flush interval for dirty actors.
    pub save_interval: Duration,
    /// Mailbox drain budget on stop.
    pub drain_deadline: Duration,
    /// Bounded wait in `tell` when the mailbox is full.
    pub tell_wait: Duration,
    /// Housekeeping scan cadence (idle checks + flush triggers).
    pub housekeeping_interval: Duration,
}

impl Default for SystemOptions {
    fn default() -> Self {
        let actor = ActorConfig::default();
        Self {
            mailbox_capacity: actor.mailbox_max_size,
            max_actors: DEFAULT_MAX_ACTORS,
            idle_timeout: actor.idle_timeout(),
            save_interval: actor.save_interval(),
            drain_deadline: DEFAULT_DRAIN_DEADLINE,
            tell_wait: DEFAULT_TELL_WAIT,
            housekeeping_interval: DEFAULT_HOUSEKEEPING_INTERVAL,
        }
    }
}

impl SystemOptions {
    /// Derive options from the `actor.*` configuration section.
    pub fn from_config(config: &ActorConfig) -> Self {
        Self {
            mailbox_capacity: config.mailbox_max_size,
            idle_timeout: config.idle_timeout(),
            save_interval: config.save_interval(),
            ..Self::default()
        }
    }
}

/// Counters exposed per actor, mostly for tests and diagnostics.
#[derive(Debug, Clone)]
pub struct ActorStats {
    pub status: ActorStatus,
    pub handled: u64,
    /// Handler invocations currently in progress; the single-writer
    /// guarantee keeps this at most 1.
    pub processing: u32,
    /// High-water mark of `processing` over the actor's lifetime.
    pub processing_peak: u32,
}

enum Envelope {
    User(ActorMessage),
    Flush,
    Stop,
}

struct ActorMeta {
    status: AtomicU8,
    last_active_ms: AtomicI64,
    processing: AtomicU32,
    processing_peak: AtomicU32,
    handled: AtomicU64,
}

impl ActorMeta {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(ActorStatus::Init as u8),
            last_active_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            processing: AtomicU32::new(0),
            processing_peak: AtomicU32::new(0),
            handled: AtomicU64::new(0),
        }
    }

    fn status(&self) -> ActorStatus {
        ActorStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: ActorStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn touch(&self, at: DateTime<Utc>) {
        self.last_active_ms
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    fn enter_processing(&self) {
        let now = self.processing.fetch_add(1, Ordering::SeqCst) + 1;
        self.processing_peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit_processing(&self) {
        self.processing.fetch_sub(1, Ordering::SeqCst);
        self.handled.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
struct ActorHandle {
    generation: u64,
    sender: mpsc::Sender<Envelope>,
    meta: Arc<ActorMeta>,
    stopped_rx: watch::Receiver<bool>,
}

struct SystemCore<S> {
    name: String,
    options: SystemOptions,
    handlers: HandlerSet<S>,
    store: Arc<dyn StateStore<S>>,
    metrics: Arc<dyn MetricsSink>,
    actors: DashMap<String, ActorHandle>,
    generation: AtomicU64,
    shutting_down: AtomicBool,
}

/// Re-entrant system reference handed to handlers via [`MessageContext`].
struct CoreRef<S>(Arc<SystemCore<S>>);

impl<S: Send + 'static> SystemRef for CoreRef<S> {
    fn system_name(&self) -> &str {
        &self.0.name
    }

    fn tell(&self, actor_id: &str, message_type: &str, payload: Value) -> bool {
        let handle = match self.0.actors.get(actor_id) {
            Some(entry) if entry.meta.status().accepts_messages() => entry.value().clone(),
            Some(_) => return false,
            None => {
                // Creating from a sync context cannot await capacity
                // eviction; a full system rejects the re-entrant send.
                if self.0.actors.len() >= self.0.options.max_actors {
                    self.0.metrics.incr(keys::MAILBOX_REJECTED);
                    return false;
                }
                match SystemCore::spawn_actor(&self.0, actor_id) {
                    Some(handle) => handle,
                    None => return false,
                }
            }
        };
        let message = ActorMessage::tell(message_type, payload);
        handle.sender.try_send(Envelope::User(message)).is_ok()
    }
}

/// A named actor system: one mailbox-owning worker per live entity.
pub struct ActorSystem<S> {
    core: Arc<SystemCore<S>>,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Send + 'static> ActorSystem<S> {
    /// Create a system and start its housekeeping task.
    pub fn new(
        name: impl Into<String>,
        options: SystemOptions,
        handlers: HandlerSet<S>,
        store: Arc<dyn StateStore<S>>,
    ) -> Self {
        Self::with_metrics(name, options, handlers, store, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        name: impl Into<String>,
        options: SystemOptions,
        handlers: HandlerSet<S>,
        store: Arc<dyn StateStore<S>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let core = Arc::new(SystemCore {
            name: name.into(),
            options,
            handlers,
            store,
            metrics,
            actors: DashMap::new(),
            generation: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        });
        let housekeeping = tokio::spawn(Self::housekeeping_loop(Arc::clone(&core)));
        Self {
            core,
            housekeeping: Mutex::new(Some(housekeeping)),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn actor_count(&self) -> usize {
        self.core.actors.len()
    }

    /// Whether an actor is currently live; never creates one.
    pub fn has_actor(&self, actor_id: &str) -> bool {
        self.core
            .actors
            .get(actor_id)
            .map(|h| h.meta.status().accepts_messages())
            .unwrap_or(false)
    }

    pub fn actor_ids(&self) -> Vec<String> {
        self.core
            .actors
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Per-actor counters; `None` when the actor is not live.
    pub fn actor_stats(&self, actor_id: &str) -> Option<ActorStats> {
        self.core.actors.get(actor_id).map(|h| ActorStats {
            status: h.meta.status(),
            handled: h.meta.handled.load(Ordering::Relaxed),
            processing: h.meta.processing.load(Ordering::SeqCst),
            processing_peak: h.meta.processing_peak.load(Ordering::SeqCst),
        })
    }

    /// Create the actor if absent (evicting the least-recently-active one
    /// when at capacity) and leave it running.
    pub async fn ensure_actor(&self, actor_id: &str) -> Result<(), ActorError> {
        self.live_handle(actor_id).await.map(|_| ())
    }

    /// Enqueue a message; `false` when the mailbox stayed full past the
    /// configured wait or the actor is not accepting messages.
    pub async fn tell(&self, actor_id: &str, message_type: &str, payload: Value) -> bool {
        let Ok(handle) = self.live_handle(actor_id).await else {
            return false;
        };
        let envelope = Envelope::User(ActorMessage::tell(message_type, payload));
        match handle.sender.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                let waited =
                    timeout(self.core.options.tell_wait, handle.sender.send(envelope)).await;
                match waited {
                    Ok(Ok(())) => true,
                    _ => {
                        self.core.metrics.incr(keys::MAILBOX_REJECTED);
                        warn!(
                            system = %self.core.name,
                            actor = %actor_id,
                            "mailbox full, tell rejected"
                        );
                        false
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Enqueue a request and await its completion slot up to `wait`.
    ///
    /// A timeout does not interrupt the handler; its late result is
    /// discarded when the receiver drops.
    pub async fn ask(
        &self,
        actor_id: &str,
        message_type: &str,
        payload: Value,
        wait: Duration,
    ) -> Result<Value, ActorError> {
        let handle = self.live_handle(actor_id).await?;
        let (message, rx) = ActorMessage::ask(message_type, payload);
        let envelope = Envelope::User(message);
        match handle.sender.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                let waited =
                    timeout(self.core.options.tell_wait, handle.sender.send(envelope)).await;
                if !matches!(waited, Ok(Ok(()))) {
                    self.core.metrics.incr(keys::MAILBOX_REJECTED);
                    return Err(ActorError::MailboxFull {
                        actor_id: actor_id.to_string(),
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(ActorError::Stopped {
                    actor_id: actor_id.to_string(),
                })
            }
        }
        match timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ActorError::Stopped {
                actor_id: actor_id.to_string(),
            }),
            Err(_) => Err(ActorError::AskTimeout {
                actor_id: actor_id.to_string(),
                timeout: wait,
            }),
        }
    }

    /// Gracefully stop one actor: drain up to the deadline, flush, remove.
    /// Returns `false` when the actor was not live.
    pub async fn stop_actor(&self, actor_id: &str) -> bool {
        let Some(handle) = self.core.actors.get(actor_id).map(|h| h.value().clone()) else {
            return false;
        };
        if handle.sender.try_send(Envelope::Stop).is_err() && handle.sender.is_closed() {
            return false;
        }
        Self::await_stopped(&handle).await;
        true
    }

    /// Stop every actor and the housekeeping task. Idempotent.
    pub async fn shutdown(&self) {
        if self.core.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.housekeeping.lock().take() {
            task.abort();
        }
        let handles: Vec<(String, ActorHandle)> = self
            .core
            .actors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (_, handle) in &handles {
            let _ = handle.sender.try_send(Envelope::Stop);
        }
        for (actor_id, handle) in handles {
            Self::await_stopped(&handle).await;
            self.core
                .actors
                .remove_if(&actor_id, |_, h| h.generation == handle.generation);
        }
        info!(system = %self.core.name, "actor system shut down");
    }

    async fn await_stopped(handle: &ActorHandle) {
        let mut rx = handle.stopped_rx.clone();
        // Bounded by drain deadline plus slack so a wedged store cannot
        // hang shutdown forever.
        let budget = Duration::from_secs(10);
        let _ = timeout(budget, async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
    }

    async fn live_handle(&self, actor_id: &str) -> Result<ActorHandle, ActorError> {
        for _ in 0..8 {
            if self.core.shutting_down.load(Ordering::SeqCst) {
                return Err(ActorError::SystemDown {
                    system: self.core.name.clone(),
                });
            }
            if let Some(handle) = self.core.actors.get(actor_id).map(|h| h.value().clone()) {
                if handle.meta.status().accepts_messages() {
                    return Ok(handle);
                }
                // A stopping predecessor: wait it out, then retry so the
                // replacement never overlaps with it.
                Self::await_stopped(&handle).await;
                self.core
                    .actors
                    .remove_if(actor_id, |_, h| h.generation == handle.generation);
                continue;
            }
            self.ensure_capacity().await;
            match SystemCore::spawn_actor(&self.core, actor_id) {
                // A lost insert race can hand back a predecessor that is
                // already stopping; loop back and wait it out.
                Some(handle) if handle.meta.status().accepts_messages() => return Ok(handle),
                Some(_) | None => continue,
            }
        }
        Err(ActorError::Stopped {
            actor_id: actor_id.to_string(),
        })
    }

    /// Evict least-recently-active running actors until a slot is free.
    async fn ensure_capacity(&self) {
        while self.core.actors.len() >= self.core.options.max_actors {
            let victim = self
                .core
                .actors
                .iter()
                .filter(|entry| entry.meta.status() == ActorStatus::Running)
                .min_by_key(|entry| entry.meta.last_active_ms.load(Ordering::Relaxed))
                .map(|entry| (entry.key().clone(), entry.value().clone()));
            let Some((actor_id, handle)) = victim else {
                return;
            };
            warn!(
                system = %self.core.name,
                actor = %actor_id,
                "system at capacity, evicting least-recently-active actor"
            );
            self.core.metrics.incr(keys::ACTOR_EVICTED);
            let _ = handle.sender.try_send(Envelope::Stop);
            Self::await_stopped(&handle).await;
            self.core
                .actors
                .remove_if(&actor_id, |_, h| h.generation == handle.generation);
        }
    }

    async fn housekeeping_loop(core: Arc<SystemCore<S>>) {
        let mut ticker = tokio::time::interval(core.options.housekeeping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now_ms = Utc::now().timestamp_millis();
            let idle_ms = core.options.idle_timeout.as_millis() as i64;
            for entry in core.actors.iter() {
                if entry.meta.status() != ActorStatus::Running {
                    continue;
                }
                let idle_for = now_ms - entry.meta.last_active_ms.load(Ordering::Relaxed);
                if idle_for >= idle_ms {
                    debug!(
                        system = %core.name,
                        actor = %entry.key(),
                        idle_for_ms = idle_for,
                        "idle actor scheduled for stop"
                    );
                    let _ = entry.sender.try_send(Envelope::Stop);
                } else {
                    // The worker checks dirty + save interval itself.
                    let _ = entry.sender.try_send(Envelope::Flush);
                }
            }
        }
    }
}

impl<S> Drop for ActorSystem<S> {
    fn drop(&mut self) {
        if let Some(task) = self.housekeeping.lock().take() {
            task.abort();
        }
    }
}

impl<S: Send + 'static> SystemCore<S> {
    /// Insert and start an actor; `None` when it lost an insert race or
    /// the system is shutting down (caller retries).
    fn spawn_actor(core: &Arc<SystemCore<S>>, actor_id: &str) -> Option<ActorHandle> {
        if core.shutting_down.load(Ordering::SeqCst) {
            return None;
        }
        let (sender, receiver) = mpsc::channel(core.options.mailbox_capacity);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let generation = core.generation.fetch_add(1, Ordering::Relaxed);
        let meta = Arc::new(ActorMeta::new());
        let handle = ActorHandle {
            generation,
            sender,
            meta: Arc::clone(&meta),
            stopped_rx,
        };
        match core.actors.entry(actor_id.to_string()) {
            Entry::Occupied(existing) => return Some(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(handle.clone());
            }
        }
        let task_core = Arc::clone(core);
        let task_id = actor_id.to_string();
        tokio::spawn(async move {
            Self::run_actor(task_core, task_id, generation, receiver, meta, stopped_tx).await;
        });
        Some(handle)
    }

    /// The single worker owning one actor for its whole lifetime.
    async fn run_actor(
        core: Arc<SystemCore<S>>,
        actor_id: String,
        generation: u64,
        mut receiver: mpsc::Receiver<Envelope>,
        meta: Arc<ActorMeta>,
        stopped_tx: watch::Sender<bool>,
    ) {
        let mut cell = ActorCell::new(actor_id.clone());

        // State is loaded at most once per actor lifetime.
        match core.store.load(&actor_id).await {
            Ok(Some(state)) => cell.install_loaded(state),
            Ok(None) => {}
            Err(err) => {
                error!(
                    system = %core.name,
                    actor = %actor_id,
                    error = %err,
                    "state load failed, actor will not start"
                );
                meta.set_status(ActorStatus::Stopped);
                receiver.close();
                while let Ok(envelope) = receiver.try_recv() {
                    if let Envelope::User(message) = envelope {
                        if let Some(slot) = message.reply {
                            let _ = slot.send(Err(ActorError::LoadFailed {
                                actor_id: actor_id.clone(),
                                reason: err.to_string(),
                            }));
                        }
                    }
                }
                core.actors
                    .remove_if(&actor_id, |_, h| h.generation == generation);
                let _ = stopped_tx.send(true);
                return;
            }
        }

        if let Some(hook) = core.handlers.pre_start_hook() {
            if let Err(err) = hook.call(&mut cell).await {
                warn!(
                    system = %core.name,
                    actor = %actor_id,
                    error = %err,
                    "pre_start hook failed"
                );
            }
        }
        meta.set_status(ActorStatus::Running);
        debug!(system = %core.name, actor = %actor_id, "actor started");

        let system_ref: Arc<dyn SystemRef> = Arc::new(CoreRef(Arc::clone(&core)));

        while let Some(envelope) = receiver.recv().await {
            match envelope {
                Envelope::User(message) => {
                    Self::handle_user(&core, &mut cell, &meta, &system_ref, message).await;
                }
                Envelope::Flush => {
                    Self::flush(&core, &mut cell, false).await;
                }
                Envelope::Stop => break,
            }
        }

        meta.set_status(ActorStatus::Stopping);
        receiver.close();

        // Drain what is already queued, bounded by the drain deadline;
        // asks past the deadline fail rather than hang.
        let drain_until = tokio::time::Instant::now() + core.options.drain_deadline;
        while let Ok(envelope) = receiver.try_recv() {
            match envelope {
                Envelope::User(message) => {
                    if tokio::time::Instant::now() >= drain_until {
                        if let Some(slot) = message.reply {
                            let _ = slot.send(Err(ActorError::Stopped {
                                actor_id: actor_id.clone(),
                            }));
                        }
                        continue;
                    }
                    Self::handle_user(&core, &mut cell, &meta, &system_ref, message).await;
                }
                Envelope::Flush | Envelope::Stop => {}
            }
        }

        Self::flush(&core, &mut cell, true).await;
        if let Some(hook) = core.handlers.post_stop_hook() {
            if let Err(err) = hook.call(&mut cell).await {
                warn!(
                    system = %core.name,
                    actor = %actor_id,
                    error = %err,
                    "post_stop hook failed"
                );
            }
        }
        meta.set_status(ActorStatus::Stopped);
        core.actors
            .remove_if(&actor_id, |_, h| h.generation == generation);
        let _ = stopped_tx.send(true);
        debug!(system = %core.name, actor = %actor_id, "actor stopped");
    }

    async fn handle_user(
        core: &Arc<SystemCore<S>>,
        cell: &mut ActorCell<S>,
        meta: &Arc<ActorMeta>,
        system_ref: &Arc<dyn SystemRef>,
        message: ActorMessage,
    ) {
        let now = Utc::now();
        cell.touch(now);
        meta.touch(now);

        let Some(handler) = core.handlers.resolve(&message.message_type) else {
            match message.reply {
                Some(slot) => {
                    let _ = slot.send(Err(ActorError::Handler(
                        HandlerError::UnknownMessageType(message.message_type),
                    )));
                }
                None => {
                    warn!(
                        system = %core.name,
                        actor = %cell.actor_id(),
                        message_type = %message.message_type,
                        "dropping message with no registered handler"
                    );
                }
            }
            return;
        };

        let ctx = MessageContext {
            actor_id: cell.actor_id().to_string(),
            trace: message.trace.clone(),
            system: Arc::clone(system_ref),
        };

        meta.enter_processing();
        let result = match message.trace {
            Some(trace) => {
                trace
                    .scope(handler.call(cell, message.payload, ctx))
                    .await
            }
            None => handler.call(cell, message.payload, ctx).await,
        };
        meta.exit_processing();

        match (result, message.reply) {
            (Ok(value), Some(slot)) => {
                let _ = slot.send(Ok(value));
            }
            (Ok(_), None) => {}
            (Err(err), Some(slot)) => {
                let _ = slot.send(Err(ActorError::Handler(err)));
            }
            (Err(err), None) => {
                warn!(
                    system = %core.name,
                    actor = %cell.actor_id(),
                    error = %err,
                    "handler failed for one-way message"
                );
            }
        }
    }

    /// Save if dirty; `force` skips the interval check (stop path).
    /// A failed save keeps the dirty flag so the next interval retries.
    async fn flush(core: &Arc<SystemCore<S>>, cell: &mut ActorCell<S>, force: bool) {
        if !cell.is_dirty() {
            return;
        }
        let now = Utc::now();
        if !force {
            let since_save = now
                .signed_duration_since(cell.last_save)
                .to_std()
                .unwrap_or_default();
            if since_save < core.options.save_interval {
                return;
            }
        }
        let Some(state) = cell.state() else {
            return;
        };
        match core.store.save(cell.actor_id(), state).await {
            Ok(()) => cell.mark_flushed(now),
            Err(err) => {
                core.metrics.incr(keys::ACTOR_SAVE_FAILED);
                error!(
                    system = %core.name,
                    actor = %cell.actor_id(),
                    error = %err,
                    "state save failed, will retry next interval"
                );
            }
        }
    }
}
