//! Compensation engine: durable "needs-retry" records with exponential
//! backoff.
//!
//! `execute_with_compensation` persists a record before running the
//! guarded action; success deletes it, failure marks it `Failed` and
//! schedules a retry. A periodic worker drives registered handlers until a
//! record is `Compensated` or exhausts its retries into `ManualRequired`,
//! where it waits for an operator. Terminal records are retained seven
//! days via the store's TTL.

// Layer 1: Standard library
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// Layer 3: Internal
use crate::error::SyncError;
use hivecore_shared::ids::{RecordId, RoleId};
use hivecore_shared::metrics::{keys, MetricsSink, NoopMetrics};
use hivecore_store::{KeyValueStore, SortedSetStore};

/// Sorted set of record ids scored by their next attention time.
const PENDING_SET: &str = "comp:pending";

/// Sorted set of records awaiting operator action, scored by entry time.
const MANUAL_SET: &str = "comp:manual";

/// Default retry ceiling before a record goes manual.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default first-retry delay; doubles per failed compensation attempt.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(60);

/// Default cadence of the retry worker.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// How long terminal records are kept for ops inspection.
pub const TERMINAL_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Lifecycle status of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    /// Created; the guarded action has not resolved yet.
    Pending,
    /// The action failed; a compensation retry is scheduled.
    Failed,
    /// A handler compensated successfully. Terminal.
    Compensated,
    /// Retries exhausted; waiting for an operator. Terminal.
    ManualRequired,
}

/// One durable compensation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub record_id: RecordId,
    pub record_type: String,
    pub role_id: RoleId,
    pub context: Value,
    pub status: RecordStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CompensationRecord {
    fn new(record_type: &str, role_id: RoleId, context: Value, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            record_id: RecordId::new(),
            record_type: record_type.to_string(),
            role_id,
            context,
            status: RecordStatus::Pending,
            retry_count: 0,
            max_retries,
            last_error: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Compensates one failed write of its registered type.
#[async_trait]
pub trait CompensationHandler: Send + Sync + 'static {
    async fn compensate(&self, record: &CompensationRecord) -> Result<(), SyncError>;
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct CompensationOptions {
    pub max_retries: u32,
    pub retry_base: Duration,
    pub scan_interval: Duration,
    pub terminal_retention: Duration,
}

impl Default for CompensationOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base: DEFAULT_RETRY_BASE,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            terminal_retention: TERMINAL_RETENTION,
        }
    }
}

/// The engine: records in the KV store, the pending/manual indexes in the
/// sorted-set store, handlers registered by type tag.
pub struct CompensationEngine {
    kv: Arc<dyn KeyValueStore>,
    index: Arc<dyn SortedSetStore>,
    handlers: DashMap<String, Arc<dyn CompensationHandler>>,
    options: CompensationOptions,
    metrics: Arc<dyn MetricsSink>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CompensationEngine {
    pub fn new(kv: Arc<dyn KeyValueStore>, index: Arc<dyn SortedSetStore>) -> Self {
        Self::with_options(kv, index, CompensationOptions::default())
    }

    pub fn with_options(
        kv: Arc<dyn KeyValueStore>,
        index: Arc<dyn SortedSetStore>,
        options: CompensationOptions,
    ) -> Self {
        Self {
            kv,
            index,
            handlers: DashMap::new(),
            options,
            metrics: Arc::new(NoopMetrics),
            worker: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Register the handler invoked for records of `record_type`.
    pub fn register_handler(
        &self,
        record_type: &str,
        handler: Arc<dyn CompensationHandler>,
    ) {
        self.handlers.insert(record_type.to_string(), handler);
    }

    /// Start the periodic retry worker.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let engine = Arc::clone(self);
        *worker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.options.scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = engine.scan_once().await {
                    error!(error = %err, "compensation scan failed");
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.worker.lock().take() {
            task.abort();
        }
    }

    /// Persist a record, run `action`, and either delete the record
    /// (success) or mark it `Failed` with a first retry in `retry_base`
    /// seconds, rethrowing the action's error.
    pub async fn execute_with_compensation<T, F, Fut>(
        &self,
        record_type: &str,
        role_id: RoleId,
        context: Value,
        action: F,
    ) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut record =
            CompensationRecord::new(record_type, role_id, context, self.options.max_retries);
        self.persist(&record).await?;
        self.index
            .add(
                PENDING_SET,
                &record.record_id.to_string(),
                record.created_at.timestamp_millis() as f64,
            )
            .await?;

        match action().await {
            Ok(value) => {
                self.remove(&record).await?;
                Ok(value)
            }
            Err(err) => {
                let now = Utc::now();
                record.status = RecordStatus::Failed;
                record.last_error = Some(err.to_string());
                record.next_retry_at = Some(now + self.options.retry_base);
                record.updated_at = now;
                self.persist(&record).await?;
                self.index
                    .add(
                        PENDING_SET,
                        &record.record_id.to_string(),
                        next_retry_score(&record),
                    )
                    .await?;
                warn!(
                    record_id = %record.record_id,
                    record_type = %record.record_type,
                    role_id = %record.role_id,
                    error = %err,
                    "action failed, compensation scheduled"
                );
                Err(err)
            }
        }
    }

    /// One pass of the retry worker; public so tests and drains can force
    /// a scan without waiting for the interval.
    pub async fn scan_once(&self) -> Result<(), SyncError> {
        let due_cutoff = Utc::now().timestamp_millis() as f64;
        let entries = self
            .index
            .range_desc_with_scores(PENDING_SET, 0, u64::MAX)
            .await?;
        for (record_id, score) in entries {
            if score > due_cutoff {
                continue;
            }
            let Some(mut record) = self.load(&record_id).await? else {
                // Orphaned index entry; drop it.
                self.index.remove(PENDING_SET, &record_id).await?;
                continue;
            };
            if record.status != RecordStatus::Failed {
                continue;
            }
            if record
                .next_retry_at
                .map(|at| at > Utc::now())
                .unwrap_or(true)
            {
                continue;
            }
            self.retry(&mut record).await?;
        }
        Ok(())
    }

    async fn retry(&self, record: &mut CompensationRecord) -> Result<(), SyncError> {
        let Some(handler) = self
            .handlers
            .get(&record.record_type)
            .map(|h| Arc::clone(h.value()))
        else {
            warn!(
                record_id = %record.record_id,
                record_type = %record.record_type,
                "no compensation handler registered, leaving record pending"
            );
            return Ok(());
        };

        match handler.compensate(record).await {
            Ok(()) => {
                let now = Utc::now();
                record.status = RecordStatus::Compensated;
                record.next_retry_at = None;
                record.updated_at = now;
                self.persist_terminal(record).await?;
                self.index
                    .remove(PENDING_SET, &record.record_id.to_string())
                    .await?;
                info!(
                    record_id = %record.record_id,
                    record_type = %record.record_type,
                    retry_count = record.retry_count,
                    "record compensated"
                );
            }
            Err(err) => {
                let now = Utc::now();
                record.retry_count += 1;
                record.last_error = Some(err.to_string());
                record.updated_at = now;
                if record.retry_count >= record.max_retries {
                    record.status = RecordStatus::ManualRequired;
                    record.next_retry_at = None;
                    self.persist_terminal(record).await?;
                    self.index
                        .remove(PENDING_SET, &record.record_id.to_string())
                        .await?;
                    self.index
                        .add(
                            MANUAL_SET,
                            &record.record_id.to_string(),
                            now.timestamp_millis() as f64,
                        )
                        .await?;
                    self.metrics.incr(keys::COMPENSATION_MANUAL);
                    error!(
                        record_id = %record.record_id,
                        record_type = %record.record_type,
                        error = %err,
                        "retries exhausted, record requires manual action"
                    );
                } else {
                    let backoff = self.options.retry_base * 2u32.pow(record.retry_count);
                    record.next_retry_at = Some(now + backoff);
                    self.persist(record).await?;
                    self.index
                        .add(
                            PENDING_SET,
                            &record.record_id.to_string(),
                            next_retry_score(record),
                        )
                        .await?;
                    debug!(
                        record_id = %record.record_id,
                        retry_count = record.retry_count,
                        backoff_secs = backoff.as_secs(),
                        "compensation attempt failed, backing off"
                    );
                }
            }
        }
        Ok(())
    }

    /// Records waiting for an operator, oldest first.
    pub async fn list_manual_required(&self) -> Result<Vec<CompensationRecord>, SyncError> {
        let entries = self
            .index
            .range_desc_with_scores(MANUAL_SET, 0, u64::MAX)
            .await?;
        let mut records = Vec::with_capacity(entries.len());
        // MANUAL_SET is scored by entry time; descending range gives the
        // newest first, so walk it backwards.
        for (record_id, _) in entries.into_iter().rev() {
            if let Some(record) = self.load(&record_id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Operator acknowledgement: the record leaves the manual queue.
    pub async fn resolve_manual(&self, record_id: RecordId) -> Result<bool, SyncError> {
        let id = record_id.to_string();
        let Some(mut record) = self.load(&id).await? else {
            return Ok(false);
        };
        if record.status != RecordStatus::ManualRequired {
            return Ok(false);
        }
        record.status = RecordStatus::Compensated;
        record.updated_at = Utc::now();
        self.persist_terminal(&record).await?;
        self.index.remove(MANUAL_SET, &id).await?;
        Ok(true)
    }

    /// Load a record for diagnostics.
    pub async fn get_record(
        &self,
        record_id: RecordId,
    ) -> Result<Option<CompensationRecord>, SyncError> {
        self.load(&record_id.to_string()).await
    }

    async fn load(&self, record_id: &str) -> Result<Option<CompensationRecord>, SyncError> {
        match self.kv.get(&record_key(record_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn persist(&self, record: &CompensationRecord) -> Result<(), SyncError> {
        self.kv
            .set(
                &record_key(&record.record_id.to_string()),
                serde_json::to_string(record)?,
            )
            .await?;
        Ok(())
    }

    async fn persist_terminal(&self, record: &CompensationRecord) -> Result<(), SyncError> {
        self.kv
            .set_with_ttl(
                &record_key(&record.record_id.to_string()),
                serde_json::to_string(record)?,
                self.options.terminal_retention,
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, record: &CompensationRecord) -> Result<(), SyncError> {
        let id = record.record_id.to_string();
        self.kv.delete(&record_key(&id)).await?;
        self.index.remove(PENDING_SET, &id).await?;
        Ok(())
    }
}

fn record_key(record_id: &str) -> String {
    format!("comp:record:{record_id}")
}

fn next_retry_score(record: &CompensationRecord) -> f64 {
    record
        .next_retry_at
        .map(|at| at.timestamp_millis() as f64)
        .unwrap_or(f64::MAX)
}
