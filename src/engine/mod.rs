// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine: prioritized operation queue with bounded concurrency.
//!
//! ```text
//! enqueue(op)
//!    │ shape check → validation gate → dependency check
//!    ▼
//! PendingQueue (priority, FIFO within tier, not_before)
//!    │ dispatcher: permit → pop_ready → breaker open? defer : spawn
//!    ▼
//! run(op)
//!    ├─→ result cache hit       → Ok(cached outcome)
//!    ├─→ attempt ok / partial   → Ok(outcome)
//!    ├─→ transient, budget left → requeue at now + backoff (same seq)
//!    └─→ otherwise              → Err, reported to recovery
//! ```
//!
//! Every attempt is written to the metrics recorder. Single-row calls run
//! through the table's circuit breaker; bulk chunks report their outcome to
//! it one by one.

mod execute;
mod queue;
pub mod types;

pub use types::{EngineStats, OperationOutcome, OperationPayload, Priority, RowUpdate, SyncOperation};

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::comm::cache::{EvictionStrategy, RequestCache};
use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::monitor::MetricsRecorder;
use crate::recovery::{DegradationFlags, FailureRecoverySystem};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitRegistry};
use crate::resilience::retry::RetryConfig;
use crate::scheduler::{BackgroundTask, TaskGroup};
use crate::storage::traits::RowStore;
use crate::validation::IntegrityValidator;
use execute::AttemptResult;
use queue::{DependencyState, Dequeued, FinishedLog, PendingQueue, QueuedOperation, Responder};

/// Handle to an enqueued operation.
#[derive(Debug)]
pub struct OperationTicket {
    id: String,
    receiver: oneshot::Receiver<Result<OperationOutcome>>,
}

impl OperationTicket {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the operation's final result. Resolves to `Shutdown` if the
    /// engine stopped before the operation ran.
    pub async fn outcome(self) -> Result<OperationOutcome> {
        self.receiver.await.unwrap_or(Err(SyncError::Shutdown))
    }
}

pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<dyn RowStore>,
    recorder: Arc<MetricsRecorder>,
    validator: Option<Arc<IntegrityValidator>>,
    gate_inserts: bool,
    recovery: Option<Arc<FailureRecoverySystem>>,
    flags: Arc<DegradationFlags>,
    circuits: CircuitRegistry,
    retry: RetryConfig,
    result_cache: Option<Arc<RequestCache<OperationOutcome>>>,

    queue: Mutex<PendingQueue>,
    seq: AtomicU64,
    notify: Notify,
    permits: Arc<Semaphore>,
    in_flight: DashSet<String>,
    /// Locked after `queue` whenever both are held
    finished: Mutex<FinishedLog>,
    accepting: AtomicBool,

    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    deferred: AtomicU64,
    cache_hits: AtomicU64,
    validation_warnings: AtomicU64,

    tasks: TaskGroup,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn RowStore>, recorder: Arc<MetricsRecorder>) -> Self {
        let result_cache = config.enable_result_cache.then(|| {
            Arc::new(RequestCache::new(
                config.result_cache_size,
                config.result_cache_ttl(),
                EvictionStrategy::Lru,
            ))
        });
        Self {
            store,
            recorder,
            validator: None,
            gate_inserts: false,
            recovery: None,
            flags: Arc::new(DegradationFlags::new()),
            circuits: CircuitRegistry::new(config.circuit_config()),
            retry: RetryConfig::operation(config.max_retries, config.retry_delay()),
            result_cache,
            queue: Mutex::new(PendingQueue::default()),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            in_flight: DashSet::new(),
            finished: Mutex::new(FinishedLog::new(config.finished_history)),
            accepting: AtomicBool::new(true),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            validation_warnings: AtomicU64::new(0),
            tasks: TaskGroup::new(),
            config,
        }
    }

    /// Check inserted rows against `validator` before they are queued.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<IntegrityValidator>, gate_inserts: bool) -> Self {
        self.validator = Some(validator);
        self.gate_inserts = gate_inserts;
        self
    }

    /// Report terminal failures to `recovery`.
    #[must_use]
    pub fn with_recovery(mut self, recovery: Arc<FailureRecoverySystem>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: Arc<DegradationFlags>) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Breaker guarding writes to `table`.
    #[must_use]
    pub fn circuit(&self, table: &str) -> Arc<CircuitBreaker> {
        self.circuits.get(table)
    }

    #[must_use]
    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    #[must_use]
    pub fn flags(&self) -> Arc<DegradationFlags> {
        Arc::clone(&self.flags)
    }

    /// Admit an operation to the queue.
    ///
    /// Malformed operations, rejected inserts, duplicate ids and unknown
    /// dependencies fail here and never reach the queue.
    #[tracing::instrument(skip(self, op), fields(operation_id = %op.id, table = %op.table, kind = op.kind()))]
    pub fn enqueue(&self, op: SyncOperation) -> Result<OperationTicket> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SyncError::Shutdown);
        }
        op.validate()?;
        self.gate(&op)?;

        let (tx, rx) = oneshot::channel();
        let id = op.id.clone();
        let depth = {
            let mut queue = self.queue.lock();
            if queue.contains(&op.id) || self.in_flight.contains(&op.id) {
                return Err(SyncError::InvalidOperation(format!("operation '{}' is already queued", op.id)));
            }
            let finished = self.finished.lock();
            if let Some(unknown) = op
                .dependencies
                .iter()
                .find(|dep| !finished.contains(dep) && !self.in_flight.contains(*dep) && !queue.contains(dep))
            {
                return Err(SyncError::InvalidOperation(format!(
                    "operation '{}' depends on unknown operation '{}'",
                    op.id, unknown
                )));
            }
            queue.push(QueuedOperation {
                op,
                seq: self.seq.fetch_add(1, Ordering::SeqCst),
                not_before: Instant::now(),
                deferrals: 0,
                responder: tx,
            });
            drop(finished);
            queue.len()
        };
        crate::metrics::set_queue_depth(depth);
        debug!(queued = depth, "Operation enqueued");
        self.notify.notify_one();

        Ok(OperationTicket { id, receiver: rx })
    }

    /// Enqueue and wait for the result.
    pub async fn submit(&self, op: SyncOperation) -> Result<OperationOutcome> {
        self.enqueue(op)?.outcome().await
    }

    fn gate(&self, op: &SyncOperation) -> Result<()> {
        let Some(validator) = self.validator.as_ref().filter(|_| self.gate_inserts) else {
            return Ok(());
        };
        if !matches!(op.payload, OperationPayload::Insert(_) | OperationPayload::BulkInsert(_)) {
            return Ok(());
        }
        let mut warnings = 0;
        for row in op.payload.rows() {
            let checked = validator
                .validate_single_record(&op.table, row)
                .into_result()
                .map_err(|e| {
                    crate::metrics::record_operation(op.kind(), &op.table, "rejected");
                    e
                })?;
            warnings += checked.warnings.len();
        }
        if warnings > 0 {
            self.validation_warnings.fetch_add(warnings as u64, Ordering::Relaxed);
            debug!(warnings, "Operation admitted with validation warnings");
        }
        Ok(())
    }

    /// Operations waiting in the queue (not counting in-flight ones).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            queued: self.pending_count(),
            in_flight: self.in_flight.len(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            validation_warnings: self.validation_warnings.load(Ordering::Relaxed),
        }
    }

    /// Start the dispatcher (and the result cache sweeper). Operations
    /// enqueued earlier start running now.
    ///
    /// The dispatcher holds the engine until [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>) {
        if self.tasks.is_running() {
            return;
        }
        if let Some(cache) = &self.result_cache {
            self.tasks.push(cache.spawn_ttl_sweeper(self.config.result_cache_ttl()));
        }

        let engine = Arc::clone(self);
        self.tasks.push(BackgroundTask::spawn("engine_dispatcher", move |mut shutdown| async move {
            loop {
                let permit = tokio::select! {
                    _ = shutdown.changed() => break,
                    permit = Arc::clone(&engine.permits).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let now = Instant::now();
                let next = engine.queue.lock().pop_ready(now, |op| engine.dependency_state(op));
                match next {
                    Some(Dequeued::Ready(entry)) => engine.admit(entry, permit, now),
                    Some(Dequeued::DependencyFailed(entry, dependency)) => {
                        drop(permit);
                        let err = SyncError::DependencyFailed {
                            operation: entry.op.id.clone(),
                            dependency,
                        };
                        engine.fail(entry.op, entry.responder, err, false);
                    }
                    None => {
                        drop(permit);
                        let wake = engine.queue.lock().next_wake(now);
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = engine.notify.notified() => {}
                            _ = sleep_until(wake) => {}
                        }
                    }
                }
                crate::metrics::set_queue_depth(engine.pending_count());
            }
            debug!("Dispatcher stopped");
        }));
        info!(max_concurrency = self.config.max_concurrency, "Sync engine started");
    }

    /// Stop accepting work, wait for in-flight operations, then fail
    /// everything still queued with `Shutdown`.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.tasks.shutdown().await;

        let total = u32::try_from(self.config.max_concurrency.max(1)).unwrap_or(u32::MAX);
        if let Ok(all) = self.permits.acquire_many(total).await {
            drop(all);
        }

        let drained = self.queue.lock().drain();
        let abandoned = drained.len();
        for entry in drained {
            let _ = entry.responder.send(Err(SyncError::Shutdown));
        }
        crate::metrics::set_queue_depth(0);
        info!(abandoned, "Sync engine stopped");
    }

    fn dependency_state(&self, op: &SyncOperation) -> DependencyState {
        if op.dependencies.is_empty() {
            return DependencyState::Satisfied;
        }
        let finished = self.finished.lock();
        for dep in &op.dependencies {
            match finished.get(dep) {
                Some(true) => {}
                Some(false) => return DependencyState::Failed(dep.clone()),
                None => return DependencyState::Waiting,
            }
        }
        DependencyState::Satisfied
    }

    /// Defer the entry if its table's breaker is open, else run it.
    fn admit(self: &Arc<Self>, mut entry: QueuedOperation, permit: OwnedSemaphorePermit, now: Instant) {
        // Dependencies are met once handed out; deferrals and retries must
        // not wait on ids the finished log has since forgotten.
        entry.op.dependencies.clear();
        let breaker = self.circuits.get(&entry.op.table);
        if breaker.would_reject() {
            drop(permit);
            if entry.deferrals >= self.config.max_circuit_deferrals {
                warn!(
                    operation_id = %entry.op.id,
                    table = %entry.op.table,
                    deferrals = entry.deferrals,
                    "Circuit still open, giving up"
                );
                let err = SyncError::CircuitOpen {
                    circuit: breaker.name().to_string(),
                };
                self.fail(entry.op, entry.responder, err, true);
                return;
            }
            entry.deferrals += 1;
            entry.not_before = now + self.config.circuit_retry_delay();
            self.deferred.fetch_add(1, Ordering::Relaxed);
            debug!(
                operation_id = %entry.op.id,
                table = %entry.op.table,
                deferrals = entry.deferrals,
                "Circuit open, operation deferred"
            );
            self.queue.lock().push(entry);
            return;
        }

        self.in_flight.insert(entry.op.id.clone());
        crate::metrics::set_in_flight(self.in_flight.len());
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run(entry).await;
            drop(permit);
            engine.notify.notify_one();
        });
    }

    async fn run(&self, entry: QueuedOperation) {
        let QueuedOperation {
            mut op, seq, responder, ..
        } = entry;
        let started_at = Utc::now();
        let timer = Instant::now();

        if let Some(outcome) = self.cached_outcome(&op) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.completed.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_operation(op.kind(), &op.table, "cached");
            debug!(operation_id = %op.id, "Served from result cache");
            self.finish(&op.id, true);
            let _ = responder.send(Ok(outcome));
            return;
        }

        match self.attempt(&op).await {
            Ok(result) => {
                let outcome = self.outcome_from(&op, result, timer.elapsed());
                self.record_attempt(&op, started_at, outcome.processed, outcome.succeeded, outcome.errors.clone());
                crate::metrics::record_latency("engine", op.kind(), timer.elapsed());

                if outcome.is_complete() {
                    self.completed.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_operation(op.kind(), &op.table, "success");
                    if let (Some(cache), Some(key)) = (&self.result_cache, op.cache_key()) {
                        cache.set(key, outcome.clone());
                    }
                } else {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_operation(op.kind(), &op.table, "partial");
                    warn!(
                        operation_id = %op.id,
                        succeeded = outcome.succeeded,
                        failed = outcome.failed,
                        failed_chunks = outcome.failed_chunks,
                        "Operation partially applied"
                    );
                }
                self.finish(&op.id, outcome.is_complete());
                let _ = responder.send(Ok(outcome));
            }
            Err(e) if e.is_transient() && op.retry_count < self.config.max_retries => {
                self.record_attempt(&op, started_at, op.payload.record_count() as u64, 0, vec![e.to_string()]);
                let delay = self
                    .flags
                    .effective_retry_delay(self.retry.delay_for_attempt(op.retry_count));
                op.retry_count += 1;
                self.retried.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_retry("engine", op.kind());
                warn!(
                    operation_id = %op.id,
                    attempt = op.retry_count,
                    max_retries = self.config.max_retries,
                    delay = ?delay,
                    error = %e,
                    "Operation failed, retrying"
                );

                let id = op.id.clone();
                self.queue.lock().push(QueuedOperation {
                    op,
                    seq,
                    not_before: Instant::now() + delay,
                    deferrals: 0,
                    responder,
                });
                self.in_flight.remove(&id);
                crate::metrics::set_in_flight(self.in_flight.len());
            }
            Err(e) => {
                self.record_attempt(&op, started_at, op.payload.record_count() as u64, 0, vec![e.to_string()]);
                crate::metrics::record_latency("engine", op.kind(), timer.elapsed());
                self.fail(op, responder, e, true);
            }
        }
    }

    /// One pass against the store. An error means nothing was applied.
    async fn attempt(&self, op: &SyncOperation) -> Result<AttemptResult> {
        let breaker = self.circuits.get(&op.table);
        let timeout = self.config.operation_timeout();
        if op.payload.is_bulk() {
            let batch_size = self.flags.effective_batch_size(self.config.batch_size);
            execute::execute_bulk(self.store.as_ref(), op, batch_size, timeout, |ok| breaker.record_outcome(ok))
                .await?
                .into_total_failure()
        } else {
            breaker
                .execute(|| execute::execute_single(self.store.as_ref(), op, timeout))
                .await
                .map_err(SyncError::from)
        }
    }

    fn cached_outcome(&self, op: &SyncOperation) -> Option<OperationOutcome> {
        let key = op.cache_key()?;
        let mut outcome = self.result_cache.as_ref()?.get(&key)?;
        outcome.operation_id = op.id.clone();
        outcome.cached = true;
        outcome.retries = op.retry_count;
        outcome.duration_ms = 0;
        Some(outcome)
    }

    fn outcome_from(&self, op: &SyncOperation, result: AttemptResult, elapsed: Duration) -> OperationOutcome {
        OperationOutcome {
            operation_id: op.id.clone(),
            table: op.table.clone(),
            kind: op.kind(),
            processed: result.processed as u64,
            succeeded: result.succeeded as u64,
            failed: result.failed() as u64,
            errors: result.errors(),
            chunks: result.chunks.len(),
            failed_chunks: result.failed_chunks(),
            retries: op.retry_count,
            cached: false,
            rows: result.rows,
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    fn record_attempt(&self, op: &SyncOperation, start: DateTime<Utc>, processed: u64, succeeded: u64, errors: Vec<String>) {
        let mut metadata = Map::new();
        metadata.insert("operation_id".into(), Value::from(op.id.clone()));
        metadata.insert("kind".into(), Value::from(op.kind()));
        metadata.insert("table".into(), Value::from(op.table.clone()));
        metadata.insert("priority".into(), Value::from(op.priority.as_str()));
        metadata.insert("retry_count".into(), Value::from(op.retry_count));
        self.recorder
            .record(op.metric_kind(), start, Utc::now(), processed, succeeded, errors, metadata);
    }

    /// Terminal failure. `report` hands it to the recovery system along with
    /// the rows it tried to write and a replay of the operation.
    fn fail(&self, op: SyncOperation, responder: Responder, err: SyncError, report: bool) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_operation(op.kind(), &op.table, err.kind());
        warn!(operation_id = %op.id, table = %op.table, error = %err, "Operation failed");

        if let (true, Some(recovery)) = (report, &self.recovery) {
            let name = format!("{}:{}:{}", op.kind(), op.table, op.id);
            self.register_replay(recovery, &name, &op);
            recovery.record_error(name, &err, failure_context(&op));
        }
        self.finish(&op.id, false);
        let _ = responder.send(Err(err));
    }

    /// Let simple retry re-run the failed operation directly.
    fn register_replay(&self, recovery: &FailureRecoverySystem, name: &str, op: &SyncOperation) {
        let store = Arc::clone(&self.store);
        let op = op.clone();
        let timeout = self.config.operation_timeout();
        let batch_size = self.flags.effective_batch_size(self.config.batch_size);
        recovery.register_operation(name, move || {
            let store = Arc::clone(&store);
            let op = op.clone();
            async move {
                let result = if op.payload.is_bulk() {
                    execute::execute_bulk(store.as_ref(), &op, batch_size, timeout, |_| {}).await?
                } else {
                    execute::execute_single(store.as_ref(), &op, timeout).await?
                };
                match result.chunks.into_iter().find_map(|c| c.error) {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        });
    }

    /// Finished operations kept for dependency checks.
    #[must_use]
    pub fn finished_count(&self) -> usize {
        self.finished.lock().len()
    }

    fn finish(&self, operation_id: &str, succeeded: bool) {
        {
            let queue = self.queue.lock();
            self.finished
                .lock()
                .record(operation_id, succeeded, |id| queue.awaits(id));
        }
        self.in_flight.remove(operation_id);
        crate::metrics::set_in_flight(self.in_flight.len());
        self.notify.notify_one();
    }
}

fn failure_context(op: &SyncOperation) -> Map<String, Value> {
    let rows: Vec<Value> = op.payload.rows().into_iter().map(|r| Value::Object(r.clone())).collect();
    let mut context = Map::new();
    context.insert("operation_id".into(), Value::from(op.id.clone()));
    context.insert("table".into(), Value::from(op.table.clone()));
    context.insert("kind".into(), Value::from(op.kind()));
    context.insert(
        "data".into(),
        if rows.is_empty() { Value::Null } else { Value::Array(rows) },
    );
    context
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RecoveryConfig, ValidationConfig};
    use crate::storage::memory::InMemoryRowStore;
    use crate::storage::traits::{Filter, Row, StoreError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap_or_default()
    }

    /// Fails the first `failures` inserts, and any insert carrying
    /// `"fail": true`, with `error`.
    struct FaultyStore {
        inner: InMemoryRowStore,
        failures: AtomicUsize,
        inserts: AtomicUsize,
        transient: bool,
    }

    impl FaultyStore {
        fn new(failures: usize, transient: bool) -> Self {
            Self {
                inner: InMemoryRowStore::new(),
                failures: AtomicUsize::new(failures),
                inserts: AtomicUsize::new(0),
                transient,
            }
        }

        fn error(&self) -> StoreError {
            if self.transient {
                StoreError::Backend("connection reset".into())
            } else {
                StoreError::NotFound
            }
        }
    }

    #[async_trait]
    impl RowStore for FaultyStore {
        async fn select(&self, t: &str, f: &Filter, l: Option<usize>) -> std::result::Result<Vec<Row>, StoreError> {
            self.inner.select(t, f, l).await
        }
        async fn insert(&self, t: &str, rows: Vec<Row>) -> std::result::Result<Vec<Row>, StoreError> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            let scheduled = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if scheduled || rows.iter().any(|r| r.get("fail") == Some(&Value::Bool(true))) {
                return Err(self.error());
            }
            self.inner.insert(t, rows).await
        }
        async fn update(&self, t: &str, f: &Filter, p: Row) -> std::result::Result<Vec<Row>, StoreError> {
            self.inner.update(t, f, p).await
        }
        async fn delete(&self, t: &str, f: &Filter) -> std::result::Result<usize, StoreError> {
            self.inner.delete(t, f).await
        }
        async fn rpc(&self, n: &str, a: Value) -> std::result::Result<Value, StoreError> {
            self.inner.rpc(n, a).await
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            retry_delay_ms: 100,
            circuit_retry_delay_ms: 100,
            ..EngineConfig::default()
        }
    }

    fn engine_with(config: EngineConfig, store: Arc<dyn RowStore>) -> Arc<SyncEngine> {
        Arc::new(SyncEngine::new(config, store, Arc::new(MetricsRecorder::in_memory())))
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order_with_single_slot() {
        let store = Arc::new(InMemoryRowStore::new());
        let engine = engine_with(
            EngineConfig {
                max_concurrency: 1,
                ..config()
            },
            store.clone(),
        );

        let mut tickets = Vec::new();
        for (name, priority) in [
            ("low", Priority::Low),
            ("medium", Priority::Medium),
            ("critical", Priority::Critical),
            ("high", Priority::High),
        ] {
            let op = SyncOperation::insert("products", row(json!({"name": name}))).with_priority(priority);
            tickets.push(engine.enqueue(op).unwrap());
        }
        assert_eq!(engine.pending_count(), 4);

        engine.start();
        for ticket in tickets {
            assert!(ticket.outcome().await.unwrap().is_complete());
        }

        let order: Vec<_> = store.rows("products").iter().map(|r| r["name"].clone()).collect();
        assert_eq!(order, vec![json!("critical"), json!("high"), json!("medium"), json!("low")]);
        assert_eq!(engine.stats().completed, 4);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_partial_failure_reports_chunks() {
        let store = Arc::new(FaultyStore::new(0, true));
        let engine = engine_with(
            EngineConfig {
                batch_size: 3,
                ..config()
            },
            store.clone(),
        );
        engine.start();

        let rows = (0..10).map(|i| row(json!({"id": i, "fail": i == 4}))).collect();
        let outcome = engine.submit(SyncOperation::bulk_insert("products", rows)).await.unwrap();

        assert_eq!(outcome.processed, 10);
        assert_eq!(outcome.succeeded, 7);
        assert_eq!(outcome.failed, 3);
        assert_eq!(outcome.chunks, 4);
        assert_eq!(outcome.failed_chunks, 1);
        assert!(outcome.is_partial());
        // Partial results are final
        assert_eq!(outcome.retries, 0);
        assert_eq!(store.inserts.load(Ordering::SeqCst), 4);
        assert_eq!(store.inner.len("products"), 7);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_flags_shrink_chunks() {
        let store = Arc::new(InMemoryRowStore::new());
        let flags = Arc::new(DegradationFlags::new());
        flags.degrade();
        let engine = Arc::new(
            SyncEngine::new(
                EngineConfig {
                    batch_size: 4,
                    ..config()
                },
                store.clone(),
                Arc::new(MetricsRecorder::in_memory()),
            )
            .with_flags(flags),
        );
        engine.start();

        let rows = (0..10).map(|i| row(json!({"id": i}))).collect();
        let outcome = engine.submit(SyncOperation::bulk_insert("products", rows)).await.unwrap();
        assert_eq!(outcome.chunks, 5);
        assert!(outcome.is_complete());
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried_then_succeed() {
        let store = Arc::new(FaultyStore::new(2, true));
        let recorder = Arc::new(MetricsRecorder::in_memory());
        let engine = Arc::new(SyncEngine::new(config(), store.clone(), recorder.clone()));
        engine.start();

        let outcome = engine
            .submit(SyncOperation::insert("products", row(json!({"name": "Tea"}))))
            .await
            .unwrap();

        assert_eq!(outcome.retries, 2);
        assert_eq!(store.inserts.load(Ordering::SeqCst), 3);
        assert_eq!(engine.stats().retried, 2);
        // One metric record per attempt
        assert_eq!(recorder.len(), 3);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_bounds_attempts() {
        let store = Arc::new(FaultyStore::new(usize::MAX, true));
        let engine = engine_with(
            EngineConfig {
                max_retries: 2,
                circuit_failure_threshold: 100,
                ..config()
            },
            store.clone(),
        );
        engine.start();

        let result = engine
            .submit(SyncOperation::insert("products", row(json!({"name": "Tea"}))))
            .await;
        assert!(matches!(result, Err(SyncError::Store(StoreError::Backend(_)))));
        assert_eq!(store.inserts.load(Ordering::SeqCst), 3);
        assert_eq!(engine.stats().failed, 1);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let store = Arc::new(FaultyStore::new(1, false));
        let engine = engine_with(config(), store.clone());
        engine.start();

        let result = engine
            .submit(SyncOperation::insert("products", row(json!({"name": "Tea"}))))
            .await;
        assert!(matches!(result, Err(SyncError::Store(StoreError::NotFound))));
        assert_eq!(store.inserts.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stats().retried, 0);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_defers_then_fails() {
        let store = Arc::new(FaultyStore::new(1, false));
        let engine = engine_with(
            EngineConfig {
                circuit_failure_threshold: 1,
                max_circuit_deferrals: 2,
                ..config()
            },
            store.clone(),
        );
        engine.start();

        let first = engine
            .submit(SyncOperation::insert("products", row(json!({"name": "a"}))))
            .await;
        assert!(first.is_err());

        let second = engine
            .submit(SyncOperation::insert("products", row(json!({"name": "b"}))))
            .await;
        assert!(matches!(second, Err(SyncError::CircuitOpen { .. })));
        assert_eq!(engine.stats().deferred, 2);
        // The deferred operation never reached the store
        assert_eq!(store.inserts.load(Ordering::SeqCst), 1);

        // Other tables are unaffected
        let other = engine
            .submit(SyncOperation::insert("suppliers", row(json!({"name": "c"}))))
            .await;
        assert!(other.is_ok());
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependent_waits_for_dependency() {
        let store = Arc::new(InMemoryRowStore::new());
        let engine = engine_with(config(), store.clone());

        let parent = SyncOperation::insert("suppliers", row(json!({"id": "s1"}))).with_id("parent");
        let child = SyncOperation::insert("products", row(json!({"id": "p1", "supplier_id": "s1"})))
            .with_id("child")
            .with_priority(Priority::Critical)
            .depends_on("parent");
        let parent_ticket = engine.enqueue(parent).unwrap();
        let child_ticket = engine.enqueue(child).unwrap();
        engine.start();

        assert!(child_ticket.outcome().await.is_ok());
        assert!(parent_ticket.outcome().await.is_ok());
        assert_eq!(store.len("suppliers"), 1);
        assert_eq!(store.len("products"), 1);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dependency_fails_dependent() {
        let store = Arc::new(FaultyStore::new(1, false));
        let engine = engine_with(config(), store.clone());

        let parent = engine
            .enqueue(SyncOperation::insert("suppliers", row(json!({"id": "s1"}))).with_id("parent"))
            .unwrap();
        let child = engine
            .enqueue(
                SyncOperation::insert("products", row(json!({"id": "p1"})))
                    .with_id("child")
                    .depends_on("parent"),
            )
            .unwrap();
        engine.start();

        assert!(parent.outcome().await.is_err());
        match child.outcome().await {
            Err(SyncError::DependencyFailed { operation, dependency }) => {
                assert_eq!(operation, "child");
                assert_eq!(dependency, "parent");
            }
            other => panic!("expected dependency failure, got {:?}", other),
        }
        assert!(store.inner.is_empty("products"));
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_history_stays_bounded() {
        let engine = engine_with(
            EngineConfig {
                finished_history: 16,
                ..config()
            },
            Arc::new(InMemoryRowStore::new()),
        );
        engine.start();

        for i in 0..200 {
            let op = SyncOperation::insert("products", row(json!({"id": format!("p{}", i), "name": "Tea"})));
            engine.submit(op).await.unwrap();
        }

        let stats = engine.stats();
        assert_eq!(stats.completed, 200);
        assert_eq!(stats.queued + stats.in_flight, 0);
        assert_eq!(engine.finished_count(), 16);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_awaited_dependency_outlives_history_bound() {
        let store = Arc::new(InMemoryRowStore::new());
        let engine = engine_with(
            EngineConfig {
                max_concurrency: 1,
                finished_history: 1,
                ..config()
            },
            store.clone(),
        );

        let parent = engine
            .enqueue(
                SyncOperation::insert("suppliers", row(json!({"id": "s1"})))
                    .with_id("parent")
                    .with_priority(Priority::Critical),
            )
            .unwrap();
        let child = engine
            .enqueue(
                SyncOperation::insert("products", row(json!({"id": "p1", "supplier_id": "s1"})))
                    .with_id("child")
                    .with_priority(Priority::Low)
                    .depends_on("parent"),
            )
            .unwrap();
        // These finish between parent and child and would push parent out
        let fillers: Vec<_> = (0..4)
            .map(|i| {
                let op = SyncOperation::insert("categories", row(json!({"id": format!("c{}", i)})))
                    .with_priority(Priority::High);
                engine.enqueue(op).unwrap()
            })
            .collect();
        engine.start();

        assert!(parent.outcome().await.is_ok());
        for filler in fillers {
            assert!(filler.outcome().await.is_ok());
        }
        assert!(child.outcome().await.is_ok());
        assert_eq!(store.len("products"), 1);
        assert_eq!(engine.finished_count(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_rejections() {
        let engine = engine_with(config(), Arc::new(InMemoryRowStore::new()));

        let orphan = SyncOperation::insert("products", row(json!({"a": 1}))).depends_on("nobody");
        assert!(matches!(engine.enqueue(orphan), Err(SyncError::InvalidOperation(_))));

        let unscoped = SyncOperation::delete("products", Filter::all());
        assert!(matches!(engine.enqueue(unscoped), Err(SyncError::OperationUnsupported(_))));

        let _ticket = engine
            .enqueue(SyncOperation::insert("products", row(json!({"a": 1}))).with_id("dup"))
            .unwrap();
        let again = SyncOperation::insert("products", row(json!({"a": 2}))).with_id("dup");
        assert!(matches!(engine.enqueue(again), Err(SyncError::InvalidOperation(_))));
        assert_eq!(engine.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_cache_short_circuits_duplicate_insert() {
        let store = Arc::new(InMemoryRowStore::new());
        let engine = engine_with(config(), store.clone());
        engine.start();

        let payload = json!({"name": "Tea", "price": 2});
        let first = engine
            .submit(SyncOperation::insert("products", row(payload.clone())))
            .await
            .unwrap();
        let second = engine
            .submit(SyncOperation::insert("products", row(payload)))
            .await
            .unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_ne!(first.operation_id, second.operation_id);
        assert_eq!(store.len("products"), 1);
        assert_eq!(engine.stats().cache_hits, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_validation_gate_rejects_invalid_insert() {
        let store: Arc<dyn RowStore> = Arc::new(InMemoryRowStore::new());
        let validator = Arc::new(IntegrityValidator::from_config(Arc::clone(&store), &ValidationConfig::default()));
        let engine = SyncEngine::new(config(), store, Arc::new(MetricsRecorder::in_memory()))
            .with_validator(validator, true);

        let nameless = SyncOperation::insert("products", row(json!({"id": "p1", "price": 5})));
        assert!(matches!(engine.enqueue(nameless), Err(SyncError::ValidationFailed { .. })));
        assert_eq!(engine.pending_count(), 0);

        let fine = SyncOperation::insert("products", row(json!({"id": "p2", "name": "Tea", "price": 5})));
        assert!(engine.enqueue(fine).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_reported_to_recovery() {
        let store = Arc::new(FaultyStore::new(1, false));
        let recovery = Arc::new(FailureRecoverySystem::new(
            RecoveryConfig {
                auto_recover: false,
                ..RecoveryConfig::default()
            },
            Arc::new(InMemoryRowStore::new()),
            None,
        ));
        let engine = Arc::new(
            SyncEngine::new(config(), store, Arc::new(MetricsRecorder::in_memory())).with_recovery(recovery.clone()),
        );
        engine.start();

        let op = SyncOperation::insert("products", row(json!({"name": "Tea"}))).with_id("op-1");
        assert!(engine.submit(op).await.is_err());

        let failures = recovery.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].operation, "insert:products:op-1");
        assert_eq!(failures[0].context["table"], "products");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_and_refuses_new_work() {
        let engine = engine_with(config(), Arc::new(InMemoryRowStore::new()));
        let ticket = engine
            .enqueue(SyncOperation::insert("products", row(json!({"a": 1}))))
            .unwrap();

        engine.shutdown().await;
        assert!(matches!(ticket.outcome().await, Err(SyncError::Shutdown)));
        assert!(matches!(
            engine.enqueue(SyncOperation::insert("products", row(json!({"a": 2})))),
            Err(SyncError::Shutdown)
        ));
    }
}
