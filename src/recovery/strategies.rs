// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Recovery strategies.
//!
//! A strategy's return value decides what the plan walker does next:
//!
//! | Outcome    | Walker action                                         |
//! |------------|-------------------------------------------------------|
//! | `Success`  | failure resolved, stop                                |
//! | `Retry`    | restart the plan after backoff while retries remain   |
//! | `Escalate` | move to the next strategy in the path                 |
//! | `Manual`   | stop automation, a human must act                     |

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::backup::BackupManager;
use super::events::FailureEvent;
use crate::error::{Result, SyncError};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitRegistry};
use crate::storage::traits::{Filter, Row, RowStore};
use crate::validation::IntegrityValidator;

pub const SIMPLE_RETRY: &str = "simple_retry";
pub const DATA_RECOVERY: &str = "data_recovery";
pub const GRACEFUL_DEGRADATION: &str = "graceful_degradation";
pub const ESCALATION: &str = "escalation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyOutcome {
    Success,
    Retry,
    Escalate,
    Manual,
}

impl StrategyOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retry => "retry",
            Self::Escalate => "escalate",
            Self::Manual => "manual",
        }
    }
}

#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Attempt recovery. An `Err` is treated like [`StrategyOutcome::Escalate`].
    async fn execute(&self, failure: &FailureEvent) -> Result<StrategyOutcome>;
}

/// Re-invocable operation registered for simple retry.
pub type RetryFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Named operations and the per-operation breakers that guard their replays.
pub struct OperationRegistry {
    operations: DashMap<String, RetryFn>,
    circuits: CircuitRegistry,
}

impl OperationRegistry {
    pub fn new(circuit_config: CircuitConfig) -> Self {
        Self {
            operations: DashMap::new(),
            circuits: CircuitRegistry::new(circuit_config),
        }
    }

    pub fn register<F, Fut>(&self, name: impl Into<String>, operation: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let retry: RetryFn = Arc::new(move || operation().boxed());
        self.operations.insert(name.into(), retry);
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Run the registered operation through its breaker.
    pub async fn invoke(&self, name: &str) -> Result<()> {
        let operation = self
            .operations
            .get(name)
            .map(|op| Arc::clone(op.value()))
            .ok_or_else(|| SyncError::ConfigurationNotFound(format!("operation '{}'", name)))?;
        self.circuit(name).execute(|| operation()).await.map_err(SyncError::from)
    }

    #[must_use]
    pub fn circuit(&self, name: &str) -> Arc<CircuitBreaker> {
        self.circuits.get(name)
    }

    #[must_use]
    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }
}

/// Load-shedding switches shared with the sync engine.
#[derive(Debug)]
pub struct DegradationFlags {
    realtime_disabled: AtomicBool,
    /// Effective batch size as a percentage of the configured one
    batch_size_percent: AtomicU32,
    retry_delay_multiplier: AtomicU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DegradationSnapshot {
    pub degraded: bool,
    pub realtime_disabled: bool,
    pub batch_size_percent: u32,
    pub retry_delay_multiplier: u32,
}

const DEGRADED_BATCH_PERCENT: u32 = 50;
const DEGRADED_DELAY_MULTIPLIER: u32 = 2;

impl DegradationFlags {
    #[must_use]
    pub fn new() -> Self {
        Self {
            realtime_disabled: AtomicBool::new(false),
            batch_size_percent: AtomicU32::new(100),
            retry_delay_multiplier: AtomicU32::new(1),
        }
    }

    /// Turn every switch to its degraded setting. Returns `false` when the
    /// system was already degraded.
    pub fn degrade(&self) -> bool {
        let was = self.realtime_disabled.swap(true, Ordering::SeqCst);
        self.batch_size_percent.store(DEGRADED_BATCH_PERCENT, Ordering::SeqCst);
        self.retry_delay_multiplier.store(DEGRADED_DELAY_MULTIPLIER, Ordering::SeqCst);
        !was
    }

    pub fn restore(&self) {
        self.realtime_disabled.store(false, Ordering::SeqCst);
        self.batch_size_percent.store(100, Ordering::SeqCst);
        self.retry_delay_multiplier.store(1, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.realtime_disabled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn realtime_enabled(&self) -> bool {
        !self.is_degraded()
    }

    #[must_use]
    pub fn effective_batch_size(&self, configured: usize) -> usize {
        let percent = self.batch_size_percent.load(Ordering::SeqCst) as usize;
        (configured * percent / 100).max(1)
    }

    #[must_use]
    pub fn effective_retry_delay(&self, configured: Duration) -> Duration {
        configured * self.retry_delay_multiplier.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn snapshot(&self) -> DegradationSnapshot {
        DegradationSnapshot {
            degraded: self.is_degraded(),
            realtime_disabled: self.realtime_disabled.load(Ordering::SeqCst),
            batch_size_percent: self.batch_size_percent.load(Ordering::SeqCst),
            retry_delay_multiplier: self.retry_delay_multiplier.load(Ordering::SeqCst),
        }
    }
}

impl Default for DegradationFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives escalations that need a human.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, failure: &FailureEvent, reason: &str);
}

/// Logs escalations at `error!`.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, failure: &FailureEvent, reason: &str) {
        error!(
            failure_id = %failure.id,
            operation = %failure.operation,
            failure_type = failure.failure_type.as_str(),
            severity = failure.severity.as_str(),
            error = %failure.error,
            reason,
            "Manual intervention required"
        );
    }
}

/// Replays the failed operation after a delay, through its breaker.
pub struct SimpleRetryStrategy {
    operations: Arc<OperationRegistry>,
    delay: Duration,
}

impl SimpleRetryStrategy {
    pub fn new(operations: Arc<OperationRegistry>, delay: Duration) -> Self {
        Self { operations, delay }
    }
}

#[async_trait]
impl RecoveryStrategy for SimpleRetryStrategy {
    fn name(&self) -> &str {
        SIMPLE_RETRY
    }

    async fn execute(&self, failure: &FailureEvent) -> Result<StrategyOutcome> {
        if !self.operations.contains(&failure.operation) {
            debug!(operation = %failure.operation, "No registered operation to replay");
            return Ok(StrategyOutcome::Escalate);
        }
        tokio::time::sleep(self.delay).await;

        match self.operations.invoke(&failure.operation).await {
            Ok(()) => Ok(StrategyOutcome::Success),
            Err(SyncError::CircuitOpen { .. }) => Ok(StrategyOutcome::Escalate),
            Err(e) if e.is_transient() => {
                debug!(operation = %failure.operation, error = %e, "Replay failed, transient");
                Ok(StrategyOutcome::Retry)
            }
            Err(e) => {
                debug!(operation = %failure.operation, error = %e, "Replay failed");
                Ok(StrategyOutcome::Escalate)
            }
        }
    }
}

/// Restores the newest verified backup for the operation and writes its
/// rows back, after re-validating each one.
pub struct DataRecoveryStrategy {
    backups: Arc<BackupManager>,
    store: Arc<dyn RowStore>,
    validator: Option<Arc<IntegrityValidator>>,
}

impl DataRecoveryStrategy {
    pub fn new(backups: Arc<BackupManager>, store: Arc<dyn RowStore>, validator: Option<Arc<IntegrityValidator>>) -> Self {
        Self {
            backups,
            store,
            validator,
        }
    }

    async fn write_back(&self, table: &str, row: Row) -> Result<()> {
        if let Some(id) = row.get("id").filter(|v| !v.is_null()).cloned() {
            let updated = self.store.update(table, &Filter::eq("id", id), row.clone()).await?;
            if !updated.is_empty() {
                return Ok(());
            }
        }
        self.store.insert(table, vec![row]).await?;
        Ok(())
    }
}

#[async_trait]
impl RecoveryStrategy for DataRecoveryStrategy {
    fn name(&self) -> &str {
        DATA_RECOVERY
    }

    async fn execute(&self, failure: &FailureEvent) -> Result<StrategyOutcome> {
        let Some(point) = self.backups.latest_for(&failure.operation) else {
            debug!(operation = %failure.operation, "No backup to restore");
            return Ok(StrategyOutcome::Escalate);
        };
        let payload = match point.restore() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(backup_id = %point.id, error = %e, "Refusing corrupt backup");
                return Ok(StrategyOutcome::Escalate);
            }
        };

        let Some(table) = payload.get("table").and_then(Value::as_str).map(str::to_string) else {
            return Ok(StrategyOutcome::Escalate);
        };
        let rows: Vec<Row> = match payload.get("data") {
            Some(Value::Object(row)) => vec![row.clone()],
            Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_object().cloned()).collect(),
            _ => Vec::new(),
        };
        if rows.is_empty() {
            return Ok(StrategyOutcome::Escalate);
        }

        if let Some(validator) = &self.validator {
            let rejected = rows
                .iter()
                .map(|row| validator.validate_single_record(&table, row))
                .filter(|v| !v.is_valid())
                .count();
            if rejected > 0 {
                warn!(backup_id = %point.id, rejected, "Restored rows failed validation");
                return Ok(StrategyOutcome::Escalate);
            }
        }

        for row in rows {
            if let Err(e) = self.write_back(&table, row).await {
                return Ok(if e.is_transient() {
                    StrategyOutcome::Retry
                } else {
                    StrategyOutcome::Escalate
                });
            }
        }
        info!(backup_id = %point.id, table = %table, "Backup restored");
        Ok(StrategyOutcome::Success)
    }
}

/// Sheds load by flipping the shared degradation flags. Succeeds only when
/// it actually changed something.
pub struct GracefulDegradationStrategy {
    flags: Arc<DegradationFlags>,
}

impl GracefulDegradationStrategy {
    pub fn new(flags: Arc<DegradationFlags>) -> Self {
        Self { flags }
    }
}

#[async_trait]
impl RecoveryStrategy for GracefulDegradationStrategy {
    fn name(&self) -> &str {
        GRACEFUL_DEGRADATION
    }

    async fn execute(&self, failure: &FailureEvent) -> Result<StrategyOutcome> {
        if self.flags.degrade() {
            warn!(
                failure_id = %failure.id,
                flags = ?self.flags.snapshot(),
                "Degraded mode enabled: realtime sync off, smaller batches, longer retry delays"
            );
            Ok(StrategyOutcome::Success)
        } else {
            Ok(StrategyOutcome::Escalate)
        }
    }
}

/// Terminal strategy: notifies and hands the failure to a human.
pub struct EscalationStrategy {
    notifier: Arc<dyn Notifier>,
}

impl EscalationStrategy {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl RecoveryStrategy for EscalationStrategy {
    fn name(&self) -> &str {
        ESCALATION
    }

    async fn execute(&self, failure: &FailureEvent) -> Result<StrategyOutcome> {
        self.notifier.notify(failure, "automated recovery did not resolve the failure").await;
        Ok(StrategyOutcome::Manual)
    }
}
