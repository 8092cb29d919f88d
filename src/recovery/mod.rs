// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure recovery.
//!
//! ```text
//! record_failure ──→ FailureEvent ──→ sync_failures (async)
//!        │
//!        └─ severity > low ──→ initiate_recovery (spawned)
//!                                 │
//!                                 ├─ backup { table, data } from context
//!                                 ├─ first enabled plan for the failure type
//!                                 │    (plans sorted by max execution time)
//!                                 ├─ walk escalation path, one timeout per strategy
//!                                 │    Success → resolved   Manual → stop
//!                                 │    Escalate → next      Retry → restart path
//!                                 └─ path exhausted ──→ escalation strategy
//! ```
//!
//! A separate health loop rates the backing store, the network and the
//! recent failure density.

pub mod backup;
pub mod events;
pub mod health;
pub mod plans;
pub mod strategies;

pub use backup::{BackupManager, BackupPoint};
pub use events::{FailureEvent, FailureSeverity, FailureType, FAILURES_TABLE};
pub use health::{ComponentHealth, HealthRating, ReachabilityProbe, StaticProbe, SystemHealthReport, TcpProbe};
pub use plans::{default_plans, PlanBook, RecoveryPlan};
pub use strategies::{
    DataRecoveryStrategy, DegradationFlags, DegradationSnapshot, EscalationStrategy, GracefulDegradationStrategy,
    LogNotifier, Notifier, OperationRegistry, RecoveryStrategy, SimpleRetryStrategy, StrategyOutcome,
};

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::error::{Result, SyncError};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::scheduler::{BackgroundTask, TaskGroup};
use crate::storage::traits::{Filter, RowStore};
use crate::validation::IntegrityValidator;

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStep {
    pub strategy: String,
    pub outcome: StrategyOutcome,
    pub duration_ms: u64,
    /// Error or timeout that was treated as `Escalate`
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub failure_id: String,
    pub plan: Option<String>,
    pub backup_id: Option<String>,
    pub steps: Vec<RecoveryStep>,
    pub plan_retries: u32,
    pub resolved: bool,
    pub resolution_method: Option<String>,
    pub manual_required: bool,
    /// Every strategy in the path failed and escalation took over
    pub exhausted: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl RecoveryReport {
    fn new(failure_id: &str) -> Self {
        Self {
            failure_id: failure_id.to_string(),
            plan: None,
            backup_id: None,
            steps: Vec::new(),
            plan_retries: 0,
            resolved: false,
            resolution_method: None,
            manual_required: false,
            exhausted: false,
            error: None,
            duration_ms: 0,
        }
    }

    /// `Err(RecoveryExhausted)` when the path was exhausted.
    pub fn into_result(self) -> Result<Self> {
        if self.exhausted {
            Err(SyncError::RecoveryExhausted {
                failure_id: self.failure_id,
            })
        } else {
            Ok(self)
        }
    }
}

/// Removes the failure from the in-progress set when recovery ends.
struct InProgress<'a> {
    set: &'a DashSet<String>,
    id: String,
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

pub struct FailureRecoverySystem {
    config: RecoveryConfig,
    store: Arc<dyn RowStore>,
    failures: RwLock<Vec<FailureEvent>>,
    backups: Arc<BackupManager>,
    operations: Arc<OperationRegistry>,
    flags: Arc<DegradationFlags>,
    strategies: DashMap<String, Arc<dyn RecoveryStrategy>>,
    plans: RwLock<PlanBook>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    in_progress: DashSet<String>,
    last_health: RwLock<Option<SystemHealthReport>>,
    tasks: TaskGroup,
}

impl FailureRecoverySystem {
    /// System with the built-in strategies and plans. Escalations go to
    /// [`LogNotifier`]; a TCP probe is installed when `network_probe_addr`
    /// is configured.
    pub fn new(config: RecoveryConfig, store: Arc<dyn RowStore>, validator: Option<Arc<IntegrityValidator>>) -> Self {
        let backups = Arc::new(BackupManager::new(config.max_backups));
        let operations = Arc::new(OperationRegistry::new(config.circuit_config()));
        let flags = Arc::new(DegradationFlags::new());
        let probe = config
            .network_probe_addr
            .as_ref()
            .map(|addr| Arc::new(TcpProbe::new(addr.clone(), config.probe_timeout())) as Arc<dyn ReachabilityProbe>);

        let system = Self {
            store: Arc::clone(&store),
            failures: RwLock::new(Vec::new()),
            backups: Arc::clone(&backups),
            operations: Arc::clone(&operations),
            flags: Arc::clone(&flags),
            strategies: DashMap::new(),
            plans: RwLock::new(PlanBook::new(default_plans())),
            probe,
            in_progress: DashSet::new(),
            last_health: RwLock::new(None),
            tasks: TaskGroup::new(),
            config,
        };

        system.register_strategy(Arc::new(SimpleRetryStrategy::new(operations, system.config.retry_delay())));
        system.register_strategy(Arc::new(DataRecoveryStrategy::new(backups, store, validator)));
        system.register_strategy(Arc::new(GracefulDegradationStrategy::new(flags)));
        system.register_strategy(Arc::new(EscalationStrategy::new(Arc::new(LogNotifier))));
        system
    }

    /// Route escalations to `notifier`.
    #[must_use]
    pub fn with_notifier(self, notifier: Arc<dyn Notifier>) -> Self {
        self.register_strategy(Arc::new(EscalationStrategy::new(notifier)));
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Share degradation flags owned elsewhere (the coordinator hands the
    /// same flags to the engine).
    #[must_use]
    pub fn with_flags(mut self, flags: Arc<DegradationFlags>) -> Self {
        self.flags = Arc::clone(&flags);
        self.register_strategy(Arc::new(GracefulDegradationStrategy::new(flags)));
        self
    }

    /// Add or replace a strategy under its `name()`.
    pub fn register_strategy(&self, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    pub fn add_plan(&self, plan: RecoveryPlan) {
        self.plans.write().upsert(plan);
    }

    pub fn remove_plan(&self, name: &str) -> bool {
        self.plans.write().remove(name)
    }

    #[must_use]
    pub fn plans(&self) -> Vec<RecoveryPlan> {
        self.plans.read().plans().to_vec()
    }

    /// Register the operation simple retry replays for failures named `name`.
    pub fn register_operation<F, Fut>(&self, name: impl Into<String>, operation: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.operations.register(name, operation);
    }

    /// Breaker guarding replays of `operation`.
    #[must_use]
    pub fn circuit(&self, operation: &str) -> Arc<CircuitBreaker> {
        self.operations.circuit(operation)
    }

    #[must_use]
    pub fn flags(&self) -> Arc<DegradationFlags> {
        Arc::clone(&self.flags)
    }

    #[must_use]
    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backups
    }

    /// Record a failure. Anything above `Low` starts recovery in the
    /// background when `auto_recover` is on.
    pub fn record_failure(
        self: &Arc<Self>,
        failure_type: FailureType,
        severity: FailureSeverity,
        operation: impl Into<String>,
        error: impl Into<String>,
        context: Map<String, Value>,
    ) -> String {
        let event = FailureEvent::new(failure_type, severity, operation, error, context);
        let id = event.id.clone();
        warn!(
            failure_id = %id,
            operation = %event.operation,
            failure_type = failure_type.as_str(),
            severity = severity.as_str(),
            error = %event.error,
            "Failure recorded"
        );
        crate::metrics::record_failure_event(failure_type.as_str(), severity.as_str());
        self.persist_event(&event);
        self.failures.write().push(event);

        if severity > FailureSeverity::Low && self.config.auto_recover {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let system = Arc::clone(self);
                    let failure_id = id.clone();
                    handle.spawn(async move {
                        if let Err(e) = system.initiate_recovery(&failure_id).await {
                            debug!(failure_id = %failure_id, error = %e, "Automatic recovery not started");
                        }
                    });
                }
                Err(_) => debug!(failure_id = %id, "No runtime available, recovery left to the caller"),
            }
        }
        id
    }

    /// Convenience for callers holding a [`SyncError`].
    pub fn record_error(
        self: &Arc<Self>,
        operation: impl Into<String>,
        error: &SyncError,
        context: Map<String, Value>,
    ) -> String {
        self.record_failure(
            FailureType::from_error(error),
            FailureSeverity::for_error(error),
            operation,
            error.to_string(),
            context,
        )
    }

    /// Run the recovery walk for one failure.
    #[tracing::instrument(skip(self))]
    pub async fn initiate_recovery(&self, failure_id: &str) -> Result<RecoveryReport> {
        let started = tokio::time::Instant::now();
        let mut event = self
            .failure(failure_id)
            .ok_or_else(|| SyncError::ConfigurationNotFound(format!("failure '{}'", failure_id)))?;
        let mut report = RecoveryReport::new(failure_id);
        if event.resolved {
            report.resolved = true;
            report.resolution_method = event.resolution_method.clone();
            return Ok(report);
        }
        if !self.in_progress.insert(failure_id.to_string()) {
            return Err(SyncError::InvalidOperation(format!(
                "recovery of '{}' is already running",
                failure_id
            )));
        }
        let _guard = InProgress {
            set: &self.in_progress,
            id: failure_id.to_string(),
        };

        if let Some(payload) = event.recoverable_payload() {
            match self.backups.create(&event.operation, &payload) {
                Ok(point) => report.backup_id = Some(point.id),
                Err(e) => warn!(failure_id, error = %e, "Could not back up failure context"),
            }
        }

        let plan = self.plans.read().select(event.failure_type).cloned();
        if let Some(plan) = &plan {
            report.plan = Some(plan.name.clone());
            let deadline = started + plan.max_execution_time;

            'plan: loop {
                for strategy_name in &plan.escalation_path {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        warn!(failure_id, plan = %plan.name, "Recovery plan deadline reached");
                        break 'plan;
                    }
                    let step = self
                        .run_strategy(strategy_name, &event, self.config.strategy_timeout().min(remaining))
                        .await;
                    let outcome = step.outcome;
                    report.steps.push(step);

                    match outcome {
                        StrategyOutcome::Success => {
                            self.resolve(failure_id, strategy_name);
                            report.resolved = true;
                            report.resolution_method = Some(strategy_name.clone());
                            return Ok(self.finish(report, started));
                        }
                        StrategyOutcome::Manual => {
                            report.manual_required = true;
                            return Ok(self.finish(report, started));
                        }
                        StrategyOutcome::Escalate => {}
                        StrategyOutcome::Retry if report.plan_retries < plan.max_retries => {
                            let backoff = self.flags.effective_retry_delay(
                                self.config.retry_delay() * 2u32.saturating_pow(report.plan_retries),
                            );
                            report.plan_retries += 1;
                            event.retry_count += 1;
                            self.update_event(failure_id, |e| e.retry_count = event.retry_count);
                            debug!(failure_id, attempt = report.plan_retries, ?backoff, "Restarting recovery plan");
                            tokio::time::sleep(backoff).await;
                            continue 'plan;
                        }
                        StrategyOutcome::Retry => {}
                    }
                }
                break;
            }
        } else {
            debug!(failure_id, failure_type = event.failure_type.as_str(), "No recovery plan matches");
        }

        // Path exhausted: escalation always gets the last word
        report.exhausted = true;
        report.error = Some(
            SyncError::RecoveryExhausted {
                failure_id: failure_id.to_string(),
            }
            .to_string(),
        );
        let step = self
            .run_strategy(strategies::ESCALATION, &event, self.config.strategy_timeout())
            .await;
        report.manual_required = step.outcome == StrategyOutcome::Manual;
        report.steps.push(step);
        Ok(self.finish(report, started))
    }

    async fn run_strategy(&self, name: &str, event: &FailureEvent, timeout: Duration) -> RecoveryStep {
        let started = tokio::time::Instant::now();
        let Some(strategy) = self.strategies.get(name).map(|s| Arc::clone(s.value())) else {
            warn!(strategy = name, "Unknown recovery strategy");
            return RecoveryStep {
                strategy: name.to_string(),
                outcome: StrategyOutcome::Escalate,
                duration_ms: 0,
                error: Some(format!("strategy '{}' is not registered", name)),
            };
        };

        let (outcome, error) = match tokio::time::timeout(timeout, strategy.execute(event)).await {
            Ok(Ok(outcome)) => (outcome, None),
            Ok(Err(e)) => (StrategyOutcome::Escalate, Some(e.to_string())),
            Err(_) => (
                StrategyOutcome::Escalate,
                Some(format!("strategy timed out after {}ms", timeout.as_millis())),
            ),
        };
        crate::metrics::record_recovery(name, outcome.as_str());
        debug!(strategy = name, outcome = outcome.as_str(), "Recovery strategy finished");
        RecoveryStep {
            strategy: name.to_string(),
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        }
    }

    fn finish(&self, mut report: RecoveryReport, started: tokio::time::Instant) -> RecoveryReport {
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            failure_id = %report.failure_id,
            plan = ?report.plan,
            resolved = report.resolved,
            manual_required = report.manual_required,
            exhausted = report.exhausted,
            steps = report.steps.len(),
            "Recovery finished"
        );
        report
    }

    fn resolve(&self, failure_id: &str, method: &str) {
        if let Some(event) = self.update_event(failure_id, |e| e.mark_resolved(method)) {
            let mut patch = Map::new();
            patch.insert("resolved".into(), Value::Bool(true));
            patch.insert("resolved_at".into(), Value::String(Utc::now().to_rfc3339()));
            patch.insert("resolution_method".into(), Value::String(method.to_string()));
            patch.insert("retry_count".into(), Value::from(event.retry_count));
            self.persist_patch(failure_id, patch);
        }
    }

    fn update_event<F: FnOnce(&mut FailureEvent)>(&self, failure_id: &str, f: F) -> Option<FailureEvent> {
        let mut failures = self.failures.write();
        let event = failures.iter_mut().find(|e| e.id == failure_id)?;
        f(event);
        Some(event.clone())
    }

    fn persist_event(&self, event: &FailureEvent) {
        let Some(row) = event.to_row() else { return };
        let store = Arc::clone(&self.store);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.insert(FAILURES_TABLE, vec![row]).await {
                    warn!(error = %e, "Failed to persist failure event");
                    crate::metrics::record_persist_error(FAILURES_TABLE);
                }
            });
        }
    }

    fn persist_patch(&self, failure_id: &str, patch: Map<String, Value>) {
        let store = Arc::clone(&self.store);
        let filter = Filter::eq("id", failure_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.update(FAILURES_TABLE, &filter, patch).await {
                    warn!(error = %e, "Failed to update failure event");
                    crate::metrics::record_persist_error(FAILURES_TABLE);
                }
            });
        }
    }

    #[must_use]
    pub fn failure(&self, failure_id: &str) -> Option<FailureEvent> {
        self.failures.read().iter().find(|e| e.id == failure_id).cloned()
    }

    /// All failures, oldest first.
    #[must_use]
    pub fn failures(&self) -> Vec<FailureEvent> {
        self.failures.read().clone()
    }

    #[must_use]
    pub fn unresolved(&self) -> Vec<FailureEvent> {
        self.failures.read().iter().filter(|e| !e.resolved).cloned().collect()
    }

    /// Drop resolved failures. Returns how many were removed.
    pub fn clear_resolved(&self) -> usize {
        let mut failures = self.failures.write();
        let before = failures.len();
        failures.retain(|e| !e.resolved);
        before - failures.len()
    }

    pub fn clear(&self) {
        self.failures.write().clear();
    }

    /// Rate the backing store, the network and recent failure density.
    pub async fn health_check(&self) -> SystemHealthReport {
        let _timer = crate::metrics::LatencyTimer::new("recovery", "health_check");
        let mut components = Vec::with_capacity(4);

        let started = tokio::time::Instant::now();
        let store_result = match tokio::time::timeout(self.config.probe_timeout(), self.store.ping()).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("ping timed out after {}ms", self.config.probe_timeout_ms)),
        };
        components.push(probe_component("backing_store", &store_result));

        match &self.probe {
            Some(probe) => {
                let result = probe.probe().await;
                components.push(probe_component("network", &result));
            }
            None => components.push(ComponentHealth {
                component: "network".into(),
                rating: HealthRating::Healthy,
                detail: "no probe configured".into(),
                latency_ms: None,
            }),
        }

        let since = Utc::now() - self.config.failure_window();
        let (recent_failures, unresolved_failures) = {
            let failures = self.failures.read();
            (
                failures.iter().filter(|e| e.timestamp >= since).count(),
                failures.iter().filter(|e| !e.resolved).count(),
            )
        };
        components.push(ComponentHealth {
            component: "failure_density".into(),
            rating: HealthRating::from_failure_density(
                recent_failures,
                self.config.degraded_failure_density,
                self.config.critical_failure_density,
            ),
            detail: format!("{} failure(s) in the last {}s", recent_failures, self.config.failure_window_secs),
            latency_ms: None,
        });

        let open_circuits = self.operations.circuits().tripped();
        components.push(ComponentHealth {
            component: "circuits".into(),
            rating: if open_circuits.is_empty() {
                HealthRating::Healthy
            } else {
                HealthRating::Degraded
            },
            detail: format!("{} circuit(s) not closed", open_circuits.len()),
            latency_ms: None,
        });

        let overall = components
            .iter()
            .map(|c| c.rating)
            .max()
            .unwrap_or(HealthRating::Healthy);
        for c in &components {
            crate::metrics::set_health_rating(&c.component, c.rating.gauge_value());
        }
        crate::metrics::set_health_rating("overall", overall.gauge_value());
        if overall > HealthRating::Healthy {
            warn!(overall = overall.as_str(), "System health check");
        } else {
            debug!("System health check: healthy");
        }

        let report = SystemHealthReport {
            checked_at: Utc::now(),
            overall,
            components,
            open_circuits,
            recent_failures,
            unresolved_failures,
            degradation: self.flags.snapshot(),
        };
        *self.last_health.write() = Some(report.clone());
        report
    }

    /// Result of the most recent health check.
    #[must_use]
    pub fn last_health(&self) -> Option<SystemHealthReport> {
        self.last_health.read().clone()
    }

    /// Start the periodic health check.
    pub fn start(self: &Arc<Self>) {
        if self.tasks.is_running() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        self.tasks.push(BackgroundTask::spawn_interval(
            "recovery_health_check",
            self.config.health_check_interval(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(system) = weak.upgrade() {
                        system.health_check().await;
                    }
                }
            },
        ));
    }

    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
    }
}

fn probe_component(name: &str, result: &std::result::Result<Duration, String>) -> ComponentHealth {
    ComponentHealth {
        component: name.to_string(),
        rating: HealthRating::from_probe(result),
        detail: match result {
            Ok(_) => "reachable".to_string(),
            Err(e) => e.clone(),
        },
        latency_ms: result.as_ref().ok().map(|d| d.as_millis() as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryRowStore;
    use crate::storage::traits::{Row, StoreError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> RecoveryConfig {
        RecoveryConfig {
            auto_recover: false,
            retry_delay_ms: 10,
            strategy_timeout_ms: 1000,
            ..RecoveryConfig::default()
        }
    }

    fn system() -> Arc<FailureRecoverySystem> {
        Arc::new(FailureRecoverySystem::new(config(), Arc::new(InMemoryRowStore::new()), None))
    }

    struct Fixed {
        name: &'static str,
        outcomes: parking_lot::Mutex<Vec<StrategyOutcome>>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(name: &'static str, mut outcomes: Vec<StrategyOutcome>) -> Arc<Self> {
            outcomes.reverse();
            Arc::new(Self {
                name,
                outcomes: parking_lot::Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RecoveryStrategy for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _failure: &FailureEvent) -> Result<StrategyOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcomes.lock().pop().unwrap_or(StrategyOutcome::Escalate))
        }
    }

    struct Slow;

    #[async_trait]
    impl RecoveryStrategy for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _failure: &FailureEvent) -> Result<StrategyOutcome> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(StrategyOutcome::Success)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_resolved_by_replay() {
        let system = system();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        system.register_operation("sync_products", move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });

        let id = system.record_failure(
            FailureType::Network,
            FailureSeverity::Medium,
            "sync_products",
            "connection reset",
            Map::new(),
        );
        let report = system.initiate_recovery(&id).await.unwrap();

        assert!(report.resolved);
        assert_eq!(report.plan.as_deref(), Some("network_recovery"));
        assert_eq!(report.resolution_method.as_deref(), Some(strategies::SIMPLE_RETRY));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(system.failure(&id).unwrap().resolved);
        assert!(system.unresolved().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_outcome_restarts_plan_within_budget() {
        let system = system();
        let first = Fixed::new("first", vec![StrategyOutcome::Retry, StrategyOutcome::Retry, StrategyOutcome::Success]);
        system.register_strategy(first.clone());
        system.add_plan(RecoveryPlan::new("custom", [FailureType::Database], ["first"], Duration::from_secs(1), 2));

        let id = system.record_failure(FailureType::Database, FailureSeverity::High, "op", "e", Map::new());
        let report = system.initiate_recovery(&id).await.unwrap();

        assert!(report.resolved);
        assert_eq!(report.plan_retries, 2);
        assert_eq!(first.calls.load(Ordering::SeqCst), 3);
        assert_eq!(system.failure(&id).unwrap().retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_path_falls_back_to_escalation() {
        let system = system();
        let always_retry = Fixed::new("stubborn", vec![StrategyOutcome::Retry; 10]);
        system.register_strategy(always_retry.clone());
        system.add_plan(RecoveryPlan::new("custom", [FailureType::Database], ["stubborn"], Duration::from_secs(1), 1));

        let id = system.record_failure(FailureType::Database, FailureSeverity::High, "op", "e", Map::new());
        let report = system.initiate_recovery(&id).await.unwrap();

        assert!(report.exhausted);
        assert!(report.manual_required);
        assert!(!report.resolved);
        assert_eq!(always_retry.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.steps.last().unwrap().strategy, strategies::ESCALATION);
        assert!(report.error.as_deref().unwrap().contains("recovery exhausted"));
        assert!(matches!(report.into_result(), Err(SyncError::RecoveryExhausted { .. })));
        assert_eq!(system.unresolved().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_stops_walk() {
        let system = system();
        let manual = Fixed::new("manual", vec![StrategyOutcome::Manual]);
        let never = Fixed::new("never", vec![StrategyOutcome::Success]);
        system.register_strategy(manual);
        system.register_strategy(never.clone());
        system.add_plan(RecoveryPlan::new(
            "custom",
            [FailureType::Validation],
            ["manual", "never"],
            Duration::from_secs(1),
            0,
        ));

        let id = system.record_failure(FailureType::Validation, FailureSeverity::High, "op", "e", Map::new());
        let report = system.initiate_recovery(&id).await.unwrap();
        assert!(report.manual_required);
        assert!(!report.exhausted);
        assert_eq!(never.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strategy_timeout_counts_as_escalate() {
        let system = system();
        system.register_strategy(Arc::new(Slow));
        let fallback = Fixed::new("fallback", vec![StrategyOutcome::Success]);
        system.register_strategy(fallback);
        system.add_plan(RecoveryPlan::new(
            "custom",
            [FailureType::System],
            ["slow", "fallback"],
            Duration::from_secs(10),
            0,
        ));

        let id = system.record_failure(FailureType::System, FailureSeverity::High, "op", "e", Map::new());
        let report = system.initiate_recovery(&id).await.unwrap();
        assert!(report.resolved);
        assert_eq!(report.steps[0].outcome, StrategyOutcome::Escalate);
        assert!(report.steps[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_database_failure_restores_backup_context() {
        let store = Arc::new(InMemoryRowStore::new());
        let system = Arc::new(FailureRecoverySystem::new(config(), store.clone(), None));
        let context = json!({"table": "products", "data": [{"id": "p1", "name": "Coffee"}]});

        let id = system.record_failure(
            FailureType::Database,
            FailureSeverity::High,
            "bulk_insert:products",
            "backend down",
            context.as_object().cloned().unwrap_or_default(),
        );
        let report = system.initiate_recovery(&id).await.unwrap();

        assert!(report.backup_id.is_some());
        assert!(report.resolved);
        assert_eq!(report.resolution_method.as_deref(), Some(strategies::DATA_RECOVERY));
        assert_eq!(store.rows("products").len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_failure() {
        let system = system();
        assert!(matches!(
            system.initiate_recovery("missing").await,
            Err(SyncError::ConfigurationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_auto_recovery_for_non_low_severity() {
        let system = Arc::new(FailureRecoverySystem::new(
            RecoveryConfig {
                auto_recover: true,
                ..config()
            },
            Arc::new(InMemoryRowStore::new()),
            None,
        ));
        let low = system.record_failure(FailureType::System, FailureSeverity::Low, "op", "minor", Map::new());
        let high = system.record_failure(FailureType::System, FailureSeverity::High, "op", "major", Map::new());

        for _ in 0..50 {
            if system.failure(&high).unwrap().resolved {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // system_recovery degrades first
        assert!(system.failure(&high).unwrap().resolved);
        assert!(system.flags().is_degraded());
        assert!(!system.failure(&low).unwrap().resolved);
    }

    #[tokio::test]
    async fn test_failures_persisted() {
        let store = Arc::new(InMemoryRowStore::new());
        let system = Arc::new(FailureRecoverySystem::new(config(), store.clone(), None));
        system.record_failure(FailureType::Network, FailureSeverity::Low, "op", "e", Map::new());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.rows(FAILURES_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_clear_resolved() {
        let system = system();
        let a = system.record_failure(FailureType::System, FailureSeverity::Low, "op", "a", Map::new());
        system.record_failure(FailureType::System, FailureSeverity::Low, "op", "b", Map::new());
        system.resolve(&a, "manual");

        assert_eq!(system.clear_resolved(), 1);
        assert_eq!(system.failures().len(), 1);
        system.clear();
        assert!(system.failures().is_empty());
    }

    struct DeadStore;

    #[async_trait]
    impl RowStore for DeadStore {
        async fn select(&self, _: &str, _: &Filter, _: Option<usize>) -> Result<Vec<Row>, StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }
        async fn insert(&self, _: &str, _: Vec<Row>) -> Result<Vec<Row>, StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }
        async fn update(&self, _: &str, _: &Filter, _: Row) -> Result<Vec<Row>, StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }
        async fn delete(&self, _: &str, _: &Filter) -> Result<usize, StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }
        async fn rpc(&self, name: &str, _: Value) -> Result<Value, StoreError> {
            Err(StoreError::ProcedureNotFound(name.into()))
        }
    }

    #[tokio::test]
    async fn test_health_ratings() {
        let healthy = FailureRecoverySystem::new(config(), Arc::new(InMemoryRowStore::new()), None)
            .with_probe(Arc::new(StaticProbe::reachable(Duration::from_millis(5))));
        let report = healthy.health_check().await;
        assert_eq!(report.overall, HealthRating::Healthy);
        assert!(healthy.last_health().is_some());

        let dead = FailureRecoverySystem::new(config(), Arc::new(DeadStore), None)
            .with_probe(Arc::new(StaticProbe::unreachable("no route")));
        let report = dead.health_check().await;
        assert_eq!(report.component("backing_store").unwrap().rating, HealthRating::Offline);
        assert_eq!(report.component("network").unwrap().rating, HealthRating::Offline);
        assert_eq!(report.overall, HealthRating::Offline);
    }

    #[tokio::test]
    async fn test_failure_density_degrades_health() {
        let system = system();
        for i in 0..4 {
            system.record_failure(FailureType::System, FailureSeverity::Low, "op", format!("e{}", i), Map::new());
        }
        let report = system.health_check().await;
        assert_eq!(report.component("failure_density").unwrap().rating, HealthRating::Degraded);
        assert_eq!(report.overall, HealthRating::Degraded);
    }
}
