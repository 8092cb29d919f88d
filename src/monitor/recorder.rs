// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics recorder: the single sink every execution path reports through.
//!
//! Records land in two places: an append-only history trimmed by the
//! retention sweep, and a bounded ring of the most recent records used by
//! the optimizer and analyzer. Persistence to `sync_metrics` is fire-and-forget.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::record::{MetricRecord, OperationKind, ResourceReadings};
use super::report::PerformanceReport;
use crate::config::MetricsConfig;
use crate::scheduler::{BackgroundTask, TaskGroup};
use crate::storage::traits::{Row, RowStore};

/// Table metric records are persisted to
pub const METRICS_TABLE: &str = "sync_metrics";

const HEALTHY_PING_MS: u64 = 1000;
const WARNING_PING_MS: u64 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecorderHealth {
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub records_in_memory: usize,
}

pub struct MetricsRecorder {
    config: MetricsConfig,
    store: Option<Arc<dyn RowStore>>,
    history: RwLock<Vec<MetricRecord>>,
    recent: Mutex<VecDeque<MetricRecord>>,
    tasks: TaskGroup,
}

impl MetricsRecorder {
    pub fn new(config: MetricsConfig, store: Option<Arc<dyn RowStore>>) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(config.recent_capacity.min(4096))),
            config,
            store,
            history: RwLock::new(Vec::new()),
            tasks: TaskGroup::new(),
        }
    }

    /// Recorder with default settings and no persistence.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(
            MetricsConfig {
                persist: false,
                ..MetricsConfig::default()
            },
            None,
        )
    }

    /// Record one completed operation. Never blocks on persistence.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        operation: OperationKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        processed: u64,
        succeeded: u64,
        errors: Vec<String>,
        metadata: Map<String, Value>,
    ) -> MetricRecord {
        let record = MetricRecord::new(operation, start, end, processed, succeeded, errors, metadata);
        self.push(record)
    }

    /// [`record`](Self::record) with resource readings attached.
    #[allow(clippy::too_many_arguments)]
    pub fn record_with_resources(
        &self,
        operation: OperationKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        processed: u64,
        succeeded: u64,
        errors: Vec<String>,
        metadata: Map<String, Value>,
        resources: ResourceReadings,
    ) -> MetricRecord {
        let record =
            MetricRecord::new(operation, start, end, processed, succeeded, errors, metadata).with_resources(resources);
        self.push(record)
    }

    /// Append an already built record.
    pub fn push(&self, record: MetricRecord) -> MetricRecord {
        debug!(
            operation = %record.operation,
            status = record.status.as_str(),
            duration_ms = record.duration_ms,
            "Metric recorded"
        );

        self.history.write().push(record.clone());
        {
            let mut recent = self.recent.lock();
            if recent.len() >= self.config.recent_capacity.max(1) {
                recent.pop_front();
            }
            recent.push_back(record.clone());
        }

        self.persist(&record);
        record
    }

    fn persist(&self, record: &MetricRecord) {
        if !self.config.persist {
            return;
        }
        let Some(store) = self.store.clone() else {
            return;
        };
        let row: Row = match serde_json::to_value(record) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return,
            Err(e) => {
                warn!(error = %e, "Failed to serialize metric record");
                return;
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.insert(METRICS_TABLE, vec![row]).await {
                        warn!(error = %e, "Failed to persist metric record");
                        crate::metrics::record_persist_error(METRICS_TABLE);
                    }
                });
            }
            Err(_) => debug!("No runtime available, metric kept in memory only"),
        }
    }

    /// The `n` most recent records, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<MetricRecord> {
        let recent = self.recent.lock();
        let skip = recent.len().saturating_sub(n);
        recent.iter().skip(skip).cloned().collect()
    }

    /// History records with `timestamp >= since`.
    #[must_use]
    pub fn records_since(&self, since: DateTime<Utc>) -> Vec<MetricRecord> {
        self.history.read().iter().filter(|r| r.timestamp >= since).cloned().collect()
    }

    /// History records with `start <= timestamp <= end`.
    #[must_use]
    pub fn records_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<MetricRecord> {
        self.history
            .read()
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.history.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop history older than the retention window. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_older_than(Utc::now() - self.config.retention())
    }

    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut history = self.history.write();
        let before = history.len();
        history.retain(|r| r.timestamp >= cutoff);
        let removed = before - history.len();
        drop(history);
        self.recent.lock().retain(|r| r.timestamp >= cutoff);
        if removed > 0 {
            info!(removed, "Purged expired metric records");
        }
        removed
    }

    pub fn generate_report(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> PerformanceReport {
        let history = self.history.read();
        PerformanceReport::build(&history, start, end)
    }

    /// Trivial read on the metrics table, classified by latency.
    pub async fn health_check(&self) -> RecorderHealth {
        let records_in_memory = self.len();
        let Some(store) = &self.store else {
            return RecorderHealth {
                status: HealthStatus::Healthy,
                latency_ms: 0,
                error: None,
                records_in_memory,
            };
        };

        let started = tokio::time::Instant::now();
        let result = tokio::time::timeout(Duration::from_millis(WARNING_PING_MS * 2), store.ping()).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (status, error) = match result {
            Ok(Ok(())) if latency_ms < HEALTHY_PING_MS => (HealthStatus::Healthy, None),
            Ok(Ok(())) if latency_ms < WARNING_PING_MS => (HealthStatus::Warning, None),
            Ok(Ok(())) => (HealthStatus::Critical, Some(format!("slow store read: {}ms", latency_ms))),
            Ok(Err(e)) => (HealthStatus::Critical, Some(e.to_string())),
            Err(_) => (HealthStatus::Critical, Some("store read timed out".to_string())),
        };

        RecorderHealth {
            status,
            latency_ms,
            error,
            records_in_memory,
        }
    }

    /// Start the periodic retention sweep.
    pub fn start(self: &Arc<Self>) {
        if self.tasks.is_running() {
            return;
        }
        let recorder = Arc::clone(self);
        self.tasks.push(BackgroundTask::spawn_interval(
            "metrics_retention",
            self.config.retention_sweep_interval(),
            move || {
                let recorder = recorder.clone();
                async move {
                    recorder.purge_expired();
                }
            },
        ));
    }

    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
    }
}
