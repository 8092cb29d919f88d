// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for sync-optimizer.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! These are process-level signals. The per-operation [`MetricRecord`]s kept
//! by the recorder are a separate, queryable history.
//!
//! # Metric Naming Convention
//! - `sync_optimizer_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size histograms
//!
//! # Labels
//! - `operation`: product_sync, realtime_event, catalog_sync, ...
//! - `table`: target table of a queued operation
//! - `outcome`: success, partial, failed, rejected, ...
//!
//! [`MetricRecord`]: crate::monitor::MetricRecord

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a terminal outcome of a queued sync operation
pub fn record_operation(operation: &str, table: &str, outcome: &str) {
    counter!(
        "sync_optimizer_operations_total",
        "operation" => operation.to_string(),
        "table" => table.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "sync_optimizer_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a retry of a queued operation or optimized request
pub fn record_retry(component: &str, operation: &str) {
    counter!(
        "sync_optimizer_retries_total",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Set sync queue depth (operations waiting for dispatch)
pub fn set_queue_depth(count: usize) {
    gauge!("sync_optimizer_queue_depth").set(count as f64);
}

/// Set number of operations currently executing
pub fn set_in_flight(count: usize) {
    gauge!("sync_optimizer_in_flight").set(count as f64);
}

/// Record an optimized request outcome
pub fn record_request(name: &str, outcome: &str) {
    counter!(
        "sync_optimizer_requests_total",
        "request" => name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a request cache lookup
pub fn record_request_cache(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!(
        "sync_optimizer_request_cache_total",
        "result" => result
    )
    .increment(1);
}

/// Set request cache size and hit rate
pub fn set_request_cache_stats(entries: usize, hit_rate: f64) {
    gauge!("sync_optimizer_request_cache_entries").set(entries as f64);
    gauge!("sync_optimizer_request_cache_hit_rate").set(hit_rate);
}

/// Set connection pool utilization (0.0 - 1.0)
pub fn set_pool_utilization(utilization: f64) {
    gauge!("sync_optimizer_pool_utilization").set(utilization);
}

/// Record a rejected pool acquire
pub fn record_pool_exhausted() {
    counter!("sync_optimizer_pool_exhausted_total").increment(1);
}

/// Record payload compression sizes
pub fn record_compression(original: usize, stored: usize) {
    histogram!("sync_optimizer_payload_bytes", "stage" => "original").record(original as f64);
    histogram!("sync_optimizer_payload_bytes", "stage" => "stored").record(stored as f64);
}

/// Record circuit breaker state change (0 = Closed, 1 = HalfOpen, 2 = Open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "sync_optimizer_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "sync_optimizer_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a failure event entering the recovery system
pub fn record_failure_event(category: &str, severity: &str) {
    counter!(
        "sync_optimizer_failures_total",
        "category" => category.to_string(),
        "severity" => severity.to_string()
    )
    .increment(1);
}

/// Record the outcome of one recovery strategy attempt
pub fn record_recovery(strategy: &str, outcome: &str) {
    counter!(
        "sync_optimizer_recovery_attempts_total",
        "strategy" => strategy.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a backup snapshot
pub fn record_backup(operation: &str, bytes: usize) {
    counter!(
        "sync_optimizer_backups_total",
        "operation" => operation.to_string()
    )
    .increment(1);
    histogram!("sync_optimizer_backup_bytes").record(bytes as f64);
}

/// Record integrity rule violations
pub fn record_validation_violations(table: &str, severity: &str, count: usize) {
    counter!(
        "sync_optimizer_validation_violations_total",
        "table" => table.to_string(),
        "severity" => severity.to_string()
    )
    .increment(count as u64);
}

/// Record an integrity validation run
pub fn record_validation_run(status: &str, duration: Duration) {
    counter!(
        "sync_optimizer_validation_runs_total",
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("sync_optimizer_validation_seconds").record(duration.as_secs_f64());
}

/// Set component health (0 = Healthy, 1 = Degraded, 2 = Critical, 3 = Offline)
pub fn set_health_rating(component: &str, rating: u8) {
    gauge!(
        "sync_optimizer_health_rating",
        "component" => component.to_string()
    )
    .set(rating as f64);
}

/// Record a best-effort persistence write that failed
pub fn record_persist_error(table: &str) {
    counter!(
        "sync_optimizer_persist_errors_total",
        "table" => table.to_string()
    )
    .increment(1);
}

/// Record detected bottlenecks
pub fn record_bottlenecks(severity: &str, count: usize) {
    counter!(
        "sync_optimizer_bottlenecks_total",
        "severity" => severity.to_string()
    )
    .increment(count as u64);
}

/// Record a completed load or stress test
pub fn record_load_test(kind: &str, passed: bool) {
    counter!(
        "sync_optimizer_load_tests_total",
        "kind" => kind.to_string(),
        "passed" => if passed { "true" } else { "false" }
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($component:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($component, $op)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    // Without a recorder installed these are no-ops; they must not panic.

    #[test]
    fn test_emitters_without_recorder() {
        record_operation("product_sync", "products", "success");
        record_latency("engine", "insert", Duration::from_millis(5));
        set_queue_depth(3);
        set_in_flight(1);
        record_request_cache(true);
        set_pool_utilization(0.5);
        set_circuit_state("products", 2);
        record_recovery("simple_retry", "success");
        set_health_rating("backing_store", 0);
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("engine", "insert");
            std::thread::sleep(Duration::from_micros(10));
        }
    }

    #[test]
    fn test_counters_reach_local_recorder() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_operation("product_sync", "products", "success");
            record_operation("product_sync", "products", "success");
            record_pool_exhausted();
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let ops = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "sync_optimizer_operations_total")
            .map(|(_, _, _, value)| value.clone());
        assert_eq!(ops, Some(&DebugValue::Counter(2)));

        let exhausted = snapshot
            .iter()
            .any(|(key, _, _, _)| key.key().name() == "sync_optimizer_pool_exhausted_total");
        assert!(exhausted);
    }
}
