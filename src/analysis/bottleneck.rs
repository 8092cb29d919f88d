// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bottleneck analysis over recorded metrics.
//!
//! Per operation kind the live averages are compared with the kind's
//! baseline (latency, throughput, error rate, memory). System-wide checks
//! look at concurrency, network latency and per-record database time.
//! Analysis is a pure function of the supplied records; baselines change
//! only through [`BottleneckAnalyzer::analyze_and_update_baselines`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::monitor::{BaselineRegistry, MetricRecord, MetricsRecorder, OperationKind, PerformanceBaseline};

const LATENCY_FACTOR: f64 = 1.5;
const THROUGHPUT_FACTOR: f64 = 0.7;
const ERROR_RATE_FACTOR: f64 = 2.0;
const MEMORY_FACTOR: f64 = 2.0;
const MAX_AVG_CONCURRENCY: f64 = 10.0;
const MAX_NETWORK_LATENCY_MS: f64 = 200.0;
const MAX_RECORD_DB_MS: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckType {
    Latency,
    Throughput,
    ErrorRate,
    Memory,
    Concurrency,
    Network,
    Database,
}

impl BottleneckType {
    #[must_use]
    pub fn weight(&self) -> u32 {
        match self {
            Self::ErrorRate => 4,
            Self::Latency | Self::Database => 3,
            Self::Throughput | Self::Memory | Self::Concurrency | Self::Network => 2,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Latency => "latency",
            Self::Throughput => "throughput",
            Self::ErrorRate => "error_rate",
            Self::Memory => "memory",
            Self::Concurrency => "concurrency",
            Self::Network => "network",
            Self::Database => "database",
        }
    }

    /// Fixed advice per finding type
    #[must_use]
    pub fn recommendations(&self) -> Vec<String> {
        let items: &[&str] = match self {
            Self::Latency => &[
                "Add indexes for the columns used in sync filters",
                "Reduce batch size to shorten individual round trips",
                "Enable response caching for repeated reads",
            ],
            Self::Throughput => &[
                "Increase batch size to amortize per-request overhead",
                "Raise the concurrency limit if the backend has headroom",
                "Enable payload compression for large transfers",
            ],
            Self::ErrorRate => &[
                "Inspect recent failure events for a common cause",
                "Tighten validation before records are queued",
                "Review retry and circuit breaker thresholds",
            ],
            Self::Memory => &[
                "Process large syncs in smaller chunks",
                "Lower cache sizes or TTLs",
            ],
            Self::Concurrency => &[
                "Lower the concurrency limit to reduce contention",
                "Spread scheduled syncs across time",
            ],
            Self::Network => &[
                "Enable compression to cut transfer size",
                "Batch small requests together",
                "Check connectivity to the backing store",
            ],
            Self::Database => &[
                "Profile slow queries and add missing indexes",
                "Use bulk writes instead of per-row statements",
            ],
        };
        items.iter().map(|s| (*s).to_string()).collect()
    }
}

impl std::fmt::Display for BottleneckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// `≥3×` critical, `≥2×` high, `≥1.5×` medium, else low.
    #[must_use]
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 3.0 {
            Self::Critical
        } else if ratio >= 2.0 {
            Self::High
        } else if ratio >= 1.5 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    #[must_use]
    pub fn weight(&self) -> u32 {
        match self {
            Self::Critical => 4,
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }

    /// Points deducted from the 100-point score
    #[must_use]
    pub fn penalty(&self) -> u32 {
        match self {
            Self::Critical => 25,
            Self::High => 15,
            Self::Medium => 8,
            Self::Low => 3,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Bottleneck {
    pub kind: BottleneckType,
    pub severity: Severity,
    /// `None` for system-wide findings
    pub operation: Option<OperationKind>,
    pub current_value: f64,
    pub expected_value: f64,
    /// How far the value is past its expectation (always ≥ 1 for a finding)
    pub ratio: f64,
    pub impact: String,
    pub recommendations: Vec<String>,
    pub priority: u32,
}

impl Bottleneck {
    fn new(kind: BottleneckType, operation: Option<OperationKind>, current: f64, expected: f64, ratio: f64, impact: String) -> Self {
        let severity = Severity::from_ratio(ratio);
        Self {
            kind,
            severity,
            operation,
            current_value: current,
            expected_value: expected,
            ratio,
            impact,
            recommendations: kind.recommendations(),
            priority: severity.weight() * kind.weight(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionItem {
    pub kind: BottleneckType,
    pub operation: Option<OperationKind>,
    pub description: String,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ActionPlan {
    /// Critical and high findings
    pub immediate: Vec<ActionItem>,
    /// Medium findings
    pub short_term: Vec<ActionItem>,
    /// Low findings
    pub long_term: Vec<ActionItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemBottlenecks {
    /// Sorted by priority, highest first
    pub bottlenecks: Vec<Bottleneck>,
    /// 0-100, higher is healthier
    pub score: u32,
    pub action_plan: ActionPlan,
    pub analyzed_records: usize,
    pub analyzed_at: DateTime<Utc>,
}

impl SystemBottlenecks {
    #[must_use]
    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.bottlenecks.iter().filter(|b| b.severity == severity).count()
    }

    #[must_use]
    pub fn find(&self, kind: BottleneckType, operation: Option<OperationKind>) -> Option<&Bottleneck> {
        self.bottlenecks.iter().find(|b| b.kind == kind && b.operation == operation)
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// `a / b` with a zero divisor treated as a tiny positive number.
fn ratio(a: f64, b: f64) -> f64 {
    a / b.max(f64::EPSILON)
}

pub struct BottleneckAnalyzer {
    baselines: Arc<BaselineRegistry>,
}

impl BottleneckAnalyzer {
    pub fn new(baselines: Arc<BaselineRegistry>) -> Self {
        Self { baselines }
    }

    #[must_use]
    pub fn baselines(&self) -> &Arc<BaselineRegistry> {
        &self.baselines
    }

    /// Analyze the recorder's records from the last `window`.
    pub fn analyze_window(&self, recorder: &MetricsRecorder, window: std::time::Duration) -> SystemBottlenecks {
        let since = Utc::now() - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(1));
        self.analyze(&recorder.records_since(since))
    }

    /// Analyze `records` against the current baselines.
    pub fn analyze(&self, records: &[MetricRecord]) -> SystemBottlenecks {
        let mut groups: BTreeMap<OperationKind, Vec<&MetricRecord>> = BTreeMap::new();
        for r in records {
            groups.entry(r.operation).or_default().push(r);
        }

        let mut bottlenecks = Vec::new();
        for (operation, group) in &groups {
            if let Some(baseline) = self.baselines.get(*operation) {
                check_operation(*operation, group, &baseline, &mut bottlenecks);
            }
        }
        check_concurrency(records, &mut bottlenecks);
        check_network(records, &mut bottlenecks);
        check_database(records, &mut bottlenecks);

        bottlenecks.sort_by(|a, b| b.priority.cmp(&a.priority).then(b.ratio.total_cmp(&a.ratio)));

        let penalty: u32 = bottlenecks.iter().map(|b| b.severity.penalty()).sum();
        let score = 100u32.saturating_sub(penalty);

        let mut action_plan = ActionPlan::default();
        for b in &bottlenecks {
            let item = ActionItem {
                kind: b.kind,
                operation: b.operation,
                description: b.impact.clone(),
                recommendations: b.recommendations.clone(),
            };
            match b.severity {
                Severity::Critical | Severity::High => action_plan.immediate.push(item),
                Severity::Medium => action_plan.short_term.push(item),
                Severity::Low => action_plan.long_term.push(item),
            }
        }

        for severity in [Severity::Critical, Severity::High, Severity::Medium, Severity::Low] {
            let n = bottlenecks.iter().filter(|b| b.severity == severity).count();
            if n > 0 {
                crate::metrics::record_bottlenecks(severity.as_str(), n);
            }
        }
        debug!(records = records.len(), findings = bottlenecks.len(), score, "Bottleneck analysis complete");

        SystemBottlenecks {
            bottlenecks,
            score,
            action_plan,
            analyzed_records: records.len(),
            analyzed_at: Utc::now(),
        }
    }

    /// Analyze, then refresh the baseline of every kind with enough samples.
    pub fn analyze_and_update_baselines(&self, records: &[MetricRecord]) -> SystemBottlenecks {
        let result = self.analyze(records);
        for operation in OperationKind::ALL {
            let samples: Vec<&MetricRecord> = records.iter().filter(|r| r.operation == operation).collect();
            if self.baselines.update_from_samples(operation, &samples).is_some() {
                info!(operation = %operation, "Baseline refreshed after analysis");
            }
        }
        result
    }
}

fn check_operation(operation: OperationKind, group: &[&MetricRecord], baseline: &PerformanceBaseline, out: &mut Vec<Bottleneck>) {
    if let Some(latency) = mean(group.iter().map(|r| r.duration_ms as f64)) {
        if latency > baseline.expected_latency_ms * LATENCY_FACTOR {
            let r = ratio(latency, baseline.expected_latency_ms);
            out.push(Bottleneck::new(
                BottleneckType::Latency,
                Some(operation),
                latency,
                baseline.expected_latency_ms,
                r,
                format!(
                    "{} takes {:.0}ms on average, {:.1}x the {:.0}ms baseline",
                    operation, latency, r, baseline.expected_latency_ms
                ),
            ));
        }
    }

    let with_rows = group.iter().filter(|r| r.records_processed > 0);
    if let Some(throughput) = mean(with_rows.map(|r| r.throughput)) {
        if throughput < baseline.expected_throughput * THROUGHPUT_FACTOR {
            let r = ratio(baseline.expected_throughput, throughput);
            out.push(Bottleneck::new(
                BottleneckType::Throughput,
                Some(operation),
                throughput,
                baseline.expected_throughput,
                r,
                format!(
                    "{} processes {:.1} records/s against an expected {:.1}",
                    operation, throughput, baseline.expected_throughput
                ),
            ));
        }
    }

    if let Some(error_rate) = mean(group.iter().map(|r| r.error_rate)) {
        if error_rate > baseline.expected_error_rate * ERROR_RATE_FACTOR {
            let r = ratio(error_rate, baseline.expected_error_rate);
            out.push(Bottleneck::new(
                BottleneckType::ErrorRate,
                Some(operation),
                error_rate,
                baseline.expected_error_rate,
                r,
                format!(
                    "{} fails {:.1}% of records, {:.1}x the expected {:.1}%",
                    operation, error_rate, r, baseline.expected_error_rate
                ),
            ));
        }
    }

    if let Some(memory) = mean(group.iter().filter_map(|r| r.resources.memory_mb)) {
        if memory > baseline.expected_memory_mb * MEMORY_FACTOR {
            let r = ratio(memory, baseline.expected_memory_mb);
            out.push(Bottleneck::new(
                BottleneckType::Memory,
                Some(operation),
                memory,
                baseline.expected_memory_mb,
                r,
                format!("{} uses {:.0}MB against an expected {:.0}MB", operation, memory, baseline.expected_memory_mb),
            ));
        }
    }
}

/// Average number of operations started per one-second window.
fn check_concurrency(records: &[MetricRecord], out: &mut Vec<Bottleneck>) {
    let mut per_second: BTreeMap<i64, usize> = BTreeMap::new();
    for r in records {
        *per_second.entry(r.start_time.timestamp()).or_default() += 1;
    }
    let Some(avg) = mean(per_second.values().map(|n| *n as f64)) else {
        return;
    };
    if avg > MAX_AVG_CONCURRENCY {
        let r = ratio(avg, MAX_AVG_CONCURRENCY);
        out.push(Bottleneck::new(
            BottleneckType::Concurrency,
            None,
            avg,
            MAX_AVG_CONCURRENCY,
            r,
            format!("{:.1} operations start per second on average", avg),
        ));
    }
}

fn check_network(records: &[MetricRecord], out: &mut Vec<Bottleneck>) {
    let Some(avg) = mean(records.iter().filter_map(|r| r.resources.network_latency_ms)) else {
        return;
    };
    if avg > MAX_NETWORK_LATENCY_MS {
        let r = ratio(avg, MAX_NETWORK_LATENCY_MS);
        out.push(Bottleneck::new(
            BottleneckType::Network,
            None,
            avg,
            MAX_NETWORK_LATENCY_MS,
            r,
            format!("Network latency averages {:.0}ms", avg),
        ));
    }
}

fn check_database(records: &[MetricRecord], out: &mut Vec<Bottleneck>) {
    let Some(avg) = mean(records.iter().filter(|r| r.records_processed > 0).map(|r| r.avg_latency_ms)) else {
        return;
    };
    if avg > MAX_RECORD_DB_MS {
        let r = ratio(avg, MAX_RECORD_DB_MS);
        out.push(Bottleneck::new(
            BottleneckType::Database,
            None,
            avg,
            MAX_RECORD_DB_MS,
            r,
            format!("Each record takes {:.0}ms of store time on average", avg),
        ));
    }
}
