// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Load test results and the pass/fail verdict.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use super::config::{Ceilings, LoadOperation};
use crate::analysis::Bottleneck;
use crate::monitor::{BaselineRegistry, ResourceSample};

/// Average latency above this multiple of the baseline fails the run
pub const LATENCY_BASELINE_FACTOR: f64 = 2.0;

/// Nearest-rank percentile of an ascending slice (0 when empty).
#[must_use]
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Latency and outcome figures for one action type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationStats {
    pub count: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Percent
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
}

impl OperationStats {
    /// Summarise `(latency_ms, succeeded)` samples.
    #[must_use]
    pub fn from_samples(samples: &[(f64, bool)]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut latencies: Vec<f64> = samples.iter().map(|(l, _)| *l).collect();
        latencies.sort_by(f64::total_cmp);
        let count = samples.len() as u64;
        let succeeded = samples.iter().filter(|(_, ok)| *ok).count() as u64;
        let failed = count - succeeded;
        Self {
            count,
            succeeded,
            failed,
            error_rate: failed as f64 / count as f64 * 100.0,
            avg_latency_ms: latencies.iter().sum::<f64>() / latencies.len() as f64,
            min_latency_ms: latencies[0],
            max_latency_ms: latencies[latencies.len() - 1],
            p50_latency_ms: percentile(&latencies, 50.0),
            p95_latency_ms: percentile(&latencies, 95.0),
            p99_latency_ms: percentile(&latencies, 99.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    Load,
    Stress,
}

impl TestKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Stress => "stress",
        }
    }
}

/// One escalation step of a stress test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StressStep {
    pub users: usize,
    pub operations: u64,
    pub error_rate: f64,
    pub throughput: f64,
    pub p95_latency_ms: f64,
    pub peak: ResourceSample,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StressSummary {
    pub steps: Vec<StressStep>,
    /// Highest user count whose step stayed under every threshold
    pub max_stable_users: usize,
    /// Which threshold ended the escalation, if any did
    pub breaking_point: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub test_id: String,
    pub name: String,
    pub kind: TestKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub operations: BTreeMap<LoadOperation, OperationStats>,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// Operations per second over the whole run
    pub throughput: f64,
    /// Percent
    pub error_rate: f64,
    pub peak: ResourceSample,
    pub bottlenecks: Vec<Bottleneck>,
    pub passed: bool,
    pub failure_reasons: Vec<String>,
    pub stress: Option<StressSummary>,
}

impl TestResult {
    /// Reasons the run fails against `baselines` and `ceilings`; empty means pass.
    #[must_use]
    pub fn evaluate(&self, baselines: &BaselineRegistry, ceilings: &Ceilings) -> Vec<String> {
        let mut reasons = Vec::new();
        for (operation, stats) in &self.operations {
            if stats.count == 0 {
                continue;
            }
            let Some(baseline) = baselines.get(operation.metric_kind()) else {
                continue;
            };
            let limit = baseline.expected_latency_ms * LATENCY_BASELINE_FACTOR;
            if stats.avg_latency_ms > limit {
                reasons.push(format!(
                    "{} average latency {:.1}ms exceeds {:.1}ms ({}x baseline)",
                    operation, stats.avg_latency_ms, limit, LATENCY_BASELINE_FACTOR
                ));
            }
            if stats.error_rate > baseline.expected_error_rate {
                reasons.push(format!(
                    "{} error rate {:.1}% exceeds baseline {:.1}%",
                    operation, stats.error_rate, baseline.expected_error_rate
                ));
            }
        }
        if self.error_rate > ceilings.max_error_rate {
            reasons.push(format!(
                "overall error rate {:.1}% exceeds {:.1}%",
                self.error_rate, ceilings.max_error_rate
            ));
        }
        if self.peak.memory_mb > ceilings.max_memory_mb {
            reasons.push(format!(
                "peak memory {:.1}MB exceeds {:.1}MB",
                self.peak.memory_mb, ceilings.max_memory_mb
            ));
        }
        if self.peak.cpu_percent > ceilings.max_cpu_percent {
            reasons.push(format!(
                "peak CPU {:.1}% exceeds {:.1}%",
                self.peak.cpu_percent, ceilings.max_cpu_percent
            ));
        }
        reasons
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{OperationKind, PerformanceBaseline};

    #[test]
    fn test_percentile_nearest_rank() {
        let sorted: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&sorted, 95.0), 95.0);
        assert_eq!(percentile(&sorted, 99.0), 99.0);
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&[7.0], 99.0), 7.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_stats_from_samples() {
        let samples = [(10.0, true), (30.0, false), (20.0, true), (40.0, true)];
        let stats = OperationStats::from_samples(&samples);
        assert_eq!(stats.count, 4);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.error_rate, 25.0);
        assert_eq!(stats.avg_latency_ms, 25.0);
        assert_eq!(stats.min_latency_ms, 10.0);
        assert_eq!(stats.max_latency_ms, 40.0);
        assert_eq!(stats.p50_latency_ms, 20.0);
    }

    fn result_with(op: LoadOperation, stats: OperationStats, peak: ResourceSample) -> TestResult {
        let error_rate = stats.error_rate;
        TestResult {
            test_id: "t".into(),
            name: "t".into(),
            kind: TestKind::Load,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            duration_ms: 1000,
            total_operations: stats.count,
            successful_operations: stats.succeeded,
            failed_operations: stats.failed,
            operations: BTreeMap::from([(op, stats)]),
            avg_latency_ms: 0.0,
            p95_latency_ms: 0.0,
            p99_latency_ms: 0.0,
            throughput: 0.0,
            error_rate,
            peak,
            bottlenecks: Vec::new(),
            passed: false,
            failure_reasons: Vec::new(),
            stress: None,
        }
    }

    #[test]
    fn test_verdict_against_baseline_and_ceilings() {
        let baselines = BaselineRegistry::empty();
        baselines.set(PerformanceBaseline::new(OperationKind::RealtimeEvent, 100.0, 10.0, 1.0, 50.0));
        let ceilings = Ceilings::default();

        let fast = OperationStats::from_samples(&[(50.0, true); 10]);
        let ok = result_with(LoadOperation::Read, fast, ResourceSample::default());
        assert!(ok.evaluate(&baselines, &ceilings).is_empty());

        let slow = OperationStats::from_samples(&[(250.0, true); 10]);
        let reasons = result_with(LoadOperation::Read, slow, ResourceSample::default()).evaluate(&baselines, &ceilings);
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("average latency"));

        let hot = ResourceSample {
            memory_mb: 2048.0,
            cpu_percent: 99.0,
        };
        let reasons = result_with(LoadOperation::Read, OperationStats::default(), hot).evaluate(&baselines, &ceilings);
        assert_eq!(reasons.len(), 2);
    }

    #[test]
    fn test_error_rate_breaches_baseline_and_ceiling() {
        let baselines = BaselineRegistry::with_defaults();
        let mut samples = vec![(1.0, true); 9];
        samples.push((1.0, false));
        let stats = OperationStats::from_samples(&samples);
        let reasons = result_with(LoadOperation::Create, stats, ResourceSample::default())
            .evaluate(&baselines, &Ceilings::default());
        // 10% beats both the product baseline (2%) and the 5% ceiling
        assert_eq!(reasons.len(), 2);
    }
}
