// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Aggregated performance report over a time window.

use chrono::{DateTime, DurationRound, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use super::record::{MetricRecord, OperationKind};

const TOP_N: usize = 5;
const MIN_SUCCESS_RATE: f64 = 95.0;
const MAX_AVG_DURATION_MS: f64 = 5000.0;
const MIN_AVG_THROUGHPUT: f64 = 10.0;
const MAX_OPERATION_ERROR_RATE: f64 = 5.0;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportSummary {
    pub total_operations: usize,
    /// Successful records / processed records, in percent (100 when nothing was processed)
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub avg_throughput: f64,
    pub avg_latency_ms: f64,
    pub total_records_processed: u64,
    pub total_records_success: u64,
    pub total_records_error: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationBreakdown {
    pub operation: OperationKind,
    pub count: usize,
    pub avg_duration_ms: f64,
    pub avg_throughput: f64,
    pub avg_error_rate: f64,
    pub total_processed: u64,
}

/// Short form of a record for the top-N lists
#[derive(Debug, Clone, Serialize)]
pub struct RecordDigest {
    pub id: String,
    pub operation: OperationKind,
    pub duration_ms: u64,
    pub error_rate: f64,
    pub throughput: f64,
    pub timestamp: DateTime<Utc>,
}

impl From<&MetricRecord> for RecordDigest {
    fn from(r: &MetricRecord) -> Self {
        Self {
            id: r.id.clone(),
            operation: r.operation,
            duration_ms: r.duration_ms,
            error_rate: r.error_rate,
            throughput: r.throughput,
            timestamp: r.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HourlyTrend {
    /// Start of the hour bucket
    pub hour: DateTime<Utc>,
    pub count: usize,
    pub avg_duration_ms: f64,
    pub avg_error_rate: f64,
    pub avg_throughput: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub summary: ReportSummary,
    pub by_operation: Vec<OperationBreakdown>,
    pub slowest: Vec<RecordDigest>,
    pub highest_error_rate: Vec<RecordDigest>,
    pub lowest_throughput: Vec<RecordDigest>,
    pub hourly_trends: Vec<HourlyTrend>,
    pub recommendations: Vec<String>,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

fn top<F>(records: &[&MetricRecord], mut cmp: F) -> Vec<RecordDigest>
where
    F: FnMut(&MetricRecord, &MetricRecord) -> std::cmp::Ordering,
{
    let mut sorted = records.to_vec();
    sorted.sort_by(|a, b| cmp(*a, *b));
    sorted.into_iter().take(TOP_N).map(RecordDigest::from).collect()
}

impl PerformanceReport {
    /// Aggregate `records` whose timestamp falls in `[start, end]`.
    #[must_use]
    pub fn build(records: &[MetricRecord], start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let window: Vec<&MetricRecord> = records
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .collect();

        let summary = summarize(&window);
        let by_operation = breakdown(&window);
        let hourly_trends = hourly(&window);

        let slowest = top(&window, |a, b| b.duration_ms.cmp(&a.duration_ms));
        let highest_error_rate = top(&window, |a, b| b.error_rate.total_cmp(&a.error_rate));
        let lowest_throughput = top(&window, |a, b| a.throughput.total_cmp(&b.throughput));

        let recommendations = recommend(&summary, &by_operation);

        Self {
            period_start: start,
            period_end: end,
            generated_at: Utc::now(),
            summary,
            by_operation,
            slowest,
            highest_error_rate,
            lowest_throughput,
            hourly_trends,
            recommendations,
        }
    }
}

fn summarize(window: &[&MetricRecord]) -> ReportSummary {
    let processed: u64 = window.iter().map(|r| r.records_processed).sum();
    let success: u64 = window.iter().map(|r| r.records_success).sum();
    let error: u64 = window.iter().map(|r| r.records_error).sum();

    ReportSummary {
        total_operations: window.len(),
        success_rate: if processed == 0 {
            100.0
        } else {
            success as f64 / processed as f64 * 100.0
        },
        avg_duration_ms: mean(window.iter().map(|r| r.duration_ms as f64)),
        avg_throughput: mean(window.iter().map(|r| r.throughput)),
        avg_latency_ms: mean(window.iter().map(|r| r.avg_latency_ms)),
        total_records_processed: processed,
        total_records_success: success,
        total_records_error: error,
    }
}

fn breakdown(window: &[&MetricRecord]) -> Vec<OperationBreakdown> {
    let mut groups: BTreeMap<OperationKind, Vec<&MetricRecord>> = BTreeMap::new();
    for r in window {
        groups.entry(r.operation).or_default().push(r);
    }
    groups
        .into_iter()
        .map(|(operation, rs)| OperationBreakdown {
            operation,
            count: rs.len(),
            avg_duration_ms: mean(rs.iter().map(|r| r.duration_ms as f64)),
            avg_throughput: mean(rs.iter().map(|r| r.throughput)),
            avg_error_rate: mean(rs.iter().map(|r| r.error_rate)),
            total_processed: rs.iter().map(|r| r.records_processed).sum(),
        })
        .collect()
}

fn hourly(window: &[&MetricRecord]) -> Vec<HourlyTrend> {
    let mut buckets: BTreeMap<DateTime<Utc>, Vec<&MetricRecord>> = BTreeMap::new();
    for r in window {
        let hour = r.timestamp.duration_trunc(chrono::Duration::hours(1)).unwrap_or(r.timestamp);
        buckets.entry(hour).or_default().push(r);
    }
    buckets
        .into_iter()
        .map(|(hour, rs)| HourlyTrend {
            hour,
            count: rs.len(),
            avg_duration_ms: mean(rs.iter().map(|r| r.duration_ms as f64)),
            avg_error_rate: mean(rs.iter().map(|r| r.error_rate)),
            avg_throughput: mean(rs.iter().map(|r| r.throughput)),
        })
        .collect()
}

fn recommend(summary: &ReportSummary, by_operation: &[OperationBreakdown]) -> Vec<String> {
    let mut out = Vec::new();
    if summary.total_operations == 0 {
        return out;
    }
    if summary.success_rate < MIN_SUCCESS_RATE {
        out.push(format!(
            "Success rate is {:.1}%: investigate failing operations and add retry handling",
            summary.success_rate
        ));
    }
    if summary.avg_duration_ms > MAX_AVG_DURATION_MS {
        out.push(format!(
            "Average operation takes {:.0}ms: consider smaller batches or query optimization",
            summary.avg_duration_ms
        ));
    }
    if summary.avg_throughput < MIN_AVG_THROUGHPUT {
        out.push(format!(
            "Throughput is {:.1} records/s: consider batching or parallel processing",
            summary.avg_throughput
        ));
    }
    for op in by_operation {
        if op.avg_error_rate > MAX_OPERATION_ERROR_RATE {
            out.push(format!(
                "{} has a {:.1}% error rate: review its error handling",
                op.operation, op.avg_error_rate
            ));
        }
    }
    out
}
