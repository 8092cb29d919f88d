// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Expected performance per operation kind.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use super::record::{MetricRecord, OperationKind};

/// Samples required before a baseline is recomputed from observations.
pub const MIN_BASELINE_SAMPLES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceBaseline {
    pub operation: OperationKind,
    /// Expected duration of one operation
    pub expected_latency_ms: f64,
    /// Expected records per second
    pub expected_throughput: f64,
    /// Expected error rate in percent
    pub expected_error_rate: f64,
    pub expected_memory_mb: f64,
    pub sample_count: usize,
    pub updated_at: DateTime<Utc>,
}

impl PerformanceBaseline {
    #[must_use]
    pub fn new(operation: OperationKind, latency_ms: f64, throughput: f64, error_rate: f64, memory_mb: f64) -> Self {
        Self {
            operation,
            expected_latency_ms: latency_ms,
            expected_throughput: throughput,
            expected_error_rate: error_rate,
            expected_memory_mb: memory_mb,
            sample_count: 0,
            updated_at: Utc::now(),
        }
    }

    /// Startup default for a kind
    #[must_use]
    pub fn default_for(operation: OperationKind) -> Self {
        match operation {
            OperationKind::ProductSync => Self::new(operation, 2000.0, 50.0, 2.0, 100.0),
            OperationKind::RealtimeEvent => Self::new(operation, 100.0, 100.0, 1.0, 50.0),
            OperationKind::CatalogSync => Self::new(operation, 5000.0, 20.0, 3.0, 200.0),
            OperationKind::SupplierSync => Self::new(operation, 3000.0, 30.0, 2.0, 100.0),
            OperationKind::InventorySync => Self::new(operation, 1500.0, 80.0, 1.0, 80.0),
        }
    }

    /// Averages over `records`, or `None` below [`MIN_BASELINE_SAMPLES`].
    #[must_use]
    pub fn from_samples(operation: OperationKind, records: &[&MetricRecord]) -> Option<Self> {
        if records.len() < MIN_BASELINE_SAMPLES {
            return None;
        }
        let n = records.len() as f64;
        let latency = records.iter().map(|r| r.duration_ms as f64).sum::<f64>() / n;
        let throughput = records.iter().map(|r| r.throughput).sum::<f64>() / n;
        let error_rate = records.iter().map(|r| r.error_rate).sum::<f64>() / n;
        let memory: Vec<f64> = records.iter().filter_map(|r| r.resources.memory_mb).collect();
        let memory_mb = if memory.is_empty() {
            PerformanceBaseline::default_for(operation).expected_memory_mb
        } else {
            memory.iter().sum::<f64>() / memory.len() as f64
        };

        Some(Self {
            sample_count: records.len(),
            ..Self::new(operation, latency, throughput, error_rate, memory_mb)
        })
    }
}

/// Current baseline per kind; last write wins.
pub struct BaselineRegistry {
    inner: RwLock<HashMap<OperationKind, PerformanceBaseline>>,
}

impl BaselineRegistry {
    /// Registry seeded with [`PerformanceBaseline::default_for`] every kind.
    #[must_use]
    pub fn with_defaults() -> Self {
        let map = OperationKind::ALL
            .iter()
            .map(|k| (*k, PerformanceBaseline::default_for(*k)))
            .collect();
        Self { inner: RwLock::new(map) }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn get(&self, operation: OperationKind) -> Option<PerformanceBaseline> {
        self.inner.read().get(&operation).cloned()
    }

    pub fn set(&self, baseline: PerformanceBaseline) {
        self.inner.write().insert(baseline.operation, baseline);
    }

    /// Every baseline, ordered by kind.
    #[must_use]
    pub fn all(&self) -> Vec<PerformanceBaseline> {
        let mut all: Vec<_> = self.inner.read().values().cloned().collect();
        all.sort_by_key(|b| b.operation);
        all
    }

    /// Recompute a kind's baseline from observations. No-op (returns `None`)
    /// below the sample minimum.
    pub fn update_from_samples(&self, operation: OperationKind, records: &[&MetricRecord]) -> Option<PerformanceBaseline> {
        let baseline = PerformanceBaseline::from_samples(operation, records)?;
        info!(
            operation = %operation,
            samples = baseline.sample_count,
            latency_ms = baseline.expected_latency_ms,
            "Baseline updated from samples"
        );
        self.set(baseline.clone());
        Some(baseline)
    }
}

impl Default for BaselineRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
