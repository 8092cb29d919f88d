// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-operation metric records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// What kind of sync work a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ProductSync,
    RealtimeEvent,
    CatalogSync,
    SupplierSync,
    InventorySync,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        Self::ProductSync,
        Self::RealtimeEvent,
        Self::CatalogSync,
        Self::SupplierSync,
        Self::InventorySync,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProductSync => "product_sync",
            Self::RealtimeEvent => "realtime_event",
            Self::CatalogSync => "catalog_sync",
            Self::SupplierSync => "supplier_sync",
            Self::InventorySync => "inventory_sync",
        }
    }

    /// Route a table name to the kind its writes are reported under.
    #[must_use]
    pub fn for_table(table: &str) -> Self {
        match table {
            "products" => Self::ProductSync,
            "suppliers" => Self::SupplierSync,
            "categories" | "catalog" | "catalogs" => Self::CatalogSync,
            t if t.starts_with("inventory") || t == "stock_movements" => Self::InventorySync,
            _ => Self::RealtimeEvent,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Success,
    Partial,
    Failed,
}

impl RecordStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

/// Optional resource readings attached to a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceReadings {
    pub memory_mb: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub network_latency_ms: Option<f64>,
}

/// One completed operation attempt. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub id: String,
    pub operation: OperationKind,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub records_processed: u64,
    pub records_success: u64,
    pub records_error: u64,
    /// Percentage of processed records that failed (0-100)
    pub error_rate: f64,
    /// Records per second
    pub throughput: f64,
    /// `duration_ms / max(records_processed, 1)`
    pub avg_latency_ms: f64,
    #[serde(flatten)]
    pub resources: ResourceReadings,
    pub status: RecordStatus,
    pub errors: Vec<String>,
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl MetricRecord {
    /// Build a record, deriving error count, rates and status.
    ///
    /// `succeeded` is clamped to `processed`; an `end` before `start` counts
    /// as zero duration.
    #[must_use]
    pub fn new(
        operation: OperationKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        processed: u64,
        succeeded: u64,
        errors: Vec<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        let succeeded = succeeded.min(processed);
        let records_error = processed - succeeded;
        let duration_ms = u64::try_from((end - start).num_milliseconds()).unwrap_or(0);

        let error_rate = if processed == 0 {
            0.0
        } else {
            records_error as f64 / processed as f64 * 100.0
        };
        // Sub-millisecond operations are treated as taking 1ms
        let duration_secs = duration_ms.max(1) as f64 / 1000.0;
        let throughput = processed as f64 / duration_secs;
        let avg_latency_ms = duration_ms as f64 / processed.max(1) as f64;

        let status = if records_error == 0 && errors.is_empty() {
            RecordStatus::Success
        } else if succeeded == 0 {
            RecordStatus::Failed
        } else {
            RecordStatus::Partial
        };

        Self {
            id: Uuid::new_v4().to_string(),
            operation,
            start_time: start,
            end_time: end,
            duration_ms,
            records_processed: processed,
            records_success: succeeded,
            records_error,
            error_rate,
            throughput,
            avg_latency_ms,
            resources: ResourceReadings::default(),
            status,
            errors,
            metadata,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_resources(mut self, resources: ResourceReadings) -> Self {
        self.resources = resources;
        self
    }

    /// Metadata value as `f64`, if present and numeric.
    #[must_use]
    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(Value::as_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap() + Duration::milliseconds(ms)
    }

    #[test]
    fn test_derived_fields() {
        let r = MetricRecord::new(OperationKind::ProductSync, at(0), at(2000), 100, 80, vec![], Map::new());

        assert_eq!(r.records_error, 20);
        assert!((r.error_rate - 20.0).abs() < f64::EPSILON);
        assert!((r.throughput - 50.0).abs() < f64::EPSILON);
        assert!((r.avg_latency_ms - 20.0).abs() < f64::EPSILON);
        assert_eq!(r.duration_ms, 2000);
        assert_eq!(r.status, RecordStatus::Partial);
    }

    #[test]
    fn test_zero_processed_has_zero_error_rate() {
        let r = MetricRecord::new(OperationKind::RealtimeEvent, at(0), at(10), 0, 0, vec![], Map::new());
        assert_eq!(r.error_rate, 0.0);
        assert_eq!(r.avg_latency_ms, 10.0);
        assert_eq!(r.status, RecordStatus::Success);
    }

    #[test]
    fn test_status_classification() {
        let ok = MetricRecord::new(OperationKind::CatalogSync, at(0), at(5), 3, 3, vec![], Map::new());
        assert_eq!(ok.status, RecordStatus::Success);

        let failed = MetricRecord::new(OperationKind::CatalogSync, at(0), at(5), 3, 0, vec!["down".into()], Map::new());
        assert_eq!(failed.status, RecordStatus::Failed);

        let errored_without_rows =
            MetricRecord::new(OperationKind::CatalogSync, at(0), at(5), 0, 0, vec!["timeout".into()], Map::new());
        assert_eq!(errored_without_rows.status, RecordStatus::Failed);
    }

    #[test]
    fn test_success_clamped_and_negative_duration() {
        let r = MetricRecord::new(OperationKind::SupplierSync, at(100), at(0), 5, 9, vec![], Map::new());
        assert_eq!(r.records_success, 5);
        assert_eq!(r.records_error, 0);
        assert_eq!(r.duration_ms, 0);
    }

    #[test]
    fn test_for_table_routing() {
        assert_eq!(OperationKind::for_table("products"), OperationKind::ProductSync);
        assert_eq!(OperationKind::for_table("suppliers"), OperationKind::SupplierSync);
        assert_eq!(OperationKind::for_table("inventory_movements"), OperationKind::InventorySync);
        assert_eq!(OperationKind::for_table("categories"), OperationKind::CatalogSync);
        assert_eq!(OperationKind::for_table("sales"), OperationKind::RealtimeEvent);
    }

    #[test]
    fn test_serializes_snake_case_with_flattened_resources() {
        let r = MetricRecord::new(OperationKind::InventorySync, at(0), at(1), 1, 1, vec![], Map::new())
            .with_resources(ResourceReadings { memory_mb: Some(12.0), ..Default::default() });
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["operation"], "inventory_sync");
        assert_eq!(v["status"], "success");
        assert_eq!(v["memory_mb"], 12.0);
    }
}
