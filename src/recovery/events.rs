// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure events and their classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::SyncError;
use crate::storage::traits::{Row, StoreError};
use crate::validation::RuleSeverity;

/// Table failure events are persisted to
pub const FAILURES_TABLE: &str = "sync_failures";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureType {
    Network,
    Database,
    Timeout,
    Validation,
    System,
    Unknown,
}

impl FailureType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Database => "database",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::System => "system",
            Self::Unknown => "unknown",
        }
    }

    /// Classify an error surfaced by the engine or the optimizer.
    #[must_use]
    pub fn from_error(error: &SyncError) -> Self {
        match error {
            SyncError::Timeout { .. } => Self::Timeout,
            SyncError::PoolExhausted { .. } | SyncError::CircuitOpen { .. } => Self::Network,
            SyncError::Store(StoreError::Serialization(_)) => Self::System,
            SyncError::Store(_) => Self::Database,
            SyncError::ValidationFailed { .. } | SyncError::ConsistencyViolation { .. } => Self::Validation,
            SyncError::BackupCorrupt { .. }
            | SyncError::Compression(_)
            | SyncError::Serialization(_)
            | SyncError::Shutdown => Self::System,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl FailureSeverity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Default severity for an error. Rejected records are low: retrying
    /// the same payload cannot fix them.
    #[must_use]
    pub fn for_error(error: &SyncError) -> Self {
        match error {
            SyncError::ValidationFailed { severity: RuleSeverity::Critical, .. } => Self::High,
            SyncError::ValidationFailed { .. } | SyncError::InvalidOperation(_) | SyncError::OperationUnsupported(_) => {
                Self::Low
            }
            SyncError::CircuitOpen { .. } | SyncError::BackupCorrupt { .. } | SyncError::ConsistencyViolation { .. } => {
                Self::High
            }
            SyncError::RecoveryExhausted { .. } => Self::Critical,
            _ => Self::Medium,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub failure_type: FailureType,
    pub severity: FailureSeverity,
    /// Name of the operation that failed (matches `register_operation`)
    pub operation: String,
    pub error: String,
    /// Free-form context; `table` and `data` are backed up before recovery
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution_method: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub affected_records: Option<u64>,
}

impl FailureEvent {
    pub fn new(
        failure_type: FailureType,
        severity: FailureSeverity,
        operation: impl Into<String>,
        error: impl Into<String>,
        context: Map<String, Value>,
    ) -> Self {
        let affected_records = context.get("affected_records").and_then(Value::as_u64).or_else(|| {
            context
                .get("data")
                .and_then(Value::as_array)
                .map(|rows| rows.len() as u64)
        });
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            failure_type,
            severity,
            operation: operation.into(),
            error: error.into(),
            context,
            resolved: false,
            resolved_at: None,
            resolution_method: None,
            retry_count: 0,
            affected_records,
        }
    }

    pub(crate) fn mark_resolved(&mut self, method: &str) {
        self.resolved = true;
        self.resolved_at = Some(Utc::now());
        self.resolution_method = Some(method.to_string());
    }

    /// Context payload worth backing up: `{ table, data }` when `data` is present.
    #[must_use]
    pub fn recoverable_payload(&self) -> Option<Value> {
        let data = self.context.get("data").filter(|v| !v.is_null())?;
        let mut payload = Map::new();
        payload.insert(
            "table".into(),
            self.context.get("table").cloned().unwrap_or(Value::Null),
        );
        payload.insert("data".into(), data.clone());
        Some(Value::Object(payload))
    }

    pub(crate) fn to_row(&self) -> Option<Row> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}
