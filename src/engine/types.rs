// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queued operation types.
//!
//! Payloads are a closed set of typed variants, checked by
//! [`SyncOperation::validate`] before they enter the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::monitor::OperationKind;
use crate::storage::traits::{Filter, Row};

/// Selection order: critical before high before medium before low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
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

/// One scoped update inside a bulk update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowUpdate {
    pub filter: Filter,
    pub patch: Row,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum OperationPayload {
    Insert(Row),
    Update { filter: Filter, patch: Row },
    Delete { filter: Filter },
    BulkInsert(Vec<Row>),
    BulkUpdate(Vec<RowUpdate>),
}

impl OperationPayload {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert(_) => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::BulkInsert(_) => "bulk_insert",
            Self::BulkUpdate(_) => "bulk_update",
        }
    }

    #[must_use]
    pub fn is_bulk(&self) -> bool {
        matches!(self, Self::BulkInsert(_) | Self::BulkUpdate(_))
    }

    /// Records the payload carries (update/delete count as one).
    #[must_use]
    pub fn record_count(&self) -> usize {
        match self {
            Self::BulkInsert(rows) => rows.len(),
            Self::BulkUpdate(updates) => updates.len(),
            _ => 1,
        }
    }

    /// Rows being written, for validation and failure backups.
    #[must_use]
    pub fn rows(&self) -> Vec<&Row> {
        match self {
            Self::Insert(row) => vec![row],
            Self::BulkInsert(rows) => rows.iter().collect(),
            Self::Update { patch, .. } => vec![patch],
            Self::BulkUpdate(updates) => updates.iter().map(|u| &u.patch).collect(),
            Self::Delete { .. } => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: String,
    pub table: String,
    pub payload: OperationPayload,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    /// Operation ids that must succeed before this one runs
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl SyncOperation {
    pub fn new(table: impl Into<String>, payload: OperationPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            table: table.into(),
            payload,
            priority: Priority::default(),
            retry_count: 0,
            created_at: Utc::now(),
            dependencies: Vec::new(),
        }
    }

    pub fn insert(table: impl Into<String>, row: Row) -> Self {
        Self::new(table, OperationPayload::Insert(row))
    }

    pub fn update(table: impl Into<String>, filter: Filter, patch: Row) -> Self {
        Self::new(table, OperationPayload::Update { filter, patch })
    }

    pub fn delete(table: impl Into<String>, filter: Filter) -> Self {
        Self::new(table, OperationPayload::Delete { filter })
    }

    pub fn bulk_insert(table: impl Into<String>, rows: Vec<Row>) -> Self {
        Self::new(table, OperationPayload::BulkInsert(rows))
    }

    pub fn bulk_update(table: impl Into<String>, updates: Vec<RowUpdate>) -> Self {
        Self::new(table, OperationPayload::BulkUpdate(updates))
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn depends_on(mut self, operation_id: impl Into<String>) -> Self {
        self.dependencies.push(operation_id.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Kind metrics for this operation are recorded under.
    #[must_use]
    pub fn metric_kind(&self) -> OperationKind {
        OperationKind::for_table(&self.table)
    }

    /// Shape checks done at the queue boundary. Unscoped update and delete
    /// are refused outright.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SyncError::InvalidOperation("operation id is empty".into()));
        }
        if self.table.trim().is_empty() {
            return Err(SyncError::InvalidOperation(format!("operation '{}' has no table", self.id)));
        }
        if self.dependencies.iter().any(|d| *d == self.id) {
            return Err(SyncError::InvalidOperation(format!("operation '{}' depends on itself", self.id)));
        }
        match &self.payload {
            OperationPayload::Insert(row) if row.is_empty() => {
                Err(SyncError::InvalidOperation(format!("insert '{}' has an empty row", self.id)))
            }
            OperationPayload::BulkInsert(rows) if rows.is_empty() => {
                Err(SyncError::InvalidOperation(format!("bulk insert '{}' has no rows", self.id)))
            }
            OperationPayload::BulkInsert(rows) if rows.iter().any(Row::is_empty) => {
                Err(SyncError::InvalidOperation(format!("bulk insert '{}' contains an empty row", self.id)))
            }
            OperationPayload::BulkUpdate(updates) if updates.is_empty() => {
                Err(SyncError::InvalidOperation(format!("bulk update '{}' has no updates", self.id)))
            }
            OperationPayload::Update { filter, patch } => check_scoped_update(&self.id, filter, patch),
            OperationPayload::BulkUpdate(updates) => updates
                .iter()
                .try_for_each(|u| check_scoped_update(&self.id, &u.filter, &u.patch)),
            OperationPayload::Delete { filter } if filter.is_empty() => Err(SyncError::OperationUnsupported(format!(
                "delete '{}' on '{}' has no filter",
                self.id, self.table
            ))),
            _ => Ok(()),
        }
    }

    /// Result-cache key for inserts: table plus a digest of the canonical row.
    #[must_use]
    pub fn cache_key(&self) -> Option<String> {
        let OperationPayload::Insert(row) = &self.payload else {
            return None;
        };
        let canonical = serde_json::to_string(&Value::Object(row.clone())).ok()?;
        Some(format!("{}:{}", self.table, hex::encode(Sha256::digest(canonical.as_bytes()))))
    }
}

fn check_scoped_update(id: &str, filter: &Filter, patch: &Row) -> Result<()> {
    if patch.is_empty() {
        return Err(SyncError::InvalidOperation(format!("update '{}' has an empty patch", id)));
    }
    if filter.is_empty() {
        return Err(SyncError::OperationUnsupported(format!("update '{}' has no filter", id)));
    }
    Ok(())
}

/// Final result of an operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationOutcome {
    pub operation_id: String,
    pub table: String,
    pub kind: &'static str,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub errors: Vec<String>,
    /// Chunks executed (1 for single-row operations)
    pub chunks: usize,
    pub failed_chunks: usize,
    pub retries: u32,
    /// Served from the result cache without touching the store
    pub cached: bool,
    /// Rows returned by the store (inserted or updated)
    pub rows: Vec<Row>,
    pub duration_ms: u64,
}

impl OperationOutcome {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.failed > 0 && self.succeeded > 0
    }
}

/// Queue and execution counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub deferred: u64,
    pub cache_hits: u64,
    pub validation_warnings: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_priority_order() {
        let mut p = vec![Priority::High, Priority::Low, Priority::Critical, Priority::Medium];
        p.sort_by(|a, b| b.cmp(a));
        assert_eq!(p, vec![Priority::Critical, Priority::High, Priority::Medium, Priority::Low]);
    }

    #[test]
    fn test_validate_rejects_malformed() {
        assert!(matches!(
            SyncOperation::insert("", row(json!({"a": 1}))).validate(),
            Err(SyncError::InvalidOperation(_))
        ));
        assert!(matches!(
            SyncOperation::insert("products", Row::new()).validate(),
            Err(SyncError::InvalidOperation(_))
        ));
        assert!(matches!(
            SyncOperation::bulk_insert("products", vec![]).validate(),
            Err(SyncError::InvalidOperation(_))
        ));
        assert!(matches!(
            SyncOperation::update("products", Filter::eq("id", "p1"), Row::new()).validate(),
            Err(SyncError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_unscoped_writes_unsupported() {
        assert!(matches!(
            SyncOperation::delete("products", Filter::all()).validate(),
            Err(SyncError::OperationUnsupported(_))
        ));
        assert!(matches!(
            SyncOperation::update("products", Filter::all(), row(json!({"price": 1}))).validate(),
            Err(SyncError::OperationUnsupported(_))
        ));
        let ok = SyncOperation::delete("products", Filter::eq("id", "p1"));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let op = SyncOperation::insert("products", row(json!({"a": 1}))).with_id("x").depends_on("x");
        assert!(matches!(op.validate(), Err(SyncError::InvalidOperation(_))));
    }

    #[test]
    fn test_cache_key_is_canonical() {
        let a = SyncOperation::insert("products", row(json!({"name": "Tea", "price": 2})));
        let b = SyncOperation::insert("products", row(json!({"price": 2, "name": "Tea"})));
        let c = SyncOperation::insert("suppliers", row(json!({"name": "Tea", "price": 2})));
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
        assert!(SyncOperation::delete("products", Filter::eq("id", 1)).cache_key().is_none());
    }

    #[test]
    fn test_payload_serde_tagging() {
        let op = SyncOperation::insert("products", row(json!({"name": "Tea"})));
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["payload"]["kind"], "insert");
        let back: SyncOperation = serde_json::from_value(value).unwrap();
        assert_eq!(back, op);
    }
}
