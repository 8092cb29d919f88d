// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row-store contract.
//!
//! The sync core treats the backing store as an opaque row store reached
//! through five calls: select / insert / update / delete / rpc. Every call
//! either succeeds or returns a structured [`StoreError`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use thiserror::Error;

/// A single row: column name → JSON value.
pub type Row = Map<String, Value>;

/// Table probed by [`RowStore::ping`].
pub const PING_TABLE: &str = "sync_metrics";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Row not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// Named server-side procedure does not exist (callers treat this as a skip)
    #[error("Procedure not found: {0}")]
    ProcedureNotFound(String),
    #[error("Row serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Backend errors may clear up on retry; the rest will not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// One comparison against a row column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Gt { field: String, value: Value },
    Gte { field: String, value: Value },
    Lt { field: String, value: Value },
    Lte { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    IsNull { field: String },
    NotNull { field: String },
}

impl Condition {
    /// Evaluate against a row. Missing columns behave as `null`.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        let get = |field: &str| row.get(field).unwrap_or(&Value::Null);
        match self {
            Self::Eq { field, value } => values_equal(get(field), value),
            Self::Ne { field, value } => !values_equal(get(field), value),
            Self::Gt { field, value } => compare_values(get(field), value) == Some(Ordering::Greater),
            Self::Gte { field, value } => matches!(
                compare_values(get(field), value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Lt { field, value } => compare_values(get(field), value) == Some(Ordering::Less),
            Self::Lte { field, value } => matches!(
                compare_values(get(field), value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::In { field, values } => values.iter().any(|v| values_equal(get(field), v)),
            Self::IsNull { field } => get(field).is_null(),
            Self::NotNull { field } => !get(field).is_null(),
        }
    }
}

/// Conjunction of conditions. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    /// Filter matching every row
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter matching rows where `field == value`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(Condition::Eq { field: field.into(), value: value.into() })
    }

    /// Add another condition
    #[must_use]
    pub fn and(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }
}

/// Numbers compare numerically (so `5` equals `5.0`), everything else structurally.
#[must_use]
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

/// Ordering for numbers and strings; `None` for incomparable values.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Minimal row-store client the sync core depends on.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn select(&self, table: &str, filter: &Filter, limit: Option<usize>) -> Result<Vec<Row>, StoreError>;

    /// Insert rows, returning them as stored (with `id` assigned when absent).
    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, StoreError>;

    /// Apply `patch` to every matching row, returning the updated rows.
    async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<Vec<Row>, StoreError>;

    /// Delete matching rows, returning how many were removed.
    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, StoreError>;

    /// Call a named server-side procedure.
    async fn rpc(&self, name: &str, args: Value) -> Result<Value, StoreError>;

    /// Trivial read used by health checks.
    async fn ping(&self) -> Result<(), StoreError> {
        self.select(PING_TABLE, &Filter::all(), Some(1)).await.map(|_| ())
    }
}
