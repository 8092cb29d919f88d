// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-table consistency checks.
//!
//! Each check compares an *expected* keyed set against an *actual* keyed set
//! built from table snapshots; every key whose values differ (beyond the
//! numeric tolerance) is a [`Mismatch`]. Results are sorted by key so the
//! same data always yields the same report.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};

use super::rules::{numeric, RuleSeverity};
use crate::storage::traits::Row;

/// Negates child values whose `field` is one of `negative` (e.g. outbound
/// stock movements).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignRule {
    pub field: String,
    pub negative: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsistencyCheckKind {
    /// `parent.parent_field` equals the (signed) sum of `child.child_field`
    /// over children whose `child_key` references `parent.parent_key`.
    AggregateMatches {
        parent_table: String,
        parent_key: String,
        parent_field: String,
        child_table: String,
        child_key: String,
        child_field: String,
        sign: Option<SignRule>,
    },
    /// Every parent has at least one child
    ChildrenExist {
        parent_table: String,
        parent_key: String,
        child_table: String,
        child_key: String,
    },
    /// Every non-null `table.field` exists in `referenced_table.referenced_field`
    ReferencesExist {
        table: String,
        field: String,
        referenced_table: String,
        referenced_field: String,
    },
    /// Server-side procedure returning the mismatching rows
    Procedure { name: String },
}

impl ConsistencyCheckKind {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::AggregateMatches { .. } => "aggregate_matches",
            Self::ChildrenExist { .. } => "children_exist",
            Self::ReferencesExist { .. } => "references_exist",
            Self::Procedure { .. } => "procedure",
        }
    }

    /// Tables the check reads.
    #[must_use]
    pub fn tables(&self) -> Vec<&str> {
        match self {
            Self::AggregateMatches { parent_table, child_table, .. } | Self::ChildrenExist { parent_table, child_table, .. } => {
                vec![parent_table.as_str(), child_table.as_str()]
            }
            Self::ReferencesExist { table, referenced_table, .. } => vec![table.as_str(), referenced_table.as_str()],
            Self::Procedure { .. } => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyCheck {
    pub id: String,
    pub kind: ConsistencyCheckKind,
    pub severity: RuleSeverity,
    /// Allowed absolute difference for numeric comparisons
    #[serde(default)]
    pub tolerance: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl ConsistencyCheck {
    pub fn new(id: impl Into<String>, kind: ConsistencyCheckKind, severity: RuleSeverity) -> Self {
        Self {
            id: id.into(),
            kind,
            severity,
            tolerance: 0.0,
            description: String::new(),
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance.abs();
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Whether the check touches any of `tables` (procedures always do).
    #[must_use]
    pub fn applies_to(&self, tables: &[String]) -> bool {
        let own = self.kind.tables();
        own.is_empty() || own.iter().any(|t| tables.iter().any(|x| x.as_str() == *t))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mismatch {
    pub key: String,
    pub expected: Value,
    pub actual: Value,
    pub message: String,
}

/// Canonical string form of a key value.
#[must_use]
pub fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn key_of(row: &Row, field: &str) -> Option<String> {
    row.get(field).filter(|v| !v.is_null()).map(key_string)
}

/// Parent value vs signed child sum, per parent key.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn aggregate_mismatches(
    parents: &[Row],
    parent_key: &str,
    parent_field: &str,
    children: &[Row],
    child_key: &str,
    child_field: &str,
    sign: Option<&SignRule>,
    tolerance: f64,
) -> Vec<Mismatch> {
    let mut actual: BTreeMap<String, f64> = BTreeMap::new();
    for child in children {
        let Some(key) = key_of(child, child_key) else { continue };
        let amount = child.get(child_field).and_then(numeric).unwrap_or(0.0);
        let negative = sign.is_some_and(|s| {
            child
                .get(&s.field)
                .and_then(Value::as_str)
                .is_some_and(|v| s.negative.iter().any(|n| n == v))
        });
        *actual.entry(key).or_default() += if negative { -amount } else { amount };
    }

    let mut out: Vec<Mismatch> = parents
        .iter()
        .filter_map(|parent| {
            let key = key_of(parent, parent_key)?;
            let expected = parent.get(parent_field).and_then(numeric).unwrap_or(0.0);
            let sum = actual.get(&key).copied().unwrap_or(0.0);
            ((expected - sum).abs() > tolerance).then(|| Mismatch {
                message: format!("{} is {} but related rows sum to {}", parent_field, expected, sum),
                key,
                expected: json!(expected),
                actual: json!(sum),
            })
        })
        .collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

/// Parents with no child referencing them.
#[must_use]
pub fn missing_children(parents: &[Row], parent_key: &str, children: &[Row], child_key: &str) -> Vec<Mismatch> {
    let referenced: HashSet<String> = children.iter().filter_map(|c| key_of(c, child_key)).collect();
    let mut out: Vec<Mismatch> = parents
        .iter()
        .filter_map(|p| key_of(p, parent_key))
        .filter(|k| !referenced.contains(k))
        .map(|key| Mismatch {
            message: format!("{} has no related rows", key),
            key,
            expected: json!(">= 1"),
            actual: json!(0),
        })
        .collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

/// Rows whose non-null `field` is absent from the referenced rows.
#[must_use]
pub fn dangling_references(rows: &[Row], field: &str, referenced: &[Row], referenced_field: &str) -> Vec<Mismatch> {
    let existing: HashSet<String> = referenced.iter().filter_map(|r| key_of(r, referenced_field)).collect();
    let mut out: Vec<Mismatch> = rows
        .iter()
        .filter_map(|row| {
            let target = key_of(row, field)?;
            if existing.contains(&target) {
                return None;
            }
            let key = row.get("id").map(key_string).unwrap_or_else(|| target.clone());
            Some(Mismatch {
                message: format!("{} references missing {}", key, target),
                key,
                expected: json!(target),
                actual: Value::Null,
            })
        })
        .collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}
