// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Validation rule descriptors and their per-row evaluation.
//!
//! Rules are a closed set of typed variants. `Custom` never compiles code
//! from data: it names either a predicate registered in process or a
//! server-side procedure.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::storage::traits::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl RuleSeverity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// Error and critical reject a record; info and warning let it through.
    #[must_use]
    pub fn rejects(&self) -> bool {
        matches!(self, Self::Error | Self::Critical)
    }
}

impl std::fmt::Display for RuleSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A regex compiled once when the rule is built. Serializes as its source.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    regex: Regex,
}

impl CompiledPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(|regex| Self { regex })
            .map_err(|e| SyncError::InvalidOperation(format!("invalid format pattern '{}': {}", pattern, e)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl PartialEq for CompiledPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for CompiledPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CompiledPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Regex::new(&source).map(|regex| Self { regex }).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    /// Field must be present and non-empty
    Required,
    /// Non-null values must not repeat across rows
    Unique,
    /// Non-null values must exist in `table.field`
    ForeignKey { table: String, field: String },
    /// Numeric value within `[min, max]`; either bound optional
    Range { min: Option<f64>, max: Option<f64> },
    /// String values must match the pattern
    Format { pattern: CompiledPattern },
    /// Registered predicate, else a store procedure of the same name
    Custom { name: String },
}

impl RuleKind {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::Unique => "unique",
            Self::ForeignKey { .. } => "foreign_key",
            Self::Range { .. } => "range",
            Self::Format { .. } => "format",
            Self::Custom { .. } => "custom",
        }
    }

    /// Whether the rule can be checked on one row without reading the store.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Required | Self::Range { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub id: String,
    pub table: String,
    pub field: String,
    pub kind: RuleKind,
    pub severity: RuleSeverity,
    #[serde(default)]
    pub description: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl ValidationRule {
    pub fn new(
        id: impl Into<String>,
        table: impl Into<String>,
        field: impl Into<String>,
        kind: RuleKind,
        severity: RuleSeverity,
    ) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            field: field.into(),
            kind,
            severity,
            description: String::new(),
            enabled: true,
        }
    }

    pub fn required(id: impl Into<String>, table: impl Into<String>, field: impl Into<String>, severity: RuleSeverity) -> Self {
        Self::new(id, table, field, RuleKind::Required, severity)
    }

    pub fn unique(id: impl Into<String>, table: impl Into<String>, field: impl Into<String>, severity: RuleSeverity) -> Self {
        Self::new(id, table, field, RuleKind::Unique, severity)
    }

    pub fn range(
        id: impl Into<String>,
        table: impl Into<String>,
        field: impl Into<String>,
        min: Option<f64>,
        max: Option<f64>,
        severity: RuleSeverity,
    ) -> Self {
        Self::new(id, table, field, RuleKind::Range { min, max }, severity)
    }

    pub fn foreign_key(
        id: impl Into<String>,
        table: impl Into<String>,
        field: impl Into<String>,
        referenced_table: impl Into<String>,
        referenced_field: impl Into<String>,
        severity: RuleSeverity,
    ) -> Self {
        let kind = RuleKind::ForeignKey {
            table: referenced_table.into(),
            field: referenced_field.into(),
        };
        Self::new(id, table, field, kind, severity)
    }

    /// Fails on an invalid pattern.
    pub fn format(
        id: impl Into<String>,
        table: impl Into<String>,
        field: impl Into<String>,
        pattern: &str,
        severity: RuleSeverity,
    ) -> Result<Self> {
        let pattern = CompiledPattern::new(pattern)?;
        Ok(Self::new(id, table, field, RuleKind::Format { pattern }, severity))
    }

    pub fn custom(
        id: impl Into<String>,
        table: impl Into<String>,
        field: impl Into<String>,
        name: impl Into<String>,
        severity: RuleSeverity,
    ) -> Self {
        Self::new(id, table, field, RuleKind::Custom { name: name.into() }, severity)
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Evaluate a row-local rule (required, range, format) on one row.
    /// Returns the violation message, if any. Other kinds always pass here.
    #[must_use]
    pub fn check_row(&self, row: &Row) -> Option<String> {
        let value = row.get(&self.field).unwrap_or(&Value::Null);
        match &self.kind {
            RuleKind::Required => is_empty_value(value).then(|| format!("{} is required", self.field)),
            RuleKind::Range { min, max } => {
                if value.is_null() {
                    return None;
                }
                let Some(n) = numeric(value) else {
                    return Some(format!("{} is not numeric", self.field));
                };
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    Some(format!("{} = {} is outside {}", self.field, n, describe_range(*min, *max)))
                } else {
                    None
                }
            }
            RuleKind::Format { pattern } => match value {
                Value::String(s) if !pattern.is_match(s) => {
                    Some(format!("{} '{}' does not match {}", self.field, s, pattern.as_str()))
                }
                _ => None,
            },
            RuleKind::Unique | RuleKind::ForeignKey { .. } | RuleKind::Custom { .. } => None,
        }
    }
}

/// In-process predicate for `Custom` rules: `true` means the row is valid.
pub type CustomPredicate = Arc<dyn Fn(&Row) -> bool + Send + Sync>;

/// Null, missing, blank string or empty array.
#[must_use]
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Numbers, and strings that parse as numbers.
#[must_use]
pub fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn describe_range(min: Option<f64>, max: Option<f64>) -> String {
    match (min, max) {
        (Some(lo), Some(hi)) => format!("[{}, {}]", lo, hi),
        (Some(lo), None) => format!("[{}, ∞)", lo),
        (None, Some(hi)) => format!("(-∞, {}]", hi),
        (None, None) => "(-∞, ∞)".to_string(),
    }
}
