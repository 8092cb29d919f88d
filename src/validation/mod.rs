// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data integrity validation.
//!
//! [`IntegrityValidator`] holds a registry of [`ValidationRule`]s and
//! [`ConsistencyCheck`]s and evaluates them against the row store:
//!
//! ```text
//! validate_all(tables?)
//!    │
//!    ├─→ for each enabled rule on a requested table (registration order)
//!    │      required / range / format → per-row check
//!    │      unique                    → group non-null values, >1 = violation
//!    │      foreign_key               → value must exist in referenced table
//!    │      custom                    → registered predicate, else store rpc,
//!    │                                  else Skipped (never "passed")
//!    │
//!    ├─→ for each enabled consistency check touching those tables
//!    │      expected set vs actual set (with tolerance)
//!    │
//!    └─→ IntegrityReport (status, breakdowns, recommendations)
//! ```
//!
//! Each table is read at most once per run. Rows and violations are ordered
//! deterministically, so re-running on unchanged data gives the same report.
//!
//! [`IntegrityValidator::validate_single_record`] runs only the rules that
//! need no store access (required, range) and gates inserts in the engine.

pub mod consistency;
pub mod report;
pub mod rules;

pub use consistency::{ConsistencyCheck, ConsistencyCheckKind, Mismatch, SignRule};
pub use report::{CheckStatus, ConsistencyResult, IntegrityReport, IntegrityStatus, RuleResult, Violation};
pub use rules::{CompiledPattern, CustomPredicate, RuleKind, RuleSeverity, ValidationRule};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ValidationConfig;
use crate::error::{Result, SyncError};
use crate::storage::traits::{Filter, Row, RowStore, StoreError};
use consistency::key_string;

const DEFAULT_CRITICAL_FAILED_RULES: usize = 10;

/// Outcome of [`IntegrityValidator::validate_single_record`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordValidation {
    /// Error and critical violations; any of these rejects the record
    pub errors: Vec<Violation>,
    /// Info and warning violations; counted, never rejecting
    pub warnings: Vec<Violation>,
}

impl RecordValidation {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Highest severity among the rejecting violations.
    #[must_use]
    pub fn worst_severity(&self) -> Option<RuleSeverity> {
        self.errors.iter().map(|v| v.severity).max()
    }

    /// `Err(ValidationFailed)` when the record must be rejected.
    pub fn into_result(self) -> Result<Self> {
        match self.worst_severity() {
            Some(severity) => {
                let message = self.errors.iter().map(|v| v.message.as_str()).collect::<Vec<_>>().join("; ");
                Err(SyncError::ValidationFailed { severity, message })
            }
            None => Ok(self),
        }
    }
}

/// Reads each table once per validation run.
struct TableSnapshot<'a> {
    store: &'a dyn RowStore,
    tables: HashMap<String, std::result::Result<Vec<Row>, String>>,
}

impl<'a> TableSnapshot<'a> {
    fn new(store: &'a dyn RowStore) -> Self {
        Self {
            store,
            tables: HashMap::new(),
        }
    }

    async fn rows(&mut self, table: &str) -> std::result::Result<&[Row], String> {
        if !self.tables.contains_key(table) {
            let loaded = self
                .store
                .select(table, &Filter::all(), None)
                .await
                .map(|mut rows| {
                    rows.sort_by_key(record_id);
                    rows
                })
                .map_err(|e| e.to_string());
            self.tables.insert(table.to_string(), loaded);
        }
        match self.tables.get(table) {
            Some(Ok(rows)) => Ok(rows.as_slice()),
            Some(Err(e)) => Err(e.clone()),
            None => Err(format!("table '{}' not loaded", table)),
        }
    }
}

fn record_id(row: &Row) -> Option<String> {
    row.get("id").filter(|v| !v.is_null()).map(key_string)
}

pub struct IntegrityValidator {
    store: Arc<dyn RowStore>,
    rules: RwLock<Vec<ValidationRule>>,
    checks: RwLock<Vec<ConsistencyCheck>>,
    predicates: DashMap<String, CustomPredicate>,
    critical_failed_rules: usize,
}

impl IntegrityValidator {
    /// Validator with an empty registry.
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self {
            store,
            rules: RwLock::new(Vec::new()),
            checks: RwLock::new(Vec::new()),
            predicates: DashMap::new(),
            critical_failed_rules: DEFAULT_CRITICAL_FAILED_RULES,
        }
    }

    pub fn from_config(store: Arc<dyn RowStore>, config: &ValidationConfig) -> Self {
        let validator = Self {
            critical_failed_rules: config.critical_failed_rules,
            ..Self::new(store)
        };
        if config.with_default_rules {
            validator.with_default_rules()
        } else {
            validator
        }
    }

    /// Install the POS defaults: product, supplier and sale rules plus the
    /// stock, sale-item and supplier-reference consistency checks.
    #[must_use]
    pub fn with_default_rules(self) -> Self {
        let mut rules = vec![
            ValidationRule::required("product_name_required", "products", "name", RuleSeverity::Error)
                .with_description("Every product needs a name"),
            ValidationRule::range("product_price_range", "products", "price", Some(0.0), Some(999_999.99), RuleSeverity::Error)
                .with_description("Prices are non-negative and bounded"),
            ValidationRule::unique("product_sku_unique", "products", "sku", RuleSeverity::Error)
                .with_description("SKUs identify one product"),
            ValidationRule::foreign_key("product_supplier_fk", "products", "supplier_id", "suppliers", "id", RuleSeverity::Error)
                .with_description("Products reference an existing supplier"),
            ValidationRule::range("sale_total_range", "sales", "total", Some(0.0), None, RuleSeverity::Error)
                .with_description("Sale totals are non-negative"),
            ValidationRule::range("stock_quantity_range", "products", "stock_quantity", Some(0.0), None, RuleSeverity::Warning)
                .with_description("Negative stock means missing movements"),
        ];
        match ValidationRule::format(
            "supplier_email_format",
            "suppliers",
            "email",
            r"^[^@\s]+@[^@\s]+\.[^@\s]+$",
            RuleSeverity::Warning,
        ) {
            Ok(rule) => rules.push(rule.with_description("Supplier emails are well formed")),
            Err(e) => warn!(error = %e, "Skipping default email rule"),
        }

        let checks = vec![
            ConsistencyCheck::new(
                "stock_matches_movements",
                ConsistencyCheckKind::AggregateMatches {
                    parent_table: "products".into(),
                    parent_key: "id".into(),
                    parent_field: "stock_quantity".into(),
                    child_table: "stock_movements".into(),
                    child_key: "product_id".into(),
                    child_field: "quantity".into(),
                    sign: Some(SignRule {
                        field: "movement_type".into(),
                        negative: vec!["out".into(), "sale".into()],
                    }),
                },
                RuleSeverity::Error,
            )
            .with_description("Stock equals the signed sum of its movements"),
            ConsistencyCheck::new(
                "sale_has_items",
                ConsistencyCheckKind::ChildrenExist {
                    parent_table: "sales".into(),
                    parent_key: "id".into(),
                    child_table: "sale_items".into(),
                    child_key: "sale_id".into(),
                },
                RuleSeverity::Warning,
            )
            .with_description("Every sale has at least one line item"),
            ConsistencyCheck::new(
                "product_supplier_exists",
                ConsistencyCheckKind::ReferencesExist {
                    table: "products".into(),
                    field: "supplier_id".into(),
                    referenced_table: "suppliers".into(),
                    referenced_field: "id".into(),
                },
                RuleSeverity::Error,
            )
            .with_description("Supplier references resolve"),
        ];

        for rule in rules {
            self.add_rule(rule);
        }
        for check in checks {
            self.add_consistency_check(check);
        }
        self
    }

    /// Register a rule; an existing rule with the same id is replaced in place.
    pub fn add_rule(&self, rule: ValidationRule) {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != rule_id);
        rules.len() != before
    }

    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        match self.rules.write().iter_mut().find(|r| r.id == rule_id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn rules(&self) -> Vec<ValidationRule> {
        self.rules.read().clone()
    }

    pub fn add_consistency_check(&self, check: ConsistencyCheck) {
        let mut checks = self.checks.write();
        match checks.iter_mut().find(|c| c.id == check.id) {
            Some(existing) => *existing = check,
            None => checks.push(check),
        }
    }

    pub fn remove_consistency_check(&self, check_id: &str) -> bool {
        let mut checks = self.checks.write();
        let before = checks.len();
        checks.retain(|c| c.id != check_id);
        checks.len() != before
    }

    pub fn set_check_enabled(&self, check_id: &str, enabled: bool) -> bool {
        match self.checks.write().iter_mut().find(|c| c.id == check_id) {
            Some(check) => {
                check.enabled = enabled;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn consistency_checks(&self) -> Vec<ConsistencyCheck> {
        self.checks.read().clone()
    }

    /// Register the in-process predicate that `Custom { name }` rules resolve to.
    pub fn register_custom_predicate<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(predicate));
    }

    /// Evaluate every enabled rule and check on `tables` (all tables when `None`).
    #[tracing::instrument(skip(self))]
    pub async fn validate_all(&self, tables: Option<&[&str]>) -> IntegrityReport {
        let started = Instant::now();
        let rules: Vec<ValidationRule> = self
            .rules
            .read()
            .iter()
            .filter(|r| r.enabled && tables.map_or(true, |t| t.contains(&r.table.as_str())))
            .cloned()
            .collect();

        let mut table_names: Vec<String> = match tables {
            Some(t) => t.iter().map(|s| (*s).to_string()).collect(),
            None => rules.iter().map(|r| r.table.clone()).collect(),
        };
        table_names.sort();
        table_names.dedup();

        let checks: Vec<ConsistencyCheck> = self
            .checks
            .read()
            .iter()
            .filter(|c| c.enabled && (tables.is_none() || c.applies_to(&table_names)))
            .cloned()
            .collect();

        let mut snapshot = TableSnapshot::new(self.store.as_ref());
        let mut rule_results = Vec::with_capacity(rules.len());
        for rule in &rules {
            rule_results.push(self.evaluate_rule(rule, &mut snapshot).await);
        }
        let mut consistency_results = Vec::with_capacity(checks.len());
        for check in &checks {
            consistency_results.push(self.evaluate_check(check, &mut snapshot).await);
        }

        let report = IntegrityReport::build(
            table_names,
            rule_results,
            consistency_results,
            self.critical_failed_rules,
            started.elapsed().as_millis() as u64,
        );

        for r in report.rule_results.iter().filter(|r| !r.violations.is_empty()) {
            crate::metrics::record_validation_violations(&r.table, r.severity.as_str(), r.violations.len());
        }
        crate::metrics::record_validation_run(report.status.as_str(), started.elapsed());
        info!(
            status = report.status.as_str(),
            rules = report.total_rules,
            failed = report.failed_rules,
            skipped = report.skipped_rules,
            violations = report.total_violations,
            "Integrity validation complete"
        );
        report
    }

    /// Like [`validate_all`](Self::validate_all), but a failed consistency
    /// check becomes [`SyncError::ConsistencyViolation`].
    pub async fn ensure_consistent(&self, tables: Option<&[&str]>) -> Result<IntegrityReport> {
        let report = self.validate_all(tables).await;
        if let Some(failed) = report.consistency_results.iter().find(|c| c.status == CheckStatus::Failed) {
            let message = failed
                .mismatches
                .first()
                .map(|m| m.message.clone())
                .unwrap_or_default();
            return Err(SyncError::ConsistencyViolation {
                check: failed.check_id.clone(),
                message: format!("{} mismatch(es), first: {}", failed.mismatches.len(), message),
            });
        }
        Ok(report)
    }

    /// Row-local rules only (required, range); no store access.
    #[must_use]
    pub fn validate_single_record(&self, table: &str, record: &Row) -> RecordValidation {
        let mut out = RecordValidation::default();
        for rule in self.rules.read().iter() {
            if !rule.enabled || rule.table != table || !rule.kind.is_local() {
                continue;
            }
            if let Some(message) = rule.check_row(record) {
                let violation = Violation {
                    rule_id: rule.id.clone(),
                    table: table.to_string(),
                    field: rule.field.clone(),
                    record_id: record_id(record),
                    value: record.get(&rule.field).cloned().unwrap_or(Value::Null),
                    message,
                    severity: rule.severity,
                };
                if rule.severity.rejects() {
                    out.errors.push(violation);
                } else {
                    out.warnings.push(violation);
                }
            }
        }
        debug!(table, errors = out.errors.len(), warnings = out.warnings.len(), "Record validated");
        out
    }

    async fn evaluate_rule(&self, rule: &ValidationRule, snapshot: &mut TableSnapshot<'_>) -> RuleResult {
        let mut result = RuleResult {
            rule_id: rule.id.clone(),
            table: rule.table.clone(),
            field: rule.field.clone(),
            rule_type: rule.kind.type_name(),
            severity: rule.severity,
            status: CheckStatus::Passed,
            checked_records: 0,
            violations: Vec::new(),
            skip_reason: None,
        };

        let violation = |row: &Row, message: String| Violation {
            rule_id: rule.id.clone(),
            table: rule.table.clone(),
            field: rule.field.clone(),
            record_id: record_id(row),
            value: row.get(&rule.field).cloned().unwrap_or(Value::Null),
            message,
            severity: rule.severity,
        };

        let referenced = match &rule.kind {
            RuleKind::ForeignKey { table, field } => match snapshot.rows(table).await {
                Ok(rows) => Some((
                    rows.iter()
                        .filter_map(|r| r.get(field).filter(|v| !v.is_null()).map(key_string))
                        .collect::<std::collections::HashSet<_>>(),
                    table.clone(),
                )),
                Err(e) => return skipped(result, format!("cannot read '{}': {}", table, e)),
            },
            _ => None,
        };

        let rows = match snapshot.rows(&rule.table).await {
            Ok(rows) => rows,
            Err(e) => return skipped(result, format!("cannot read '{}': {}", rule.table, e)),
        };
        result.checked_records = rows.len();

        match &rule.kind {
            RuleKind::Required | RuleKind::Range { .. } | RuleKind::Format { .. } => {
                for row in rows {
                    if let Some(message) = rule.check_row(row) {
                        result.violations.push(violation(row, message));
                    }
                }
            }
            RuleKind::Unique => {
                let mut groups: BTreeMap<String, Vec<&Row>> = BTreeMap::new();
                for row in rows {
                    if let Some(v) = row.get(&rule.field).filter(|v| !v.is_null()) {
                        groups.entry(key_string(v)).or_default().push(row);
                    }
                }
                for (value, members) in groups.into_iter().filter(|(_, m)| m.len() > 1) {
                    for row in &members {
                        let message = format!("{} '{}' is shared by {} rows", rule.field, value, members.len());
                        result.violations.push(violation(row, message));
                    }
                }
            }
            RuleKind::ForeignKey { field, .. } => {
                if let Some((existing, table)) = &referenced {
                    for row in rows {
                        let Some(v) = row.get(&rule.field).filter(|v| !v.is_null()) else { continue };
                        let key = key_string(v);
                        if !existing.contains(&key) {
                            let message = format!("{} '{}' has no match in {}.{}", rule.field, key, table, field);
                            result.violations.push(violation(row, message));
                        }
                    }
                }
            }
            RuleKind::Custom { name } => {
                if let Some(predicate) = self.predicates.get(name).map(|p| Arc::clone(p.value())) {
                    for row in rows {
                        if !predicate(row) {
                            result.violations.push(violation(row, format!("failed custom check '{}'", name)));
                        }
                    }
                } else {
                    let args = json!({ "table": rule.table, "field": rule.field, "rule_id": rule.id });
                    match self.store.rpc(name, args).await {
                        Ok(value) => {
                            for row in procedure_rows(value) {
                                let message = format!("failed custom check '{}'", name);
                                result.violations.push(violation(&row, message));
                            }
                        }
                        Err(StoreError::ProcedureNotFound(_)) => {
                            return skipped(result, format!("no predicate or procedure named '{}'", name));
                        }
                        Err(e) => return skipped(result, format!("procedure '{}' failed: {}", name, e)),
                    }
                }
            }
        }

        if !result.violations.is_empty() {
            result.status = CheckStatus::Failed;
        }
        result
    }

    async fn evaluate_check(&self, check: &ConsistencyCheck, snapshot: &mut TableSnapshot<'_>) -> ConsistencyResult {
        let result = ConsistencyResult {
            check_id: check.id.clone(),
            check_type: check.kind.type_name(),
            severity: check.severity,
            status: CheckStatus::Passed,
            mismatches: Vec::new(),
            skip_reason: None,
        };

        // Load every table first; the snapshot hands out one borrow at a time
        for table in check.kind.tables() {
            if let Err(e) = snapshot.rows(table).await {
                return skipped_check(result, format!("cannot read '{}': {}", table, e));
            }
        }
        let loaded = |t: &str| -> Vec<Row> {
            match snapshot.tables.get(t) {
                Some(Ok(rows)) => rows.clone(),
                _ => Vec::new(),
            }
        };

        let mismatches = match &check.kind {
            ConsistencyCheckKind::AggregateMatches {
                parent_table,
                parent_key,
                parent_field,
                child_table,
                child_key,
                child_field,
                sign,
            } => consistency::aggregate_mismatches(
                &loaded(parent_table),
                parent_key,
                parent_field,
                &loaded(child_table),
                child_key,
                child_field,
                sign.as_ref(),
                check.tolerance,
            ),
            ConsistencyCheckKind::ChildrenExist {
                parent_table,
                parent_key,
                child_table,
                child_key,
            } => consistency::missing_children(&loaded(parent_table), parent_key, &loaded(child_table), child_key),
            ConsistencyCheckKind::ReferencesExist {
                table,
                field,
                referenced_table,
                referenced_field,
            } => consistency::dangling_references(&loaded(table), field, &loaded(referenced_table), referenced_field),
            ConsistencyCheckKind::Procedure { name } => {
                match self.store.rpc(name, json!({ "check_id": check.id })).await {
                    Ok(value) => {
                        let mut out: Vec<Mismatch> = procedure_rows(value)
                            .into_iter()
                            .map(|row| Mismatch {
                                key: record_id(&row).unwrap_or_default(),
                                expected: row.get("expected").cloned().unwrap_or(Value::Null),
                                actual: row.get("actual").cloned().unwrap_or(Value::Null),
                                message: row
                                    .get("message")
                                    .and_then(Value::as_str)
                                    .map(str::to_string)
                                    .unwrap_or_else(|| format!("reported by procedure '{}'", name)),
                            })
                            .collect();
                        out.sort_by(|a, b| a.key.cmp(&b.key));
                        out
                    }
                    Err(StoreError::ProcedureNotFound(_)) => {
                        return skipped_check(result, format!("procedure '{}' is not installed", name));
                    }
                    Err(e) => return skipped_check(result, format!("procedure '{}' failed: {}", name, e)),
                }
            }
        };

        if mismatches.is_empty() {
            result
        } else {
            ConsistencyResult {
                status: CheckStatus::Failed,
                mismatches,
                ..result
            }
        }
    }
}

fn skipped(mut result: RuleResult, reason: String) -> RuleResult {
    warn!(rule = %result.rule_id, reason = %reason, "Validation rule skipped");
    result.status = CheckStatus::Skipped;
    result.skip_reason = Some(reason);
    result
}

fn skipped_check(mut result: ConsistencyResult, reason: String) -> ConsistencyResult {
    warn!(check = %result.check_id, reason = %reason, "Consistency check skipped");
    result.status = CheckStatus::Skipped;
    result.skip_reason = Some(reason);
    result
}

/// Rows returned by a procedure: an array of objects, or `{ "rows": [...] }`.
fn procedure_rows(value: Value) -> Vec<Row> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("rows").or_else(|| map.remove("violations")) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    let mut rows: Vec<Row> = items
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(m) => Some(m),
            _ => None,
        })
        .collect();
    rows.sort_by_key(record_id);
    rows
}
