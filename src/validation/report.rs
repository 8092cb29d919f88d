// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integrity report assembled from rule and consistency-check results.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::consistency::Mismatch;
use super::rules::RuleSeverity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    /// Not evaluated; `skip_reason` says why. Never counted as passed.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    Healthy,
    Warnings,
    Errors,
    Critical,
}

impl IntegrityStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warnings => "warnings",
            Self::Errors => "errors",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub rule_id: String,
    pub table: String,
    pub field: String,
    pub record_id: Option<String>,
    pub value: Value,
    pub message: String,
    pub severity: RuleSeverity,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleResult {
    pub rule_id: String,
    pub table: String,
    pub field: String,
    pub rule_type: &'static str,
    pub severity: RuleSeverity,
    pub status: CheckStatus,
    pub checked_records: usize,
    pub violations: Vec<Violation>,
    pub skip_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyResult {
    pub check_id: String,
    pub check_type: &'static str,
    pub severity: RuleSeverity,
    pub status: CheckStatus,
    pub mismatches: Vec<Mismatch>,
    pub skip_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BreakdownEntry {
    pub rules: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub violations: usize,
}

impl BreakdownEntry {
    fn add(&mut self, result: &RuleResult) {
        self.rules += 1;
        self.violations += result.violations.len();
        match result.status {
            CheckStatus::Passed => self.passed += 1,
            CheckStatus::Failed => self.failed += 1,
            CheckStatus::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub generated_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub tables: Vec<String>,
    pub total_rules: usize,
    pub passed_rules: usize,
    pub failed_rules: usize,
    pub skipped_rules: usize,
    pub total_violations: usize,
    /// Failed rules and checks per severity
    pub severity_counts: BTreeMap<RuleSeverity, usize>,
    pub by_table: BTreeMap<String, BreakdownEntry>,
    pub by_rule_type: BTreeMap<String, BreakdownEntry>,
    pub rule_results: Vec<RuleResult>,
    pub consistency_results: Vec<ConsistencyResult>,
    pub status: IntegrityStatus,
    pub recommendations: Vec<String>,
}

impl IntegrityReport {
    /// Aggregate results. `critical_failed_rules` is the failure count above
    /// which the report is critical regardless of severities.
    #[must_use]
    pub fn build(
        tables: Vec<String>,
        rule_results: Vec<RuleResult>,
        consistency_results: Vec<ConsistencyResult>,
        critical_failed_rules: usize,
        duration_ms: u64,
    ) -> Self {
        let count = |status| rule_results.iter().filter(|r| r.status == status).count();
        let passed_rules = count(CheckStatus::Passed);
        let failed_rules = count(CheckStatus::Failed);
        let skipped_rules = count(CheckStatus::Skipped);

        let mut severity_counts = BTreeMap::new();
        let failed_severities = rule_results
            .iter()
            .filter(|r| r.status == CheckStatus::Failed)
            .map(|r| r.severity)
            .chain(
                consistency_results
                    .iter()
                    .filter(|c| c.status == CheckStatus::Failed)
                    .map(|c| c.severity),
            );
        for severity in failed_severities {
            *severity_counts.entry(severity).or_insert(0) += 1;
        }

        let mut by_table: BTreeMap<String, BreakdownEntry> = BTreeMap::new();
        let mut by_rule_type: BTreeMap<String, BreakdownEntry> = BTreeMap::new();
        for r in &rule_results {
            by_table.entry(r.table.clone()).or_default().add(r);
            by_rule_type.entry(r.rule_type.to_string()).or_default().add(r);
        }

        let total_violations = rule_results.iter().map(|r| r.violations.len()).sum::<usize>()
            + consistency_results.iter().map(|c| c.mismatches.len()).sum::<usize>();

        let failed_checks = consistency_results.iter().filter(|c| c.status == CheckStatus::Failed).count();
        let worst = severity_counts.keys().next_back().copied();
        let status = if failed_rules + failed_checks > critical_failed_rules || worst == Some(RuleSeverity::Critical) {
            IntegrityStatus::Critical
        } else if worst == Some(RuleSeverity::Error) {
            IntegrityStatus::Errors
        } else if worst.is_some() {
            IntegrityStatus::Warnings
        } else {
            IntegrityStatus::Healthy
        };

        let recommendations = recommend(&rule_results, &consistency_results, skipped_rules);

        Self {
            generated_at: Utc::now(),
            duration_ms,
            tables,
            total_rules: rule_results.len(),
            passed_rules,
            failed_rules,
            skipped_rules,
            total_violations,
            severity_counts,
            by_table,
            by_rule_type,
            rule_results,
            consistency_results,
            status,
            recommendations,
        }
    }

    /// Ids of passed rules and checks, in report order.
    #[must_use]
    pub fn passed_ids(&self) -> Vec<&str> {
        self.ids_with(CheckStatus::Passed)
    }

    /// Ids of failed rules and checks, in report order.
    #[must_use]
    pub fn failed_ids(&self) -> Vec<&str> {
        self.ids_with(CheckStatus::Failed)
    }

    #[must_use]
    pub fn skipped_ids(&self) -> Vec<&str> {
        self.ids_with(CheckStatus::Skipped)
    }

    fn ids_with(&self, status: CheckStatus) -> Vec<&str> {
        self.rule_results
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.rule_id.as_str())
            .chain(
                self.consistency_results
                    .iter()
                    .filter(|c| c.status == status)
                    .map(|c| c.check_id.as_str()),
            )
            .collect()
    }

    #[must_use]
    pub fn rule(&self, rule_id: &str) -> Option<&RuleResult> {
        self.rule_results.iter().find(|r| r.rule_id == rule_id)
    }

    #[must_use]
    pub fn check(&self, check_id: &str) -> Option<&ConsistencyResult> {
        self.consistency_results.iter().find(|c| c.check_id == check_id)
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == IntegrityStatus::Healthy
    }
}

fn recommend(rules: &[RuleResult], checks: &[ConsistencyResult], skipped: usize) -> Vec<String> {
    let violations_of = |rule_type: &str| -> usize {
        rules
            .iter()
            .filter(|r| r.rule_type == rule_type)
            .map(|r| r.violations.len())
            .sum()
    };

    let mut out = Vec::new();
    let n = violations_of("required");
    if n > 0 {
        out.push(format!("Fill in {} missing required value(s) before the next sync", n));
    }
    let n = violations_of("unique");
    if n > 0 {
        out.push(format!("Resolve {} duplicate value(s) and add a unique index", n));
    }
    let n = violations_of("foreign_key");
    if n > 0 {
        out.push(format!(
            "{} foreign key violation(s): verify referential integrity before deleting referenced records",
            n
        ));
    }
    let n = violations_of("range");
    if n > 0 {
        out.push(format!("Review {} out-of-range value(s) and tighten input validation", n));
    }
    let n = violations_of("format");
    if n > 0 {
        out.push(format!("Normalize {} badly formatted value(s)", n));
    }
    let n = violations_of("custom");
    if n > 0 {
        out.push(format!("Review {} custom rule violation(s)", n));
    }
    for check in checks.iter().filter(|c| c.status == CheckStatus::Failed) {
        out.push(format!(
            "Reconcile {} mismatch(es) reported by '{}'",
            check.mismatches.len(),
            check.check_id
        ));
    }
    let skipped_checks = checks.iter().filter(|c| c.status == CheckStatus::Skipped).count();
    if skipped + skipped_checks > 0 {
        out.push(format!(
            "{} rule(s) or check(s) were skipped and are unverified: install the missing procedures",
            skipped + skipped_checks
        ));
    }
    out
}
