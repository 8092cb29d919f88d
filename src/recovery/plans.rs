// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Recovery plans: which strategies run, in what order, for which failures.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::events::FailureType;
use super::strategies::{DATA_RECOVERY, GRACEFUL_DEGRADATION, SIMPLE_RETRY};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub name: String,
    /// Failure types this plan handles
    pub triggers: Vec<FailureType>,
    /// Strategy names, tried in order
    pub escalation_path: Vec<String>,
    /// Deadline for the whole walk, retries included
    pub max_execution_time: Duration,
    /// How often a `Retry` outcome may restart the path
    pub max_retries: u32,
    pub enabled: bool,
}

impl RecoveryPlan {
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        triggers: impl IntoIterator<Item = FailureType>,
        escalation_path: impl IntoIterator<Item = S>,
        max_execution_time: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            name: name.into(),
            triggers: triggers.into_iter().collect(),
            escalation_path: escalation_path.into_iter().map(Into::into).collect(),
            max_execution_time,
            max_retries,
            enabled: true,
        }
    }

    #[must_use]
    pub fn handles(&self, failure_type: FailureType) -> bool {
        self.enabled && self.triggers.contains(&failure_type)
    }
}

/// Built-in plans. Escalation is not listed: it always runs once a path
/// is exhausted.
#[must_use]
pub fn default_plans() -> Vec<RecoveryPlan> {
    vec![
        RecoveryPlan::new(
            "network_recovery",
            [FailureType::Network, FailureType::Timeout],
            [SIMPLE_RETRY, GRACEFUL_DEGRADATION],
            Duration::from_secs(30),
            3,
        ),
        RecoveryPlan::new(
            "database_recovery",
            [FailureType::Database],
            [SIMPLE_RETRY, DATA_RECOVERY],
            Duration::from_secs(60),
            2,
        ),
        RecoveryPlan::new(
            "validation_recovery",
            [FailureType::Validation],
            [DATA_RECOVERY],
            Duration::from_secs(45),
            1,
        ),
        RecoveryPlan::new(
            "system_recovery",
            [FailureType::System, FailureType::Unknown],
            [GRACEFUL_DEGRADATION, SIMPLE_RETRY],
            Duration::from_secs(120),
            1,
        ),
    ]
}

/// Plans kept sorted by `max_execution_time`, shortest first.
#[derive(Debug, Clone, Default)]
pub struct PlanBook {
    plans: Vec<RecoveryPlan>,
}

impl PlanBook {
    #[must_use]
    pub fn new(plans: Vec<RecoveryPlan>) -> Self {
        let mut book = Self { plans };
        book.sort();
        book
    }

    fn sort(&mut self) {
        self.plans.sort_by_key(|p| p.max_execution_time);
    }

    /// Add or replace (by name).
    pub fn upsert(&mut self, plan: RecoveryPlan) {
        match self.plans.iter_mut().find(|p| p.name == plan.name) {
            Some(existing) => *existing = plan,
            None => self.plans.push(plan),
        }
        self.sort();
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.plans.len();
        self.plans.retain(|p| p.name != name);
        self.plans.len() != before
    }

    /// First enabled plan triggered by `failure_type`.
    #[must_use]
    pub fn select(&self, failure_type: FailureType) -> Option<&RecoveryPlan> {
        self.plans.iter().find(|p| p.handles(failure_type))
    }

    #[must_use]
    pub fn plans(&self) -> &[RecoveryPlan] {
        &self.plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plans_sorted_by_execution_time() {
        let book = PlanBook::new(default_plans());
        let times: Vec<_> = book.plans().iter().map(|p| p.max_execution_time).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
    }

    #[test]
    fn test_select_prefers_shortest_enabled() {
        let mut book = PlanBook::new(default_plans());
        book.upsert(RecoveryPlan::new(
            "fast_network",
            [FailureType::Network],
            [GRACEFUL_DEGRADATION],
            Duration::from_secs(5),
            0,
        ));
        assert_eq!(book.select(FailureType::Network).unwrap().name, "fast_network");
        assert_eq!(book.select(FailureType::Timeout).unwrap().name, "network_recovery");

        let mut disabled = book.select(FailureType::Network).unwrap().clone();
        disabled.enabled = false;
        book.upsert(disabled);
        assert_eq!(book.select(FailureType::Network).unwrap().name, "network_recovery");
    }

    #[test]
    fn test_unmatched_type() {
        let book = PlanBook::new(vec![]);
        assert!(book.select(FailureType::Database).is_none());
    }
}
