// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Load and stress test settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::monitor::OperationKind;

/// One synthetic user action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadOperation {
    Create,
    Read,
    Update,
    Delete,
    Sync,
    Batch,
}

impl LoadOperation {
    pub const ALL: [LoadOperation; 6] = [
        Self::Create,
        Self::Read,
        Self::Update,
        Self::Delete,
        Self::Sync,
        Self::Batch,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Sync => "sync",
            Self::Batch => "batch",
        }
    }

    /// Metric kind (and baseline) the action is measured against.
    #[must_use]
    pub fn metric_kind(&self) -> OperationKind {
        match self {
            Self::Create | Self::Update | Self::Delete => OperationKind::ProductSync,
            Self::Read => OperationKind::RealtimeEvent,
            Self::Sync => OperationKind::InventorySync,
            Self::Batch => OperationKind::CatalogSync,
        }
    }
}

impl std::fmt::Display for LoadOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relative weights for picking the next action. Zero disables an action.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperationMix {
    #[serde(default)]
    pub create: u32,
    #[serde(default)]
    pub read: u32,
    #[serde(default)]
    pub update: u32,
    #[serde(default)]
    pub delete: u32,
    #[serde(default)]
    pub sync: u32,
    #[serde(default)]
    pub batch: u32,
}

impl Default for OperationMix {
    /// Read-heavy POS traffic
    fn default() -> Self {
        Self {
            create: 20,
            read: 50,
            update: 15,
            delete: 5,
            sync: 5,
            batch: 5,
        }
    }
}

impl OperationMix {
    /// Only `operation`, always.
    #[must_use]
    pub fn only(operation: LoadOperation) -> Self {
        let mut mix = Self {
            create: 0,
            read: 0,
            update: 0,
            delete: 0,
            sync: 0,
            batch: 0,
        };
        *mix.weight_mut(operation) = 1;
        mix
    }

    #[must_use]
    pub fn weight(&self, operation: LoadOperation) -> u32 {
        match operation {
            LoadOperation::Create => self.create,
            LoadOperation::Read => self.read,
            LoadOperation::Update => self.update,
            LoadOperation::Delete => self.delete,
            LoadOperation::Sync => self.sync,
            LoadOperation::Batch => self.batch,
        }
    }

    fn weight_mut(&mut self, operation: LoadOperation) -> &mut u32 {
        match operation {
            LoadOperation::Create => &mut self.create,
            LoadOperation::Read => &mut self.read,
            LoadOperation::Update => &mut self.update,
            LoadOperation::Delete => &mut self.delete,
            LoadOperation::Sync => &mut self.sync,
            LoadOperation::Batch => &mut self.batch,
        }
    }

    /// `(operation, weight)` for every enabled action.
    #[must_use]
    pub fn entries(&self) -> Vec<(LoadOperation, u32)> {
        LoadOperation::ALL
            .iter()
            .map(|op| (*op, self.weight(*op)))
            .filter(|(_, w)| *w > 0)
            .collect()
    }
}

/// Global limits a run must stay under to pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ceilings {
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: f64,
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f64,
    /// Percent of all operations
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
}

fn default_max_memory_mb() -> f64 { 512.0 }
fn default_max_cpu_percent() -> f64 { 80.0 }
fn default_max_error_rate() -> f64 { 5.0 }

impl Default for Ceilings {
    fn default() -> Self {
        Self {
            max_memory_mb: default_max_memory_mb(),
            max_cpu_percent: default_max_cpu_percent(),
            max_error_rate: default_max_error_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTestConfig {
    #[serde(default = "default_name")]
    pub name: String,

    /// Simulated users running at once (after ramp-up)
    #[serde(default = "default_concurrent_users")]
    pub concurrent_users: usize,

    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,

    /// Users start evenly spread over this period
    #[serde(default)]
    pub ramp_up_ms: u64,

    /// Users stop evenly spread over the final period
    #[serde(default)]
    pub ramp_down_ms: u64,

    /// Actions per second per user
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    #[serde(default)]
    pub mix: OperationMix,

    /// Simulated network delay before each action
    #[serde(default)]
    pub network_delay_ms: u64,

    /// Uniform extra delay in `[0, jitter_ms]`
    #[serde(default)]
    pub jitter_ms: u64,

    /// Probability (0-1) that an action fails without reaching the target
    #[serde(default)]
    pub error_injection_rate: f64,

    /// Rows per `Batch` action
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,

    /// How often peak resources are sampled
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Fixed seed for reproducible action sequences
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub ceilings: Ceilings,
}

fn default_name() -> String { "load_test".into() }
fn default_concurrent_users() -> usize { 10 }
fn default_duration_ms() -> u64 { 60_000 }
fn default_requests_per_second() -> f64 { 1.0 }
fn default_batch_rows() -> usize { 10 }
fn default_sample_interval_ms() -> u64 { 1000 }

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            concurrent_users: default_concurrent_users(),
            duration_ms: default_duration_ms(),
            ramp_up_ms: 0,
            ramp_down_ms: 0,
            requests_per_second: default_requests_per_second(),
            mix: OperationMix::default(),
            network_delay_ms: 0,
            jitter_ms: 0,
            error_injection_rate: 0.0,
            batch_rows: default_batch_rows(),
            sample_interval_ms: default_sample_interval_ms(),
            seed: None,
            ceilings: Ceilings::default(),
        }
    }
}

impl LoadTestConfig {
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    #[must_use]
    pub fn ramp_up(&self) -> Duration {
        Duration::from_millis(self.ramp_up_ms)
    }

    #[must_use]
    pub fn ramp_down(&self) -> Duration {
        Duration::from_millis(self.ramp_down_ms)
    }

    /// Gap between two actions of one user.
    #[must_use]
    pub fn action_interval(&self) -> Duration {
        if self.requests_per_second <= 0.0 || !self.requests_per_second.is_finite() {
            return self.duration();
        }
        Duration::from_secs_f64(1.0 / self.requests_per_second)
    }

    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

/// Escalating load: users grow by `step_users` every `step_interval_ms`
/// until a threshold breaks or `max_users` ran a full step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressTestConfig {
    /// Per-step load; `concurrent_users` is the starting count
    #[serde(default)]
    pub base: LoadTestConfig,

    #[serde(default = "default_max_users")]
    pub max_users: usize,

    #[serde(default = "default_step_users")]
    pub step_users: usize,

    #[serde(default = "default_step_interval_ms")]
    pub step_interval_ms: u64,

    /// Error rate (percent) that ends the escalation
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: f64,

    #[serde(default = "default_cpu_threshold_percent")]
    pub cpu_threshold_percent: f64,
}

fn default_max_users() -> usize { 100 }
fn default_step_users() -> usize { 10 }
fn default_step_interval_ms() -> u64 { 30_000 }
fn default_failure_rate_threshold() -> f64 { 10.0 }
fn default_memory_threshold_mb() -> f64 { 1024.0 }
fn default_cpu_threshold_percent() -> f64 { 90.0 }

impl Default for StressTestConfig {
    fn default() -> Self {
        Self {
            base: LoadTestConfig::default(),
            max_users: default_max_users(),
            step_users: default_step_users(),
            step_interval_ms: default_step_interval_ms(),
            failure_rate_threshold: default_failure_rate_threshold(),
            memory_threshold_mb: default_memory_threshold_mb(),
            cpu_threshold_percent: default_cpu_threshold_percent(),
        }
    }
}

impl StressTestConfig {
    #[must_use]
    pub fn step_interval(&self) -> Duration {
        Duration::from_millis(self.step_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_entries_skip_disabled() {
        let mix = OperationMix::only(LoadOperation::Batch);
        assert_eq!(mix.entries(), vec![(LoadOperation::Batch, 1)]);
        assert_eq!(OperationMix::default().entries().len(), 6);
    }

    #[test]
    fn test_action_interval_from_rate() {
        let config = LoadTestConfig {
            requests_per_second: 4.0,
            ..LoadTestConfig::default()
        };
        assert_eq!(config.action_interval(), Duration::from_millis(250));

        let idle = LoadTestConfig {
            requests_per_second: 0.0,
            duration_ms: 500,
            ..LoadTestConfig::default()
        };
        assert_eq!(idle.action_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: StressTestConfig =
            serde_json::from_str(r#"{"base": {"concurrent_users": 2, "mix": {"read": 1}}, "max_users": 6}"#).unwrap();
        assert_eq!(config.base.concurrent_users, 2);
        assert_eq!(config.base.mix.entries(), vec![(LoadOperation::Read, 1)]);
        assert_eq!(config.max_users, 6);
        assert_eq!(config.step_users, 10);
        assert_eq!(config.base.ceilings.max_error_rate, 5.0);
    }
}
