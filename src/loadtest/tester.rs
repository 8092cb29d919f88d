// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Load and stress runs.
//!
//! ```text
//! run_load_test:   users start spread over ramp_up, act every 1/rps,
//!                  leave spread over ramp_down, stop at duration
//! run_stress_test: users += step every step_interval
//!                  until error rate / memory / CPU breaks or max_users ran
//! ```
//!
//! Every action is written to the metrics recorder tagged with the test id,
//! so bottleneck analysis and baseline refresh read the same records.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{LoadOperation, LoadTestConfig, StressTestConfig};
use super::result::{percentile, OperationStats, StressStep, StressSummary, TestKind, TestResult};
use super::{ActionContext, LoadTarget};
use crate::analysis::BottleneckAnalyzer;
use crate::error::SyncError;
use crate::monitor::{MetricRecord, MetricsRecorder, PerformanceBaseline, ProcessSampler, ResourceSample, ResourceSampler};
use crate::scheduler::BackgroundTask;

const TEST_ID_KEY: &str = "load_test_id";

#[derive(Debug, Clone, Copy)]
struct ActionSample {
    operation: LoadOperation,
    latency_ms: f64,
    ok: bool,
}

/// Samples and peak readings of one run (or one stress step).
#[derive(Debug, Default)]
struct Phase {
    samples: Vec<ActionSample>,
    peak: ResourceSample,
    elapsed: Duration,
}

impl Phase {
    fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failed = self.samples.iter().filter(|s| !s.ok).count();
        failed as f64 / self.samples.len() as f64 * 100.0
    }

    fn throughput(&self) -> f64 {
        self.samples.len() as f64 / self.elapsed.as_secs_f64().max(0.001)
    }

    fn sorted_latencies(&self) -> Vec<f64> {
        let mut latencies: Vec<f64> = self.samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_by(f64::total_cmp);
        latencies
    }

    fn absorb(&mut self, other: Phase) {
        self.samples.extend(other.samples);
        self.peak = max_sample(self.peak, other.peak);
        self.elapsed += other.elapsed;
    }
}

fn max_sample(a: ResourceSample, b: ResourceSample) -> ResourceSample {
    ResourceSample {
        memory_mb: a.memory_mb.max(b.memory_mb),
        cpu_percent: a.cpu_percent.max(b.cpu_percent),
    }
}

pub struct LoadTester {
    target: Arc<dyn LoadTarget>,
    recorder: Arc<MetricsRecorder>,
    analyzer: Arc<BottleneckAnalyzer>,
    sampler: Arc<dyn ResourceSampler>,
}

impl LoadTester {
    /// Tester reading real process resources through [`ProcessSampler`].
    pub fn new(target: Arc<dyn LoadTarget>, recorder: Arc<MetricsRecorder>, analyzer: Arc<BottleneckAnalyzer>) -> Self {
        Self {
            target,
            recorder,
            analyzer,
            sampler: Arc::new(ProcessSampler::new()),
        }
    }

    #[must_use]
    pub fn with_sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    #[tracing::instrument(skip(self, config), fields(name = %config.name, users = config.concurrent_users))]
    pub async fn run_load_test(&self, config: &LoadTestConfig) -> TestResult {
        let test_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(test_id = %test_id, duration_ms = config.duration_ms, "Load test started");

        let phase = self
            .drive(config, config.concurrent_users, config.duration(), &test_id)
            .await;

        self.finish(config, TestKind::Load, test_id, started_at, phase, None)
    }

    #[tracing::instrument(skip(self, config), fields(name = %config.base.name, max_users = config.max_users))]
    pub async fn run_stress_test(&self, config: &StressTestConfig) -> TestResult {
        let test_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let step_config = LoadTestConfig {
            ramp_up_ms: 0,
            ramp_down_ms: 0,
            ..config.base.clone()
        };
        let max_users = config.max_users.max(1);
        let mut users = config.base.concurrent_users.clamp(1, max_users);
        let mut total = Phase::default();
        let mut steps = Vec::new();
        let mut max_stable_users = 0;
        let mut breaking_point = None;
        info!(test_id = %test_id, start_users = users, "Stress test started");

        loop {
            let phase = self.drive(&step_config, users, config.step_interval(), &test_id).await;
            let step = StressStep {
                users,
                operations: phase.samples.len() as u64,
                error_rate: phase.error_rate(),
                throughput: phase.throughput(),
                p95_latency_ms: percentile(&phase.sorted_latencies(), 95.0),
                peak: phase.peak,
            };
            debug!(users, error_rate = step.error_rate, throughput = step.throughput, "Stress step complete");
            total.absorb(phase);

            let breach = if step.error_rate > config.failure_rate_threshold {
                Some(format!(
                    "error rate {:.1}% exceeded {:.1}% at {} users",
                    step.error_rate, config.failure_rate_threshold, users
                ))
            } else if step.peak.memory_mb > config.memory_threshold_mb {
                Some(format!(
                    "memory {:.1}MB exceeded {:.1}MB at {} users",
                    step.peak.memory_mb, config.memory_threshold_mb, users
                ))
            } else if step.peak.cpu_percent > config.cpu_threshold_percent {
                Some(format!(
                    "CPU {:.1}% exceeded {:.1}% at {} users",
                    step.peak.cpu_percent, config.cpu_threshold_percent, users
                ))
            } else {
                None
            };
            steps.push(step);

            if let Some(reason) = breach {
                warn!(test_id = %test_id, reason = %reason, "Stress threshold breached");
                breaking_point = Some(reason);
                break;
            }
            max_stable_users = users;
            if users >= max_users {
                break;
            }
            users = (users + config.step_users.max(1)).min(max_users);
        }

        let summary = StressSummary {
            steps,
            max_stable_users,
            breaking_point,
        };
        self.finish(&config.base, TestKind::Stress, test_id, started_at, total, Some(summary))
    }

    /// Refresh baselines from the run's own records (kinds with enough
    /// samples only). Returns the baselines that changed.
    pub fn establish_baselines(&self, result: &TestResult) -> Vec<PerformanceBaseline> {
        let records = self.test_records(result);
        let mut by_kind: BTreeMap<_, Vec<&MetricRecord>> = BTreeMap::new();
        for record in &records {
            by_kind.entry(record.operation).or_default().push(record);
        }
        let updated: Vec<_> = by_kind
            .into_iter()
            .filter_map(|(kind, samples)| self.analyzer.baselines().update_from_samples(kind, &samples))
            .collect();
        info!(test_id = %result.test_id, updated = updated.len(), "Baselines established from load test");
        updated
    }

    fn test_records(&self, result: &TestResult) -> Vec<MetricRecord> {
        self.recorder
            .records_between(result.started_at, result.ended_at)
            .into_iter()
            .filter(|r| r.metadata.get(TEST_ID_KEY).and_then(Value::as_str) == Some(result.test_id.as_str()))
            .collect()
    }

    /// Run `users` simulated users for `duration`.
    async fn drive(&self, config: &LoadTestConfig, users: usize, duration: Duration, test_id: &str) -> Phase {
        let entries = config.mix.entries();
        let weights = match WeightedIndex::new(entries.iter().map(|(_, w)| *w)) {
            Ok(weights) => weights,
            Err(e) => {
                warn!(error = %e, "Operation mix has no enabled actions");
                return Phase::default();
            }
        };
        let operations: Arc<Vec<LoadOperation>> = Arc::new(entries.iter().map(|(op, _)| *op).collect());

        let peak = Arc::new(Mutex::new(self.sampler.sample()));
        let sampler_task = {
            let sampler = Arc::clone(&self.sampler);
            let peak = Arc::clone(&peak);
            BackgroundTask::spawn_interval("loadtest_sampler", config.sample_interval(), move || {
                let reading = sampler.sample();
                let peak = Arc::clone(&peak);
                async move {
                    let mut current = peak.lock();
                    *current = max_sample(*current, reading);
                }
            })
        };

        let started = Instant::now();
        let end = started + duration;
        let samples = Arc::new(Mutex::new(Vec::new()));
        let users = users.max(1);
        let mut handles = Vec::with_capacity(users);

        for user in 0..users {
            let share = user as f64 / users as f64;
            let leave_share = (users - 1 - user) as f64 / users as f64;
            let user_start = started + config.ramp_up().mul_f64(share);
            let user_end = end.checked_sub(config.ramp_down().mul_f64(leave_share)).unwrap_or(end);
            let rng = match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(user as u64)),
                None => StdRng::from_entropy(),
            };
            let user_run = UserRun {
                user,
                target: Arc::clone(&self.target),
                recorder: Arc::clone(&self.recorder),
                operations: Arc::clone(&operations),
                weights: weights.clone(),
                rng,
                samples: Arc::clone(&samples),
                test_id: test_id.to_string(),
                config: config.clone(),
            };
            handles.push(tokio::spawn(user_run.run(user_start, user_end)));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Simulated user ended abnormally");
            }
        }
        sampler_task.stop().await;

        let final_reading = self.sampler.sample();
        let peak = max_sample(*peak.lock(), final_reading);
        let samples = std::mem::take(&mut *samples.lock());
        Phase {
            samples,
            peak,
            elapsed: started.elapsed(),
        }
    }

    fn finish(
        &self,
        config: &LoadTestConfig,
        kind: TestKind,
        test_id: String,
        started_at: DateTime<Utc>,
        phase: Phase,
        stress: Option<StressSummary>,
    ) -> TestResult {
        let ended_at = Utc::now();
        let mut grouped: BTreeMap<LoadOperation, Vec<(f64, bool)>> = BTreeMap::new();
        for s in &phase.samples {
            grouped.entry(s.operation).or_default().push((s.latency_ms, s.ok));
        }
        let operations: BTreeMap<_, _> = grouped
            .into_iter()
            .map(|(op, samples)| (op, OperationStats::from_samples(&samples)))
            .collect();

        let latencies = phase.sorted_latencies();
        let total = phase.samples.len() as u64;
        let failed = phase.samples.iter().filter(|s| !s.ok).count() as u64;
        let bottlenecks = self
            .analyzer
            .analyze(&self.recorder.records_between(started_at, ended_at))
            .bottlenecks;

        let mut result = TestResult {
            test_id,
            name: config.name.clone(),
            kind,
            started_at,
            ended_at,
            duration_ms: phase.elapsed.as_millis() as u64,
            total_operations: total,
            successful_operations: total - failed,
            failed_operations: failed,
            operations,
            avg_latency_ms: if latencies.is_empty() {
                0.0
            } else {
                latencies.iter().sum::<f64>() / latencies.len() as f64
            },
            p95_latency_ms: percentile(&latencies, 95.0),
            p99_latency_ms: percentile(&latencies, 99.0),
            throughput: phase.throughput(),
            error_rate: phase.error_rate(),
            peak: phase.peak,
            bottlenecks,
            passed: false,
            failure_reasons: Vec::new(),
            stress,
        };
        result.failure_reasons = result.evaluate(self.analyzer.baselines(), &config.ceilings);
        result.passed = result.failure_reasons.is_empty();

        crate::metrics::record_load_test(kind.as_str(), result.passed);
        info!(
            test_id = %result.test_id,
            kind = kind.as_str(),
            operations = result.total_operations,
            error_rate = result.error_rate,
            p95_ms = result.p95_latency_ms,
            passed = result.passed,
            "Load test finished"
        );
        result
    }
}

/// One simulated user's loop.
struct UserRun {
    user: usize,
    target: Arc<dyn LoadTarget>,
    recorder: Arc<MetricsRecorder>,
    operations: Arc<Vec<LoadOperation>>,
    weights: WeightedIndex<u32>,
    rng: StdRng,
    samples: Arc<Mutex<Vec<ActionSample>>>,
    test_id: String,
    config: LoadTestConfig,
}

impl UserRun {
    async fn run(mut self, start: Instant, end: Instant) {
        tokio::time::sleep_until(start).await;
        let interval = self.config.action_interval();
        let injection_rate = self.config.error_injection_rate.clamp(0.0, 1.0);
        let mut sequence = 0u64;
        let mut next = Instant::now();

        while Instant::now() < end {
            let operation = self.operations[self.weights.sample(&mut self.rng)];
            let delay = Duration::from_millis(self.config.network_delay_ms + self.jitter());
            let inject = injection_rate > 0.0 && self.rng.gen_bool(injection_rate);

            let wall_start = Utc::now();
            let timer = Instant::now();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let ctx = ActionContext {
                user: self.user,
                sequence,
                batch_rows: self.config.batch_rows,
            };
            let outcome = if inject {
                Err(SyncError::InvalidOperation("injected failure".into()))
            } else {
                self.target.execute(operation, &ctx).await
            };
            let latency = timer.elapsed();

            self.record(operation, wall_start, &outcome);
            self.samples.lock().push(ActionSample {
                operation,
                latency_ms: latency.as_secs_f64() * 1000.0,
                ok: outcome.is_ok(),
            });

            sequence += 1;
            next += interval;
            tokio::time::sleep_until(next).await;
        }
    }

    fn jitter(&mut self) -> u64 {
        if self.config.jitter_ms == 0 {
            return 0;
        }
        self.rng.gen_range(0..=self.config.jitter_ms)
    }

    fn record(&self, operation: LoadOperation, start: DateTime<Utc>, outcome: &crate::error::Result<u64>) {
        let mut metadata = Map::new();
        metadata.insert(TEST_ID_KEY.into(), Value::from(self.test_id.clone()));
        metadata.insert("action".into(), Value::from(operation.as_str()));
        metadata.insert("user".into(), Value::from(self.user));
        let (processed, succeeded, errors) = match outcome {
            Ok(n) => ((*n).max(1), (*n).max(1), Vec::new()),
            Err(e) => (1, 0, vec![e.to_string()]),
        };
        self.recorder
            .record(operation.metric_kind(), start, Utc::now(), processed, succeeded, errors, metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::config::{OperationMix, StressTestConfig};
    use crate::loadtest::EngineTarget;
    use crate::monitor::{BaselineRegistry, OperationKind, ScriptedSampler};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls; fails every action from users at or above `fail_from_user`.
    struct CountingTarget {
        calls: AtomicUsize,
        fail_from_user: usize,
    }

    impl CountingTarget {
        fn new(fail_from_user: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_from_user,
            })
        }
    }

    #[async_trait]
    impl LoadTarget for CountingTarget {
        async fn execute(&self, _operation: LoadOperation, ctx: &ActionContext) -> crate::error::Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if ctx.user >= self.fail_from_user {
                return Err(SyncError::Timeout {
                    operation: "load".into(),
                    timeout_ms: 1,
                });
            }
            Ok(1)
        }
    }

    fn tester(target: Arc<dyn LoadTarget>) -> (LoadTester, Arc<MetricsRecorder>, Arc<BottleneckAnalyzer>) {
        let recorder = Arc::new(MetricsRecorder::in_memory());
        let analyzer = Arc::new(BottleneckAnalyzer::new(Arc::new(BaselineRegistry::with_defaults())));
        let tester = LoadTester::new(target, recorder.clone(), analyzer.clone())
            .with_sampler(Arc::new(ScriptedSampler::constant(64.0, 10.0)));
        (tester, recorder, analyzer)
    }

    fn config(users: usize, duration_ms: u64, mix: OperationMix) -> LoadTestConfig {
        LoadTestConfig {
            concurrent_users: users,
            duration_ms,
            requests_per_second: 10.0,
            mix,
            seed: Some(7),
            ..LoadTestConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_test_paces_users() {
        let target = CountingTarget::new(usize::MAX);
        let (tester, recorder, _) = tester(target.clone());

        let result = tester
            .run_load_test(&config(2, 1000, OperationMix::only(LoadOperation::Read)))
            .await;

        // Actions at 0, 100, ..., 900ms for each user
        assert_eq!(result.total_operations, 20);
        assert_eq!(target.calls.load(Ordering::SeqCst), 20);
        assert_eq!(result.failed_operations, 0);
        assert_eq!(result.operations[&LoadOperation::Read].count, 20);
        assert_eq!(result.peak.memory_mb, 64.0);
        assert!(result.passed, "unexpected failures: {:?}", result.failure_reasons);
        assert_eq!(recorder.len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_up_reduces_early_load() {
        let target = CountingTarget::new(usize::MAX);
        let (tester, _, _) = tester(target.clone());

        let steady = tester
            .run_load_test(&config(4, 2000, OperationMix::only(LoadOperation::Create)))
            .await;
        let ramped = tester
            .run_load_test(&LoadTestConfig {
                ramp_up_ms: 1000,
                ramp_down_ms: 1000,
                ..config(4, 2000, OperationMix::only(LoadOperation::Create))
            })
            .await;

        assert_eq!(steady.total_operations, 80);
        assert!(ramped.total_operations < steady.total_operations);
        assert!(ramped.total_operations > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_errors_fail_the_run() {
        let target = CountingTarget::new(usize::MAX);
        let (tester, _, _) = tester(target.clone());

        let result = tester
            .run_load_test(&LoadTestConfig {
                error_injection_rate: 1.0,
                ..config(1, 500, OperationMix::default())
            })
            .await;

        assert_eq!(target.calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.error_rate, 100.0);
        assert!(!result.passed);
        assert!(result.failure_reasons.iter().any(|r| r.contains("overall error rate")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_delay_shows_in_latency() {
        let target = CountingTarget::new(usize::MAX);
        let (tester, _, _) = tester(target);

        let result = tester
            .run_load_test(&LoadTestConfig {
                network_delay_ms: 30,
                ..config(1, 500, OperationMix::only(LoadOperation::Read))
            })
            .await;

        assert!(result.total_operations > 0);
        assert!(result.avg_latency_ms >= 30.0);
        assert!(result.p99_latency_ms >= 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stress_stops_at_error_threshold() {
        let target = CountingTarget::new(4);
        let (tester, _, _) = tester(target);

        let result = tester
            .run_stress_test(&StressTestConfig {
                base: config(2, 0, OperationMix::only(LoadOperation::Update)),
                max_users: 10,
                step_users: 2,
                step_interval_ms: 500,
                failure_rate_threshold: 10.0,
                ..StressTestConfig::default()
            })
            .await;

        let stress = result.stress.as_ref().unwrap();
        let users: Vec<_> = stress.steps.iter().map(|s| s.users).collect();
        assert_eq!(users, vec![2, 4, 6]);
        assert_eq!(stress.max_stable_users, 4);
        assert!(stress.breaking_point.as_deref().unwrap().contains("error rate"));
        assert_eq!(result.kind, TestKind::Stress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stress_runs_to_max_users() {
        let target = CountingTarget::new(usize::MAX);
        let (tester, _, _) = tester(target);

        let result = tester
            .run_stress_test(&StressTestConfig {
                base: config(2, 0, OperationMix::only(LoadOperation::Read)),
                max_users: 5,
                step_users: 2,
                step_interval_ms: 300,
                ..StressTestConfig::default()
            })
            .await;

        let stress = result.stress.unwrap();
        let users: Vec<_> = stress.steps.iter().map(|s| s.users).collect();
        assert_eq!(users, vec![2, 4, 5]);
        assert_eq!(stress.max_stable_users, 5);
        assert!(stress.breaking_point.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stress_memory_threshold() {
        let recorder = Arc::new(MetricsRecorder::in_memory());
        let analyzer = Arc::new(BottleneckAnalyzer::new(Arc::new(BaselineRegistry::with_defaults())));
        let tester = LoadTester::new(CountingTarget::new(usize::MAX), recorder, analyzer)
            .with_sampler(Arc::new(ScriptedSampler::constant(4096.0, 5.0)));

        let result = tester
            .run_stress_test(&StressTestConfig {
                base: config(1, 0, OperationMix::only(LoadOperation::Read)),
                step_interval_ms: 200,
                memory_threshold_mb: 1024.0,
                ..StressTestConfig::default()
            })
            .await;

        let stress = result.stress.as_ref().unwrap();
        assert_eq!(stress.steps.len(), 1);
        assert_eq!(stress.max_stable_users, 0);
        assert!(stress.breaking_point.as_deref().unwrap().contains("memory"));
        assert!(result.failure_reasons.iter().any(|r| r.contains("peak memory")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_establish_baselines_from_run() {
        let target = CountingTarget::new(usize::MAX);
        let (tester, _, analyzer) = tester(target);

        let result = tester
            .run_load_test(&config(2, 1000, OperationMix::only(LoadOperation::Read)))
            .await;
        let updated = tester.establish_baselines(&result);

        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].operation, OperationKind::RealtimeEvent);
        assert_eq!(updated[0].sample_count, 20);
        assert_eq!(
            analyzer.baselines().get(OperationKind::RealtimeEvent).unwrap().sample_count,
            20
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_target_round_trip() {
        use crate::config::EngineConfig;
        use crate::engine::SyncEngine;
        use crate::storage::memory::InMemoryRowStore;
        use crate::storage::traits::RowStore;

        let store = Arc::new(InMemoryRowStore::new());
        let recorder = Arc::new(MetricsRecorder::in_memory());
        let engine = Arc::new(SyncEngine::new(
            EngineConfig::default(),
            store.clone() as Arc<dyn RowStore>,
            recorder.clone(),
        ));
        engine.start();

        let target = Arc::new(EngineTarget::new(engine.clone(), store.clone() as Arc<dyn RowStore>));
        let analyzer = Arc::new(BottleneckAnalyzer::new(Arc::new(BaselineRegistry::with_defaults())));
        let tester = LoadTester::new(target, recorder, analyzer)
            .with_sampler(Arc::new(ScriptedSampler::constant(64.0, 10.0)));

        let result = tester
            .run_load_test(&config(2, 1000, OperationMix::default()))
            .await;

        assert_eq!(result.failed_operations, 0, "{:?}", result.failure_reasons);
        assert!(!store.is_empty("products"));
        engine.shutdown().await;
    }
}
