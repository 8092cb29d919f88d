// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Communication optimizer
//!
//! Wraps the connection pool, request cache and compressor around ad-hoc
//! backend calls.
//!
//! ```text
//! request(name, f, cache_key)
//!    │
//!    ├─→ cache hit ──────────────────────────────→ decode, record, return
//!    │
//!    └─→ for attempt in 0..=retry_attempts
//!           lease = pool.acquire_any()      (dropped at end of attempt)
//!           timeout(request_timeout, f())
//!           ok  → compress → cache → record → return
//!           err → sleep(retry_delay × 2^attempt)
//! ```
//!
//! Every call produces exactly one [`MetricRecord`](crate::monitor::MetricRecord).
//! The optimizer also keeps the last [`SAMPLE_WINDOW`] request samples, from
//! which [`optimize_configuration`](CommunicationOptimizer::optimize_configuration)
//! proposes new settings.

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cache::{CacheStats, RequestCache};
use super::pool::{ConnectionPool, PoolStats};
use crate::compression::{CompressedPayload, DataCompressor};
use crate::config::CommunicationConfig;
use crate::error::{Result, SyncError};
use crate::monitor::{MetricsRecorder, OperationKind};
use crate::resilience::retry::RetryConfig;
use crate::scheduler::{BackgroundTask, TaskGroup};

/// Request samples kept for tuning
pub const SAMPLE_WINDOW: usize = 100;

const MAX_POOL_SIZE: usize = 50;
const MIN_POOL_SIZE: usize = 5;
const HIGH_UTILIZATION: f64 = 0.8;
const LOW_UTILIZATION: f64 = 0.3;
const MAX_REQUEST_TIMEOUT_MS: u64 = 120_000;
const MIN_REQUEST_TIMEOUT_MS: u64 = 5_000;
const MAX_BATCH_SIZE: usize = 100;
const MAX_RETRY_ATTEMPTS: u32 = 5;
const MAX_RETRY_DELAY_MS: u64 = 10_000;
const MAX_CACHE_TTL_SECS: u64 = 3600;

/// Per-call overrides of the live configuration.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub retry_attempts: Option<u32>,
    pub retry_delay: Option<Duration>,
    /// Consult and populate the cache when a key is given
    pub use_cache: bool,
    /// Kind the metric record is filed under; defaults to routing by name
    pub operation: Option<OperationKind>,
    /// Records the call represents, for throughput accounting
    pub records: u64,
    /// Items per batch in `batch_request`
    pub batch_size: Option<usize>,
    pub parallel: Option<bool>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retry_attempts: None,
            retry_delay: None,
            use_cache: true,
            operation: None,
            records: 1,
            batch_size: None,
            parallel: None,
        }
    }
}

impl RequestOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = Some(attempts);
        self.retry_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn for_operation(mut self, operation: OperationKind) -> Self {
        self.operation = Some(operation);
        self
    }

    #[must_use]
    pub fn no_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

/// Results of a batched request, in submission order.
#[derive(Debug)]
pub struct BatchResponse<T> {
    pub results: Vec<Result<T>>,
    pub succeeded: usize,
    pub failed: usize,
    pub batches: usize,
    pub duration: Duration,
}

impl<T> BatchResponse<T> {
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct RequestSample {
    latency: Duration,
    success: bool,
    timed_out: bool,
    cache_hit: bool,
    retries: u32,
    pool_utilization: f64,
}

/// Settings change suggested from recent request samples.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationProposal {
    pub current: CommunicationConfig,
    pub proposed: CommunicationConfig,
    pub changes: Vec<String>,
    pub recommendations: Vec<String>,
    /// Rough expected gain in percent
    pub estimated_improvement: f64,
    pub sample_count: usize,
}

impl OptimizationProposal {
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.current != self.proposed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommunicationStats {
    pub pool: PoolStats,
    pub cache: CacheStats,
    pub samples: usize,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

pub struct CommunicationOptimizer {
    config: RwLock<CommunicationConfig>,
    pool: RwLock<Arc<ConnectionPool>>,
    cache: Arc<RequestCache<Arc<CompressedPayload>>>,
    compressor: RwLock<DataCompressor>,
    recorder: Arc<MetricsRecorder>,
    samples: Mutex<VecDeque<RequestSample>>,
    tasks: TaskGroup,
}

fn should_retry(error: &SyncError) -> bool {
    !matches!(
        error,
        SyncError::CircuitOpen { .. }
            | SyncError::ValidationFailed { .. }
            | SyncError::InvalidOperation(_)
            | SyncError::OperationUnsupported(_)
            | SyncError::Shutdown
    )
}

fn compressor_for(config: &CommunicationConfig) -> DataCompressor {
    DataCompressor::new(
        config.enable_compression,
        config.compression_threshold_bytes,
        config.compression_level,
    )
}

impl CommunicationOptimizer {
    pub fn new(config: CommunicationConfig, recorder: Arc<MetricsRecorder>) -> Self {
        let pool = ConnectionPool::new(config.max_connections, config.idle_timeout());
        let cache = RequestCache::new(config.cache_max_size, config.cache_ttl(), config.cache_strategy);
        Self {
            pool: RwLock::new(Arc::new(pool)),
            cache: Arc::new(cache),
            compressor: RwLock::new(compressor_for(&config)),
            config: RwLock::new(config),
            recorder,
            samples: Mutex::new(VecDeque::with_capacity(SAMPLE_WINDOW)),
            tasks: TaskGroup::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> CommunicationConfig {
        self.config.read().clone()
    }

    /// The live pool. Replaced by [`apply_configuration`](Self::apply_configuration).
    #[must_use]
    pub fn pool(&self) -> Arc<ConnectionPool> {
        Arc::clone(&self.pool.read())
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Run `f` with caching, pooling, timeout and retry.
    #[tracing::instrument(skip(self, f, options))]
    pub async fn request<T, F, Fut>(&self, name: &str, f: F, cache_key: Option<&str>, options: RequestOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let config = self.config();
        let started_at = Utc::now();
        let started = Instant::now();
        let operation = options.operation.unwrap_or_else(|| OperationKind::for_table(name));
        let cache_key = cache_key.filter(|_| config.enable_caching && options.use_cache);

        if let Some(key) = cache_key {
            if let Some(payload) = self.cache.get(key) {
                let decoded = self.compressor.read().decompress_json::<T>(&payload.bytes);
                match decoded {
                    Ok(value) => {
                        debug!(request = name, key, "Served from request cache");
                        self.finish(name, operation, started_at, started, &options, CallSummary {
                            error: None,
                            cache_hit: true,
                            retries: 0,
                            compression_ratio: payload.ratio(),
                            pool_utilization: self.pool().utilization(),
                            timed_out: false,
                        });
                        return Ok(value);
                    }
                    Err(e) => {
                        warn!(request = name, key, error = %e, "Dropping undecodable cache entry");
                        self.cache.remove(key);
                    }
                }
            }
        }

        let retry_attempts = options.retry_attempts.unwrap_or(config.retry_attempts);
        let policy = RetryConfig::operation(retry_attempts, options.retry_delay.unwrap_or_else(|| config.retry_delay()));
        let timeout = options.timeout.unwrap_or_else(|| config.request_timeout());

        let mut attempt: u32 = 0;
        let mut pool_utilization = 0.0;
        let mut timed_out = false;
        let outcome = loop {
            let result = {
                let pool = self.pool();
                match pool.acquire_any() {
                    Ok(_lease) => {
                        pool_utilization = pool.utilization();
                        match tokio::time::timeout(timeout, f()).await {
                            Ok(r) => r,
                            Err(_) => {
                                timed_out = true;
                                Err(SyncError::Timeout {
                                    operation: name.to_string(),
                                    timeout_ms: timeout.as_millis() as u64,
                                })
                            }
                        }
                    }
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(value) => break Ok(value),
                Err(e) if attempt < retry_attempts && should_retry(&e) => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(request = name, attempt = attempt + 1, error = %e, delay_ms = delay.as_millis() as u64, "Request failed, retrying");
                    crate::metrics::record_retry("communication", name);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        let mut compression_ratio = 1.0;
        if let Ok(value) = &outcome {
            match self.compressor.read().compress_json(value) {
                Ok(payload) => {
                    compression_ratio = payload.ratio();
                    if let Some(key) = cache_key {
                        self.cache.set(key, Arc::new(payload));
                    }
                }
                Err(e) => warn!(request = name, error = %e, "Failed to encode response for caching"),
            }
        }

        self.finish(name, operation, started_at, started, &options, CallSummary {
            error: outcome.as_ref().err().map(ToString::to_string),
            cache_hit: false,
            retries: attempt,
            compression_ratio,
            pool_utilization,
            timed_out,
        });
        outcome
    }

    fn finish(
        &self,
        name: &str,
        operation: OperationKind,
        started_at: chrono::DateTime<Utc>,
        started: Instant,
        options: &RequestOptions,
        call: CallSummary,
    ) {
        let latency = started.elapsed();
        let success = call.error.is_none();

        let mut metadata = Map::new();
        metadata.insert("request".into(), json!(name));
        metadata.insert("cache_hit".into(), json!(call.cache_hit));
        metadata.insert("compression_ratio".into(), json!(call.compression_ratio));
        metadata.insert("pool_utilization".into(), json!(call.pool_utilization));
        metadata.insert("retry_count".into(), json!(call.retries));
        metadata.insert("latency_ms".into(), Value::from(latency.as_millis() as u64));

        let processed = options.records;
        let succeeded = if success { processed } else { 0 };
        self.recorder.record(
            operation,
            started_at,
            started_at + chrono::Duration::from_std(latency).unwrap_or_else(|_| chrono::Duration::zero()),
            processed,
            succeeded,
            call.error.into_iter().collect(),
            metadata,
        );

        crate::metrics::record_request(name, if success { "success" } else { "failed" });
        crate::metrics::record_latency("communication", name, latency);

        let mut samples = self.samples.lock();
        if samples.len() >= SAMPLE_WINDOW {
            samples.pop_front();
        }
        samples.push_back(RequestSample {
            latency,
            success,
            timed_out: call.timed_out,
            cache_hit: call.cache_hit,
            retries: call.retries,
            pool_utilization: call.pool_utilization,
        });
    }

    /// Run every closure through [`request`](Self::request), in batches of
    /// the configured size. Items of one batch run concurrently when
    /// parallel batching is on; batches always run one after another.
    pub async fn batch_request<T, F, Fut>(&self, name: &str, requests: Vec<F>, options: RequestOptions) -> BatchResponse<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let config = self.config();
        let batch_size = options.batch_size.unwrap_or(config.batch_size).max(1);
        let parallel = options.parallel.unwrap_or(config.parallel_batches);
        let started = Instant::now();

        let mut results = Vec::with_capacity(requests.len());
        let mut batches = 0;
        let mut pending = requests.into_iter().peekable();
        while pending.peek().is_some() {
            let chunk: Vec<F> = pending.by_ref().take(batch_size).collect();
            batches += 1;
            if parallel {
                let calls = chunk.into_iter().map(|f| self.request(name, f, None, options.clone()));
                results.extend(join_all(calls).await);
            } else {
                for f in chunk {
                    results.push(self.request(name, f, None, options.clone()).await);
                }
            }
        }

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let failed = results.len() - succeeded;
        debug!(request = name, batches, succeeded, failed, "Batch request complete");
        BatchResponse {
            results,
            succeeded,
            failed,
            batches,
            duration: started.elapsed(),
        }
    }

    /// Propose new settings from the recent request samples.
    pub fn optimize_configuration(&self) -> OptimizationProposal {
        let current = self.config();
        let samples: Vec<RequestSample> = self.samples.lock().iter().copied().collect();
        let mut proposed = current.clone();
        let mut changes = Vec::new();
        let mut recommendations = Vec::new();
        let mut estimated_improvement: f64 = 0.0;

        if samples.is_empty() {
            recommendations.push("No request samples yet: keep the current configuration".to_string());
            return OptimizationProposal {
                current,
                proposed,
                changes,
                recommendations,
                estimated_improvement,
                sample_count: 0,
            };
        }

        let n = samples.len() as f64;
        let network: Vec<&RequestSample> = samples.iter().filter(|s| !s.cache_hit).collect();
        let utilization = if network.is_empty() {
            0.0
        } else {
            network.iter().map(|s| s.pool_utilization).sum::<f64>() / network.len() as f64
        };
        let error_rate = samples.iter().filter(|s| !s.success).count() as f64 / n;
        let timeout_rate = samples.iter().filter(|s| s.timed_out).count() as f64 / n;
        let hit_rate = samples.iter().filter(|s| s.cache_hit).count() as f64 / n;
        let avg_latency_ms = samples.iter().map(|s| s.latency.as_secs_f64() * 1000.0).sum::<f64>() / n;
        let avg_retries = samples.iter().map(|s| f64::from(s.retries)).sum::<f64>() / n;

        if utilization > HIGH_UTILIZATION {
            let size = ((current.max_connections as f64 * 1.5).ceil() as usize).min(MAX_POOL_SIZE);
            if size != current.max_connections {
                proposed.max_connections = size;
                changes.push(format!("max_connections {} -> {}", current.max_connections, size));
                estimated_improvement += 15.0;
            }
            recommendations.push(format!("Pool utilization is {:.0}%: grow the pool", utilization * 100.0));
        } else if utilization < LOW_UTILIZATION && !network.is_empty() && current.max_connections > MIN_POOL_SIZE {
            let size = ((current.max_connections as f64 * 0.8).floor() as usize).max(MIN_POOL_SIZE);
            if size != current.max_connections {
                proposed.max_connections = size;
                changes.push(format!("max_connections {} -> {}", current.max_connections, size));
                estimated_improvement += 5.0;
            }
        }

        if timeout_rate > 0.05 {
            let timeout = (current.request_timeout_ms * 3 / 2).min(MAX_REQUEST_TIMEOUT_MS);
            if timeout != current.request_timeout_ms {
                proposed.request_timeout_ms = timeout;
                changes.push(format!("request_timeout_ms {} -> {}", current.request_timeout_ms, timeout));
                estimated_improvement += 10.0;
            }
            recommendations.push(format!("{:.0}% of requests time out: check backend latency", timeout_rate * 100.0));
        } else if timeout_rate == 0.0 && avg_latency_ms * 4.0 < current.request_timeout_ms as f64 {
            let timeout = ((avg_latency_ms * 4.0) as u64).max(MIN_REQUEST_TIMEOUT_MS);
            if timeout < current.request_timeout_ms {
                proposed.request_timeout_ms = timeout;
                changes.push(format!("request_timeout_ms {} -> {}", current.request_timeout_ms, timeout));
                estimated_improvement += 5.0;
            }
        }

        if error_rate > 0.1 {
            let batch = (current.batch_size / 2).max(1);
            if batch != current.batch_size {
                proposed.batch_size = batch;
                changes.push(format!("batch_size {} -> {}", current.batch_size, batch));
            }
            let attempts = (current.retry_attempts + 1).min(MAX_RETRY_ATTEMPTS);
            let delay = (current.retry_delay_ms * 3 / 2).min(MAX_RETRY_DELAY_MS);
            if attempts != current.retry_attempts || delay != current.retry_delay_ms {
                proposed.retry_attempts = attempts;
                proposed.retry_delay_ms = delay;
                changes.push(format!(
                    "retry_attempts {} -> {}, retry_delay_ms {} -> {}",
                    current.retry_attempts, attempts, current.retry_delay_ms, delay
                ));
            }
            estimated_improvement += 10.0;
            recommendations.push(format!(
                "Error rate is {:.1}%: investigate failing requests before tuning further",
                error_rate * 100.0
            ));
        } else if error_rate < 0.01 && avg_latency_ms < 100.0 {
            let batch = ((current.batch_size as f64 * 1.5).ceil() as usize).min(MAX_BATCH_SIZE);
            if batch != current.batch_size {
                proposed.batch_size = batch;
                changes.push(format!("batch_size {} -> {}", current.batch_size, batch));
                estimated_improvement += 10.0;
            }
            if avg_retries == 0.0 && current.retry_attempts > 1 {
                proposed.retry_attempts = current.retry_attempts - 1;
                changes.push(format!("retry_attempts {} -> {}", current.retry_attempts, proposed.retry_attempts));
            }
        }

        if current.enable_caching && hit_rate < 0.2 && n >= 10.0 {
            let ttl = (current.cache_ttl_secs * 2).min(MAX_CACHE_TTL_SECS);
            if ttl != current.cache_ttl_secs {
                proposed.cache_ttl_secs = ttl;
                changes.push(format!("cache_ttl_secs {} -> {}", current.cache_ttl_secs, ttl));
                estimated_improvement += 5.0;
            }
            recommendations.push(format!(
                "Cache hit rate is {:.0}%: pass cache keys for repeated reads",
                hit_rate * 100.0
            ));
        }

        if !current.enable_compression && avg_latency_ms > 1000.0 {
            recommendations.push("Responses are slow: consider enabling compression".to_string());
        }

        OptimizationProposal {
            current,
            proposed,
            changes,
            recommendations,
            estimated_improvement: estimated_improvement.min(50.0),
            sample_count: samples.len(),
        }
    }

    /// Swap in `config`. The pool is rebuilt at the new size; leases on the
    /// old pool stay valid until dropped.
    pub fn apply_configuration(&self, config: CommunicationConfig) {
        let pool = ConnectionPool::new(config.max_connections, config.idle_timeout());
        *self.pool.write() = Arc::new(pool);
        *self.compressor.write() = compressor_for(&config);
        info!(
            max_connections = config.max_connections,
            request_timeout_ms = config.request_timeout_ms,
            batch_size = config.batch_size,
            retry_attempts = config.retry_attempts,
            "Applied communication configuration"
        );
        *self.config.write() = config;
    }

    #[must_use]
    pub fn stats(&self) -> CommunicationStats {
        let samples = self.samples.lock();
        let n = samples.len();
        let (success_rate, avg_latency_ms) = if n == 0 {
            (1.0, 0.0)
        } else {
            (
                samples.iter().filter(|s| s.success).count() as f64 / n as f64,
                samples.iter().map(|s| s.latency.as_secs_f64() * 1000.0).sum::<f64>() / n as f64,
            )
        };
        drop(samples);
        CommunicationStats {
            pool: self.pool().stats(),
            cache: self.cache.stats(),
            samples: n,
            success_rate,
            avg_latency_ms,
        }
    }

    /// Start the pool-idle and cache-TTL sweeps.
    pub fn start(self: &Arc<Self>) {
        if self.tasks.is_running() {
            return;
        }
        let period = self.config().sweep_interval();
        let weak: Weak<Self> = Arc::downgrade(self);
        self.tasks.push(BackgroundTask::spawn_interval("communication_pool_sweep", period, move || {
            let weak = weak.clone();
            async move {
                if let Some(this) = weak.upgrade() {
                    let pool = this.pool();
                    pool.evict_idle();
                    crate::metrics::set_pool_utilization(pool.utilization());
                }
            }
        }));
        self.tasks.push(self.cache.spawn_ttl_sweeper(period));
        info!(sweep_interval_secs = period.as_secs(), "Communication optimizer started");
    }

    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
        debug!("Communication optimizer stopped");
    }
}

struct CallSummary {
    error: Option<String>,
    cache_hit: bool,
    retries: u32,
    compression_ratio: f64,
    pool_utilization: f64,
    timed_out: bool,
}
