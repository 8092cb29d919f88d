// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker pattern.
//!
//! Provides protection against cascading failures when a table, backend, or
//! registered operation keeps failing. Wraps async operations and counts
//! failures to "trip" the breaker once the threshold is reached.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Resource unhealthy, requests fail-fast without attempting
//! - HalfOpen: Reset timeout elapsed, exactly one trial request allowed
//!
//! Every admitted call is bounded by `call_timeout`; a timeout counts as a
//! failure. Timing uses `tokio::time::Instant`, so paused-clock tests can
//! step through the reset timeout deterministically.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SyncError;

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error("circuit '{circuit}' open, request rejected")]
    Rejected { circuit: String },

    /// The call exceeded the breaker's call timeout
    #[error("circuit '{circuit}' call timed out after {timeout:?}")]
    Timeout { circuit: String, timeout: Duration },

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    /// Whether the breaker refused to run the call at all.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

impl<E: Into<SyncError>> From<CircuitError<E>> for SyncError {
    fn from(err: CircuitError<E>) -> Self {
        match err {
            CircuitError::Rejected { circuit } => SyncError::CircuitOpen { circuit },
            CircuitError::Timeout { circuit, timeout } => SyncError::Timeout {
                operation: circuit,
                timeout_ms: timeout.as_millis() as u64,
            },
            CircuitError::Inner(e) => e.into(),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of failures (without an intervening success) that trips the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed
    pub reset_timeout: Duration,
    /// Absolute bound on each admitted call
    pub call_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Aggressive config for critical paths (trips faster, recovers cautiously)
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(120),
            call_timeout: Duration::from_secs(10),
        }
    }

    /// Lenient config for less critical paths (tolerates more failures)
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            reset_timeout: Duration::from_secs(15),
            call_timeout: Duration::from_secs(60),
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(50),
            call_timeout: Duration::from_millis(200),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Time until a trial call is admitted (only while open)
    pub next_retry_in: Option<Duration>,
    pub calls_total: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    next_attempt: Option<Instant>,
    trial_in_flight: bool,
}

/// Clears the half-open trial slot if the trial future is dropped mid-call.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut s = self.breaker.state.lock();
            s.trial_in_flight = false;
            s.state = CircuitState::Open;
            s.next_attempt = Some(Instant::now());
        }
    }
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    state: Mutex<BreakerState>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                next_attempt: None,
                trial_in_flight: false,
            }),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Create with default config
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    /// Get the circuit breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Get current circuit state.
    ///
    /// An open circuit whose reset timeout has elapsed still reports `Open`
    /// until a call arrives to take the trial slot.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Whether a call made now would be rejected without running.
    #[must_use]
    pub fn would_reject(&self) -> bool {
        let s = self.state.lock();
        match s.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen => s.trial_in_flight,
            CircuitState::Open => s.next_attempt.map_or(false, |at| Instant::now() < at),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let s = self.state.lock();
        let now = Instant::now();
        CircuitSnapshot {
            name: self.name.clone(),
            state: s.state,
            failure_count: s.failure_count,
            last_failure_at: s.last_failure_at,
            next_retry_in: match s.state {
                CircuitState::Open => s.next_attempt.map(|at| at.saturating_duration_since(now)),
                _ => None,
            },
            calls_total: self.calls_total(),
            successes: self.successes(),
            failures: self.failures(),
            rejections: self.rejections(),
        }
    }

    /// Decide whether a call may run. `Ok(true)` means it is the half-open trial.
    fn admit(&self) -> Result<bool, ()> {
        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen if s.trial_in_flight => Err(()),
            CircuitState::HalfOpen => {
                s.trial_in_flight = true;
                Ok(true)
            }
            CircuitState::Open => {
                let ready = s.next_attempt.map_or(true, |at| Instant::now() >= at);
                if !ready {
                    return Err(());
                }
                s.state = CircuitState::HalfOpen;
                s.trial_in_flight = true;
                drop(s);
                info!(circuit = %self.name, "Circuit half-open, admitting trial call");
                crate::metrics::set_circuit_state(&self.name, CircuitState::HalfOpen as u8);
                Ok(true)
            }
        }
    }

    fn on_success(&self) {
        let mut s = self.state.lock();
        let was = s.state;
        s.state = CircuitState::Closed;
        s.failure_count = 0;
        s.next_attempt = None;
        s.trial_in_flight = false;
        drop(s);
        if was != CircuitState::Closed {
            info!(circuit = %self.name, "Circuit closed after successful trial");
            crate::metrics::set_circuit_state(&self.name, CircuitState::Closed as u8);
        }
    }

    fn on_failure(&self) {
        let mut s = self.state.lock();
        s.failure_count = s.failure_count.saturating_add(1);
        s.last_failure_at = Some(Utc::now());
        let trip = s.state == CircuitState::HalfOpen || s.failure_count >= self.config.failure_threshold;
        s.trial_in_flight = false;
        if trip {
            s.state = CircuitState::Open;
            s.next_attempt = Some(Instant::now() + self.config.reset_timeout);
        }
        let failures = s.failure_count;
        drop(s);
        if trip {
            warn!(
                circuit = %self.name,
                failures,
                reset_timeout = ?self.config.reset_timeout,
                "Circuit opened"
            );
            crate::metrics::set_circuit_state(&self.name, CircuitState::Open as u8);
        }
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// Takes a closure that returns a Future, allowing lazy evaluation: a
    /// rejected call never constructs the future.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let is_trial = match self.admit() {
            Ok(trial) => trial,
            Err(()) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                return Err(CircuitError::Rejected { circuit: self.name.clone() });
            }
        };
        let mut guard = TrialGuard { breaker: self, armed: is_trial };

        let outcome = tokio::time::timeout(self.config.call_timeout, f()).await;
        guard.armed = false;

        match outcome {
            Ok(Ok(result)) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.on_success();
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.on_failure();
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.on_failure();
                warn!(circuit = %self.name, timeout = ?self.config.call_timeout, "Circuit call timed out");
                crate::metrics::record_circuit_call(&self.name, "timeout");
                Err(CircuitError::Timeout {
                    circuit: self.name.clone(),
                    timeout: self.config.call_timeout,
                })
            }
        }
    }

    /// Report an outcome observed outside `execute` (e.g. a chunked bulk write
    /// that already ran under its own timeout).
    pub fn record_outcome(&self, success: bool) {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
            self.on_success();
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
            self.on_failure();
        }
    }

    /// Force the circuit closed and clear the failure count.
    pub fn reset(&self) {
        self.on_success();
    }

    /// Get total number of calls
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors and timeouts)
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }
}

/// Breakers keyed by resource name (table, operation), created on first use.
pub struct CircuitRegistry {
    config: CircuitConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `name`, creating it with the registry's config if needed.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.get(name) {
            return b.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Breaker for `name` if one exists.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Snapshots of every breaker, sorted by name.
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Names of breakers currently open or half-open.
    #[must_use]
    pub fn tripped(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .breakers
            .iter()
            .filter(|b| b.state() != CircuitState::Closed)
            .map(|b| b.key().clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        let result: Result<i32, CircuitError<&str>> = cb.execute(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        let result: Result<i32, CircuitError<&str>> = cb.execute(|| async { Err("boom") }).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_at_threshold_and_rejects_without_invoking() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        for _ in 0..2 {
            let _: Result<i32, CircuitError<&str>> = cb.execute(|| async { Err("fail") }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = Arc::new(AtomicUsize::new(0));
        let i = invoked.clone();
        let result: Result<i32, CircuitError<&str>> = cb
            .execute(|| async move {
                i.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Rejected { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.rejections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        for _ in 0..2 {
            let _: Result<(), CircuitError<&str>> = cb.execute(|| async { Err("fail") }).await;
        }
        assert!(cb.would_reject());

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(!cb.would_reject());

        let result: Result<i32, CircuitError<&str>> = cb.execute(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_timeout() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        for _ in 0..2 {
            let _: Result<(), CircuitError<&str>> = cb.execute(|| async { Err("fail") }).await;
        }
        tokio::time::advance(Duration::from_millis(60)).await;

        let _: Result<(), CircuitError<&str>> = cb.execute(|| async { Err("still down") }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let snap = cb.snapshot();
        assert_eq!(snap.next_retry_in, Some(Duration::from_millis(50)));
        assert!(snap.last_failure_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let cb = Arc::new(CircuitBreaker::new("test", CircuitConfig::test()));
        for _ in 0..2 {
            let _: Result<(), CircuitError<&str>> = cb.execute(|| async { Err("fail") }).await;
        }
        tokio::time::advance(Duration::from_millis(60)).await;

        let slow = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(|| async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, &str>(1)
                })
                .await
                .is_ok()
            })
        };
        tokio::task::yield_now().await;

        let second: Result<i32, CircuitError<&str>> = cb.execute(|| async { Ok(2) }).await;
        assert!(second.unwrap_err().is_rejected());
        assert!(slow.await.unwrap());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        let result: Result<(), CircuitError<&str>> = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Timeout { .. })));
        assert_eq!(cb.failures(), 1);
        assert_eq!(cb.snapshot().failure_count, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        let _: Result<(), CircuitError<&str>> = cb.execute(|| async { Err("x") }).await;
        let _: Result<(), CircuitError<&str>> = cb.execute(|| async { Ok(()) }).await;
        let _: Result<(), CircuitError<&str>> = cb.execute(|| async { Err("x") }).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failure_rate_calculation() {
        let config = CircuitConfig {
            failure_threshold: 100,
            ..CircuitConfig::test()
        };
        let cb = CircuitBreaker::new("test", config);

        let _: Result<i32, CircuitError<&str>> = cb.execute(|| async { Ok(1) }).await;
        let _: Result<i32, CircuitError<&str>> = cb.execute(|| async { Err("x") }).await;
        let _: Result<i32, CircuitError<&str>> = cb.execute(|| async { Ok(2) }).await;
        let _: Result<i32, CircuitError<&str>> = cb.execute(|| async { Err("y") }).await;

        assert!((cb.failure_rate() - 0.5).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_rejection_converts_to_circuit_open() {
        let cb = CircuitBreaker::new("products", CircuitConfig::test());
        cb.record_outcome(false);
        cb.record_outcome(false);

        let err: SyncError = cb
            .execute(|| async { Ok::<(), SyncError>(()) })
            .await
            .unwrap_err()
            .into();
        assert!(matches!(err, SyncError::CircuitOpen { ref circuit } if circuit == "products"));
    }

    #[test]
    fn test_registry_reuses_breakers() {
        let registry = CircuitRegistry::new(CircuitConfig::test());
        let a = registry.get("products");
        let b = registry.get("products");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.find("suppliers").is_none());

        a.record_outcome(false);
        a.record_outcome(false);
        assert_eq!(registry.tripped(), vec!["products".to_string()]);
        assert_eq!(registry.snapshots().len(), 1);
    }

    #[test]
    fn test_circuit_config_presets() {
        let default = CircuitConfig::default();
        let aggressive = CircuitConfig::aggressive();
        let lenient = CircuitConfig::lenient();

        assert!(aggressive.failure_threshold < default.failure_threshold);
        assert!(lenient.failure_threshold > default.failure_threshold);
        assert!(aggressive.reset_timeout > lenient.reset_timeout);
    }
}
