// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential backoff for store calls and queued operations.
//!
//! Every policy has a finite attempt budget; a sync write that cannot land
//! is handed to failure recovery instead of being retried in place.
//!
//! # Example
//!
//! ```
//! use sync_optimizer::RetryConfig;
//! use std::time::Duration;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//!
//! // The sync engine's per-operation policy
//! let op = RetryConfig::operation(3, Duration::from_millis(500));
//! assert_eq!(op.max_attempts, 4);
//! assert_eq!(op.delay_for_attempt(2), Duration::from_millis(2000));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff policy.
///
/// - [`RetryConfig::startup()`]: opening the SQL pool and creating tables
/// - [`RetryConfig::query()`]: scans, updates and deletes
/// - [`RetryConfig::batch_write()`]: multi-row inserts
/// - [`RetryConfig::operation()`]: queued sync operations and optimized requests
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Attempts allowed, the first one included
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Roughly five seconds of patience before a bad URL is reported.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    #[must_use]
    pub fn batch_write() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
        }
    }

    /// `retries` extra attempts after the first, waiting `base × 2^attempt`
    /// between them.
    #[must_use]
    pub fn operation(retries: u32, base: Duration) -> Self {
        Self {
            max_attempts: retries as usize + 1,
            initial_delay: base,
            max_delay: Duration::from_secs(300),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Backoff before retry number `attempt` (0-based), capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * self.factor.powi(exp);
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.round() as u64)
    }
}

/// Run `call` until it succeeds or the attempt budget is spent.
pub async fn retry<F, Fut, T, E>(call_name: &str, config: &RetryConfig, call: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(call_name, config, call, |_| true).await
}

/// Like [`retry`], but gives up at once on errors `is_transient` rejects.
pub async fn retry_if<F, Fut, T, E, P>(call_name: &str, config: &RetryConfig, mut call: F, is_transient: P) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        let err = match call().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(call = call_name, retries = attempt, "Call recovered after retrying");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let used = attempt as usize + 1;
        if !is_transient(&err) || used >= config.max_attempts {
            return Err(err);
        }

        let delay = config.delay_for_attempt(attempt);
        warn!(
            call = call_name,
            attempt = used,
            max_attempts = config.max_attempts,
            error = %err,
            ?delay,
            "Call failed, backing off"
        );
        sleep(delay).await;
        attempt += 1;
    }
}
