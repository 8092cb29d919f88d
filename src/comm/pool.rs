// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection pool
//!
//! Bounded set of reusable backend handles keyed by name. A handle is
//! *active* while at least one [`ConnectionLease`] holds it and *idle*
//! otherwise. The number of active keys never exceeds `max_connections`;
//! an acquire past the cap fails with [`SyncError::PoolExhausted`] rather
//! than waiting.
//!
//! Leases release on drop, so every exit path (success, error, timeout,
//! cancellation) gives the slot back.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::scheduler::BackgroundTask;

#[derive(Debug)]
struct PooledHandle {
    last_used: Instant,
    /// Outstanding leases; 0 means idle
    leases: usize,
    uses: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub max_connections: usize,
    pub utilization: f64,
    pub acquired_total: u64,
    pub exhausted_total: u64,
    pub evicted_total: u64,
}

pub struct ConnectionPool {
    max_connections: usize,
    idle_timeout: Duration,
    handles: Mutex<HashMap<String, PooledHandle>>,
    next_id: AtomicU64,
    acquired: AtomicU64,
    exhausted: AtomicU64,
    evicted: AtomicU64,
}

/// Holds one pooled handle until dropped.
#[must_use = "dropping the lease releases the connection immediately"]
pub struct ConnectionLease {
    pool: Arc<ConnectionPool>,
    key: String,
}

impl ConnectionLease {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Explicit release; same as dropping.
    pub fn release(self) {}
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.pool.release_one(&self.key);
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease").field("key", &self.key).finish()
    }
}

impl ConnectionPool {
    pub fn new(max_connections: usize, idle_timeout: Duration) -> Self {
        Self {
            max_connections,
            idle_timeout,
            handles: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn active_count(handles: &HashMap<String, PooledHandle>) -> usize {
        handles.values().filter(|h| h.leases > 0).count()
    }

    /// Lease the handle named `key`, creating it if needed.
    ///
    /// A key that is already active is shared and does not take another slot.
    pub fn acquire(self: &Arc<Self>, key: &str) -> Result<ConnectionLease> {
        let mut handles = self.handles.lock();
        let already_active = handles.get(key).is_some_and(|h| h.leases > 0);
        if !already_active {
            let active = Self::active_count(&handles);
            if active >= self.max_connections {
                drop(handles);
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_pool_exhausted();
                warn!(key, active, max = self.max_connections, "Connection pool exhausted");
                return Err(SyncError::PoolExhausted {
                    active,
                    max: self.max_connections,
                });
            }
        }

        let handle = handles.entry(key.to_string()).or_insert_with(|| PooledHandle {
            last_used: Instant::now(),
            leases: 0,
            uses: 0,
        });
        handle.leases += 1;
        handle.uses += 1;
        handle.last_used = Instant::now();
        let utilization = self.ratio(Self::active_count(&handles));
        drop(handles);

        self.acquired.fetch_add(1, Ordering::Relaxed);
        crate::metrics::set_pool_utilization(utilization);
        Ok(ConnectionLease {
            pool: Arc::clone(self),
            key: key.to_string(),
        })
    }

    /// Lease any idle handle, or open a new one.
    pub fn acquire_any(self: &Arc<Self>) -> Result<ConnectionLease> {
        let idle = {
            let handles = self.handles.lock();
            handles
                .iter()
                .filter(|(_, h)| h.leases == 0)
                .max_by_key(|(_, h)| h.last_used)
                .map(|(k, _)| k.clone())
        };
        let key = idle.unwrap_or_else(|| format!("conn-{}", self.next_id.fetch_add(1, Ordering::Relaxed)));
        self.acquire(&key)
    }

    fn release_one(&self, key: &str) {
        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get_mut(key) {
            handle.leases = handle.leases.saturating_sub(1);
            handle.last_used = Instant::now();
        }
        let utilization = self.ratio(Self::active_count(&handles));
        drop(handles);
        crate::metrics::set_pool_utilization(utilization);
    }

    /// Mark `key` idle regardless of outstanding leases.
    pub fn release(&self, key: &str) {
        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get_mut(key) {
            handle.leases = 0;
            handle.last_used = Instant::now();
        }
    }

    /// Drop idle handles unused for longer than the idle timeout.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut handles = self.handles.lock();
        let before = handles.len();
        handles.retain(|_, h| h.leases > 0 || now.duration_since(h.last_used) <= self.idle_timeout);
        let evicted = before - handles.len();
        drop(handles);

        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, "Evicted idle connections");
        }
        evicted
    }

    pub fn spawn_idle_sweeper(self: &Arc<Self>, period: Duration) -> BackgroundTask {
        let pool = Arc::clone(self);
        BackgroundTask::spawn_interval("connection_pool_idle", period, move || {
            let pool = Arc::clone(&pool);
            async move {
                pool.evict_idle();
            }
        })
    }

    fn ratio(&self, active: usize) -> f64 {
        if self.max_connections == 0 {
            1.0
        } else {
            active as f64 / self.max_connections as f64
        }
    }

    #[must_use]
    pub fn active(&self) -> usize {
        Self::active_count(&self.handles.lock())
    }

    /// active / max
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.ratio(self.active())
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let handles = self.handles.lock();
        let active = Self::active_count(&handles);
        PoolStats {
            active,
            idle: handles.len() - active,
            max_connections: self.max_connections,
            utilization: self.ratio(active),
            acquired_total: self.acquired.load(Ordering::Relaxed),
            exhausted_total: self.exhausted.load(Ordering::Relaxed),
            evicted_total: self.evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max: usize) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(max, Duration::from_millis(100)))
    }

    #[test]
    fn test_acquire_beyond_cap_fails() {
        let p = pool(2);
        let _a = p.acquire("a").unwrap();
        let _b = p.acquire("b").unwrap();

        let err = p.acquire("c").unwrap_err();
        assert!(matches!(err, SyncError::PoolExhausted { active: 2, max: 2 }));
        assert_eq!(p.active(), 2);
        assert_eq!(p.stats().exhausted_total, 1);
    }

    #[test]
    fn test_same_key_shares_slot() {
        let p = pool(1);
        let a1 = p.acquire("a").unwrap();
        let a2 = p.acquire("a").unwrap();
        assert_eq!(p.active(), 1);

        drop(a1);
        assert_eq!(p.active(), 1);
        drop(a2);
        assert_eq!(p.active(), 0);
    }

    #[test]
    fn test_lease_drop_frees_slot() {
        let p = pool(1);
        {
            let lease = p.acquire_any().unwrap();
            assert!((p.utilization() - 1.0).abs() < f64::EPSILON);
            lease.release();
        }
        assert_eq!(p.utilization(), 0.0);
        assert!(p.acquire_any().is_ok());
    }

    #[test]
    fn test_acquire_any_reuses_idle_handle() {
        let p = pool(4);
        let key = p.acquire_any().unwrap().key().to_string();
        let again = p.acquire_any().unwrap();
        assert_eq!(again.key(), key);
        assert_eq!(p.stats().idle, 0);
    }

    #[test]
    fn test_forced_release() {
        let p = pool(1);
        let lease = p.acquire("a").unwrap();
        p.release("a");
        assert_eq!(p.active(), 0);
        drop(lease);
        assert_eq!(p.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweep_skips_active_handles() {
        let p = pool(4);
        let held = p.acquire("busy").unwrap();
        drop(p.acquire("idle").unwrap());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(p.evict_idle(), 1);

        let stats = p.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.idle, 0);
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweeper_runs_in_background() {
        let p = pool(4);
        drop(p.acquire("a").unwrap());
        let sweeper = p.spawn_idle_sweeper(Duration::from_millis(200));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(p.stats().evicted_total, 1);
        sweeper.stop().await;
    }
}
