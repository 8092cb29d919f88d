// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request cache
//!
//! Bounded key-value cache in front of backend calls. Entries expire after a
//! TTL; when full, one entry is evicted by the configured strategy.
//!
//! ```text
//! get(key)
//!    │
//!    ├─→ present, age < ttl → hit, bump access counters
//!    ├─→ present, age ≥ ttl → drop entry, miss
//!    └─→ absent             → miss
//!
//! set(key) at capacity → purge expired → still full? evict one:
//!    Lru  = least recently accessed
//!    Lfu  = fewest accesses (ties: least recently accessed)
//!    Fifo = oldest inserted
//! ```
//!
//! Recency and insertion order come from a monotonic sequence, so ordering
//! is exact even when several operations share an instant.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::scheduler::BackgroundTask;

/// Which entry to drop when the cache is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    #[default]
    Lru,
    Lfu,
    Fifo,
}

impl EvictionStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Fifo => "fifo",
        }
    }
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    inserted_seq: u64,
    accessed_seq: u64,
    access_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// hits / (hits + misses), 0.0 before any lookup
    pub hit_rate: f64,
    pub strategy: EvictionStrategy,
}

pub struct RequestCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    ttl: Duration,
    max_size: usize,
    strategy: EvictionStrategy,
    seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V: Clone + Send + 'static> RequestCache<V> {
    pub fn new(max_size: usize, ttl: Duration, strategy: EvictionStrategy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_size,
            strategy,
            seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        now.duration_since(entry.inserted_at) >= self.ttl
    }

    /// Look up `key`. Expired entries are removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let seq = self.next_seq();
        let mut entries = self.entries.lock();

        let mut expired = false;
        let hit = match entries.get_mut(key) {
            Some(entry) if !self.is_expired(entry, now) => {
                entry.accessed_seq = seq;
                entry.access_count += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                expired = true;
                None
            }
            None => None,
        };
        if expired {
            entries.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        drop(entries);

        let counter = if hit.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_request_cache(hit.is_some());
        hit
    }

    /// Insert or replace `key`. Replacing restarts the entry's TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        if self.max_size == 0 {
            return;
        }
        let key = key.into();
        let now = Instant::now();
        let seq = self.next_seq();
        let mut entries = self.entries.lock();

        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            let before = entries.len();
            entries.retain(|_, e| now.duration_since(e.inserted_at) < self.ttl);
            let expired = before - entries.len();
            if expired > 0 {
                self.expirations.fetch_add(expired as u64, Ordering::Relaxed);
            }
            if entries.len() >= self.max_size {
                if let Some(victim) = self.select_victim(&entries) {
                    entries.remove(&victim);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %victim, strategy = self.strategy.as_str(), "Evicted cache entry");
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                inserted_seq: seq,
                accessed_seq: seq,
                access_count: 0,
            },
        );
    }

    fn select_victim(&self, entries: &HashMap<String, CacheEntry<V>>) -> Option<String> {
        let victim = match self.strategy {
            EvictionStrategy::Lru => entries.iter().min_by_key(|(_, e)| e.accessed_seq),
            EvictionStrategy::Lfu => entries.iter().min_by_key(|(_, e)| (e.access_count, e.accessed_seq)),
            EvictionStrategy::Fifo => entries.iter().min_by_key(|(_, e)| e.inserted_seq),
        };
        victim.map(|(k, _)| k.clone())
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.lock().remove(key).map(|e| e.value)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.inserted_at) < self.ttl);
        let removed = before - entries.len();
        drop(entries);

        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "Purged expired cache entries");
        }
        removed
    }

    /// Periodic TTL purge independent of lookups.
    pub fn spawn_ttl_sweeper(self: &Arc<Self>, period: Duration) -> BackgroundTask {
        let cache = Arc::clone(self);
        BackgroundTask::spawn_interval("request_cache_ttl", period, move || {
            let cache = Arc::clone(&cache);
            async move {
                cache.purge_expired();
                let stats = cache.stats();
                crate::metrics::set_request_cache_stats(stats.entries, stats.hit_rate);
            }
        })
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            max_size: self.max_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
            strategy: self.strategy,
        }
    }
}
