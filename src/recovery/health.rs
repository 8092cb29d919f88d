// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! System health ratings and reachability probes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;

use super::strategies::DegradationSnapshot;

/// Probe latency above which a reachable component is rated degraded
pub const SLOW_PROBE_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthRating {
    Healthy,
    Degraded,
    Critical,
    Offline,
}

impl HealthRating {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
            Self::Offline => "offline",
        }
    }

    /// Gauge encoding used by `set_health_rating`.
    #[must_use]
    pub fn gauge_value(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Critical => 2,
            Self::Offline => 3,
        }
    }

    /// Rate a probe result by reachability and latency.
    #[must_use]
    pub fn from_probe(result: &Result<Duration, String>) -> Self {
        match result {
            Ok(latency) if latency.as_millis() as u64 <= SLOW_PROBE_MS => Self::Healthy,
            Ok(_) => Self::Degraded,
            Err(_) => Self::Offline,
        }
    }

    /// Rate the number of failures seen inside the health window.
    #[must_use]
    pub fn from_failure_density(count: usize, degraded_above: usize, critical_above: usize) -> Self {
        if count > critical_above {
            Self::Critical
        } else if count > degraded_above {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: String,
    pub rating: HealthRating,
    pub detail: String,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealthReport {
    pub checked_at: DateTime<Utc>,
    /// Worst component rating
    pub overall: HealthRating,
    pub components: Vec<ComponentHealth>,
    pub open_circuits: Vec<String>,
    pub recent_failures: usize,
    pub unresolved_failures: usize,
    pub degradation: DegradationSnapshot,
}

impl SystemHealthReport {
    #[must_use]
    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.component == name)
    }
}

/// Network reachability check.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Round-trip latency, or why the target is unreachable.
    async fn probe(&self) -> Result<Duration, String>;
}

/// Opens a TCP connection to `addr`.
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self) -> Result<Duration, String> {
        let started = tokio::time::Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_stream)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(format!("{}: {}", self.addr, e)),
            Err(_) => Err(format!("{}: timed out after {:?}", self.addr, self.timeout)),
        }
    }
}

/// Probe returning a fixed, switchable answer.
pub struct StaticProbe {
    result: Mutex<Result<Duration, String>>,
}

impl StaticProbe {
    #[must_use]
    pub fn reachable(latency: Duration) -> Self {
        Self {
            result: Mutex::new(Ok(latency)),
        }
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self {
            result: Mutex::new(Err(reason.into())),
        }
    }

    pub fn set(&self, result: Result<Duration, String>) {
        *self.result.lock() = result;
    }
}

#[async_trait]
impl ReachabilityProbe for StaticProbe {
    async fn probe(&self) -> Result<Duration, String> {
        self.result.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_rating() {
        assert_eq!(HealthRating::from_probe(&Ok(Duration::from_millis(20))), HealthRating::Healthy);
        assert_eq!(HealthRating::from_probe(&Ok(Duration::from_secs(2))), HealthRating::Degraded);
        assert_eq!(HealthRating::from_probe(&Err("refused".into())), HealthRating::Offline);
    }

    #[test]
    fn test_failure_density_rating() {
        assert_eq!(HealthRating::from_failure_density(3, 3, 10), HealthRating::Healthy);
        assert_eq!(HealthRating::from_failure_density(4, 3, 10), HealthRating::Degraded);
        assert_eq!(HealthRating::from_failure_density(11, 3, 10), HealthRating::Critical);
    }

    #[test]
    fn test_ratings_order_by_badness() {
        let worst = [HealthRating::Degraded, HealthRating::Offline, HealthRating::Healthy]
            .into_iter()
            .max();
        assert_eq!(worst, Some(HealthRating::Offline));
    }

    #[tokio::test]
    async fn test_static_probe_switches() {
        let probe = StaticProbe::reachable(Duration::from_millis(5));
        assert!(probe.probe().await.is_ok());
        probe.set(Err("down".into()));
        assert_eq!(probe.probe().await, Err("down".to_string()));
    }

    #[tokio::test]
    async fn test_tcp_probe_reaches_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let probe = TcpProbe::new(addr, Duration::from_secs(2));
        assert!(probe.probe().await.is_ok());
    }
}
