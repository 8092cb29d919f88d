//! # Sync Optimizer
//!
//! Sync core for a point-of-sale backend: a prioritized operation queue in
//! front of a row store, with communication optimization, data integrity
//! validation, failure recovery and synthetic load testing around it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Sync Engine                          │
//! │  • Priority queue with dependencies and retry scheduling    │
//! │  • Concurrency slots, per-table circuit breakers            │
//! │  • Insert gate through the integrity validator              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              (every attempt becomes a metric record)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Monitoring & Analysis                       │
//! │  • Metrics recorder with retention and reports              │
//! │  • Baselines and bottleneck detection                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                  (terminal failures are reported)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Failure Recovery                          │
//! │  • Classification, recovery plans, strategies               │
//! │  • Checksummed backups, graceful degradation                │
//! │  • Periodic component health checks                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sync_optimizer::{SyncCoordinator, SyncOptimizerConfig, SyncOperation};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let coordinator = SyncCoordinator::connect(SyncOptimizerConfig::default())
//!         .await
//!         .expect("Failed to connect");
//!     coordinator.start();
//!
//!     let row = json!({"id": "p1", "name": "Espresso", "price": 2.5});
//!     let op = SyncOperation::insert("products", row.as_object().cloned().unwrap_or_default());
//!     let outcome = coordinator.engine().submit(op).await.expect("Sync failed");
//!     println!("synced {} record(s)", outcome.succeeded);
//!
//!     coordinator.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: [`SyncCoordinator`] wiring every service over one store
//! - [`engine`]: The sync operation queue and its executor
//! - [`monitor`]: Metric records, baselines, the recorder and reports
//! - [`analysis`]: Bottleneck detection and action plans
//! - [`comm`]: Connection pool, request cache, communication optimizer
//! - [`compression`]: Payload compression
//! - [`validation`]: Integrity rules and cross-table consistency checks
//! - [`recovery`]: Failure classification, strategies and backups
//! - [`resilience`]: Circuit breakers and retry policies
//! - [`loadtest`]: Synthetic load and stress testing
//! - [`sync_config`]: Persisted sync configurations and conflict resolution
//! - [`storage`]: The row-store contract with SQL and in-memory backends

pub mod analysis;
pub mod comm;
pub mod compression;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod loadtest;
pub mod metrics;
pub mod monitor;
pub mod recovery;
pub mod resilience;
pub mod scheduler;
pub mod storage;
pub mod sync_config;
pub mod validation;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use config::{CommunicationConfig, EngineConfig, MetricsConfig, RecoveryConfig, SyncOptimizerConfig, ValidationConfig};
pub use coordinator::{CoordinatorState, SyncCoordinator};
pub use engine::{OperationOutcome, Priority, SyncEngine, SyncOperation};
pub use error::{Result, SyncError};
pub use storage::traits::{Filter, Row, RowStore, StoreError};
pub use storage::memory::InMemoryRowStore;
pub use storage::sql::SqlRowStore;
pub use monitor::{MetricRecord, MetricsRecorder, OperationKind, PerformanceBaseline};
pub use analysis::{Bottleneck, BottleneckAnalyzer};
pub use comm::{CommunicationOptimizer, ConnectionPool, RequestCache};
pub use compression::DataCompressor;
pub use validation::{IntegrityReport, IntegrityValidator};
pub use recovery::{BackupManager, FailureRecoverySystem};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitRegistry, CircuitState};
pub use resilience::retry::RetryConfig;
pub use loadtest::{LoadTestConfig, LoadTester, StressTestConfig, TestResult};
pub use sync_config::{ConflictResolution, SyncConfiguration, SyncConfigurationStore};
pub use metrics::LatencyTimer;
