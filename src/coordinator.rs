// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync coordinator.
//!
//! The [`SyncCoordinator`] builds every service over one row store and owns
//! their background tasks:
//!
//! ```text
//!                 ┌──────────────┐
//!   submit ─────▶ │  SyncEngine  │──── validator gate, circuit per table
//!                 └──────┬───────┘
//!          terminal      │ failures          shared DegradationFlags
//!                 ┌──────▼───────────────┐ ◀──────────────────────────┐
//!                 │ FailureRecoverySystem│ ── backups, health check   │
//!                 └──────────────────────┘                            │
//!   MetricsRecorder ◀── every attempt ──▶ BottleneckAnalyzer          │
//!   CommunicationOptimizer (pool, request cache, compression)         │
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::analysis::BottleneckAnalyzer;
use crate::comm::CommunicationOptimizer;
use crate::config::SyncOptimizerConfig;
use crate::engine::SyncEngine;
use crate::error::Result;
use crate::loadtest::{EngineTarget, LoadTester};
use crate::monitor::{BaselineRegistry, MetricsRecorder};
use crate::recovery::{DegradationFlags, FailureRecoverySystem};
use crate::storage::memory::InMemoryRowStore;
use crate::storage::sql::SqlRowStore;
use crate::storage::traits::RowStore;
use crate::sync_config::SyncConfigurationStore;
use crate::validation::IntegrityValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Built, no background tasks yet
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

pub struct SyncCoordinator {
    config: SyncOptimizerConfig,
    state: watch::Sender<CoordinatorState>,
    state_rx: watch::Receiver<CoordinatorState>,
    store: Arc<dyn RowStore>,
    recorder: Arc<MetricsRecorder>,
    analyzer: Arc<BottleneckAnalyzer>,
    communication: Arc<CommunicationOptimizer>,
    validator: Arc<IntegrityValidator>,
    recovery: Arc<FailureRecoverySystem>,
    engine: Arc<SyncEngine>,
    configurations: SyncConfigurationStore,
}

impl SyncCoordinator {
    /// Wire every service over `store`. Nothing runs until [`start`](Self::start).
    pub fn new(config: SyncOptimizerConfig, store: Arc<dyn RowStore>) -> Self {
        let (state, state_rx) = watch::channel(CoordinatorState::Created);

        let recorder = Arc::new(MetricsRecorder::new(config.metrics.clone(), Some(Arc::clone(&store))));
        let analyzer = Arc::new(BottleneckAnalyzer::new(Arc::new(BaselineRegistry::with_defaults())));
        let communication = Arc::new(CommunicationOptimizer::new(
            config.communication.clone(),
            Arc::clone(&recorder),
        ));
        let validator = Arc::new(IntegrityValidator::from_config(Arc::clone(&store), &config.validation));

        // Recovery degrades the same flags the engine reads its batch size
        // and retry delay from.
        let flags = Arc::new(DegradationFlags::new());
        let recovery = Arc::new(
            FailureRecoverySystem::new(config.recovery.clone(), Arc::clone(&store), Some(Arc::clone(&validator)))
                .with_flags(Arc::clone(&flags)),
        );
        let engine = Arc::new(
            SyncEngine::new(config.engine.clone(), Arc::clone(&store), Arc::clone(&recorder))
                .with_validator(Arc::clone(&validator), config.validation.gate_inserts)
                .with_recovery(Arc::clone(&recovery))
                .with_flags(flags),
        );

        Self {
            configurations: SyncConfigurationStore::new(Arc::clone(&store)),
            config,
            state,
            state_rx,
            store,
            recorder,
            analyzer,
            communication,
            validator,
            recovery,
            engine,
        }
    }

    /// Build over SQL when `sql_url` is set, otherwise over an in-memory store.
    #[tracing::instrument(skip(config), fields(has_sql = config.sql_url.is_some()))]
    pub async fn connect(config: SyncOptimizerConfig) -> Result<Self> {
        let store: Arc<dyn RowStore> = match &config.sql_url {
            Some(url) => Arc::new(SqlRowStore::new(url).await?),
            None => {
                warn!("No SQL URL configured, using in-memory row store");
                Arc::new(InMemoryRowStore::new())
            }
        };
        Ok(Self::new(config, store))
    }

    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<CoordinatorState> {
        self.state_rx.clone()
    }

    /// Launch the dispatcher, sweeps, health check and retention sweep.
    #[tracing::instrument(skip(self))]
    pub fn start(&self) {
        if self.state() != CoordinatorState::Created {
            warn!(state = %self.state(), "Coordinator already started");
            return;
        }
        self.recorder.start();
        self.communication.start();
        self.recovery.start();
        self.engine.start();
        let _ = self.state.send(CoordinatorState::Running);
        info!("Sync coordinator running");
    }

    /// Stop intake first, then the services it feeds.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), CoordinatorState::ShuttingDown | CoordinatorState::Stopped) {
            return;
        }
        let _ = self.state.send(CoordinatorState::ShuttingDown);
        info!("Sync coordinator shutting down");
        self.engine.shutdown().await;
        self.recovery.shutdown().await;
        self.communication.shutdown().await;
        self.recorder.shutdown().await;
        let _ = self.state.send(CoordinatorState::Stopped);
        info!("Sync coordinator stopped");
    }

    #[must_use]
    pub fn config(&self) -> &SyncOptimizerConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    #[must_use]
    pub fn recorder(&self) -> &Arc<MetricsRecorder> {
        &self.recorder
    }

    #[must_use]
    pub fn analyzer(&self) -> &Arc<BottleneckAnalyzer> {
        &self.analyzer
    }

    #[must_use]
    pub fn communication(&self) -> &Arc<CommunicationOptimizer> {
        &self.communication
    }

    #[must_use]
    pub fn validator(&self) -> &Arc<IntegrityValidator> {
        &self.validator
    }

    #[must_use]
    pub fn recovery(&self) -> &Arc<FailureRecoverySystem> {
        &self.recovery
    }

    #[must_use]
    pub fn configurations(&self) -> &SyncConfigurationStore {
        &self.configurations
    }

    /// Load tester driving this coordinator's engine and store.
    #[must_use]
    pub fn load_tester(&self) -> LoadTester {
        let target = EngineTarget::new(Arc::clone(&self.engine), Arc::clone(&self.store));
        LoadTester::new(Arc::new(target), Arc::clone(&self.recorder), Arc::clone(&self.analyzer))
    }
}
