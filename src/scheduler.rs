// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background task lifecycle.
//!
//! Each component that sweeps, probes or dispatches in the background owns a
//! [`TaskGroup`]. Tasks are spawned on `start`, signalled through a `watch`
//! channel on `shutdown`, and awaited so nothing outlives its owner.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A single spawned loop with its shutdown signal.
pub struct BackgroundTask {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Run `tick` every `period` until stopped. The first tick fires after one
    /// full period.
    pub fn spawn_interval<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(name, move |mut shutdown| async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => tick().await,
                }
            }
        })
    }

    /// Spawn a loop that watches the shutdown receiver itself.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(body(shutdown_rx));
        debug!(task = name, "Background task started");
        Self {
            name,
            shutdown_tx,
            handle,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(task = self.name, error = %e, "Background task ended abnormally");
        } else {
            debug!(task = self.name, "Background task stopped");
        }
    }
}

/// The background tasks owned by one component.
#[derive(Default)]
pub struct TaskGroup {
    tasks: Mutex<Vec<BackgroundTask>>,
}

impl TaskGroup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: BackgroundTask) {
        self.tasks.lock().push(task);
    }

    /// Whether any task has been started and not yet stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every task. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.stop().await;
        }
    }
}
