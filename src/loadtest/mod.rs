// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Synthetic load and stress testing.
//!
//! Simulated users are tokio tasks issuing weighted-random actions against a
//! [`LoadTarget`]. [`EngineTarget`] drives the sync engine and its store;
//! tests plug in their own targets.

pub mod config;
pub mod result;
pub mod tester;

pub use config::{Ceilings, LoadOperation, LoadTestConfig, OperationMix, StressTestConfig};
pub use result::{percentile, OperationStats, StressStep, StressSummary, TestKind, TestResult};
pub use tester::LoadTester;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::engine::{Priority, SyncEngine, SyncOperation};
use crate::error::Result;
use crate::storage::traits::{Filter, Row, RowStore};

/// Who is acting and how far along they are.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext {
    pub user: usize,
    /// Actions this user already issued
    pub sequence: u64,
    pub batch_rows: usize,
}

/// System under test.
#[async_trait]
pub trait LoadTarget: Send + Sync {
    /// Perform one action; returns the number of records it touched.
    async fn execute(&self, operation: LoadOperation, ctx: &ActionContext) -> Result<u64>;
}

/// Drives writes through the sync engine and reads straight from the store.
pub struct EngineTarget {
    engine: Arc<SyncEngine>,
    store: Arc<dyn RowStore>,
    table: String,
    events_table: String,
}

impl EngineTarget {
    pub fn new(engine: Arc<SyncEngine>, store: Arc<dyn RowStore>) -> Self {
        Self {
            engine,
            store,
            table: "products".into(),
            events_table: "realtime_events".into(),
        }
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    fn product(ctx: &ActionContext, n: u64) -> Row {
        let value = json!({
            "id": format!("lt-{}-{}", ctx.user, n),
            "name": format!("Load test item {}-{}", ctx.user, n),
            "price": 1.0 + (n % 100) as f64,
            "load_user": ctx.user,
        });
        match value {
            Value::Object(row) => row,
            _ => Row::new(),
        }
    }
}

#[async_trait]
impl LoadTarget for EngineTarget {
    async fn execute(&self, operation: LoadOperation, ctx: &ActionContext) -> Result<u64> {
        let outcome = match operation {
            LoadOperation::Read => {
                let rows = self
                    .store
                    .select(&self.table, &Filter::eq("load_user", ctx.user), Some(10))
                    .await?;
                return Ok(rows.len() as u64);
            }
            LoadOperation::Create => {
                let op = SyncOperation::insert(&self.table, Self::product(ctx, ctx.sequence));
                self.engine.submit(op).await?
            }
            LoadOperation::Update => {
                let mut patch = Row::new();
                patch.insert("last_touched".into(), Value::from(ctx.sequence));
                let op = SyncOperation::update(&self.table, Filter::eq("load_user", ctx.user), patch);
                self.engine.submit(op).await?
            }
            LoadOperation::Delete => {
                let id = format!("lt-{}-{}", ctx.user, ctx.sequence.saturating_sub(1));
                self.engine.submit(SyncOperation::delete(&self.table, Filter::eq("id", id))).await?
            }
            LoadOperation::Sync => {
                let mut event = Row::new();
                event.insert("user".into(), Value::from(ctx.user));
                event.insert("sequence".into(), Value::from(ctx.sequence));
                let op = SyncOperation::insert(&self.events_table, event).with_priority(Priority::High);
                self.engine.submit(op).await?
            }
            LoadOperation::Batch => {
                let base = ctx.sequence * 1000;
                let rows = (0..ctx.batch_rows.max(1) as u64)
                    .map(|i| Self::product(ctx, base + i + 1_000_000))
                    .collect();
                self.engine.submit(SyncOperation::bulk_insert(&self.table, rows)).await?
            }
        };
        Ok(outcome.succeeded)
    }
}
