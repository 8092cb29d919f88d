// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process row store.
//!
//! Tables are `DashMap`s of insertion-ordered rows, procedures are plain
//! closures registered by name. Used by tests and the demo, and as the
//! default store when no SQL URL is configured.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::traits::{Filter, Row, RowStore, StoreError};

/// Server-side procedure stand-in.
pub type Procedure = Arc<dyn Fn(&InMemoryRowStore, Value) -> Result<Value, StoreError> + Send + Sync>;

/// Rows keyed by insertion sequence so `select` returns them in insert order.
type Table = BTreeMap<u64, Row>;

pub struct InMemoryRowStore {
    tables: DashMap<String, Arc<RwLock<Table>>>,
    procedures: DashMap<String, Procedure>,
    seq: AtomicU64,
}

impl InMemoryRowStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            procedures: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Register a named procedure reachable through [`RowStore::rpc`].
    pub fn register_procedure<F>(&self, name: impl Into<String>, procedure: F)
    where
        F: Fn(&InMemoryRowStore, Value) -> Result<Value, StoreError> + Send + Sync + 'static,
    {
        self.procedures.insert(name.into(), Arc::new(procedure));
    }

    /// Synchronous snapshot of a table, in insertion order.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .get(table)
            .map(|t| t.read().values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of rows in a table
    #[must_use]
    pub fn len(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |t| t.read().len())
    }

    #[must_use]
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Drop every table (procedures are kept)
    pub fn clear(&self) {
        self.tables.clear();
    }

    fn table(&self, name: &str) -> Arc<RwLock<Table>> {
        self.tables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Table::new())))
            .clone()
    }
}

impl Default for InMemoryRowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RowStore for InMemoryRowStore {
    async fn select(&self, table: &str, filter: &Filter, limit: Option<usize>) -> Result<Vec<Row>, StoreError> {
        let Some(t) = self.tables.get(table).map(|t| t.clone()) else {
            return Ok(Vec::new());
        };
        let guard = t.read();
        let matching = guard.values().filter(|row| filter.matches(row)).cloned();
        Ok(match limit {
            Some(n) => matching.take(n).collect(),
            None => matching.collect(),
        })
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, StoreError> {
        let t = self.table(table);
        let mut guard = t.write();
        let mut stored = Vec::with_capacity(rows.len());
        for mut row in rows {
            if !row.contains_key("id") {
                row.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
            }
            let key = self.seq.fetch_add(1, Ordering::Relaxed);
            guard.insert(key, row.clone());
            stored.push(row);
        }
        Ok(stored)
    }

    async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<Vec<Row>, StoreError> {
        let Some(t) = self.tables.get(table).map(|t| t.clone()) else {
            return Ok(Vec::new());
        };
        let mut guard = t.write();
        let mut updated = Vec::new();
        for row in guard.values_mut().filter(|row| filter.matches(row)) {
            for (k, v) in &patch {
                row.insert(k.clone(), v.clone());
            }
            updated.push(row.clone());
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, StoreError> {
        let Some(t) = self.tables.get(table).map(|t| t.clone()) else {
            return Ok(0);
        };
        let mut guard = t.write();
        let before = guard.len();
        guard.retain(|_, row| !filter.matches(row));
        Ok(before - guard.len())
    }

    async fn rpc(&self, name: &str, args: Value) -> Result<Value, StoreError> {
        let procedure = self
            .procedures
            .get(name)
            .map(|p| p.clone())
            .ok_or_else(|| StoreError::ProcedureNotFound(name.to_string()))?;
        procedure(self, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::traits::Condition;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryRowStore::new();
        assert!(store.is_empty("products"));
        assert!(store.select("products", &Filter::all(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_assigns_id_when_absent() {
        let store = InMemoryRowStore::new();
        let stored = store
            .insert("products", vec![row(json!({"name": "tea"})), row(json!({"id": "p-2", "name": "milk"}))])
            .await
            .unwrap();

        assert_eq!(stored.len(), 2);
        assert!(stored[0]["id"].as_str().is_some());
        assert_eq!(stored[1]["id"], "p-2");
        assert_eq!(store.len("products"), 2);
    }

    #[tokio::test]
    async fn test_select_preserves_insert_order_and_limit() {
        let store = InMemoryRowStore::new();
        for i in 0..5 {
            store.insert("t", vec![row(json!({"n": i}))]).await.unwrap();
        }
        let rows = store.select("t", &Filter::all(), Some(3)).await.unwrap();
        let ns: Vec<i64> = rows.iter().map(|r| r["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_update_applies_patch_to_matching_rows() {
        let store = InMemoryRowStore::new();
        store
            .insert("products", vec![row(json!({"id": "a", "price": 1})), row(json!({"id": "b", "price": 2}))])
            .await
            .unwrap();

        let updated = store
            .update("products", &Filter::eq("id", "b"), row(json!({"price": 9})))
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);

        let rows = store.select("products", &Filter::eq("id", "b"), None).await.unwrap();
        assert_eq!(rows[0]["price"], 9);
        let untouched = store.select("products", &Filter::eq("id", "a"), None).await.unwrap();
        assert_eq!(untouched[0]["price"], 1);
    }

    #[tokio::test]
    async fn test_delete_returns_count() {
        let store = InMemoryRowStore::new();
        for i in 0..4 {
            store.insert("t", vec![row(json!({"n": i}))]).await.unwrap();
        }
        let filter = Filter::all().and(Condition::Gte { field: "n".into(), value: json!(2) });
        assert_eq!(store.delete("t", &filter).await.unwrap(), 2);
        assert_eq!(store.len("t"), 2);
        assert_eq!(store.delete("missing", &Filter::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rpc_dispatches_registered_procedure() {
        let store = InMemoryRowStore::new();
        store.register_procedure("count_rows", |s, args| {
            let table = args["table"].as_str().unwrap_or_default();
            Ok(json!(s.len(table)))
        });
        store.insert("t", vec![Row::new(), Row::new()]).await.unwrap();

        let v = store.rpc("count_rows", json!({"table": "t"})).await.unwrap();
        assert_eq!(v, json!(2));

        let missing = store.rpc("nope", Value::Null).await;
        assert!(matches!(missing, Err(StoreError::ProcedureNotFound(_))));
    }

    #[tokio::test]
    async fn test_ping_succeeds_on_empty_store() {
        assert!(InMemoryRowStore::new().ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_inserts() {
        let store = Arc::new(InMemoryRowStore::new());
        let mut handles = vec![];
        for batch in 0..10 {
            let s = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    s.insert("t", vec![row(json!({"b": batch, "i": i}))]).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.len("t"), 100);
    }
}
