// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL row store (SQLite / MySQL through the sqlx `Any` driver).
//!
//! Every logical table lives in one physical table, rows kept as JSON text:
//!
//! ```sql
//! CREATE TABLE sync_rows (
//!   seq BIGINT PRIMARY KEY AUTO_INCREMENT,  -- insertion order
//!   table_name VARCHAR(128) NOT NULL,
//!   row_id VARCHAR(255) NOT NULL,
//!   payload LONGTEXT NOT NULL               -- row as JSON text
//! )
//! ```
//!
//! Filters are evaluated in Rust after a per-table scan so both backends
//! agree with [`InMemoryRowStore`](super::memory::InMemoryRowStore) exactly.
//!
//! ## sqlx Any Driver Quirks
//!
//! `LONGTEXT` comes back as a BLOB on MySQL, so payloads are read as
//! `String` first and as `Vec<u8>` second.
//!
//! Server-side procedures are not modelled; [`RowStore::rpc`] reports
//! [`StoreError::ProcedureNotFound`] and callers skip the dependent check.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{any::AnyPoolOptions, AnyPool, Row as _};
use std::sync::Once;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::traits::{Filter, Row, RowStore, StoreError};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct SqlRowStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlRowStore {
    /// Connect with startup-mode retry (fails fast if the URL is wrong) and
    /// create the schema.
    pub async fn new(connection_string: &str) -> Result<Self, StoreError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self { pool, is_sqlite };
        if is_sqlite {
            store.enable_wal_mode().await?;
        }
        store.init_schema().await?;
        Ok(store)
    }

    async fn enable_wal_mode(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS sync_rows (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    table_name TEXT NOT NULL,
                    row_id TEXT NOT NULL,
                    payload TEXT NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_sync_rows_table ON sync_rows (table_name)",
            ]
        } else {
            &[r#"
                CREATE TABLE IF NOT EXISTS sync_rows (
                    seq BIGINT PRIMARY KEY AUTO_INCREMENT,
                    table_name VARCHAR(128) NOT NULL,
                    row_id VARCHAR(255) NOT NULL,
                    payload LONGTEXT NOT NULL,
                    INDEX idx_sync_rows_table (table_name)
                )
                "#]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }

    /// All `(seq, row)` pairs for a table in insertion order.
    async fn scan(&self, table: &str) -> Result<Vec<(i64, Row)>, StoreError> {
        let rows = retry("sql_scan", &RetryConfig::query(), || async {
            sqlx::query("SELECT seq, payload FROM sync_rows WHERE table_name = ? ORDER BY seq")
                .bind(table)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let seq: i64 = r.try_get("seq").map_err(backend)?;
            let payload: String = r
                .try_get::<String, _>("payload")
                .ok()
                .or_else(|| {
                    r.try_get::<Vec<u8>, _>("payload")
                        .ok()
                        .and_then(|bytes| String::from_utf8(bytes).ok())
                })
                .ok_or_else(|| StoreError::Serialization(format!("unreadable payload at seq {}", seq)))?;
            let row: Row = serde_json::from_str(&payload).map_err(|e| StoreError::Serialization(e.to_string()))?;
            out.push((seq, row));
        }
        Ok(out)
    }
}

fn row_id(row: &Row) -> String {
    match row.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl RowStore for SqlRowStore {
    async fn select(&self, table: &str, filter: &Filter, limit: Option<usize>) -> Result<Vec<Row>, StoreError> {
        let matching = self.scan(table).await?.into_iter().map(|(_, r)| r).filter(|r| filter.matches(r));
        Ok(match limit {
            Some(n) => matching.take(n).collect(),
            None => matching.collect(),
        })
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, StoreError> {
        if rows.is_empty() {
            return Ok(rows);
        }

        let mut stored = Vec::with_capacity(rows.len());
        let mut prepared = Vec::with_capacity(rows.len());
        for mut row in rows {
            if !row.contains_key("id") {
                row.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
            }
            let payload = serde_json::to_string(&row).map_err(|e| StoreError::Serialization(e.to_string()))?;
            prepared.push((row_id(&row), payload));
            stored.push(row);
        }

        let placeholders = vec!["(?, ?, ?)"; prepared.len()].join(", ");
        let sql = format!("INSERT INTO sync_rows (table_name, row_id, payload) VALUES {}", placeholders);

        retry("sql_insert", &RetryConfig::batch_write(), || {
            let sql = sql.clone();
            let prepared = prepared.clone();
            async move {
                let mut query = sqlx::query(&sql);
                for (id, payload) in &prepared {
                    query = query.bind(table).bind(id).bind(payload);
                }
                query.execute(&self.pool).await.map_err(backend)?;
                Ok(())
            }
        })
        .await?;

        debug!(table, count = stored.len(), "Inserted rows");
        Ok(stored)
    }

    async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<Vec<Row>, StoreError> {
        let mut updated = Vec::new();
        for (seq, mut row) in self.scan(table).await? {
            if !filter.matches(&row) {
                continue;
            }
            for (k, v) in &patch {
                row.insert(k.clone(), v.clone());
            }
            let payload = serde_json::to_string(&row).map_err(|e| StoreError::Serialization(e.to_string()))?;
            let id = row_id(&row);
            retry("sql_update", &RetryConfig::query(), || async {
                sqlx::query("UPDATE sync_rows SET payload = ?, row_id = ? WHERE seq = ?")
                    .bind(&payload)
                    .bind(&id)
                    .bind(seq)
                    .execute(&self.pool)
                    .await
                    .map_err(backend)
            })
            .await?;
            updated.push(row);
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, StoreError> {
        let targets: Vec<i64> = self
            .scan(table)
            .await?
            .into_iter()
            .filter(|(_, r)| filter.matches(r))
            .map(|(seq, _)| seq)
            .collect();

        for seq in &targets {
            retry("sql_delete", &RetryConfig::query(), || async {
                sqlx::query("DELETE FROM sync_rows WHERE seq = ?")
                    .bind(*seq)
                    .execute(&self.pool)
                    .await
                    .map_err(backend)
            })
            .await?;
        }
        Ok(targets.len())
    }

    async fn rpc(&self, name: &str, _args: Value) -> Result<Value, StoreError> {
        Err(StoreError::ProcedureNotFound(name.to_string()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(backend)?;
        Ok(())
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

    async fn temp_store(dir: &tempfile::TempDir) -> SqlRowStore {
        let path = dir.path().join("rows.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        SqlRowStore::new(&url).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_select_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;

        let stored = store
            .insert("products", vec![row(json!({"name": "tea", "price": 3})), row(json!({"id": "p2", "name": "milk"}))])
            .await
            .unwrap();
        assert!(stored[0]["id"].is_string());

        let all = store.select("products", &Filter::all(), None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0]["name"], "tea");

        let milk = store.select("products", &Filter::eq("id", "p2"), None).await.unwrap();
        assert_eq!(milk.len(), 1);

        // Tables are isolated
        assert!(store.select("suppliers", &Filter::all(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;
        for i in 0..4 {
            store.insert("t", vec![row(json!({"id": format!("r{}", i), "n": i}))]).await.unwrap();
        }

        let updated = store
            .update("t", &Filter::eq("id", "r1"), row(json!({"n": 10})))
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(store.select("t", &Filter::eq("id", "r1"), None).await.unwrap()[0]["n"], 10);

        let deleted = store
            .delete("t", &Filter::all().and(Condition::Lt { field: "n".into(), value: json!(3) }))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.select("t", &Filter::all(), None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rpc_reports_missing_procedure() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;
        assert!(matches!(
            store.rpc("check_integrity", Value::Null).await,
            Err(StoreError::ProcedureNotFound(_))
        ));
        assert!(store.ping().await.is_ok());
    }
}
