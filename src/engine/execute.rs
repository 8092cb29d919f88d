// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One execution attempt of a queued operation against the row store.
//!
//! Single-row operations are one store call. Bulk operations are split into
//! chunks of the effective batch size; every chunk is attempted even when an
//! earlier one fails, and the attempt reports per-chunk outcomes.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::types::{OperationPayload, RowUpdate, SyncOperation};
use crate::error::{Result, SyncError};
use crate::storage::traits::{Row, RowStore};

/// Outcome of one chunk of a bulk operation.
#[derive(Debug)]
pub(crate) struct ChunkResult {
    pub records: usize,
    pub succeeded: usize,
    pub rows: Vec<Row>,
    pub error: Option<SyncError>,
}

/// Aggregated result of one attempt.
#[derive(Debug, Default)]
pub(crate) struct AttemptResult {
    pub processed: usize,
    pub succeeded: usize,
    pub rows: Vec<Row>,
    pub chunks: Vec<ChunkResult>,
}

impl AttemptResult {
    pub fn failed(&self) -> usize {
        self.processed - self.succeeded
    }

    pub fn failed_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.error.is_some()).count()
    }

    pub fn errors(&self) -> Vec<String> {
        self.chunks
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.error.as_ref().map(|e| format!("chunk {}: {}", i + 1, e)))
            .collect()
    }

    /// Every chunk failed without applying anything: the attempt as a whole
    /// failed and its first error decides whether it is retried.
    pub fn into_total_failure(mut self) -> std::result::Result<Self, SyncError> {
        if self.succeeded == 0 && !self.chunks.is_empty() && self.chunks.iter().all(|c| c.error.is_some()) {
            let first = self.chunks.swap_remove(0);
            return Err(first.error.unwrap_or_else(|| SyncError::InvalidOperation("empty chunk".into())));
        }
        Ok(self)
    }
}

/// Race one store call against `timeout`.
pub(crate) async fn timed<T, Fut>(operation: &str, timeout: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = std::result::Result<T, crate::storage::traits::StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(SyncError::from),
        Err(_) => Err(SyncError::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Run a single-row operation once.
pub(crate) async fn execute_single(store: &dyn RowStore, op: &SyncOperation, timeout: Duration) -> Result<AttemptResult> {
    let label = format!("{}:{}", op.kind(), op.table);
    let (processed, rows) = match &op.payload {
        OperationPayload::Insert(row) => {
            let rows = timed(&label, timeout, store.insert(&op.table, vec![row.clone()])).await?;
            (1, rows)
        }
        // A filter matching nothing is a successful no-op over zero records
        OperationPayload::Update { filter, patch } => {
            let rows = timed(&label, timeout, store.update(&op.table, filter, patch.clone())).await?;
            (rows.len(), rows)
        }
        OperationPayload::Delete { filter } => {
            let removed = timed(&label, timeout, store.delete(&op.table, filter)).await?;
            (removed, Vec::new())
        }
        OperationPayload::BulkInsert(_) | OperationPayload::BulkUpdate(_) => {
            return Err(SyncError::InvalidOperation(format!("'{}' is a bulk operation", op.id)));
        }
    };
    Ok(AttemptResult {
        processed,
        succeeded: processed,
        chunks: vec![ChunkResult {
            records: processed,
            succeeded: processed,
            rows: Vec::new(),
            error: None,
        }],
        rows,
    })
}

/// Run a bulk operation once, chunk by chunk. `on_chunk` sees every chunk
/// outcome as it lands (the engine feeds it to the table breaker).
pub(crate) async fn execute_bulk<F>(
    store: &dyn RowStore,
    op: &SyncOperation,
    batch_size: usize,
    timeout: Duration,
    mut on_chunk: F,
) -> Result<AttemptResult>
where
    F: FnMut(bool),
{
    let batch_size = batch_size.max(1);
    let label = format!("{}:{}", op.kind(), op.table);
    let mut result = AttemptResult::default();

    match &op.payload {
        OperationPayload::BulkInsert(rows) => {
            for (i, chunk) in rows.chunks(batch_size).enumerate() {
                let outcome = timed(&label, timeout, store.insert(&op.table, chunk.to_vec())).await;
                debug!(operation_id = %op.id, chunk = i + 1, size = chunk.len(), ok = outcome.is_ok(), "Chunk executed");
                on_chunk(outcome.is_ok());
                match outcome {
                    Ok(rows) => result.push_chunk(chunk.len(), chunk.len(), rows, None),
                    Err(e) => result.push_chunk(chunk.len(), 0, Vec::new(), Some(e)),
                }
            }
        }
        OperationPayload::BulkUpdate(updates) => {
            for (i, chunk) in updates.chunks(batch_size).enumerate() {
                let applied = update_chunk(store, &op.table, chunk, &label, timeout).await;
                debug!(
                    operation_id = %op.id,
                    chunk = i + 1,
                    size = chunk.len(),
                    applied = applied.count,
                    ok = applied.error.is_none(),
                    "Chunk executed"
                );
                on_chunk(applied.error.is_none());
                result.push_chunk(chunk.len(), applied.count, applied.rows, applied.error);
            }
        }
        _ => return Err(SyncError::InvalidOperation(format!("'{}' is not a bulk operation", op.id))),
    }
    Ok(result)
}

/// Updates applied from one chunk before it stopped.
struct AppliedUpdates {
    count: usize,
    rows: Vec<Row>,
    error: Option<SyncError>,
}

/// Updates in a chunk run in order; the first failure stops the chunk and
/// the updates before it stay applied.
async fn update_chunk(
    store: &dyn RowStore,
    table: &str,
    updates: &[RowUpdate],
    label: &str,
    timeout: Duration,
) -> AppliedUpdates {
    let mut applied = AppliedUpdates {
        count: 0,
        rows: Vec::new(),
        error: None,
    };
    for update in updates {
        match timed(label, timeout, store.update(table, &update.filter, update.patch.clone())).await {
            Ok(rows) => {
                applied.count += 1;
                applied.rows.extend(rows);
            }
            Err(e) => {
                applied.error = Some(e);
                break;
            }
        }
    }
    applied
}

impl AttemptResult {
    fn push_chunk(&mut self, records: usize, succeeded: usize, rows: Vec<Row>, error: Option<SyncError>) {
        self.processed += records;
        self.succeeded += succeeded;
        self.rows.extend(rows.iter().cloned());
        self.chunks.push(ChunkResult {
            records,
            succeeded,
            rows,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryRowStore;
    use crate::storage::traits::{Filter, StoreError};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    /// Fails inserts containing a row, and updates whose patch, carrying
    /// `"fail": true`.
    struct PickyStore(InMemoryRowStore);

    #[async_trait]
    impl RowStore for PickyStore {
        async fn select(&self, t: &str, f: &Filter, l: Option<usize>) -> std::result::Result<Vec<Row>, StoreError> {
            self.0.select(t, f, l).await
        }
        async fn insert(&self, t: &str, rows: Vec<Row>) -> std::result::Result<Vec<Row>, StoreError> {
            if rows.iter().any(|r| r.get("fail") == Some(&Value::Bool(true))) {
                return Err(StoreError::Backend("chunk rejected".into()));
            }
            self.0.insert(t, rows).await
        }
        async fn update(&self, t: &str, f: &Filter, p: Row) -> std::result::Result<Vec<Row>, StoreError> {
            if p.get("fail") == Some(&Value::Bool(true)) {
                return Err(StoreError::Backend("update rejected".into()));
            }
            self.0.update(t, f, p).await
        }
        async fn delete(&self, t: &str, f: &Filter) -> std::result::Result<usize, StoreError> {
            self.0.delete(t, f).await
        }
        async fn rpc(&self, n: &str, a: Value) -> std::result::Result<Value, StoreError> {
            self.0.rpc(n, a).await
        }
    }

    fn rows(n: usize, fail_at: Option<usize>) -> Vec<Row> {
        (0..n)
            .map(|i| {
                json!({"id": i, "fail": Some(i) == fail_at})
                    .as_object()
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_bulk_chunks_all_attempted() {
        let store = PickyStore(InMemoryRowStore::new());
        // Row 4 lands in the second chunk of [0..3], [3..6], [6..9], [9]
        let op = SyncOperation::bulk_insert("products", rows(10, Some(4)));
        let mut seen = Vec::new();
        let result = execute_bulk(&store, &op, 3, Duration::from_secs(1), |ok| seen.push(ok))
            .await
            .unwrap();

        assert_eq!(seen, vec![true, false, true, true]);
        assert_eq!(result.processed, 10);
        assert_eq!(result.succeeded, 7);
        assert_eq!(result.failed(), 3);
        assert_eq!(result.failed_chunks(), 1);
        assert_eq!(result.errors().len(), 1);
        assert!(result.errors()[0].starts_with("chunk 2"));
        assert_eq!(store.0.len("products"), 7);
    }

    #[tokio::test]
    async fn test_total_failure_surfaces_first_error() {
        let store = PickyStore(InMemoryRowStore::new());
        let op = SyncOperation::bulk_insert("products", rows(1, Some(0)));
        let result = execute_bulk(&store, &op, 3, Duration::from_secs(1), |_| {}).await.unwrap();
        assert!(matches!(result.into_total_failure(), Err(SyncError::Store(StoreError::Backend(_)))));
    }

    fn price_updates(n: usize, fail_at: usize) -> Vec<RowUpdate> {
        (0..n)
            .map(|i| RowUpdate {
                filter: Filter::eq("id", i),
                patch: json!({"price": 9, "fail": i == fail_at})
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_bulk_update_counts_updates_applied_before_failure() {
        let store = PickyStore(InMemoryRowStore::new());
        store.0.insert("products", rows(4, None)).await.unwrap();

        // Chunks [0, 1] and [2, 3]; update 1 fails after update 0 landed
        let op = SyncOperation::bulk_update("products", price_updates(4, 1));
        let result = execute_bulk(&store, &op, 2, Duration::from_secs(1), |_| {}).await.unwrap();

        assert_eq!(result.processed, 4);
        assert_eq!(result.succeeded, 3);
        assert_eq!(result.failed(), 1);
        assert_eq!(result.failed_chunks(), 1);
        assert_eq!(result.chunks[0].succeeded, 1);
        let repriced = store
            .0
            .rows("products")
            .into_iter()
            .filter(|r| r.get("price") == Some(&json!(9)))
            .count();
        assert_eq!(repriced, result.succeeded);
    }

    #[tokio::test]
    async fn test_partially_applied_chunk_is_not_a_total_failure() {
        let store = PickyStore(InMemoryRowStore::new());
        store.0.insert("products", rows(2, None)).await.unwrap();

        let op = SyncOperation::bulk_update("products", price_updates(2, 1));
        let result = execute_bulk(&store, &op, 2, Duration::from_secs(1), |_| {}).await.unwrap();
        let result = result.into_total_failure().unwrap();
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed(), 1);
    }

    #[tokio::test]
    async fn test_update_matching_nothing_is_empty_noop() {
        let store = InMemoryRowStore::new();
        let patch = json!({"price": 1}).as_object().cloned().unwrap();
        let update = SyncOperation::update("products", Filter::eq("id", "missing"), patch);
        let result = execute_single(&store, &update, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.processed, 0);
        assert_eq!(result.succeeded, 0);
        assert_eq!(result.failed(), 0);

        let delete = SyncOperation::delete("products", Filter::eq("id", "missing"));
        let result = execute_single(&store, &delete, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.processed, 0);
    }

    #[tokio::test]
    async fn test_single_insert_and_delete() {
        let store = InMemoryRowStore::new();
        let op = SyncOperation::insert("products", json!({"id": "p1"}).as_object().cloned().unwrap());
        let result = execute_single(&store, &op, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.rows.len(), 1);

        let del = SyncOperation::delete("products", Filter::eq("id", "p1"));
        execute_single(&store, &del, Duration::from_secs(1)).await.unwrap();
        assert!(store.is_empty("products"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_timeout_error() {
        let result: Result<()> = timed("insert:products", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(SyncError::Timeout { timeout_ms: 50, .. })));
    }
}
