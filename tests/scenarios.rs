//! End-to-end scenarios across the public API.
//!
//! Each test builds its own services over an in-memory row store, so they
//! run in parallel without shared state.
//!
//! Run with: `cargo test --test scenarios`

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};

use sync_optimizer::analysis::{BottleneckType, Severity};
use sync_optimizer::monitor::BaselineRegistry;
use sync_optimizer::validation::{IntegrityStatus, RuleSeverity, ValidationRule};
use sync_optimizer::{
    BottleneckAnalyzer, CircuitBreaker, CircuitConfig, CircuitError, CircuitState, EngineConfig, Filter,
    InMemoryRowStore, IntegrityValidator, MetricsRecorder, OperationKind, PerformanceBaseline, Priority, Row,
    RowStore, StoreError, SyncEngine, SyncError, SyncOperation,
};

fn row(v: Value) -> Row {
    v.as_object().cloned().unwrap()
}

/// In-memory store that refuses any insert containing a row with `"fail": true`.
struct PoisonRowStore {
    inner: InMemoryRowStore,
}

#[async_trait]
impl RowStore for PoisonRowStore {
    async fn select(&self, table: &str, filter: &Filter, limit: Option<usize>) -> Result<Vec<Row>, StoreError> {
        self.inner.select(table, filter, limit).await
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, StoreError> {
        if rows.iter().any(|r| r.get("fail") == Some(&Value::Bool(true))) {
            return Err(StoreError::Backend("poisoned row".into()));
        }
        self.inner.insert(table, rows).await
    }

    async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<Vec<Row>, StoreError> {
        self.inner.update(table, filter, patch).await
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, StoreError> {
        self.inner.delete(table, filter).await
    }

    async fn rpc(&self, name: &str, args: Value) -> Result<Value, StoreError> {
        self.inner.rpc(name, args).await
    }
}

// =============================================================================
// A: required rule violation shows up in the integrity report
// =============================================================================

#[tokio::test]
async fn test_required_rule_violation_reported() {
    let store = Arc::new(InMemoryRowStore::new());
    store
        .insert("products", vec![
            row(json!({"id": "p1", "name": "Latte", "price": 3.5})),
            row(json!({"id": "p2", "name": "", "price": 2.0})),
        ])
        .await
        .unwrap();

    let validator = IntegrityValidator::new(store.clone());
    validator.add_rule(ValidationRule::required("product_name_required", "products", "name", RuleSeverity::Error));

    let report = validator.validate_all(Some(&["products"])).await;
    assert_eq!(report.failed_rules, 1);
    assert_eq!(report.total_violations, 1);
    assert_eq!(report.status, IntegrityStatus::Errors);
    assert_eq!(report.rule_results[0].violations[0].record_id.as_deref(), Some("p2"));
}

// =============================================================================
// B: priority order with one execution slot
// =============================================================================

#[tokio::test]
async fn test_priority_order() {
    let store = Arc::new(InMemoryRowStore::new());
    let engine = Arc::new(SyncEngine::new(
        EngineConfig {
            max_concurrency: 1,
            ..EngineConfig::default()
        },
        store.clone(),
        Arc::new(MetricsRecorder::in_memory()),
    ));

    let tickets: Vec<_> = [("high", Priority::High), ("low", Priority::Low), ("critical", Priority::Critical)]
        .into_iter()
        .map(|(id, priority)| {
            let op = SyncOperation::insert("products", row(json!({"id": id, "name": id}))).with_priority(priority);
            engine.enqueue(op).unwrap()
        })
        .collect();

    engine.start();
    for ticket in tickets {
        ticket.outcome().await.unwrap();
    }

    let order: Vec<_> = store.rows("products").into_iter().map(|r| r["id"].clone()).collect();
    assert_eq!(order, vec![json!("critical"), json!("high"), json!("low")]);
    engine.shutdown().await;
}

// =============================================================================
// C: circuit trips after the threshold and half-opens after the reset timeout
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_trip_and_trial() {
    let breaker = CircuitBreaker::new("products", CircuitConfig {
        failure_threshold: 5,
        reset_timeout: Duration::from_millis(1000),
        call_timeout: Duration::from_secs(5),
    });

    for _ in 0..5 {
        let result: Result<(), CircuitError<SyncError>> = breaker
            .execute(|| async { Err(SyncError::Store(StoreError::Backend("down".into()))) })
            .await;
        assert!(matches!(result, Err(CircuitError::Inner(_))));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected: Result<(), CircuitError<SyncError>> = breaker.execute(|| async { Ok(()) }).await;
    assert!(rejected.as_ref().is_err_and(|e| e.is_rejected()));
    assert!(matches!(SyncError::from(rejected.unwrap_err()), SyncError::CircuitOpen { .. }));

    tokio::time::advance(Duration::from_millis(1000)).await;
    let trial: Result<u32, CircuitError<SyncError>> = breaker.execute(|| async { Ok(7) }).await;
    assert_eq!(trial.unwrap(), 7);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

// =============================================================================
// D: a failing chunk does not stop later chunks
// =============================================================================

#[tokio::test]
async fn test_bulk_insert_partial_chunks() {
    let store = Arc::new(PoisonRowStore {
        inner: InMemoryRowStore::new(),
    });
    let recorder = Arc::new(MetricsRecorder::in_memory());
    let engine = Arc::new(SyncEngine::new(
        EngineConfig {
            batch_size: 3,
            ..EngineConfig::default()
        },
        store.clone(),
        recorder.clone(),
    ));
    engine.start();

    // Rows 3..6 form the second chunk; one of them is poisoned
    let rows = (0..10)
        .map(|i| row(json!({"id": format!("p{}", i), "name": "Item", "fail": i == 4})))
        .collect();
    let outcome = engine.submit(SyncOperation::bulk_insert("products", rows)).await.unwrap();

    assert_eq!(outcome.chunks, 4);
    assert_eq!(outcome.failed_chunks, 1);
    assert_eq!(outcome.processed, 10);
    assert_eq!(outcome.succeeded, 7);
    assert_eq!(outcome.failed, 3);
    assert_eq!(store.inner.len("products"), 7);

    let record = recorder.recent(1).pop().unwrap();
    assert_eq!(record.records_processed, 10);
    assert_eq!(record.records_success, 7);
    assert_eq!(record.records_error, 3);
    engine.shutdown().await;
}

// =============================================================================
// E: recorded error rate flagged against its baseline
// =============================================================================

#[tokio::test]
async fn test_error_rate_bottleneck_against_baseline() {
    let recorder = MetricsRecorder::in_memory();
    let start = Utc::now();
    let record = recorder.record(
        OperationKind::ProductSync,
        start,
        start + chrono::Duration::milliseconds(500),
        100,
        80,
        vec!["20 rows rejected".into()],
        Map::new(),
    );
    assert!((record.error_rate - 20.0).abs() < 1e-9);

    let baselines = BaselineRegistry::empty();
    baselines.set(PerformanceBaseline::new(OperationKind::ProductSync, 10_000.0, 1.0, 2.0, 10_000.0));
    let analyzer = BottleneckAnalyzer::new(Arc::new(baselines));

    let result = analyzer.analyze(&[record]);
    let finding = result
        .bottlenecks
        .iter()
        .find(|b| b.kind == BottleneckType::ErrorRate)
        .unwrap();
    assert_eq!(finding.severity, Severity::Critical);
    assert!((finding.ratio - 10.0).abs() < 1e-9);
    assert_eq!(finding.operation, Some(OperationKind::ProductSync));
}
