// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic sync-optimizer usage example.
//!
//! Demonstrates:
//! 1. Building a coordinator over the in-memory row store
//! 2. Submitting prioritized product writes and a bulk insert
//! 3. Saving a sync configuration
//! 4. Integrity validation, performance report and bottlenecks
//! 5. Cached requests through the communication optimizer
//! 6. A short synthetic load test
//! 7. Displaying metrics (OTEL-compatible) and clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::time::Duration;

use chrono::Utc;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::{json, Value};
use sync_optimizer::comm::RequestOptions;
use sync_optimizer::engine::Priority;
use sync_optimizer::sync_config::{FieldMapping, SyncSchedule};
use sync_optimizer::{
    Filter, LoadTestConfig, Row, SyncConfiguration, SyncCoordinator, SyncError, SyncOperation,
    SyncOptimizerConfig,
};

fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures all metrics for OTEL export)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║          sync-optimizer: Basic Usage Example                  ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the coordinator
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring sync-optimizer...");

    let mut config = SyncOptimizerConfig::default();
    // Small chunks so the bulk insert below splits visibly
    config.engine.batch_size = 4;

    let coordinator = SyncCoordinator::connect(config).await?;
    println!("   State: {}", coordinator.state());

    println!("\n🚀 Starting background services...");
    coordinator.start();
    println!("   State: {}", coordinator.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Prioritized writes
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Submitting product writes...");

    let products = [
        ("espresso", "Espresso", 2.5, Priority::Critical),
        ("latte", "Latte", 3.8, Priority::High),
        ("mocha", "Mocha", 4.2, Priority::Medium),
        ("tea", "Green tea", 2.1, Priority::Low),
    ];
    let mut tickets = Vec::new();
    for (id, name, price, priority) in products {
        let op = SyncOperation::insert("products", row(json!({
            "id": id,
            "name": name,
            "price": price,
            "stock_quantity": 25,
        })))
        .with_priority(priority);
        println!("   → {:<10} ({:?})", id, priority);
        tickets.push(coordinator.engine().enqueue(op)?);
    }
    for ticket in tickets {
        let id = ticket.id().to_string();
        let outcome = ticket.outcome().await?;
        println!("   ✓ {} synced {} row(s) in {} attempt(s)", id, outcome.succeeded, outcome.retries + 1);
    }

    println!("\n📚 Bulk insert of 10 transactions...");
    let rows = (0..10)
        .map(|i| row(json!({"id": format!("tx-{}", i), "total": 5.0 + i as f64, "status": "completed"})))
        .collect();
    let outcome = coordinator
        .engine()
        .submit(SyncOperation::bulk_insert("transactions", rows))
        .await?;
    println!(
        "   ✓ {} of {} rows in {} chunk(s), {} failed",
        outcome.succeeded, outcome.processed, outcome.chunks, outcome.failed_chunks
    );

    // A nameless product is stopped at the validation gate
    let rejected = coordinator
        .engine()
        .enqueue(SyncOperation::insert("products", row(json!({"id": "ghost", "price": 1.0}))));
    if let Err(SyncError::ValidationFailed { .. }) = rejected {
        println!("   ✗ ghost rejected by validation gate (as expected)");
    }

    let stats = coordinator.engine().stats();
    println!(
        "   Engine: completed={} failed={} retried={} queued={}",
        stats.completed, stats.failed, stats.retried, stats.queued
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Sync configuration
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⚙️  Saving sync configuration...");
    let catalog = SyncConfiguration::new("catalog", "products", "pos_items")
        .with_mapping(FieldMapping::new().rename("name", "display_name"))
        .with_schedule(SyncSchedule::Interval { every_secs: 300 });
    coordinator.configurations().save(&catalog).await?;
    let loaded = coordinator.configurations().load("catalog").await?;
    println!("   ✓ '{}' {} → {} ({:?})", loaded.name, loaded.source_table, loaded.target_table, loaded.schedule);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Integrity, performance report, bottlenecks
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔍 Validating data integrity...");
    let integrity = coordinator.validator().validate_all(None).await;
    println!(
        "   Status: {:?} ({} rule(s) failed, {} violation(s))",
        integrity.status, integrity.failed_rules, integrity.total_violations
    );

    println!("\n📈 Performance report...");
    let report = coordinator
        .recorder()
        .generate_report(Utc::now() - chrono::Duration::minutes(5), Utc::now());
    println!("   Operations:   {}", report.summary.total_operations);
    println!("   Success rate: {:.1}%", report.summary.success_rate);
    println!("   Avg duration: {:.2}ms", report.summary.avg_duration_ms);

    let bottlenecks = coordinator
        .analyzer()
        .analyze_window(coordinator.recorder(), Duration::from_secs(300));
    println!("   Health score: {}/100", bottlenecks.score);
    for item in &bottlenecks.action_plan.immediate {
        println!("   ⚠️  {}", item.description);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Cached requests
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🌐 Cached product lookups...");
    for _ in 0..3 {
        let store = coordinator.store().clone();
        let rows: Vec<Row> = coordinator
            .communication()
            .request(
                "products",
                move || {
                    let store = store.clone();
                    async move { Ok(store.select("products", &Filter::all(), None).await?) }
                },
                Some("products:all"),
                RequestOptions::default(),
            )
            .await?;
        println!("   → {} product(s)", rows.len());
    }
    let cache = coordinator.communication().cache_stats();
    println!(
        "   Cache: entries={} hits={} misses={} hit_rate={:.0}%",
        cache.entries,
        cache.hits,
        cache.misses,
        cache.hit_rate * 100.0
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Load test
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🏋️  Running a 2s load test (2 users, 5 req/s each)...");
    let result = coordinator
        .load_tester()
        .run_load_test(&LoadTestConfig {
            name: "demo".into(),
            concurrent_users: 2,
            duration_ms: 2000,
            requests_per_second: 5.0,
            seed: Some(7),
            ..LoadTestConfig::default()
        })
        .await;
    println!(
        "   {} operations, {:.1} ops/s, p95 {:.2}ms, error rate {:.1}% → {}",
        result.total_operations,
        result.throughput,
        result.p95_latency_ms,
        result.error_rate,
        if result.passed { "PASSED" } else { "FAILED" }
    );
    for reason in &result.failure_reasons {
        println!("   ✗ {}", reason);
    }

    let health = coordinator.recovery().health_check().await;
    println!("\n🩺 System health: {:?}", health.overall);
    for component in &health.components {
        println!("   • {:<14} {:?}", component.component, component.rating);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Metrics and shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Metrics snapshot:");
    dump_metrics(&snapshotter);

    println!("\n🛑 Shutting down...");
    coordinator.shutdown().await;
    println!("   State: {}", coordinator.state());

    println!("\n✅ Done!\n");
    Ok(())
}

/// Pretty-print metrics from the debugging recorder
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name.to_string(), label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name.to_string(), label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                let max = samples.iter().map(|v| v.into_inner()).fold(f64::NEG_INFINITY, f64::max);
                histograms.push((name.to_string(), label_str, count, avg, max));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }

    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }

    if !histograms.is_empty() {
        println!("   └─ Histograms (distributions)");
        for (name, labels, count, avg, max) in &histograms {
            if *count == 0 {
                println!("      └─ {}{} = (no samples)", name, labels);
            } else {
                println!("      └─ {}{} count={} avg={:.4} max={:.4}", name, labels, count, avg, max);
            }
        }
    }
}
