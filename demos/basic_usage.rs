// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic replica-sync usage example.
//!
//! Demonstrates:
//! 1. Registering a master store and two replicas
//! 2. Seeding divergent data (a stale email, a missing row)
//! 3. Running a check and reading the report
//! 4. Repairing outstanding issues
//! 5. A multi-store transaction that rolls back, and one that commits
//! 6. A full pass with its summary alert
//! 7. Displaying metrics
//!
//! Stores are in memory; the ledger is a SQLite file in a temp directory.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use replica_sync::ledger::sql::SqlLedger;
use replica_sync::storage::memory::InMemoryStore;
use replica_sync::{
    EngineConfig, Fields, ReplicaSyncEngine, StoreAccessor, StoreRegistry, TransactionError,
};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           replica-sync: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure stores and build the engine
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring stores...");
    let config = EngineConfig::from_json(
        r#"{
            "stores": [
                {"name": "clients", "is_master": true, "table": "clients",
                 "sync_fields": ["name", "email", "dob"]},
                {"name": "housing", "table": "housing_clients",
                 "sync_fields": ["name", "email"], "critical_fields": ["name"]},
                {"name": "legal", "table": "legal_clients",
                 "sync_fields": ["name", "dob"], "critical_fields": ["name", "dob"]}
            ],
            "repair_base_delay_ms": 10
        }"#,
    )?;

    let registry = StoreRegistry::new(config.stores.clone())?;
    let store = Arc::new(InMemoryStore::new(&registry));

    let dir = tempfile::tempdir()?;
    let ledger_url = format!("sqlite://{}?mode=rwc", dir.path().join("ledger.db").display());
    let ledger = Arc::new(SqlLedger::new(&ledger_url).await?);

    let engine = ReplicaSyncEngine::new(config, store.clone(), ledger)?;
    engine.start().await?;
    println!("   ✓ Engine state: {}\n", engine.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Seed data with two divergences
    // ─────────────────────────────────────────────────────────────────────────
    println!("📝 Seeding stores...");
    let c1 = fields(&[("name", json!("Ann Lee")), ("email", json!("a@x.com")), ("dob", json!("1990-01-01"))]);
    let c2 = fields(&[("name", json!("Bo Chan")), ("email", json!("b@x.com")), ("dob", json!("1985-06-30"))]);

    store.put("clients", "C1", &c1).await?;
    store.put("clients", "C2", &c2).await?;
    store.put("housing", "C1", &fields(&[("name", json!("Ann Lee")), ("email", json!("old@x.com"))])).await?;
    store.put("housing", "C2", &c2).await?;
    store.put("legal", "C1", &c1).await?;
    // legal has no row for C2
    println!("   ✓ housing.C1 has a stale email, legal.C2 is missing\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Check
    // ─────────────────────────────────────────────────────────────────────────
    println!("🔍 Running consistency check...");
    let report = engine.run_check().await?;
    println!(
        "   ✓ {} entities, {} issues ({} critical, {} warning), success rate {:.1}%",
        report.entities_checked, report.total_issues, report.critical_issues, report.warning_issues, report.success_rate
    );
    for issue in engine.outstanding_issues(None).await? {
        println!(
            "     • [{}] {}.{} on {}",
            issue.severity, issue.entity_id, issue.field_name, issue.store_name
        );
    }
    println!();

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Repair
    // ─────────────────────────────────────────────────────────────────────────
    println!("🔧 Repairing outstanding issues...");
    let summary = engine.repair_outstanding().await?;
    println!(
        "   ✓ {}/{} repaired ({:.1}%) in {}ms",
        summary.repaired, summary.processed, summary.success_rate, summary.duration_ms
    );
    println!("   ✓ housing.C1 = {:?}", store.get("housing", "C1").await?);
    println!("   ✓ legal.C2   = {:?}\n", store.get("legal", "C2").await?);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Transactions
    // ─────────────────────────────────────────────────────────────────────────
    println!("💳 Transaction that aborts...");
    let renamed = fields(&[("name", json!("Ann Lee-Park"))]);
    let result: Result<(), TransactionError> = engine
        .transactions()
        .with_transaction("C1", "rename", &["clients", "housing", "legal"], |tx| {
            let renamed = renamed.clone();
            Box::pin(async move {
                tx.put("clients", &renamed).await?;
                tx.put("housing", &renamed).await?;
                Err(TransactionError::Aborted("legal review pending".into()))
            })
        })
        .await;
    println!("   ✓ Result: {:?}", result.map_err(|e| e.to_string()));
    println!("   ✓ clients.C1.name still {:?}", store.get("clients", "C1").await?.and_then(|f| f.get("name").cloned()));

    println!("💳 Transaction that commits...");
    engine
        .transactions()
        .with_transaction("C1", "rename", &["clients", "housing", "legal"], |tx| {
            let renamed = renamed.clone();
            Box::pin(async move {
                for store in ["clients", "housing", "legal"] {
                    tx.put(store, &renamed).await?;
                }
                Ok(())
            })
        })
        .await?;
    for record in engine.transactions().recent_transactions(5).await? {
        println!(
            "     • {} {} [{}] stores={:?} retries={}",
            record.transaction_id, record.operation_type, record.status, record.stores_involved, record.retry_count
        );
    }
    println!();

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Full pass
    // ─────────────────────────────────────────────────────────────────────────
    println!("📋 Running full pass...");
    let outcome = engine.run_full_pass().await?;
    println!(
        "   ✓ {} issues, {} critical outstanding, {} alert deliveries\n",
        outcome.report.total_issues, outcome.critical_outstanding, outcome.alerts_delivered
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("📊 Metrics:");
    dump_metrics(&snapshotter);

    engine.shutdown();
    println!("\n✅ Done");
    Ok(())
}

fn fields(pairs: &[(&str, serde_json::Value)]) -> Fields {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_kind, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, label_str, count, sum));
            }
        }
    }

    counters.sort();
    gauges.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
    histograms.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

    if !counters.is_empty() {
        println!("   ┌─ Counters");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, labels, count, sum) in &histograms {
            println!("      └─ {}{} count={} sum={:.4}", name, labels, count, sum);
        }
    }
}
