//! End-to-end tests for the replica sync engine.
//!
//! Most tests run over the in-memory store and ledger. The `sql_` tests use
//! SQLite files in a temp directory, one per store plus one for the ledger.
//!
//! # Running
//! ```bash
//! cargo test --test integration
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use replica_sync::ledger::memory::InMemoryLedger;
use replica_sync::storage::memory::InMemoryStore;
use replica_sync::{
    EngineConfig, Fields, ReplicaSyncEngine, Severity, StoreAccessor, StoreDescriptor, StoreRegistry,
    TransactionError, TransactionStatus, RECORD_FIELD,
};

// =============================================================================
// Helpers
// =============================================================================

fn stores() -> Vec<StoreDescriptor> {
    vec![
        StoreDescriptor::master("clients", "clients", &["name", "email", "dob"]),
        StoreDescriptor::replica("housing", "housing_clients", &["name", "email"], &["name"]),
        StoreDescriptor::replica("legal", "legal_clients", &["name", "dob"], &["name", "dob"]),
    ]
}

fn fields(pairs: &[(&str, Value)]) -> Fields {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn ann() -> Fields {
    fields(&[("name", json!("Ann")), ("email", json!("a@x.com")), ("dob", json!("1990-01-01"))])
}

fn bo() -> Fields {
    fields(&[("name", json!("Bo")), ("email", json!("b@x.com")), ("dob", json!("1985-06-30"))])
}

fn memory_engine() -> (ReplicaSyncEngine, Arc<InMemoryStore>, Arc<InMemoryLedger>) {
    let config = EngineConfig {
        stores: stores(),
        repair_base_delay_ms: 1,
        repair_max_delay_ms: 5,
        ..Default::default()
    };
    let registry = StoreRegistry::new(config.stores.clone()).unwrap();
    let store = Arc::new(InMemoryStore::new(&registry));
    let ledger = Arc::new(InMemoryLedger::new());
    let engine = ReplicaSyncEngine::new(config, store.clone(), ledger.clone()).unwrap();
    (engine, store, ledger)
}

/// Every replica holds its projection of the master row.
async fn seed_consistent(store: &InMemoryStore, id: &str, row: &Fields) {
    store.put("clients", id, row).await.unwrap();
    store.put("housing", id, row).await.unwrap();
    store.put("legal", id, row).await.unwrap();
}

async fn field(store: &InMemoryStore, name: &str, id: &str, f: &str) -> Option<Value> {
    store.get(name, id).await.unwrap().and_then(|row| row.get(f).cloned())
}

// =============================================================================
// Check and repair scenarios
// =============================================================================

#[tokio::test]
async fn stale_replica_field_is_a_warning_and_gets_repaired() {
    let (engine, store, _ledger) = memory_engine();
    engine.start().await.unwrap();

    store.put("clients", "C1", &ann()).await.unwrap();
    store
        .put("housing", "C1", &fields(&[("name", json!("Ann")), ("email", json!("old@x.com"))]))
        .await
        .unwrap();
    store.put("legal", "C1", &ann()).await.unwrap();

    let report = engine.run_check().await.unwrap();
    assert_eq!(report.entities_checked, 1);
    assert_eq!(report.total_issues, 1);
    assert_eq!(report.warning_issues, 1);
    assert_eq!(report.critical_issues, 0);
    assert_eq!(report.success_rate, 0.0);

    let issues = engine.outstanding_issues(None).await.unwrap();
    assert_eq!(issues.len(), 1);
    let issue = &issues[0];
    assert_eq!(issue.entity_id, "C1");
    assert_eq!(issue.store_name, "housing");
    assert_eq!(issue.field_name, "email");
    assert_eq!(issue.severity, Severity::Warning);
    assert_eq!(issue.expected_value, Some(json!("a@x.com")));
    assert_eq!(issue.actual_value, Some(json!("old@x.com")));

    let summary = engine.repair_outstanding().await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.repaired, 1);
    assert!(summary.is_success());

    assert_eq!(field(&store, "housing", "C1", "email").await, Some(json!("a@x.com")));
    assert!(engine.outstanding_issues(None).await.unwrap().is_empty());

    let history = engine.issues_for_entity("C1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].repaired);
    assert!(history[0].repair_attempted_at.is_some());
}

#[tokio::test]
async fn missing_replica_row_is_critical_and_gets_inserted() {
    let (engine, store, _ledger) = memory_engine();

    store.put("clients", "C2", &bo()).await.unwrap();
    store.put("housing", "C2", &bo()).await.unwrap();

    let report = engine.run_check().await.unwrap();
    assert_eq!(report.total_issues, 1);
    assert_eq!(report.critical_issues, 1);

    let issue = &engine.outstanding_issues(None).await.unwrap()[0];
    assert_eq!(issue.store_name, "legal");
    assert_eq!(issue.field_name, RECORD_FIELD);
    assert!(issue.is_record_missing());

    let summary = engine.repair_outstanding().await.unwrap();
    assert_eq!(summary.repaired, 1);

    let row = store.get("legal", "C2").await.unwrap().unwrap();
    assert_eq!(row.get("name"), Some(&json!("Bo")));
    assert_eq!(row.get("dob"), Some(&json!("1985-06-30")));
    // Only legal's declared fields are written
    assert!(!row.contains_key("email"));
}

#[tokio::test]
async fn critical_field_mismatch_is_critical() {
    let (engine, store, _ledger) = memory_engine();
    seed_consistent(&store, "C1", &ann()).await;
    store.put("legal", "C1", &fields(&[("dob", json!("1991-01-01"))])).await.unwrap();

    let report = engine.run_check().await.unwrap();
    assert_eq!(report.critical_issues, 1);
    assert_eq!(report.warning_issues, 0);
    let issue = &engine.outstanding_issues(None).await.unwrap()[0];
    assert_eq!(issue.field_name, "dob");
    assert_eq!(issue.severity, Severity::Critical);
}

#[tokio::test]
async fn consistent_stores_produce_clean_report() {
    let (engine, store, _ledger) = memory_engine();
    seed_consistent(&store, "C1", &ann()).await;
    seed_consistent(&store, "C2", &bo()).await;

    let report = engine.run_check().await.unwrap();
    assert_eq!(report.entities_checked, 2);
    assert_eq!(report.total_issues, 0);
    assert_eq!(report.success_rate, 100.0);

    let latest = engine.latest_report().await.unwrap().unwrap();
    assert_eq!(latest.report_id, report.report_id);
}

#[tokio::test]
async fn empty_master_reports_full_success() {
    let (engine, _store, _ledger) = memory_engine();
    let report = engine.run_check().await.unwrap();
    assert_eq!(report.entities_checked, 0);
    assert_eq!(report.total_issues, 0);
    assert_eq!(report.success_rate, 100.0);
}

#[tokio::test]
async fn fields_absent_on_one_side_are_not_compared() {
    let (engine, store, _ledger) = memory_engine();
    store.put("clients", "C1", &fields(&[("name", json!("Ann"))])).await.unwrap();
    store
        .put("housing", "C1", &fields(&[("name", json!("Ann")), ("email", json!("x@x.com"))]))
        .await
        .unwrap();
    store.put("legal", "C1", &fields(&[("name", json!("Ann"))])).await.unwrap();

    let report = engine.run_check().await.unwrap();
    assert_eq!(report.total_issues, 0);
}

#[tokio::test]
async fn repair_converges_and_second_check_is_clean() {
    let (engine, store, _ledger) = memory_engine();
    seed_consistent(&store, "C1", &ann()).await;
    store.put("clients", "C2", &bo()).await.unwrap();
    store.put("housing", "C1", &fields(&[("name", json!("Anne")), ("email", json!("z@x.com"))])).await.unwrap();

    let first = engine.run_check().await.unwrap();
    assert_eq!(first.total_issues, 4); // housing name+email, C2 missing in housing and legal
    let summary = engine.repair_outstanding().await.unwrap();
    assert_eq!(summary.repaired, 4);

    let second = engine.run_check().await.unwrap();
    assert_eq!(second.total_issues, 0);
    assert_eq!(second.success_rate, 100.0);

    // A second repair pass finds nothing and changes nothing
    let before = store.updated_at("housing", "C1");
    let idle = engine.repair_outstanding().await.unwrap();
    assert_eq!(idle.processed, 0);
    assert_eq!(idle.success_rate, 100.0);
    assert_eq!(store.updated_at("housing", "C1"), before);
}

#[tokio::test]
async fn repair_uses_current_master_value() {
    let (engine, store, _ledger) = memory_engine();
    seed_consistent(&store, "C1", &ann()).await;
    store.put("housing", "C1", &fields(&[("email", json!("old@x.com"))])).await.unwrap();
    engine.run_check().await.unwrap();

    // Master changes between detection and repair
    store.put("clients", "C1", &fields(&[("email", json!("new@x.com"))])).await.unwrap();
    engine.repair_outstanding().await.unwrap();

    assert_eq!(field(&store, "housing", "C1", "email").await, Some(json!("new@x.com")));
}

#[tokio::test]
async fn repair_fails_when_master_row_disappears() {
    let (engine, store, ledger) = memory_engine();
    seed_consistent(&store, "C1", &ann()).await;
    store.put("housing", "C1", &fields(&[("email", json!("old@x.com"))])).await.unwrap();
    engine.run_check().await.unwrap();
    store.remove("clients", "C1");

    let summary = engine.repair_outstanding().await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 1);
    assert!(!summary.is_success());

    let issues = ledger.all_issues();
    assert!(!issues[0].repaired);
    assert!(issues[0].repair_attempted_at.is_some());
    assert_eq!(field(&store, "housing", "C1", "email").await, Some(json!("old@x.com")));
}

#[tokio::test]
async fn quick_pass_repairs_before_writing_report() {
    let (engine, store, _ledger) = memory_engine();
    store.put("clients", "C2", &bo()).await.unwrap();
    store.put("housing", "C2", &bo()).await.unwrap();

    let outcome = engine.run_quick_pass().await.unwrap();
    assert_eq!(outcome.report.critical_issues, 1);
    assert_eq!(outcome.report.issues_repaired, 1);
    assert_eq!(outcome.critical_outstanding, 0);
    assert_eq!(outcome.repair.map(|r| r.repaired), Some(1));

    // Exactly one report for the run
    assert_eq!(engine.recent_reports(10).await.unwrap().len(), 1);
    assert!(store.get("legal", "C2").await.unwrap().is_some());
}

#[tokio::test]
async fn schema_drift_fails_start() {
    let (engine, store, _ledger) = memory_engine();
    store.set_columns("legal", &["id", "name"]);

    let err = engine.start().await.unwrap_err();
    assert!(err.to_string().contains("legal"), "got {}", err);
    assert!(err.to_string().contains("dob"), "got {}", err);
}

// =============================================================================
// Transactions
// =============================================================================

#[tokio::test]
async fn committed_transaction_applies_exactly_the_body_writes() {
    let (engine, store, _ledger) = memory_engine();
    seed_consistent(&store, "C1", &ann()).await;

    let renamed = fields(&[("name", json!("Ann Park"))]);
    let out = engine
        .transactions()
        .with_transaction("C1", "rename", &["clients", "housing"], |tx| {
            let renamed = renamed.clone();
            Box::pin(async move {
                tx.put("clients", &renamed).await?;
                tx.put("housing", &renamed).await?;
                Ok(tx.stores().count())
            })
        })
        .await
        .unwrap();
    assert_eq!(out, 2);

    assert_eq!(field(&store, "clients", "C1", "name").await, Some(json!("Ann Park")));
    assert_eq!(field(&store, "housing", "C1", "name").await, Some(json!("Ann Park")));
    // Untouched fields and stores stay as they were
    assert_eq!(field(&store, "clients", "C1", "email").await, Some(json!("a@x.com")));
    assert_eq!(field(&store, "legal", "C1", "name").await, Some(json!("Ann")));

    let records = engine.transactions().recent_transactions(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TransactionStatus::Committed);
    assert_eq!(records[0].stores_involved, vec!["clients".to_string(), "housing".to_string()]);
    assert!(records[0].completed_at.is_some());
    assert_eq!(records[0].rollback_snapshot.get("clients").cloned().flatten(), Some(ann()));
}

#[tokio::test]
async fn aborted_transaction_leaves_every_store_unchanged() {
    let (engine, store, _ledger) = memory_engine();
    seed_consistent(&store, "C1", &ann()).await;

    let result: Result<(), TransactionError> = engine
        .transactions()
        .with_transaction("C1", "rename", &["clients", "housing", "legal"], |tx| {
            Box::pin(async move {
                tx.put("clients", &fields(&[("name", json!("X"))])).await?;
                tx.put("housing", &fields(&[("name", json!("X"))])).await?;
                Err(TransactionError::Aborted("nope".into()))
            })
        })
        .await;
    assert!(matches!(result, Err(TransactionError::Aborted(_))));

    for name in ["clients", "housing", "legal"] {
        assert_eq!(field(&store, name, "C1", "name").await, Some(json!("Ann")), "{}", name);
    }
    let record = &engine.transactions().recent_transactions(1).await.unwrap()[0];
    assert_eq!(record.status, TransactionStatus::RolledBack);
    assert!(record.error_message.as_deref().unwrap_or_default().contains("nope"));
}

#[tokio::test]
async fn rollback_to_snapshot_restores_pre_images() {
    let (engine, store, _ledger) = memory_engine();
    seed_consistent(&store, "C1", &ann()).await;

    engine
        .transactions()
        .with_transaction("C1", "rename", &["clients", "legal"], |tx| {
            Box::pin(async move {
                tx.put("clients", &fields(&[("name", json!("Zed"))])).await?;
                tx.put("legal", &fields(&[("name", json!("Zed"))])).await?;
                Ok(())
            })
        })
        .await
        .unwrap();
    let original = engine.transactions().recent_transactions(1).await.unwrap().remove(0);
    assert_eq!(field(&store, "legal", "C1", "name").await, Some(json!("Zed")));

    let restored = engine
        .transactions()
        .rollback_to_snapshot(&original.transaction_id)
        .await
        .unwrap();
    assert_eq!(restored, 2);
    assert_eq!(field(&store, "clients", "C1", "name").await, Some(json!("Ann")));
    assert_eq!(field(&store, "legal", "C1", "name").await, Some(json!("Ann")));

    // The restore is itself a logged transaction
    let latest = engine.transactions().recent_transactions(1).await.unwrap().remove(0);
    assert_eq!(latest.operation_type, format!("rollback:{}", original.transaction_id));
    assert_eq!(latest.status, TransactionStatus::Committed);

    // Once restored, a check finds nothing
    assert_eq!(engine.run_check().await.unwrap().total_issues, 0);
}

#[tokio::test]
async fn rollback_to_unknown_transaction_is_not_found() {
    let (engine, _store, _ledger) = memory_engine();
    let err = engine.transactions().rollback_to_snapshot("nope").await.unwrap_err();
    assert!(matches!(err, TransactionError::NotFound(_)));
}

// =============================================================================
// SQL-backed end to end
// =============================================================================

async fn sql_engine(dir: &tempfile::TempDir) -> ReplicaSyncEngine {
    let mut store_urls = BTreeMap::new();
    for name in ["clients", "housing", "legal"] {
        let path = dir.path().join(format!("{}.db", name));
        store_urls.insert(name.to_string(), format!("sqlite://{}?mode=rwc", path.display()));
    }
    let config = EngineConfig {
        stores: stores(),
        store_urls,
        ledger_url: Some(format!("sqlite://{}?mode=rwc", dir.path().join("ledger.db").display())),
        create_store_tables: true,
        repair_base_delay_ms: 1,
        repair_max_delay_ms: 5,
        ..Default::default()
    };
    ReplicaSyncEngine::connect(config).await.unwrap()
}

#[tokio::test]
async fn sql_check_repair_and_transaction_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let engine = sql_engine(&dir).await;
    engine.start().await.unwrap();

    engine
        .transactions()
        .with_transaction("C1", "create", &["clients", "housing", "legal"], |tx| {
            Box::pin(async move {
                tx.put("clients", &ann()).await?;
                tx.put("housing", &fields(&[("name", json!("Ann")), ("email", json!("old@x.com"))])).await?;
                tx.put("legal", &ann()).await?;
                Ok(())
            })
        })
        .await
        .unwrap();
    engine
        .transactions()
        .with_transaction("C2", "create", &["clients", "housing"], |tx| {
            Box::pin(async move {
                tx.put("clients", &bo()).await?;
                tx.put("housing", &bo()).await?;
                Ok(())
            })
        })
        .await
        .unwrap();

    let outcome = engine.run_quick_pass().await.unwrap();
    assert_eq!(outcome.report.entities_checked, 2);
    assert_eq!(outcome.report.warning_issues, 1);
    assert_eq!(outcome.report.critical_issues, 1);
    assert_eq!(outcome.report.issues_repaired, 2);
    assert_eq!(outcome.critical_outstanding, 0);

    let again = engine.run_check().await.unwrap();
    assert_eq!(again.total_issues, 0);

    let reports = engine.recent_reports(10).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].report_id, again.report_id);

    let txs = engine.transactions().recent_transactions(10).await.unwrap();
    assert_eq!(txs.len(), 2);
    assert!(txs.iter().all(|t| t.status == TransactionStatus::Committed));
}

/// Every store in one database file; the ledger keeps its own.
async fn sql_engine_single_database(dir: &tempfile::TempDir) -> ReplicaSyncEngine {
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("shared.db").display());
    let store_urls = ["clients", "housing", "legal"]
        .into_iter()
        .map(|name| (name.to_string(), url.clone()))
        .collect();
    let config = EngineConfig {
        stores: stores(),
        store_urls,
        ledger_url: Some(format!("sqlite://{}?mode=rwc", dir.path().join("ledger.db").display())),
        create_store_tables: true,
        repair_base_delay_ms: 1,
        repair_max_delay_ms: 5,
        ..Default::default()
    };
    ReplicaSyncEngine::connect(config).await.unwrap()
}

#[tokio::test]
async fn sql_single_database_transactions_commit_and_abort() {
    let dir = tempfile::tempdir().unwrap();
    let engine = sql_engine_single_database(&dir).await;
    engine.start().await.unwrap();
    let tx = engine.transactions();

    tx.with_transaction("C1", "create", &["clients", "housing", "legal"], |tx| {
        Box::pin(async move {
            tx.put("clients", &ann()).await?;
            tx.put("housing", &ann()).await?;
            tx.put("legal", &ann()).await?;
            Ok(())
        })
    })
    .await
    .unwrap();

    let err = tx
        .with_transaction("C1", "rename", &["legal", "clients"], |tx| {
            Box::pin(async move {
                tx.put("clients", &fields(&[("name", json!("Zed"))])).await?;
                tx.put("legal", &fields(&[("name", json!("Zed"))])).await?;
                Err::<(), _>(TransactionError::Aborted("not today".into()))
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TransactionError::Aborted(_)));

    let records = tx.recent_transactions(10).await.unwrap();
    assert_eq!(records.len(), 2);
    let status = |op: &str| records.iter().find(|r| r.operation_type == op).map(|r| (r.status, r.retry_count));
    assert_eq!(status("create"), Some((TransactionStatus::Committed, 0)));
    assert_eq!(status("rename"), Some((TransactionStatus::RolledBack, 0)));

    let report = engine.run_check().await.unwrap();
    assert_eq!(report.entities_checked, 1);
    assert_eq!(report.total_issues, 0);
}

#[tokio::test]
async fn sql_engine_without_ledger_url_is_a_config_error() {
    let config = EngineConfig { stores: stores(), ..Default::default() };
    let err = ReplicaSyncEngine::connect(config).await.err().unwrap();
    assert!(err.to_string().contains("ledger_url"));
}
