// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consistency checker: compares every master entity with every replica.
//!
//! # Detection rules
//!
//! For each master entity and each replica:
//!
//! | Replica read result | Issue |
//! |---|---|
//! | row absent | one critical `__record__` issue (never per-field) |
//! | row present | one issue per sync field present on both sides whose JSON values differ; critical if the field is critical for that replica, else warning |
//! | error | one critical `__access__` issue carrying the error text |
//!
//! A failing replica never aborts the run. A failing master read does,
//! since there is nothing to compare against.
//!
//! Every issue goes to the ledger, followed by exactly one report. When a
//! scheduled pass repairs between detection and the report write, the
//! report carries the repair count.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::ledger::traits::IssueLedger;
use crate::registry::{StoreDescriptor, StoreRegistry};
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::StoreAccessor;
use crate::types::{
    now_millis, percentage, ConsistencyIssue, ConsistencyReport, EntityId, Fields, SeverityCounts,
};

/// Process-wide guard making check, repair and scheduled passes mutually
/// exclusive, so two runs never double-count or double-repair.
#[derive(Default)]
pub struct RunGuard {
    lock: Mutex<()>,
}

impl RunGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for any running pass to finish.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// `None` if a pass is running right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.lock.try_lock().ok()
    }
}

/// Detection result whose report has not been written yet.
#[derive(Debug)]
pub struct PendingReport {
    pub report: ConsistencyReport,
    pub issues: Vec<ConsistencyIssue>,
    started: Instant,
}

pub struct ConsistencyChecker {
    registry: Arc<StoreRegistry>,
    accessor: Arc<dyn StoreAccessor>,
    ledger: Arc<dyn IssueLedger>,
    guard: Arc<RunGuard>,
    page_size: usize,
    read_retry: RetryConfig,
}

impl ConsistencyChecker {
    pub fn new(
        registry: Arc<StoreRegistry>,
        accessor: Arc<dyn StoreAccessor>,
        ledger: Arc<dyn IssueLedger>,
        guard: Arc<RunGuard>,
        page_size: usize,
    ) -> Self {
        Self {
            registry,
            accessor,
            ledger,
            guard,
            page_size: page_size.max(1),
            read_retry: RetryConfig::query(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_read_retry(mut self, config: RetryConfig) -> Self {
        self.read_retry = config;
        self
    }

    /// Run one full check and persist its issues and report.
    #[tracing::instrument(skip(self))]
    pub async fn run_check(&self) -> Result<ConsistencyReport, EngineError> {
        let _guard = self.guard.lock().await;
        let pending = self.detect().await?;
        self.finalize(pending, 0).await
    }

    /// Detect and persist issues. Caller must hold the [`RunGuard`].
    pub(crate) async fn detect(&self) -> Result<PendingReport, EngineError> {
        let started = Instant::now();
        let report_id = uuid::Uuid::new_v4().to_string();

        let entities = self.load_master().await?;
        debug!(entities = entities.len(), "Master entities loaded");

        let mut issues = Vec::new();
        for (entity_id, master_fields) in &entities {
            issues.extend(self.check_entity(&report_id, entity_id, master_fields).await);
        }

        self.ledger.record_issues(&issues).await?;

        let affected: HashSet<&str> = issues.iter().map(|i| i.entity_id.as_str()).collect();
        let counts = SeverityCounts::tally(&issues);
        let entities_checked = entities.len() as u64;
        let clean = entities_checked - affected.len() as u64;

        crate::metrics::record_entities_checked(entities_checked);
        crate::metrics::record_issues_detected(&counts);

        let report = ConsistencyReport {
            report_id,
            timestamp: now_millis(),
            entities_checked,
            total_issues: counts.total(),
            critical_issues: counts.critical,
            warning_issues: counts.warning,
            info_issues: counts.info,
            issues_repaired: 0,
            success_rate: percentage(clean, entities_checked),
            duration_ms: 0,
        };
        Ok(PendingReport { report, issues, started })
    }

    /// Write the report once, stamped with the repair count and duration.
    pub(crate) async fn finalize(
        &self,
        pending: PendingReport,
        issues_repaired: u64,
    ) -> Result<ConsistencyReport, EngineError> {
        let elapsed = pending.started.elapsed();
        let mut report = pending.report;
        report.issues_repaired = issues_repaired;
        report.duration_ms = elapsed.as_millis() as u64;

        self.ledger.record_report(&report).await?;

        crate::metrics::set_success_rate(report.success_rate);
        crate::metrics::record_check_duration(elapsed);
        info!(
            report_id = %report.report_id,
            entities = report.entities_checked,
            issues = report.total_issues,
            critical = report.critical_issues,
            repaired = report.issues_repaired,
            success_rate = report.success_rate,
            duration_ms = report.duration_ms,
            "Consistency check complete"
        );
        Ok(report)
    }

    async fn load_master(&self) -> Result<Vec<(EntityId, Fields)>, EngineError> {
        let master = &self.registry.master().name;
        let mut out = Vec::new();
        let mut offset = 0u64;
        loop {
            let page = retry("scan_master", &self.read_retry, || {
                self.accessor.scan(master, offset, self.page_size)
            })
            .await?;
            let len = page.len();
            out.extend(page);
            if len < self.page_size {
                break;
            }
            offset += len as u64;
        }
        Ok(out)
    }

    /// Compare one entity against every replica. Replica reads run concurrently.
    async fn check_entity(
        &self,
        report_id: &str,
        entity_id: &str,
        master_fields: &Fields,
    ) -> Vec<ConsistencyIssue> {
        let checks = self
            .registry
            .replicas()
            .map(|replica| self.check_replica(report_id, entity_id, master_fields, replica));
        join_all(checks).await.into_iter().flatten().collect()
    }

    async fn check_replica(
        &self,
        report_id: &str,
        entity_id: &str,
        master_fields: &Fields,
        replica: &StoreDescriptor,
    ) -> Vec<ConsistencyIssue> {
        match self.accessor.get(&replica.name, entity_id).await {
            Ok(None) => {
                debug!(entity = %entity_id, store = %replica.name, "Replica row missing");
                vec![ConsistencyIssue::record_missing(report_id, entity_id, &replica.name)]
            }
            Ok(Some(row)) => compare_fields(report_id, entity_id, master_fields, &row, replica),
            Err(e) => {
                warn!(entity = %entity_id, store = %replica.name, error = %e, "Replica read failed");
                crate::metrics::record_store_access_failure(&replica.name);
                vec![ConsistencyIssue::access_failure(report_id, entity_id, &replica.name, &e.to_string())]
            }
        }
    }
}

/// Field-level diff of one replica row against the master row.
pub(crate) fn compare_fields(
    report_id: &str,
    entity_id: &str,
    master_fields: &Fields,
    replica_fields: &Fields,
    replica: &StoreDescriptor,
) -> Vec<ConsistencyIssue> {
    replica
        .sync_fields
        .iter()
        .filter_map(|field| {
            let expected = master_fields.get(field)?;
            let actual = replica_fields.get(field)?;
            (expected != actual).then(|| {
                ConsistencyIssue::field_mismatch(
                    report_id,
                    entity_id,
                    &replica.name,
                    field,
                    replica.is_critical(field),
                    expected.clone(),
                    actual.clone(),
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::InMemoryLedger;
    use crate::storage::memory::InMemoryStore;
    use crate::types::{Severity, RECORD_FIELD};
    use serde_json::json;

    fn registry() -> Arc<StoreRegistry> {
        Arc::new(
            StoreRegistry::new(vec![
                StoreDescriptor::master("clients", "clients", &["name", "email", "dob"]),
                StoreDescriptor::replica("housing", "housing_clients", &["name", "email"], &["name"]),
                StoreDescriptor::replica("legal", "legal_clients", &["name", "dob"], &["name", "dob"]),
            ])
            .unwrap(),
        )
    }

    fn fields(pairs: &[(&str, serde_json::Value)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn checker(store: Arc<InMemoryStore>, ledger: Arc<InMemoryLedger>, page_size: usize) -> ConsistencyChecker {
        ConsistencyChecker::new(registry(), store, ledger, Arc::new(RunGuard::new()), page_size)
            .with_read_retry(RetryConfig::test())
    }

    #[test]
    fn test_compare_fields_skips_one_sided_fields() {
        let reg = registry();
        let housing = reg.get("housing").unwrap();
        let master = fields(&[("name", json!("Ann")), ("email", json!("a@x.com"))]);
        let replica = fields(&[("name", json!("Anne"))]);

        let issues = compare_fields("r", "C1", &master, &replica, housing);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field_name, "name");
        assert_eq!(issues[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_clean_stores_yield_full_success() {
        let store = Arc::new(InMemoryStore::new(&registry()));
        let ledger = Arc::new(InMemoryLedger::new());
        let row = fields(&[("name", json!("Ann")), ("email", json!("a@x.com")), ("dob", json!("1990-01-01"))]);
        for s in ["clients", "housing", "legal"] {
            store.put(s, "C1", &row).await.unwrap();
        }

        let report = checker(store, ledger.clone(), 10).run_check().await.unwrap();
        assert_eq!(report.entities_checked, 1);
        assert_eq!(report.total_issues, 0);
        assert_eq!(report.success_rate, 100.0);
        assert_eq!(ledger.latest_report().await.unwrap().unwrap(), report);
    }

    #[tokio::test]
    async fn test_missing_row_is_one_critical_issue() {
        let store = Arc::new(InMemoryStore::new(&registry()));
        let ledger = Arc::new(InMemoryLedger::new());
        let row = fields(&[("name", json!("Bo")), ("email", json!("b@x.com")), ("dob", json!("1980-05-05"))]);
        store.put("clients", "C2", &row).await.unwrap();
        store.put("housing", "C2", &row).await.unwrap();

        let report = checker(store, ledger.clone(), 10).run_check().await.unwrap();
        assert_eq!(report.total_issues, 1);
        assert_eq!(report.critical_issues, 1);
        assert_eq!(report.success_rate, 0.0);

        let issues = ledger.all_issues();
        assert_eq!(issues[0].field_name, RECORD_FIELD);
        assert_eq!(issues[0].store_name, "legal");
        assert_eq!(issues[0].report_id, report.report_id);
    }

    #[tokio::test]
    async fn test_pages_through_every_master_entity() {
        let store = Arc::new(InMemoryStore::new(&registry()));
        let ledger = Arc::new(InMemoryLedger::new());
        for i in 0..7 {
            let row = fields(&[("name", json!(format!("n{}", i))), ("email", json!("e")), ("dob", json!("d"))]);
            let id = format!("C{}", i);
            for s in ["clients", "housing", "legal"] {
                store.put(s, &id, &row).await.unwrap();
            }
        }

        let report = checker(store, ledger, 3).run_check().await.unwrap();
        assert_eq!(report.entities_checked, 7);
    }

    #[tokio::test]
    async fn test_empty_master_reports_full_success() {
        let store = Arc::new(InMemoryStore::new(&registry()));
        let ledger = Arc::new(InMemoryLedger::new());
        let report = checker(store, ledger, 10).run_check().await.unwrap();
        assert_eq!(report.entities_checked, 0);
        assert_eq!(report.success_rate, 100.0);
    }
}
