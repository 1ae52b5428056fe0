//! In-process ledger for tests, demos and single-run tools.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::traits::{IssueLedger, LedgerError, TransactionLog};
use crate::types::{ConsistencyIssue, ConsistencyReport, SeverityCounts, TransactionRecord};

#[derive(Default)]
pub struct InMemoryLedger {
    issues: DashMap<String, ConsistencyIssue>,
    reports: RwLock<Vec<ConsistencyReport>>,
    transactions: DashMap<String, TransactionRecord>,
}

impl InMemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn issue_count(&self) -> usize {
        self.issues.len()
    }

    /// Every issue ever recorded, in repair order.
    #[must_use]
    pub fn all_issues(&self) -> Vec<ConsistencyIssue> {
        let mut out: Vec<_> = self.issues.iter().map(|e| e.value().clone()).collect();
        out.sort_by(ConsistencyIssue::repair_order);
        out
    }
}

#[async_trait]
impl IssueLedger for InMemoryLedger {
    async fn record_issues(&self, issues: &[ConsistencyIssue]) -> Result<(), LedgerError> {
        for issue in issues {
            self.issues.insert(issue.issue_id.clone(), issue.clone());
        }
        Ok(())
    }

    async fn record_report(&self, report: &ConsistencyReport) -> Result<(), LedgerError> {
        self.reports.write().push(report.clone());
        Ok(())
    }

    async fn outstanding_issues(&self, limit: Option<usize>) -> Result<Vec<ConsistencyIssue>, LedgerError> {
        let mut out: Vec<_> = self
            .issues
            .iter()
            .filter(|e| !e.repaired)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(ConsistencyIssue::repair_order);
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn mark_repaired(&self, issue_id: &str, at: i64) -> Result<bool, LedgerError> {
        // get_mut holds the shard lock, so this is a single atomic row update
        Ok(match self.issues.get_mut(issue_id) {
            Some(mut issue) if !issue.repaired => {
                issue.repaired = true;
                issue.repair_attempted_at = Some(at);
                true
            }
            _ => false,
        })
    }

    async fn mark_attempted(&self, issue_id: &str, at: i64) -> Result<(), LedgerError> {
        if let Some(mut issue) = self.issues.get_mut(issue_id) {
            issue.repair_attempted_at = Some(at);
        }
        Ok(())
    }

    async fn issues_for_entity(&self, entity_id: &str) -> Result<Vec<ConsistencyIssue>, LedgerError> {
        let mut out: Vec<_> = self
            .issues
            .iter()
            .filter(|e| e.entity_id == entity_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(ConsistencyIssue::repair_order);
        Ok(out)
    }

    async fn outstanding_counts(&self) -> Result<SeverityCounts, LedgerError> {
        let mut counts = SeverityCounts::default();
        for e in self.issues.iter().filter(|e| !e.repaired) {
            counts.add(e.severity);
        }
        Ok(counts)
    }

    async fn latest_report(&self) -> Result<Option<ConsistencyReport>, LedgerError> {
        Ok(self.reports.read().last().cloned())
    }

    async fn recent_reports(&self, limit: usize) -> Result<Vec<ConsistencyReport>, LedgerError> {
        Ok(self.reports.read().iter().rev().take(limit).cloned().collect())
    }

    async fn purge_repaired_before(&self, cutoff: i64) -> Result<u64, LedgerError> {
        let before = self.issues.len();
        self.issues.retain(|_, i| !(i.repaired && i.detected_at < cutoff));
        Ok((before - self.issues.len()) as u64)
    }
}

#[async_trait]
impl TransactionLog for InMemoryLedger {
    async fn save_transaction(&self, record: &TransactionRecord) -> Result<(), LedgerError> {
        self.transactions.insert(record.transaction_id.clone(), record.clone());
        Ok(())
    }

    async fn get_transaction(&self, transaction_id: &str) -> Result<Option<TransactionRecord>, LedgerError> {
        Ok(self.transactions.get(transaction_id).map(|r| r.value().clone()))
    }

    async fn recent_transactions(&self, limit: usize) -> Result<Vec<TransactionRecord>, LedgerError> {
        let mut out: Vec<_> = self.transactions.iter().map(|r| r.value().clone()).collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out.truncate(limit);
        Ok(out)
    }
}
