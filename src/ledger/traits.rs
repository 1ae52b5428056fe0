//! Ledger contracts: where issues, reports and transaction records live.
//!
//! The engine never owns this state. Callers hand it a ledger and every
//! query result comes from there, so dashboards read the same data the
//! repair pass works from.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ConsistencyIssue, ConsistencyReport, SeverityCounts, TransactionRecord};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Ledger backend error: {0}")]
    Backend(String),
    #[error("Ledger data could not be decoded: {0}")]
    Corrupt(String),
}

/// Persistence of issues and reports.
#[async_trait]
pub trait IssueLedger: Send + Sync {
    /// Append issues. Persistent mismatches produce new rows every run.
    async fn record_issues(&self, issues: &[ConsistencyIssue]) -> Result<(), LedgerError>;

    /// Store a report. Reports are written once.
    async fn record_report(&self, report: &ConsistencyReport) -> Result<(), LedgerError>;

    /// Unrepaired issues in repair order (severity, then oldest first).
    async fn outstanding_issues(&self, limit: Option<usize>) -> Result<Vec<ConsistencyIssue>, LedgerError>;

    /// Atomically flag one issue as repaired. Returns false if it was
    /// unknown or already repaired.
    async fn mark_repaired(&self, issue_id: &str, at: i64) -> Result<bool, LedgerError>;

    /// Record that a repair was tried (and failed) at `at`.
    async fn mark_attempted(&self, issue_id: &str, at: i64) -> Result<(), LedgerError>;

    async fn issues_for_entity(&self, entity_id: &str) -> Result<Vec<ConsistencyIssue>, LedgerError>;

    async fn outstanding_counts(&self) -> Result<SeverityCounts, LedgerError>;

    async fn latest_report(&self) -> Result<Option<ConsistencyReport>, LedgerError>;

    /// Most recent first.
    async fn recent_reports(&self, limit: usize) -> Result<Vec<ConsistencyReport>, LedgerError>;

    /// Delete repaired issues detected before `cutoff`. Returns rows removed.
    async fn purge_repaired_before(&self, cutoff: i64) -> Result<u64, LedgerError>;
}

/// Persistence of transaction records.
#[async_trait]
pub trait TransactionLog: Send + Sync {
    /// Insert or replace the record with the same transaction id.
    async fn save_transaction(&self, record: &TransactionRecord) -> Result<(), LedgerError>;

    async fn get_transaction(&self, transaction_id: &str) -> Result<Option<TransactionRecord>, LedgerError>;

    /// Most recently started first.
    async fn recent_transactions(&self, limit: usize) -> Result<Vec<TransactionRecord>, LedgerError>;
}
