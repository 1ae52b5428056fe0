// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL ledger (SQLite or MySQL through the sqlx `Any` driver).
//!
//! ```sql
//! consistency_issues   -- one row per detected divergence, append-only
//! consistency_reports  -- one row per check run
//! sync_transactions    -- one row per multi-store transaction
//! ```
//!
//! JSON values (expected/actual, stores, snapshots) are stored as TEXT.
//! `mark_repaired` is a single conditional UPDATE keyed by issue id, so the
//! checker and repair pass may write concurrently.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::AnyRow;
use sqlx::{Any, AnyPool, Row};
use tracing::debug;

use super::traits::{IssueLedger, LedgerError, TransactionLog};
use crate::storage::sql::{connect_pool, text_column};
use crate::types::{
    ConsistencyIssue, ConsistencyReport, Severity, SeverityCounts, TransactionRecord, TransactionStatus,
};

fn backend(e: sqlx::Error) -> LedgerError {
    LedgerError::Backend(e.to_string())
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, LedgerError> {
    serde_json::to_string(value).map_err(|e| LedgerError::Corrupt(e.to_string()))
}

fn decode_json<T: serde::de::DeserializeOwned>(row: &AnyRow, column: &str) -> Result<T, LedgerError> {
    let text = text_column(row, column)
        .ok_or_else(|| LedgerError::Corrupt(format!("column '{}' is empty", column)))?;
    serde_json::from_str(&text).map_err(|e| LedgerError::Corrupt(format!("{}: {}", column, e)))
}

fn optional_json(row: &AnyRow, column: &str) -> Option<Value> {
    text_column(row, column).and_then(|t| serde_json::from_str(&t).ok())
}

fn required_text(row: &AnyRow, column: &str) -> Result<String, LedgerError> {
    text_column(row, column).ok_or_else(|| LedgerError::Corrupt(format!("column '{}' is empty", column)))
}

fn int(row: &AnyRow, column: &str) -> i64 {
    row.try_get::<i64, _>(column).unwrap_or(0)
}

const ISSUE_COLUMNS: &str = "issue_id, report_id, entity_id, field_name, store_name, expected_value, \
     actual_value, severity, severity_rank, detected_at, repaired, repair_attempted_at";

const REPORT_COLUMNS: &str = "report_id, timestamp, entities_checked, total_issues, critical_issues, \
     warning_issues, info_issues, issues_repaired, success_rate, duration_ms";

const TRANSACTION_COLUMNS: &str = "transaction_id, entity_id, operation_type, stores_involved, status, \
     started_at, completed_at, retry_count, max_retries, error_message, rollback_snapshot";

pub struct SqlLedger {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlLedger {
    /// Connect and create the ledger tables if needed.
    pub async fn new(connection_string: &str) -> Result<Self, LedgerError> {
        let pool = connect_pool(connection_string)
            .await
            .map_err(|e| LedgerError::Backend(e.to_string()))?;
        let ledger = Self {
            pool,
            is_sqlite: connection_string.starts_with("sqlite:"),
        };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    async fn init_schema(&self) -> Result<(), LedgerError> {
        let statements: Vec<&str> = if self.is_sqlite {
            vec![
                r#"
                CREATE TABLE IF NOT EXISTS consistency_issues (
                    issue_id TEXT PRIMARY KEY,
                    report_id TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    field_name TEXT NOT NULL,
                    store_name TEXT NOT NULL,
                    expected_value TEXT,
                    actual_value TEXT,
                    severity TEXT NOT NULL,
                    severity_rank INTEGER NOT NULL,
                    detected_at INTEGER NOT NULL,
                    repaired INTEGER NOT NULL DEFAULT 0,
                    repair_attempted_at INTEGER
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_issues_outstanding ON consistency_issues (repaired, severity_rank, detected_at)",
                "CREATE INDEX IF NOT EXISTS idx_issues_entity ON consistency_issues (entity_id)",
                r#"
                CREATE TABLE IF NOT EXISTS consistency_reports (
                    report_id TEXT PRIMARY KEY,
                    timestamp INTEGER NOT NULL,
                    entities_checked INTEGER NOT NULL,
                    total_issues INTEGER NOT NULL,
                    critical_issues INTEGER NOT NULL,
                    warning_issues INTEGER NOT NULL,
                    info_issues INTEGER NOT NULL,
                    issues_repaired INTEGER NOT NULL,
                    success_rate REAL NOT NULL,
                    duration_ms INTEGER NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS sync_transactions (
                    transaction_id TEXT PRIMARY KEY,
                    entity_id TEXT NOT NULL,
                    operation_type TEXT NOT NULL,
                    stores_involved TEXT NOT NULL,
                    status TEXT NOT NULL,
                    started_at INTEGER NOT NULL,
                    completed_at INTEGER,
                    retry_count INTEGER NOT NULL,
                    max_retries INTEGER NOT NULL,
                    error_message TEXT,
                    rollback_snapshot TEXT NOT NULL
                )
                "#,
            ]
        } else {
            vec![
                r#"
                CREATE TABLE IF NOT EXISTS consistency_issues (
                    issue_id VARCHAR(64) PRIMARY KEY,
                    report_id VARCHAR(64) NOT NULL,
                    entity_id VARCHAR(191) NOT NULL,
                    field_name VARCHAR(191) NOT NULL,
                    store_name VARCHAR(191) NOT NULL,
                    expected_value TEXT,
                    actual_value TEXT,
                    severity VARCHAR(16) NOT NULL,
                    severity_rank BIGINT NOT NULL,
                    detected_at BIGINT NOT NULL,
                    repaired BIGINT NOT NULL DEFAULT 0,
                    repair_attempted_at BIGINT,
                    INDEX idx_issues_outstanding (repaired, severity_rank, detected_at),
                    INDEX idx_issues_entity (entity_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS consistency_reports (
                    report_id VARCHAR(64) PRIMARY KEY,
                    timestamp BIGINT NOT NULL,
                    entities_checked BIGINT NOT NULL,
                    total_issues BIGINT NOT NULL,
                    critical_issues BIGINT NOT NULL,
                    warning_issues BIGINT NOT NULL,
                    info_issues BIGINT NOT NULL,
                    issues_repaired BIGINT NOT NULL,
                    success_rate DOUBLE NOT NULL,
                    duration_ms BIGINT NOT NULL,
                    INDEX idx_reports_timestamp (timestamp)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS sync_transactions (
                    transaction_id VARCHAR(64) PRIMARY KEY,
                    entity_id VARCHAR(191) NOT NULL,
                    operation_type VARCHAR(191) NOT NULL,
                    stores_involved TEXT NOT NULL,
                    status VARCHAR(16) NOT NULL,
                    started_at BIGINT NOT NULL,
                    completed_at BIGINT,
                    retry_count BIGINT NOT NULL,
                    max_retries BIGINT NOT NULL,
                    error_message TEXT,
                    rollback_snapshot LONGTEXT NOT NULL,
                    INDEX idx_tx_started (started_at)
                )
                "#,
            ]
        };

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(backend)?;
        }
        debug!("Ledger schema initialized");
        Ok(())
    }

    fn row_to_issue(row: &AnyRow) -> Result<ConsistencyIssue, LedgerError> {
        let severity_text = required_text(row, "severity")?;
        let severity = Severity::parse(&severity_text)
            .ok_or_else(|| LedgerError::Corrupt(format!("unknown severity '{}'", severity_text)))?;
        Ok(ConsistencyIssue {
            issue_id: required_text(row, "issue_id")?,
            report_id: required_text(row, "report_id")?,
            entity_id: required_text(row, "entity_id")?,
            field_name: required_text(row, "field_name")?,
            store_name: required_text(row, "store_name")?,
            expected_value: optional_json(row, "expected_value"),
            actual_value: optional_json(row, "actual_value"),
            severity,
            detected_at: int(row, "detected_at"),
            repaired: int(row, "repaired") != 0,
            repair_attempted_at: row.try_get::<Option<i64>, _>("repair_attempted_at").ok().flatten(),
        })
    }

    fn row_to_report(row: &AnyRow) -> Result<ConsistencyReport, LedgerError> {
        Ok(ConsistencyReport {
            report_id: required_text(row, "report_id")?,
            timestamp: int(row, "timestamp"),
            entities_checked: int(row, "entities_checked") as u64,
            total_issues: int(row, "total_issues") as u64,
            critical_issues: int(row, "critical_issues") as u64,
            warning_issues: int(row, "warning_issues") as u64,
            info_issues: int(row, "info_issues") as u64,
            issues_repaired: int(row, "issues_repaired") as u64,
            success_rate: row.try_get::<f64, _>("success_rate").unwrap_or(0.0),
            duration_ms: int(row, "duration_ms") as u64,
        })
    }

    fn row_to_transaction(row: &AnyRow) -> Result<TransactionRecord, LedgerError> {
        let status_text = required_text(row, "status")?;
        let status = TransactionStatus::parse(&status_text)
            .ok_or_else(|| LedgerError::Corrupt(format!("unknown status '{}'", status_text)))?;
        Ok(TransactionRecord {
            transaction_id: required_text(row, "transaction_id")?,
            entity_id: required_text(row, "entity_id")?,
            operation_type: required_text(row, "operation_type")?,
            stores_involved: decode_json(row, "stores_involved")?,
            status,
            started_at: int(row, "started_at"),
            completed_at: row.try_get::<Option<i64>, _>("completed_at").ok().flatten(),
            retry_count: int(row, "retry_count") as u32,
            max_retries: int(row, "max_retries") as u32,
            error_message: text_column(row, "error_message"),
            rollback_snapshot: decode_json(row, "rollback_snapshot")?,
        })
    }

    async fn fetch_issues(&self, sql: &str, bind: Option<String>) -> Result<Vec<ConsistencyIssue>, LedgerError> {
        let mut query = sqlx::query::<Any>(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(backend)?;
        rows.iter().map(Self::row_to_issue).collect()
    }
}

#[async_trait]
impl IssueLedger for SqlLedger {
    async fn record_issues(&self, issues: &[ConsistencyIssue]) -> Result<(), LedgerError> {
        if issues.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO consistency_issues ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            ISSUE_COLUMNS
        );
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for issue in issues {
            let expected = issue.expected_value.as_ref().map(encode_json).transpose()?;
            let actual = issue.actual_value.as_ref().map(encode_json).transpose()?;
            sqlx::query::<Any>(&sql)
                .bind(issue.issue_id.clone())
                .bind(issue.report_id.clone())
                .bind(issue.entity_id.clone())
                .bind(issue.field_name.clone())
                .bind(issue.store_name.clone())
                .bind(expected)
                .bind(actual)
                .bind(issue.severity.as_str().to_string())
                .bind(issue.severity.rank())
                .bind(issue.detected_at)
                .bind(i64::from(issue.repaired))
                .bind(issue.repair_attempted_at)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn record_report(&self, report: &ConsistencyReport) -> Result<(), LedgerError> {
        let sql = format!(
            "INSERT INTO consistency_reports ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            REPORT_COLUMNS
        );
        sqlx::query::<Any>(&sql)
            .bind(report.report_id.clone())
            .bind(report.timestamp)
            .bind(report.entities_checked as i64)
            .bind(report.total_issues as i64)
            .bind(report.critical_issues as i64)
            .bind(report.warning_issues as i64)
            .bind(report.info_issues as i64)
            .bind(report.issues_repaired as i64)
            .bind(report.success_rate)
            .bind(report.duration_ms as i64)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn outstanding_issues(&self, limit: Option<usize>) -> Result<Vec<ConsistencyIssue>, LedgerError> {
        let mut sql = format!(
            "SELECT {} FROM consistency_issues WHERE repaired = 0 \
             ORDER BY severity_rank ASC, detected_at ASC, issue_id ASC",
            ISSUE_COLUMNS
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        self.fetch_issues(&sql, None).await
    }

    async fn mark_repaired(&self, issue_id: &str, at: i64) -> Result<bool, LedgerError> {
        let result = sqlx::query::<Any>(
            "UPDATE consistency_issues SET repaired = 1, repair_attempted_at = ? \
             WHERE issue_id = ? AND repaired = 0",
        )
        .bind(at)
        .bind(issue_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_attempted(&self, issue_id: &str, at: i64) -> Result<(), LedgerError> {
        sqlx::query::<Any>("UPDATE consistency_issues SET repair_attempted_at = ? WHERE issue_id = ?")
            .bind(at)
            .bind(issue_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn issues_for_entity(&self, entity_id: &str) -> Result<Vec<ConsistencyIssue>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM consistency_issues WHERE entity_id = ? \
             ORDER BY severity_rank ASC, detected_at ASC, issue_id ASC",
            ISSUE_COLUMNS
        );
        self.fetch_issues(&sql, Some(entity_id.to_string())).await
    }

    async fn outstanding_counts(&self) -> Result<SeverityCounts, LedgerError> {
        let rows = sqlx::query::<Any>(
            "SELECT severity, COUNT(*) AS n FROM consistency_issues WHERE repaired = 0 GROUP BY severity",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut counts = SeverityCounts::default();
        for row in &rows {
            let n = int(row, "n") as u64;
            match text_column(row, "severity").as_deref().and_then(Severity::parse) {
                Some(Severity::Critical) => counts.critical = n,
                Some(Severity::Warning) => counts.warning = n,
                Some(Severity::Info) => counts.info = n,
                None => {}
            }
        }
        Ok(counts)
    }

    async fn latest_report(&self) -> Result<Option<ConsistencyReport>, LedgerError> {
        Ok(self.recent_reports(1).await?.into_iter().next())
    }

    async fn recent_reports(&self, limit: usize) -> Result<Vec<ConsistencyReport>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM consistency_reports ORDER BY timestamp DESC LIMIT {}",
            REPORT_COLUMNS, limit
        );
        let rows = sqlx::query::<Any>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(Self::row_to_report).collect()
    }

    async fn purge_repaired_before(&self, cutoff: i64) -> Result<u64, LedgerError> {
        let result = sqlx::query::<Any>("DELETE FROM consistency_issues WHERE repaired = 1 AND detected_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TransactionLog for SqlLedger {
    async fn save_transaction(&self, record: &TransactionRecord) -> Result<(), LedgerError> {
        // REPLACE INTO is understood by both SQLite and MySQL
        let sql = format!(
            "REPLACE INTO sync_transactions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            TRANSACTION_COLUMNS
        );
        sqlx::query::<Any>(&sql)
            .bind(record.transaction_id.clone())
            .bind(record.entity_id.clone())
            .bind(record.operation_type.clone())
            .bind(encode_json(&record.stores_involved)?)
            .bind(record.status.as_str().to_string())
            .bind(record.started_at)
            .bind(record.completed_at)
            .bind(i64::from(record.retry_count))
            .bind(i64::from(record.max_retries))
            .bind(record.error_message.clone())
            .bind(encode_json(&record.rollback_snapshot)?)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_transaction(&self, transaction_id: &str) -> Result<Option<TransactionRecord>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM sync_transactions WHERE transaction_id = ?",
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query::<Any>(&sql)
            .bind(transaction_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    async fn recent_transactions(&self, limit: usize) -> Result<Vec<TransactionRecord>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM sync_transactions ORDER BY started_at DESC LIMIT {}",
            TRANSACTION_COLUMNS, limit
        );
        let rows = sqlx::query::<Any>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(Self::row_to_transaction).collect()
    }
}
