//! Shared data model: issues, reports, repair summaries and transaction records.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque key of one logical record owned by the master store.
pub type EntityId = String;

/// Field name to value. Ordered so projections and snapshots compare stably.
pub type Fields = BTreeMap<String, Value>;

/// Field name used for a replica row that is missing entirely.
pub const RECORD_FIELD: &str = "__record__";

/// Field name used when the replica could not be read at all.
pub const ACCESS_FIELD: &str = "__access__";

/// Current time as epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Issue severity. Variant order is repair priority (critical first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Severity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }

    /// Numeric rank used for ordering in SQL (0 = most urgent).
    #[must_use]
    pub fn rank(&self) -> i64 {
        match self {
            Self::Critical => 0,
            Self::Warning => 1,
            Self::Info => 2,
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Self::Critical),
            "warning" => Some(Self::Warning),
            "info" => Some(Self::Info),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One detected divergence between the master and a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyIssue {
    /// Identity used by mark-repaired
    pub issue_id: String,
    /// Check run that detected this issue
    pub report_id: String,
    pub entity_id: EntityId,
    /// Diverging field, or [`RECORD_FIELD`] / [`ACCESS_FIELD`]
    pub field_name: String,
    pub store_name: String,
    pub expected_value: Option<Value>,
    pub actual_value: Option<Value>,
    pub severity: Severity,
    pub detected_at: i64,
    pub repaired: bool,
    pub repair_attempted_at: Option<i64>,
}

impl ConsistencyIssue {
    fn new(
        report_id: &str,
        entity_id: &str,
        store_name: &str,
        field_name: &str,
        severity: Severity,
        expected_value: Option<Value>,
        actual_value: Option<Value>,
    ) -> Self {
        Self {
            issue_id: uuid::Uuid::new_v4().to_string(),
            report_id: report_id.to_string(),
            entity_id: entity_id.to_string(),
            field_name: field_name.to_string(),
            store_name: store_name.to_string(),
            expected_value,
            actual_value,
            severity,
            detected_at: now_millis(),
            repaired: false,
            repair_attempted_at: None,
        }
    }

    /// The replica has no row for this entity.
    #[must_use]
    pub fn record_missing(report_id: &str, entity_id: &str, store_name: &str) -> Self {
        Self::new(
            report_id,
            entity_id,
            store_name,
            RECORD_FIELD,
            Severity::Critical,
            Some(Value::String("present".into())),
            None,
        )
    }

    /// A sync field holds a different value than the master.
    #[must_use]
    pub fn field_mismatch(
        report_id: &str,
        entity_id: &str,
        store_name: &str,
        field_name: &str,
        critical: bool,
        expected: Value,
        actual: Value,
    ) -> Self {
        let severity = if critical { Severity::Critical } else { Severity::Warning };
        Self::new(report_id, entity_id, store_name, field_name, severity, Some(expected), Some(actual))
    }

    /// Reading the replica failed. The error text is kept as the actual value.
    #[must_use]
    pub fn access_failure(report_id: &str, entity_id: &str, store_name: &str, error: &str) -> Self {
        Self::new(
            report_id,
            entity_id,
            store_name,
            ACCESS_FIELD,
            Severity::Critical,
            None,
            Some(Value::String(error.to_string())),
        )
    }

    #[must_use]
    pub fn is_record_missing(&self) -> bool {
        self.field_name == RECORD_FIELD
    }

    #[must_use]
    pub fn is_access_failure(&self) -> bool {
        self.field_name == ACCESS_FIELD
    }

    /// Repair order: severity first, then oldest detection, then id for stability.
    #[must_use]
    pub fn repair_order(a: &Self, b: &Self) -> Ordering {
        a.severity
            .cmp(&b.severity)
            .then(a.detected_at.cmp(&b.detected_at))
            .then_with(|| a.issue_id.cmp(&b.issue_id))
    }
}

/// Issue counts by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: u64,
    pub warning: u64,
    pub info: u64,
}

impl SeverityCounts {
    pub fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::Warning => self.warning += 1,
            Severity::Info => self.info += 1,
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.critical + self.warning + self.info
    }

    #[must_use]
    pub fn tally<'a>(issues: impl IntoIterator<Item = &'a ConsistencyIssue>) -> Self {
        let mut counts = Self::default();
        for issue in issues {
            counts.add(issue.severity);
        }
        counts
    }
}

/// Aggregate result of one check run. Written once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub report_id: String,
    pub timestamp: i64,
    pub entities_checked: u64,
    pub total_issues: u64,
    pub critical_issues: u64,
    pub warning_issues: u64,
    pub info_issues: u64,
    /// Issues of this run repaired before the report was written
    pub issues_repaired: u64,
    /// Percentage of checked entities with no issue
    pub success_rate: f64,
    pub duration_ms: u64,
}

impl ConsistencyReport {
    #[must_use]
    pub fn has_critical(&self) -> bool {
        self.critical_issues > 0
    }
}

/// Result of one repair pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RepairSummary {
    pub processed: u64,
    pub repaired: u64,
    pub failed: u64,
    /// repaired / processed as a percentage; 100 when nothing was processed
    pub success_rate: f64,
    pub duration_ms: u64,
}

impl RepairSummary {
    #[must_use]
    pub fn new(processed: u64, repaired: u64, duration_ms: u64) -> Self {
        Self {
            processed,
            repaired,
            failed: processed.saturating_sub(repaired),
            success_rate: percentage(repaired, processed),
            duration_ms,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// `part / whole` as a percentage, 100 for an empty whole.
#[must_use]
pub fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        100.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Lifecycle of a multi-store transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Committed,
    RolledBack,
    /// Rollback could not be completed on every store
    Failed,
    /// Aborted on a transient error, about to run again
    Retrying,
}

impl TransactionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "committed" => Some(Self::Committed),
            "rolled_back" => Some(Self::RolledBack),
            "failed" => Some(Self::Failed),
            "retrying" => Some(Self::Retrying),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persistent record of one multi-store transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub entity_id: EntityId,
    pub operation_type: String,
    pub stores_involved: Vec<String>,
    pub status: TransactionStatus,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    /// Pre-image per store; `None` means the row did not exist
    pub rollback_snapshot: BTreeMap<String, Option<Fields>>,
}

impl TransactionRecord {
    #[must_use]
    pub fn pending(entity_id: &str, operation_type: &str, stores: &[String], max_retries: u32) -> Self {
        Self {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            entity_id: entity_id.to_string(),
            operation_type: operation_type.to_string(),
            stores_involved: stores.to_vec(),
            status: TransactionStatus::Pending,
            started_at: now_millis(),
            completed_at: None,
            retry_count: 0,
            max_retries,
            error_message: None,
            rollback_snapshot: BTreeMap::new(),
        }
    }

    pub fn finish(&mut self, status: TransactionStatus, error: Option<String>) {
        self.status = status;
        self.error_message = error;
        self.completed_at = Some(now_millis());
    }
}
