// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for replica-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `replica_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `store`: registered store name
//! - `severity`: critical, warning, info
//! - `pass`: quick, full
//! - `status`: success, failure, rejected, ...

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::types::{Severity, SeverityCounts, TransactionStatus};

// ═══════════════════════════════════════════════════════════════════════════
// CHECKER - Detection
// ═══════════════════════════════════════════════════════════════════════════

/// Record issues detected by one check run
pub fn record_issues_detected(counts: &SeverityCounts) {
    for (severity, n) in [
        (Severity::Critical, counts.critical),
        (Severity::Warning, counts.warning),
        (Severity::Info, counts.info),
    ] {
        if n > 0 {
            counter!(
                "replica_sync_issues_detected_total",
                "severity" => severity.as_str()
            )
            .increment(n);
        }
    }
}

/// Record entities compared by one check run
pub fn record_entities_checked(count: u64) {
    counter!("replica_sync_entities_checked_total").increment(count);
}

/// Set the success rate of the latest report (0 - 100)
pub fn set_success_rate(rate: f64) {
    gauge!("replica_sync_success_rate").set(rate);
}

/// Record a replica read that failed during a check
pub fn record_store_access_failure(store: &str) {
    counter!(
        "replica_sync_store_access_failures_total",
        "store" => store.to_string()
    )
    .increment(1);
}

/// Record check duration
pub fn record_check_duration(duration: Duration) {
    histogram!("replica_sync_check_seconds").record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// REPAIR
// ═══════════════════════════════════════════════════════════════════════════

/// Record one repair outcome
pub fn record_repair(store: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replica_sync_repairs_total",
        "store" => store.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record repair pass duration
pub fn record_repair_duration(duration: Duration) {
    histogram!("replica_sync_repair_seconds").record(duration.as_secs_f64());
}

/// Set outstanding (unrepaired) issue counts
pub fn set_outstanding_issues(counts: &SeverityCounts) {
    gauge!("replica_sync_outstanding_issues", "severity" => "critical").set(counts.critical as f64);
    gauge!("replica_sync_outstanding_issues", "severity" => "warning").set(counts.warning as f64);
    gauge!("replica_sync_outstanding_issues", "severity" => "info").set(counts.info as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// TRANSACTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Record a transaction reaching a final status
pub fn record_transaction(status: TransactionStatus) {
    counter!(
        "replica_sync_transactions_total",
        "status" => status.as_str()
    )
    .increment(1);
}

/// Record a transaction body retry
pub fn record_transaction_retry() {
    counter!("replica_sync_transaction_retries_total").increment(1);
}

/// Record transaction latency
pub fn record_transaction_duration(duration: Duration) {
    histogram!("replica_sync_transaction_seconds").record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// ALERTS
// ═══════════════════════════════════════════════════════════════════════════

/// Record an alert delivery attempt on one sink
pub fn record_alert(alert_type: &str, sink: &str, delivered: bool) {
    let status = if delivered { "delivered" } else { "failed" };
    counter!(
        "replica_sync_alerts_total",
        "type" => alert_type.to_string(),
        "sink" => sink.to_string(),
        "status" => status
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SCHEDULER
// ═══════════════════════════════════════════════════════════════════════════

/// Record a scheduled pass outcome
pub fn record_pass(pass: &str, status: &str) {
    counter!(
        "replica_sync_passes_total",
        "pass" => pass.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record issues purged by retention
pub fn record_issues_purged(count: u64) {
    counter!("replica_sync_issues_purged_total").increment(count);
}

// ═══════════════════════════════════════════════════════════════════════════
// RESILIENCE
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker call outcome
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "replica_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an operation that ran out of retry attempts
pub fn record_retry_exhausted(operation: &str) {
    counter!(
        "replica_sync_retry_exhausted_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// A timing guard that records pass latency on drop
pub struct PassTimer {
    pass: &'static str,
    start: Instant,
}

impl PassTimer {
    pub fn new(pass: &'static str) -> Self {
        Self {
            pass,
            start: Instant::now(),
        }
    }
}

impl Drop for PassTimer {
    fn drop(&mut self) {
        histogram!(
            "replica_sync_pass_seconds",
            "pass" => self.pass
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
