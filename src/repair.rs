// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Repair executor: converges replicas to the master for outstanding issues.
//!
//! Issues are processed one at a time in repair order (critical first,
//! then oldest). Each write goes through the store's circuit breaker and
//! the retry executor. Failures are logged, stamped with
//! `repair_attempted_at` and left outstanding; the pass keeps going.
//! Ledger errors while marking one issue are logged the same way.
//!
//! | Issue field | Write |
//! |---|---|
//! | `__record__` | full master row projected onto the replica's sync fields |
//! | `__access__` | same as `__record__` (creates or converges the whole row) |
//! | any other | that one field, with the master's current value |

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::checker::RunGuard;
use crate::error::EngineError;
use crate::ledger::traits::IssueLedger;
use crate::registry::StoreRegistry;
use crate::resilience::circuit_breaker::{CircuitError, StoreCircuits};
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::{StoreAccessor, StoreError};
use crate::types::{now_millis, ConsistencyIssue, Fields, RepairSummary};

pub struct RepairExecutor {
    registry: Arc<StoreRegistry>,
    accessor: Arc<dyn StoreAccessor>,
    ledger: Arc<dyn IssueLedger>,
    guard: Arc<RunGuard>,
    circuits: Arc<StoreCircuits>,
    retry: RetryConfig,
    max_per_run: Option<usize>,
}

impl RepairExecutor {
    pub fn new(
        registry: Arc<StoreRegistry>,
        accessor: Arc<dyn StoreAccessor>,
        ledger: Arc<dyn IssueLedger>,
        guard: Arc<RunGuard>,
        circuits: Arc<StoreCircuits>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            registry,
            accessor,
            ledger,
            guard,
            circuits,
            retry,
            max_per_run: None,
        }
    }

    /// Cap the number of issues one pass processes.
    #[must_use]
    pub fn with_max_per_run(mut self, max: Option<usize>) -> Self {
        self.max_per_run = max;
        self
    }

    #[must_use]
    pub fn circuits(&self) -> &StoreCircuits {
        &self.circuits
    }

    /// Repair every outstanding issue (up to the per-run cap).
    #[tracing::instrument(skip(self))]
    pub async fn repair_outstanding(&self) -> Result<RepairSummary, EngineError> {
        let _guard = self.guard.lock().await;
        self.repair_locked().await
    }

    /// Caller must hold the [`RunGuard`].
    pub(crate) async fn repair_locked(&self) -> Result<RepairSummary, EngineError> {
        let start = Instant::now();
        let issues = self.ledger.outstanding_issues(self.max_per_run).await?;
        let mut repaired = 0u64;

        for issue in &issues {
            match self.repair_issue(issue).await {
                Ok(()) => {
                    match self.ledger.mark_repaired(&issue.issue_id, now_millis()).await {
                        Ok(true) => repaired += 1,
                        Ok(false) => {}
                        Err(e) => warn!(
                            issue_id = %issue.issue_id,
                            error = %e,
                            "Replica repaired but the ledger could not mark the issue"
                        ),
                    }
                    crate::metrics::record_repair(&issue.store_name, true);
                    debug!(
                        issue_id = %issue.issue_id,
                        entity = %issue.entity_id,
                        store = %issue.store_name,
                        field = %issue.field_name,
                        "Issue repaired"
                    );
                }
                Err(e) => {
                    if let Err(le) = self.ledger.mark_attempted(&issue.issue_id, now_millis()).await {
                        warn!(issue_id = %issue.issue_id, error = %le, "Could not stamp repair attempt");
                    }
                    crate::metrics::record_repair(&issue.store_name, false);
                    warn!(
                        issue_id = %issue.issue_id,
                        entity = %issue.entity_id,
                        store = %issue.store_name,
                        field = %issue.field_name,
                        error = %e,
                        "Repair failed, issue left outstanding"
                    );
                }
            }
        }

        let elapsed = start.elapsed();
        let summary = RepairSummary::new(issues.len() as u64, repaired, elapsed.as_millis() as u64);

        crate::metrics::record_repair_duration(elapsed);
        match self.ledger.outstanding_counts().await {
            Ok(counts) => crate::metrics::set_outstanding_issues(&counts),
            Err(e) => warn!(error = %e, "Could not refresh outstanding issue gauges"),
        }
        info!(
            processed = summary.processed,
            repaired = summary.repaired,
            failed = summary.failed,
            success_rate = summary.success_rate,
            duration_ms = summary.duration_ms,
            "Repair pass complete"
        );
        Ok(summary)
    }

    async fn repair_issue(&self, issue: &ConsistencyIssue) -> Result<(), StoreError> {
        let target = self
            .registry
            .get(&issue.store_name)
            .ok_or_else(|| StoreError::unknown_store(&issue.store_name))?;
        if target.is_master {
            return Err(StoreError::Validation(format!(
                "issue {} targets the master store",
                issue.issue_id
            )));
        }

        let master = self.registry.master();
        let master_row = retry("repair_read_master", &self.retry, || {
            self.accessor.get(&master.name, &issue.entity_id)
        })
        .await?
        .ok_or_else(|| {
            StoreError::Validation(format!(
                "master row for '{}' no longer exists",
                issue.entity_id
            ))
        })?;

        let patch = if issue.is_record_missing() || issue.is_access_failure() {
            target.project(&master_row)
        } else {
            let value = master_row.get(&issue.field_name).ok_or_else(|| {
                StoreError::Validation(format!(
                    "master row for '{}' has no value for '{}'",
                    issue.entity_id, issue.field_name
                ))
            })?;
            let mut patch = Fields::new();
            patch.insert(issue.field_name.clone(), value.clone());
            patch
        };

        self.write(&target.name, &issue.entity_id, &patch).await
    }

    async fn write(&self, store: &str, id: &str, patch: &Fields) -> Result<(), StoreError> {
        let breaker = self.circuits.for_store(store);
        let result = retry("repair_write", &self.retry, || {
            let breaker = breaker.clone();
            async move { breaker.call(|| self.accessor.put(store, id, patch)).await }
        })
        .await;

        result.map_err(|e| match e {
            CircuitError::Rejected => StoreError::unavailable(store, "circuit breaker open"),
            CircuitError::Inner(e) => e,
        })
    }
}
