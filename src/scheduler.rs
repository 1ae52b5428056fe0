// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scheduler: composes check, repair and alerting into passes.
//!
//! ```text
//! quick: check ─(issues)→ repair ─(critical outstanding)→ alert
//! full:  quick, then summary alert, then purge old repaired issues
//! ```
//!
//! An error escaping a pass is turned into a critical `pipeline_error`
//! alert. The run loop ticks both cadences until the shutdown channel
//! flips; a tick that finds a pass already running is skipped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::alert::{Alert, AlertDispatcher};
use crate::checker::{ConsistencyChecker, RunGuard};
use crate::error::EngineError;
use crate::ledger::traits::IssueLedger;
use crate::metrics::PassTimer;
use crate::repair::RepairExecutor;
use crate::types::{now_millis, ConsistencyReport, RepairSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Quick,
    Full,
}

impl PassKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Full => "full",
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub kind: PassKind,
    pub report: ConsistencyReport,
    /// `None` when the check found nothing to repair
    pub repair: Option<RepairSummary>,
    /// Critical issues still outstanding after repair
    pub critical_outstanding: u64,
    /// Sink deliveries across every alert the pass sent
    pub alerts_delivered: usize,
    pub purged: u64,
}

pub struct Scheduler {
    checker: Arc<ConsistencyChecker>,
    repairer: Arc<RepairExecutor>,
    alerts: Arc<AlertDispatcher>,
    ledger: Arc<dyn IssueLedger>,
    guard: Arc<RunGuard>,
    quick_interval: Duration,
    full_interval: Duration,
    retention_ms: Option<i64>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        checker: Arc<ConsistencyChecker>,
        repairer: Arc<RepairExecutor>,
        alerts: Arc<AlertDispatcher>,
        ledger: Arc<dyn IssueLedger>,
        guard: Arc<RunGuard>,
        quick_interval: Duration,
        full_interval: Duration,
        retention_ms: Option<i64>,
    ) -> Self {
        Self {
            checker,
            repairer,
            alerts,
            ledger,
            guard,
            quick_interval,
            full_interval,
            retention_ms,
        }
    }

    /// Check, repair, alert on critical leftovers. Waits for a running pass.
    pub async fn run_quick_pass(&self) -> Result<PassOutcome, EngineError> {
        let _guard = self.guard.lock().await;
        self.guarded_pass(PassKind::Quick).await
    }

    /// Quick pass plus summary alert and retention purge.
    pub async fn run_full_pass(&self) -> Result<PassOutcome, EngineError> {
        let _guard = self.guard.lock().await;
        self.guarded_pass(PassKind::Full).await
    }

    /// Tick both cadences until `shutdown` becomes true or its sender drops.
    ///
    /// The full cadence fires once immediately; the quick one waits a period.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut quick = tokio::time::interval(self.quick_interval);
        let mut full = tokio::time::interval(self.full_interval);
        quick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        full.set_missed_tick_behavior(MissedTickBehavior::Skip);
        quick.tick().await;

        info!(
            quick_secs = self.quick_interval.as_secs(),
            full_secs = self.full_interval.as_secs(),
            "Scheduler running"
        );

        loop {
            // also catches a shutdown sent before this receiver was created
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                _ = full.tick() => {
                    self.tick(PassKind::Full).await;
                }

                _ = quick.tick() => {
                    self.tick(PassKind::Quick).await;
                }
            }
        }
        info!("Scheduler stopped");
    }

    async fn tick(&self, kind: PassKind) {
        let Some(_guard) = self.guard.try_lock() else {
            debug!(pass = kind.as_str(), "Previous pass still running, skipping tick");
            crate::metrics::record_pass(kind.as_str(), "skipped");
            return;
        };
        // Errors are logged and alerted inside
        let _ = self.guarded_pass(kind).await;
    }

    /// Caller must hold the [`RunGuard`].
    async fn guarded_pass(&self, kind: PassKind) -> Result<PassOutcome, EngineError> {
        let _timer = PassTimer::new(kind.as_str());
        match self.pipeline(kind).await {
            Ok(outcome) => {
                crate::metrics::record_pass(kind.as_str(), "success");
                Ok(outcome)
            }
            Err(e) => {
                crate::metrics::record_pass(kind.as_str(), "error");
                error!(pass = kind.as_str(), error = %e, "Pass failed");
                self.alerts.send_alert(&Alert::pipeline_error(kind.as_str(), &e)).await;
                Err(e)
            }
        }
    }

    async fn pipeline(&self, kind: PassKind) -> Result<PassOutcome, EngineError> {
        let pending = self.checker.detect().await?;
        let repair = if pending.report.total_issues > 0 {
            match self.repairer.repair_locked().await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    // the run's issues are already recorded; its report goes with them
                    self.checker.finalize(pending, 0).await?;
                    return Err(e);
                }
            }
        } else {
            None
        };
        let report = self
            .checker
            .finalize(pending, repair.map_or(0, |r| r.repaired))
            .await?;

        let outstanding = self.ledger.outstanding_counts().await?;
        let mut alerts_delivered = 0;
        if outstanding.critical > 0 {
            alerts_delivered += self
                .alerts
                .send_alert(&Alert::critical_outstanding(outstanding.critical, &report))
                .await;
        }
        if let Some(summary) = repair.filter(|s| !s.is_success()) {
            alerts_delivered += self.alerts.send_alert(&Alert::repair_failed(&summary)).await;
        }

        let mut purged = 0;
        if kind == PassKind::Full {
            alerts_delivered += self.alerts.send_alert(&Alert::summary(&report, repair.as_ref())).await;
            if let Some(retention) = self.retention_ms {
                purged = self.ledger.purge_repaired_before(now_millis() - retention).await?;
                if purged > 0 {
                    crate::metrics::record_issues_purged(purged);
                    info!(purged, "Purged repaired issues past retention");
                }
            }
        }

        Ok(PassOutcome {
            kind,
            report,
            repair,
            critical_outstanding: outstanding.critical,
            alerts_delivered,
            purged,
        })
    }
}
