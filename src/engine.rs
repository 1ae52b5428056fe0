// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine facade.
//!
//! [`ReplicaSyncEngine`] wires the registry, store accessor, ledger,
//! checker, repair executor, transaction coordinator, alert dispatcher and
//! scheduler from one [`EngineConfig`].
//!
//! # Lifecycle
//!
//! ```text
//! Created → Validating → Ready → Running → ShuttingDown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replica_sync::{EngineConfig, EngineState, ReplicaSyncEngine};
//! use replica_sync::ledger::memory::InMemoryLedger;
//! use replica_sync::registry::StoreRegistry;
//! use replica_sync::storage::memory::InMemoryStore;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), replica_sync::EngineError> {
//! let config = EngineConfig::from_json(r#"{"stores": [
//!     {"name": "clients", "is_master": true, "table": "clients", "sync_fields": ["name"]},
//!     {"name": "housing", "table": "housing", "sync_fields": ["name"]}
//! ]}"#)?;
//! let registry = StoreRegistry::new(config.stores.clone())?;
//! let store = Arc::new(InMemoryStore::new(&registry));
//! let engine = ReplicaSyncEngine::new(config, store, Arc::new(InMemoryLedger::new()))?;
//!
//! engine.start().await?;
//! assert_eq!(engine.state(), EngineState::Ready);
//! let report = engine.run_check().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::alert::{Alert, AlertDispatcher};
use crate::checker::{ConsistencyChecker, RunGuard};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::ledger::sql::SqlLedger;
use crate::ledger::traits::{IssueLedger, TransactionLog};
use crate::registry::StoreRegistry;
use crate::repair::RepairExecutor;
use crate::resilience::circuit_breaker::{CircuitSnapshot, StoreCircuits};
use crate::scheduler::{PassOutcome, Scheduler};
use crate::storage::sql::SqlStore;
use crate::storage::traits::StoreAccessor;
use crate::transaction::TransactionCoordinator;
use crate::types::{ConsistencyIssue, ConsistencyReport, RepairSummary, SeverityCounts};

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, nothing checked yet
    Created,
    /// Comparing declared fields with store schemas
    Validating,
    /// Accepting checks, repairs and transactions
    Ready,
    /// Scheduler loop active
    Running,
    ShuttingDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Validating => write!(f, "Validating"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

pub struct ReplicaSyncEngine {
    config: EngineConfig,
    registry: Arc<StoreRegistry>,
    accessor: Arc<dyn StoreAccessor>,
    ledger: Arc<dyn IssueLedger>,
    checker: Arc<ConsistencyChecker>,
    repairer: Arc<RepairExecutor>,
    transactions: Arc<TransactionCoordinator>,
    alerts: Arc<AlertDispatcher>,
    scheduler: Arc<Scheduler>,
    state: watch::Sender<EngineState>,
    shutdown: watch::Sender<bool>,
}

impl ReplicaSyncEngine {
    /// Build over a caller-supplied accessor and ledger.
    pub fn new<L>(
        config: EngineConfig,
        accessor: Arc<dyn StoreAccessor>,
        ledger: Arc<L>,
    ) -> Result<Self, EngineError>
    where
        L: IssueLedger + TransactionLog + 'static,
    {
        let registry = Arc::new(StoreRegistry::new(config.stores.clone())?);
        let issues: Arc<dyn IssueLedger> = ledger.clone();
        let tx_log: Arc<dyn TransactionLog> = ledger;
        let guard = Arc::new(RunGuard::new());

        let checker = Arc::new(ConsistencyChecker::new(
            registry.clone(),
            accessor.clone(),
            issues.clone(),
            guard.clone(),
            config.scan_page_size,
        ));
        let repairer = Arc::new(
            RepairExecutor::new(
                registry.clone(),
                accessor.clone(),
                issues.clone(),
                guard.clone(),
                Arc::new(StoreCircuits::new(config.circuit())),
                config.repair_retry(),
            )
            .with_max_per_run(config.max_repairs_per_run),
        );
        let transactions = Arc::new(TransactionCoordinator::new(
            registry.clone(),
            accessor.clone(),
            tx_log,
            config.transaction_max_retries,
            config.transaction_retry(),
        ));
        let alerts = Arc::new(AlertDispatcher::from_webhook(
            config.alert_webhook_url.as_deref(),
            config.webhook_timeout(),
        )?);
        let scheduler = Arc::new(Scheduler::new(
            checker.clone(),
            repairer.clone(),
            alerts.clone(),
            issues.clone(),
            guard,
            config.quick_interval(),
            config.full_interval(),
            config.issue_retention_ms(),
        ));

        let (state, _) = watch::channel(EngineState::Created);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            registry,
            accessor,
            ledger: issues,
            checker,
            repairer,
            transactions,
            alerts,
            scheduler,
            state,
            shutdown,
        })
    }

    /// Build over SQL stores (`store_urls`) and a SQL ledger (`ledger_url`).
    pub async fn connect(config: EngineConfig) -> Result<Self, EngineError> {
        let ledger_url = config
            .ledger_url
            .clone()
            .ok_or_else(|| EngineError::Config("ledger_url is required".into()))?;
        let registry = StoreRegistry::new(config.stores.clone())?;

        let store = SqlStore::connect(&registry, &config.store_urls).await?;
        if config.create_store_tables {
            store.init_schema().await?;
        }
        let ledger = Arc::new(SqlLedger::new(&ledger_url).await?);

        Self::new(config, Arc::new(store), ledger)
    }

    /// Validate store schemas (if configured) and become ready.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), EngineError> {
        self.state.send_replace(EngineState::Validating);
        if self.config.validate_schemas_on_start {
            if let Err(e) = self.registry.validate_schemas(self.accessor.as_ref()).await {
                self.state.send_replace(EngineState::Created);
                return Err(e.into());
            }
        }
        self.state.send_replace(EngineState::Ready);
        info!(
            stores = self.registry.descriptors().len(),
            master = %self.registry.master().name,
            "Replica sync engine ready"
        );
        Ok(())
    }

    /// Run the scheduler until [`Self::shutdown`] is called.
    pub async fn run(&self) {
        self.state.send_replace(EngineState::Running);
        self.scheduler.run(self.shutdown.subscribe()).await;
    }

    pub fn shutdown(&self) {
        info!("Replica sync engine shutting down");
        self.state.send_replace(EngineState::ShuttingDown);
        self.shutdown.send_replace(true);
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn registry(&self) -> &StoreRegistry {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Trigger boundary
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn run_check(&self) -> Result<ConsistencyReport, EngineError> {
        self.checker.run_check().await
    }

    pub async fn repair_outstanding(&self) -> Result<RepairSummary, EngineError> {
        self.repairer.repair_outstanding().await
    }

    pub async fn run_quick_pass(&self) -> Result<PassOutcome, EngineError> {
        self.scheduler.run_quick_pass().await
    }

    pub async fn run_full_pass(&self) -> Result<PassOutcome, EngineError> {
        self.scheduler.run_full_pass().await
    }

    /// Multi-store transactions.
    #[must_use]
    pub fn transactions(&self) -> &TransactionCoordinator {
        &self.transactions
    }

    pub async fn send_alert(&self, alert: &Alert) -> usize {
        self.alerts.send_alert(alert).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Observability boundary (read-only)
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn latest_report(&self) -> Result<Option<ConsistencyReport>, EngineError> {
        Ok(self.ledger.latest_report().await?)
    }

    pub async fn recent_reports(&self, limit: usize) -> Result<Vec<ConsistencyReport>, EngineError> {
        Ok(self.ledger.recent_reports(limit).await?)
    }

    pub async fn outstanding_issues(&self, limit: Option<usize>) -> Result<Vec<ConsistencyIssue>, EngineError> {
        Ok(self.ledger.outstanding_issues(limit).await?)
    }

    pub async fn issues_for_entity(&self, entity_id: &str) -> Result<Vec<ConsistencyIssue>, EngineError> {
        Ok(self.ledger.issues_for_entity(entity_id).await?)
    }

    pub async fn outstanding_counts(&self) -> Result<SeverityCounts, EngineError> {
        Ok(self.ledger.outstanding_counts().await?)
    }

    /// Breaker accounting per store touched by repair.
    #[must_use]
    pub fn circuit_snapshot(&self) -> Vec<CircuitSnapshot> {
        self.repairer.circuits().snapshot()
    }
}
