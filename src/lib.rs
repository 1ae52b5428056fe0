//! # Replica Sync
//!
//! Consistency checking, repair and multi-store transactions for an entity
//! partitioned across one master store and several replica stores.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Scheduler                           │
//! │  • Quick pass (frequent) and full pass (periodic)          │
//! │  • Pipeline errors become critical alerts                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Consistency Checker                       │
//! │  • Master scan, concurrent replica reads per entity        │
//! │  • Missing rows, field mismatches, access failures         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    (issues + one report)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Issue Ledger                          │
//! │  • Externally owned (SQLite/MySQL or in-memory)            │
//! │  • Atomic mark-repaired by issue id                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Repair Executor                         │
//! │  • Critical first, oldest first                            │
//! │  • Retry with backoff, circuit breaker per store           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                      Alert Dispatcher (log, webhook)
//!
//!   Application code ──► Transaction Coordinator (snapshot, commit/rollback)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use replica_sync::{EngineConfig, ReplicaSyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), replica_sync::EngineError> {
//!     let config = EngineConfig::from_json(&std::fs::read_to_string("replica_sync.json").unwrap())?;
//!     let engine = ReplicaSyncEngine::connect(config).await?;
//!     engine.start().await?;
//!
//!     let outcome = engine.run_quick_pass().await?;
//!     println!("{} issues, {} critical outstanding",
//!         outcome.report.total_issues, outcome.critical_outstanding);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: The [`ReplicaSyncEngine`] facade wiring every component
//! - [`registry`]: Store descriptors and startup schema validation
//! - [`storage`]: Store accessor contract (SQL and in-memory backends)
//! - [`checker`]: Divergence detection
//! - [`ledger`]: Issue, report and transaction persistence
//! - [`repair`]: Convergence of replicas to the master
//! - [`transaction`]: Multi-store transactions with snapshot rollback
//! - [`alert`]: Alert sinks and dispatch
//! - [`scheduler`]: Quick and full passes, run loop
//! - [`resilience`]: Typed retry and circuit breakers

pub mod alert;
pub mod checker;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod registry;
pub mod repair;
pub mod resilience;
pub mod scheduler;
pub mod storage;
pub mod transaction;
pub mod types;

pub use alert::{Alert, AlertDispatcher, AlertError, AlertSink, AlertType, LogSink, WebhookSink};
pub use checker::{ConsistencyChecker, RunGuard};
pub use config::EngineConfig;
pub use engine::{EngineState, ReplicaSyncEngine};
pub use error::EngineError;
pub use ledger::traits::{IssueLedger, LedgerError, TransactionLog};
pub use registry::{RegistryError, StoreDescriptor, StoreRegistry};
pub use repair::RepairExecutor;
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitSnapshot, StoreCircuits};
pub use resilience::retry::{retry, retry_counted, RetryConfig, RetryOutcome, Retryable};
pub use scheduler::{PassKind, PassOutcome, Scheduler};
pub use storage::traits::{StoreAccessor, StoreError, WriteHandle};
pub use transaction::{TransactionCoordinator, TransactionError, TransactionHandles};
pub use types::{
    ConsistencyIssue, ConsistencyReport, EntityId, Fields, RepairSummary, Severity, SeverityCounts,
    TransactionRecord, TransactionStatus, ACCESS_FIELD, RECORD_FIELD,
};
