//! Crate-level error.
//!
//! Each component has its own error enum; [`EngineError`] is what the
//! pipeline entry points (check, repair, scheduled passes, engine startup)
//! return.

use thiserror::Error;

use crate::alert::AlertError;
use crate::ledger::traits::LedgerError;
use crate::registry::RegistryError;
use crate::storage::traits::StoreError;
use crate::transaction::TransactionError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}
