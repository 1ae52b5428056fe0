// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Multi-store transactions with snapshot rollback.
//!
//! There is no two-phase commit across stores. Instead each transaction:
//!
//! 1. takes the entity's lock (one transaction per entity at a time),
//! 2. opens a write handle on every participating store (stores sharing a
//!    database share one database transaction),
//! 3. captures each store's pre-image of the entity and persists it,
//! 4. runs the caller's body against the handles,
//! 5. commits every handle in order, or rolls every open handle back.
//!
//! # Known limitation
//!
//! Commits are sequential. If store A has committed and store B's commit
//! then fails, A's write stays. The transaction is recorded as `failed`
//! with the committed stores named in the error, and the persisted
//! snapshot can be applied with
//! [`TransactionCoordinator::rollback_to_snapshot`].
//!
//! # Example
//!
//! ```ignore
//! let name = serde_json::json!("Ann Lee");
//! coordinator
//!     .with_transaction("C1", "rename", &["clients", "legal"], |tx| {
//!         let name = name.clone();
//!         Box::pin(async move {
//!             let mut patch = Fields::new();
//!             patch.insert("name".into(), name);
//!             tx.put("clients", &patch).await?;
//!             tx.put("legal", &patch).await?;
//!             Ok(())
//!         })
//!     })
//!     .await?;
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::ledger::traits::{LedgerError, TransactionLog};
use crate::registry::StoreRegistry;
use crate::resilience::retry::{RetryConfig, Retryable};
use crate::storage::traits::{StoreAccessor, StoreError, WriteHandle};
use crate::types::{EntityId, Fields, TransactionRecord, TransactionStatus};

#[derive(Error, Debug)]
pub enum TransactionError {
    /// Raised by the body to abort on its own terms.
    #[error("Transaction aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("Commit failed on store '{failed_store}' after {committed:?} committed: {source}")]
    PartialCommit {
        committed: Vec<String>,
        failed_store: String,
        #[source]
        source: StoreError,
    },
    #[error("Store '{0}' is not part of this transaction")]
    NotEnlisted(String),
    #[error("Transaction '{0}' not found")]
    NotFound(String),
}

impl Retryable for TransactionError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_retryable())
    }
}

/// The open handles of one transaction, scoped to its entity.
pub struct TransactionHandles {
    entity_id: EntityId,
    handles: Vec<Box<dyn WriteHandle>>,
}

impl TransactionHandles {
    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn stores(&self) -> impl Iterator<Item = &str> {
        self.handles.iter().map(|h| h.store_name())
    }

    /// Read the entity from `store`, including this transaction's writes.
    pub async fn get(&mut self, store: &str) -> Result<Option<Fields>, TransactionError> {
        let id = self.entity_id.clone();
        Ok(self.handle(store)?.get(&id).await?)
    }

    /// Upsert the entity in `store`. Visible to others only after commit.
    pub async fn put(&mut self, store: &str, fields: &Fields) -> Result<(), TransactionError> {
        let id = self.entity_id.clone();
        Ok(self.handle(store)?.put(&id, fields).await?)
    }

    fn handle(&mut self, store: &str) -> Result<&mut Box<dyn WriteHandle>, TransactionError> {
        self.handles
            .iter_mut()
            .find(|h| h.store_name() == store)
            .ok_or_else(|| TransactionError::NotEnlisted(store.to_string()))
    }
}

/// Why one attempt failed, and whether every handle was released cleanly.
struct AttemptFailure {
    error: TransactionError,
    rolled_back: bool,
}

pub struct TransactionCoordinator {
    registry: Arc<StoreRegistry>,
    accessor: Arc<dyn StoreAccessor>,
    log: Arc<dyn TransactionLog>,
    entity_locks: DashMap<EntityId, Arc<Mutex<()>>>,
    max_retries: u32,
    backoff: RetryConfig,
}

impl TransactionCoordinator {
    /// `max_retries` bounds body re-runs after transient store errors.
    pub fn new(
        registry: Arc<StoreRegistry>,
        accessor: Arc<dyn StoreAccessor>,
        log: Arc<dyn TransactionLog>,
        max_retries: u32,
        backoff: RetryConfig,
    ) -> Self {
        Self {
            registry,
            accessor,
            log,
            entity_locks: DashMap::new(),
            max_retries,
            backoff,
        }
    }

    /// Run `body` as one logical write across `stores` for `entity_id`.
    ///
    /// The body may run more than once when a transient store error aborts
    /// an attempt, so it should clone what it captures.
    #[tracing::instrument(skip(self, stores, body))]
    pub async fn with_transaction<T, F>(
        &self,
        entity_id: &str,
        operation_type: &str,
        stores: &[&str],
        body: F,
    ) -> Result<T, TransactionError>
    where
        T: Send,
        F: for<'a> FnMut(&'a mut TransactionHandles) -> BoxFuture<'a, Result<T, TransactionError>>,
    {
        let stores = self.enlist(stores)?;

        let lock = self.entity_lock(entity_id);
        let result = {
            let _held = lock.lock().await;
            self.run_locked(entity_id, operation_type, &stores, body).await
        };
        drop(lock);
        self.entity_locks.remove_if(entity_id, |_, l| Arc::strong_count(l) == 1);
        result
    }

    pub async fn get_transaction(&self, transaction_id: &str) -> Result<Option<TransactionRecord>, TransactionError> {
        Ok(self.log.get_transaction(transaction_id).await?)
    }

    pub async fn recent_transactions(&self, limit: usize) -> Result<Vec<TransactionRecord>, TransactionError> {
        Ok(self.log.recent_transactions(limit).await?)
    }

    /// Write a recorded transaction's pre-images back to their stores.
    ///
    /// Runs as its own transaction. Stores where the row did not exist
    /// before are skipped (the accessor has no delete). Restores go through
    /// the merging upsert, so a field the transaction set that was absent
    /// from the pre-image keeps the transaction's value. Returns the number
    /// of stores restored.
    pub async fn rollback_to_snapshot(&self, transaction_id: &str) -> Result<usize, TransactionError> {
        let record = self
            .log
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| TransactionError::NotFound(transaction_id.to_string()))?;

        let restores: Vec<(String, Fields)> = record
            .rollback_snapshot
            .iter()
            .filter_map(|(store, pre)| match pre {
                Some(fields) => Some((store.clone(), fields.clone())),
                None => {
                    warn!(
                        transaction_id,
                        store = %store,
                        "Row did not exist before the transaction; leaving it in place"
                    );
                    None
                }
            })
            .collect();
        if restores.is_empty() {
            return Ok(0);
        }

        let stores: Vec<&str> = restores.iter().map(|(s, _)| s.as_str()).collect();
        let operation = format!("rollback:{}", record.transaction_id);
        let restored = self
            .with_transaction(&record.entity_id, &operation, &stores, |tx| {
                let restores = restores.clone();
                Box::pin(async move {
                    for (store, fields) in &restores {
                        tx.put(store, fields).await?;
                    }
                    Ok(restores.len())
                })
            })
            .await?;

        info!(transaction_id, entity = %record.entity_id, stores = restored, "Snapshot restored");
        Ok(restored)
    }

    fn enlist(&self, stores: &[&str]) -> Result<Vec<String>, TransactionError> {
        if stores.is_empty() {
            return Err(StoreError::Validation("transaction needs at least one store".into()).into());
        }
        let mut seen = HashSet::new();
        for store in stores {
            if self.registry.get(store).is_none() {
                return Err(StoreError::unknown_store(store).into());
            }
            if !seen.insert(*store) {
                return Err(StoreError::Validation(format!("store '{}' listed twice", store)).into());
            }
        }
        Ok(stores.iter().map(|s| (*s).to_string()).collect())
    }

    fn entity_lock(&self, entity_id: &str) -> Arc<Mutex<()>> {
        self.entity_locks
            .entry(entity_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn run_locked<T, F>(
        &self,
        entity_id: &str,
        operation_type: &str,
        stores: &[String],
        mut body: F,
    ) -> Result<T, TransactionError>
    where
        T: Send,
        F: for<'a> FnMut(&'a mut TransactionHandles) -> BoxFuture<'a, Result<T, TransactionError>>,
    {
        let start = Instant::now();
        let mut record = TransactionRecord::pending(entity_id, operation_type, stores, self.max_retries);
        self.log.save_transaction(&record).await?;

        loop {
            match self.attempt(&mut record, &mut body).await {
                Ok(value) => {
                    record.finish(TransactionStatus::Committed, None);
                    self.log.save_transaction(&record).await?;
                    crate::metrics::record_transaction(TransactionStatus::Committed);
                    crate::metrics::record_transaction_duration(start.elapsed());
                    debug!(transaction_id = %record.transaction_id, retries = record.retry_count, "Transaction committed");
                    return Ok(value);
                }
                Err(failure) if failure.error.is_retryable() && record.retry_count < self.max_retries => {
                    let delay = self.backoff.delay_for(record.retry_count);
                    record.retry_count += 1;
                    record.status = TransactionStatus::Retrying;
                    record.error_message = Some(failure.error.to_string());
                    self.log.save_transaction(&record).await?;
                    crate::metrics::record_transaction_retry();
                    warn!(
                        transaction_id = %record.transaction_id,
                        attempt = record.retry_count,
                        error = %failure.error,
                        "Transaction aborted on transient error, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => {
                    let status = if failure.rolled_back {
                        TransactionStatus::RolledBack
                    } else {
                        TransactionStatus::Failed
                    };
                    record.finish(status, Some(failure.error.to_string()));
                    if let Err(e) = self.log.save_transaction(&record).await {
                        error!(transaction_id = %record.transaction_id, error = %e, "Could not persist transaction outcome");
                    }
                    crate::metrics::record_transaction(status);
                    crate::metrics::record_transaction_duration(start.elapsed());
                    warn!(
                        transaction_id = %record.transaction_id,
                        status = %status,
                        error = %failure.error,
                        "Transaction did not commit"
                    );
                    return Err(failure.error);
                }
            }
        }
    }

    async fn attempt<T, F>(&self, record: &mut TransactionRecord, body: &mut F) -> Result<T, AttemptFailure>
    where
        F: for<'a> FnMut(&'a mut TransactionHandles) -> BoxFuture<'a, Result<T, TransactionError>>,
    {
        // Handles opened before a failure are dropped, which discards them
        let mut handles = match self.accessor.open_handles(&record.stores_involved).await {
            Ok(handles) => handles,
            Err(e) => return Err(AttemptFailure { error: e.into(), rolled_back: true }),
        };

        // Snapshot every store before the body can write to any of them
        record.rollback_snapshot.clear();
        let mut snapshot_error = None;
        for handle in handles.iter_mut() {
            match handle.get(&record.entity_id).await {
                Ok(pre) => {
                    record.rollback_snapshot.insert(handle.store_name().to_string(), pre);
                }
                Err(e) => {
                    snapshot_error = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = snapshot_error {
            return Err(abort(handles, e.into()).await);
        }
        if let Err(e) = self.log.save_transaction(record).await {
            return Err(abort(handles, e.into()).await);
        }

        let mut tx = TransactionHandles {
            entity_id: record.entity_id.clone(),
            handles,
        };
        let value = match body(&mut tx).await {
            Ok(value) => value,
            Err(e) => return Err(abort(tx.handles, e).await),
        };

        let mut committed = Vec::new();
        let mut remaining = tx.handles.into_iter();
        while let Some(handle) = remaining.next() {
            let store = handle.store_name().to_string();
            if let Err(e) = handle.commit().await {
                let rolled_back = release(remaining.collect()).await;
                if committed.is_empty() {
                    return Err(AttemptFailure { error: e.into(), rolled_back });
                }
                error!(
                    transaction_id = %record.transaction_id,
                    committed = ?committed,
                    failed_store = %store,
                    error = %e,
                    "Partial commit: earlier stores keep their writes"
                );
                return Err(AttemptFailure {
                    error: TransactionError::PartialCommit {
                        committed,
                        failed_store: store,
                        source: e,
                    },
                    rolled_back: false,
                });
            }
            committed.push(store);
        }
        Ok(value)
    }
}

async fn abort(handles: Vec<Box<dyn WriteHandle>>, error: TransactionError) -> AttemptFailure {
    let rolled_back = release(handles).await;
    AttemptFailure { error, rolled_back }
}

/// Roll back every handle, continuing past failures. True if all succeeded.
async fn release(handles: Vec<Box<dyn WriteHandle>>) -> bool {
    let mut clean = true;
    for handle in handles {
        let store = handle.store_name().to_string();
        if let Err(e) = handle.rollback().await {
            warn!(store = %store, error = %e, "Rollback failed");
            clean = false;
        }
    }
    clean
}
