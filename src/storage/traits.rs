// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store accessor contract.
//!
//! The [`StoreAccessor`] is the only boundary that touches module-owned
//! storage. The engine reads and writes through it using declared
//! sync fields only; schemas and CRUD layers stay with the modules.

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::resilience::retry::Retryable;
use crate::types::{EntityId, Fields};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection or file-level failure. Transient.
    #[error("Store '{store}' unavailable: {reason}")]
    Unavailable { store: String, reason: String },
    #[error("Record '{id}' not found in store '{store}'")]
    NotFound { store: String, id: String },
    /// Lock held, busy database, deadlock. Transient.
    #[error("Write conflict on store '{store}': {reason}")]
    WriteConflict { store: String, reason: String },
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Schema mismatch on store '{store}': declared fields missing from store: {missing:?}")]
    SchemaMismatch { store: String, missing: Vec<String> },
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn unavailable(store: &str, reason: impl Into<String>) -> Self {
        Self::Unavailable { store: store.to_string(), reason: reason.into() }
    }

    pub fn conflict(store: &str, reason: impl Into<String>) -> Self {
        Self::WriteConflict { store: store.to_string(), reason: reason.into() }
    }

    pub fn unknown_store(store: &str) -> Self {
        Self::Validation(format!("unknown store '{}'", store))
    }
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::WriteConflict { .. })
    }
}

/// Point access to every registered store.
#[async_trait]
pub trait StoreAccessor: Send + Sync {
    /// Read the declared fields of one row. `None` when the row is absent.
    async fn get(&self, store: &str, id: &str) -> Result<Option<Fields>, StoreError>;

    /// Upsert. Absent rows are created from the given fields (projected
    /// onto the store's sync fields, with fresh timestamps); present rows
    /// get only the named fields updated.
    async fn put(&self, store: &str, id: &str, fields: &Fields) -> Result<(), StoreError>;

    /// Paginated walk over all rows, ordered by identifier.
    /// Returns an empty vec once `offset` passes the end.
    async fn scan(
        &self,
        store: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<(EntityId, Fields)>, StoreError>;

    /// Columns the store actually has, for startup schema validation.
    async fn columns(&self, store: &str) -> Result<BTreeSet<String>, StoreError>;

    /// Open a write handle. The handle is already begun.
    async fn open_handle(&self, store: &str) -> Result<Box<dyn WriteHandle>, StoreError>;

    /// Open handles on several stores for one transaction. Backends whose
    /// stores share a database may back them with one database transaction
    /// and return them grouped; commits then follow the returned order.
    async fn open_handles(&self, stores: &[String]) -> Result<Vec<Box<dyn WriteHandle>>, StoreError> {
        let mut handles = Vec::with_capacity(stores.len());
        for store in stores {
            handles.push(self.open_handle(store).await?);
        }
        Ok(handles)
    }
}

/// Transactional write handle on a single store.
///
/// `commit` and `rollback` consume the handle, so each handle is released
/// exactly once. Dropping an open handle discards its writes.
#[async_trait]
pub trait WriteHandle: Send {
    fn store_name(&self) -> &str;

    /// Read through the handle (sees this handle's own uncommitted writes).
    async fn get(&mut self, id: &str) -> Result<Option<Fields>, StoreError>;

    /// Same upsert semantics as [`StoreAccessor::put`], visible only after commit.
    async fn put(&mut self, id: &str, fields: &Fields) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
