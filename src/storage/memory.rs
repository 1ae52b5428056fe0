//! In-memory store accessor.
//!
//! One DashMap per registered store. Write handles buffer field patches and
//! merge them under the table's commit lock, so a commit is all-or-nothing
//! and a rollback (or drop) simply forgets the buffer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::traits::{StoreAccessor, StoreError, WriteHandle};
use crate::registry::{StoreDescriptor, StoreRegistry, RESERVED_COLUMNS};
use crate::types::{now_millis, EntityId, Fields};

#[derive(Debug, Clone)]
struct Row {
    fields: Fields,
    #[allow(dead_code)]
    created_at: i64,
    updated_at: i64,
}

impl Row {
    /// Upsert `fields` (already projected) onto an optional existing row.
    fn upsert(existing: Option<Row>, fields: Fields) -> Row {
        let now = now_millis();
        match existing {
            Some(mut row) => {
                row.fields.extend(fields);
                row.updated_at = now;
                row
            }
            None => Row {
                fields,
                created_at: now,
                updated_at: now,
            },
        }
    }
}

struct Table {
    descriptor: StoreDescriptor,
    rows: DashMap<EntityId, Row>,
    commit_lock: Mutex<()>,
}

pub struct InMemoryStore {
    tables: HashMap<String, Arc<Table>>,
    /// Simulated actual schema, for drift tests. Defaults to the declared fields.
    column_overrides: DashMap<String, BTreeSet<String>>,
}

impl InMemoryStore {
    /// Create empty tables for every store in the registry.
    #[must_use]
    pub fn new(registry: &StoreRegistry) -> Self {
        let tables = registry
            .descriptors()
            .iter()
            .map(|d| {
                (
                    d.name.clone(),
                    Arc::new(Table {
                        descriptor: d.clone(),
                        rows: DashMap::new(),
                        commit_lock: Mutex::new(()),
                    }),
                )
            })
            .collect();
        Self {
            tables,
            column_overrides: DashMap::new(),
        }
    }

    fn table(&self, store: &str) -> Result<&Arc<Table>, StoreError> {
        self.tables.get(store).ok_or_else(|| StoreError::unknown_store(store))
    }

    /// Number of rows in a store (0 for unknown stores).
    #[must_use]
    pub fn len(&self, store: &str) -> usize {
        self.tables.get(store).map_or(0, |t| t.rows.len())
    }

    /// Delete a row directly, bypassing the engine.
    pub fn remove(&self, store: &str, id: &str) -> bool {
        self.tables
            .get(store)
            .is_some_and(|t| t.rows.remove(id).is_some())
    }

    /// Pretend the store's actual schema is `columns`.
    pub fn set_columns(&self, store: &str, columns: &[&str]) {
        self.column_overrides.insert(
            store.to_string(),
            columns.iter().map(|c| (*c).to_string()).collect(),
        );
    }

    /// Last write time of a row, for tests.
    #[must_use]
    pub fn updated_at(&self, store: &str, id: &str) -> Option<i64> {
        self.tables.get(store)?.rows.get(id).map(|r| r.updated_at)
    }
}

#[async_trait]
impl StoreAccessor for InMemoryStore {
    async fn get(&self, store: &str, id: &str) -> Result<Option<Fields>, StoreError> {
        let table = self.table(store)?;
        Ok(table.rows.get(id).map(|r| r.fields.clone()))
    }

    async fn put(&self, store: &str, id: &str, fields: &Fields) -> Result<(), StoreError> {
        let table = self.table(store)?;
        let projected = table.descriptor.project(fields);
        let _guard = table.commit_lock.lock();
        let existing = table.rows.get(id).map(|r| r.value().clone());
        table.rows.insert(id.to_string(), Row::upsert(existing, projected));
        Ok(())
    }

    async fn scan(
        &self,
        store: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<(EntityId, Fields)>, StoreError> {
        let table = self.table(store)?;
        let mut ids: Vec<EntityId> = table.rows.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .skip(offset as usize)
            .take(limit)
            .filter_map(|id| {
                let fields = table.rows.get(&id)?.fields.clone();
                Some((id, fields))
            })
            .collect())
    }

    async fn columns(&self, store: &str) -> Result<BTreeSet<String>, StoreError> {
        let table = self.table(store)?;
        let mut cols = match self.column_overrides.get(store) {
            Some(cols) => cols.clone(),
            None => table.descriptor.sync_fields.clone(),
        };
        cols.extend(RESERVED_COLUMNS.iter().map(|c| (*c).to_string()));
        Ok(cols)
    }

    async fn open_handle(&self, store: &str) -> Result<Box<dyn WriteHandle>, StoreError> {
        let table = self.table(store)?.clone();
        Ok(Box::new(MemoryWriteHandle {
            store: store.to_string(),
            table,
            pending: BTreeMap::new(),
        }))
    }
}

/// Buffered write handle over one in-memory table.
///
/// The buffer holds field patches, not rows, and commit merges them into
/// whatever the row holds at that moment, so a direct put between this
/// handle's put and its commit keeps its other fields.
pub struct MemoryWriteHandle {
    store: String,
    table: Arc<Table>,
    pending: BTreeMap<EntityId, Fields>,
}

#[async_trait]
impl WriteHandle for MemoryWriteHandle {
    fn store_name(&self) -> &str {
        &self.store
    }

    async fn get(&mut self, id: &str) -> Result<Option<Fields>, StoreError> {
        let stored = self.table.rows.get(id).map(|r| r.fields.clone());
        Ok(match (stored, self.pending.get(id)) {
            (Some(mut fields), Some(patch)) => {
                fields.extend(patch.clone());
                Some(fields)
            }
            (None, Some(patch)) => Some(patch.clone()),
            (stored, None) => stored,
        })
    }

    async fn put(&mut self, id: &str, fields: &Fields) -> Result<(), StoreError> {
        let projected = self.table.descriptor.project(fields);
        self.pending.entry(id.to_string()).or_default().extend(projected);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let count = this.pending.len();
        {
            let _guard = this.table.commit_lock.lock();
            for (id, patch) in this.pending {
                let existing = this.table.rows.get(&id).map(|r| r.value().clone());
                this.table.rows.insert(id, Row::upsert(existing, patch));
            }
        }
        debug!(store = %this.store, rows = count, "Memory handle committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        debug!(store = %self.store, discarded = self.pending.len(), "Memory handle rolled back");
        Ok(())
    }
}
