// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store registry: static descriptors of the master and its replicas.
//!
//! Descriptors are loaded once at startup and never change. Construction
//! validates the structural invariants; [`StoreRegistry::validate_schemas`]
//! checks the declared field lists against what each store actually has.
//!
//! # Example
//!
//! ```
//! use replica_sync::registry::{StoreDescriptor, StoreRegistry};
//!
//! let registry = StoreRegistry::new(vec![
//!     StoreDescriptor::master("clients", "clients", &["name", "email", "dob"]),
//!     StoreDescriptor::replica("housing", "housing_clients", &["name", "email"], &["name"]),
//! ]).unwrap();
//!
//! assert_eq!(registry.master().name, "clients");
//! assert_eq!(registry.replicas().count(), 1);
//! ```

use std::collections::{BTreeSet, HashSet};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::storage::traits::{StoreAccessor, StoreError};
use crate::types::Fields;

/// Column names every backend reserves for its own bookkeeping.
pub const RESERVED_COLUMNS: [&str; 3] = ["id", "created_at", "updated_at"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("exactly one master store required, found {0}")]
    MasterCount(usize),
    #[error("duplicate store name '{0}'")]
    DuplicateStore(String),
    #[error("store '{store}': critical fields not in sync fields: {fields:?}")]
    CriticalNotSynced { store: String, fields: Vec<String> },
    #[error("store '{store}': invalid identifier '{ident}'")]
    InvalidIdentifier { store: String, ident: String },
    #[error("store '{store}': field '{field}' is reserved")]
    ReservedField { store: String, field: String },
    #[error("store '{0}' declares no sync fields")]
    NoFields(String),
}

/// Immutable description of one store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreDescriptor {
    pub name: String,
    #[serde(default)]
    pub is_master: bool,
    /// Fields whose divergence is always critical
    #[serde(default)]
    pub critical_fields: BTreeSet<String>,
    /// Fields mirrored from the master (for the master: its own field set)
    pub sync_fields: BTreeSet<String>,
    /// Table or collection name in the backing store
    pub table: String,
}

impl StoreDescriptor {
    #[must_use]
    pub fn master(name: &str, table: &str, fields: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            is_master: true,
            critical_fields: BTreeSet::new(),
            sync_fields: fields.iter().map(|f| (*f).to_string()).collect(),
            table: table.to_string(),
        }
    }

    #[must_use]
    pub fn replica(name: &str, table: &str, sync_fields: &[&str], critical_fields: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            is_master: false,
            critical_fields: critical_fields.iter().map(|f| (*f).to_string()).collect(),
            sync_fields: sync_fields.iter().map(|f| (*f).to_string()).collect(),
            table: table.to_string(),
        }
    }

    #[must_use]
    pub fn is_critical(&self, field: &str) -> bool {
        self.critical_fields.contains(field)
    }

    /// Keep only the fields this store declares.
    #[must_use]
    pub fn project(&self, fields: &Fields) -> Fields {
        fields
            .iter()
            .filter(|(k, _)| self.sync_fields.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.sync_fields.is_empty() {
            return Err(RegistryError::NoFields(self.name.clone()));
        }
        if !is_identifier(&self.table) {
            return Err(RegistryError::InvalidIdentifier {
                store: self.name.clone(),
                ident: self.table.clone(),
            });
        }
        for field in &self.sync_fields {
            if !is_identifier(field) {
                return Err(RegistryError::InvalidIdentifier {
                    store: self.name.clone(),
                    ident: field.clone(),
                });
            }
            if RESERVED_COLUMNS.contains(&field.as_str()) {
                return Err(RegistryError::ReservedField {
                    store: self.name.clone(),
                    field: field.clone(),
                });
            }
        }
        let unsynced: Vec<String> = self
            .critical_fields
            .difference(&self.sync_fields)
            .cloned()
            .collect();
        if !unsynced.is_empty() {
            return Err(RegistryError::CriticalNotSynced {
                store: self.name.clone(),
                fields: unsynced,
            });
        }
        Ok(())
    }
}

/// Table and field names are spliced into SQL, so only plain identifiers are allowed.
fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    s.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validated set of descriptors.
#[derive(Debug, Clone)]
pub struct StoreRegistry {
    descriptors: Vec<StoreDescriptor>,
    master_idx: usize,
}

impl StoreRegistry {
    pub fn new(descriptors: Vec<StoreDescriptor>) -> Result<Self, RegistryError> {
        let masters: Vec<usize> = descriptors
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_master)
            .map(|(i, _)| i)
            .collect();
        if masters.len() != 1 {
            return Err(RegistryError::MasterCount(masters.len()));
        }

        let mut seen = HashSet::new();
        for d in &descriptors {
            if !seen.insert(d.name.as_str()) {
                return Err(RegistryError::DuplicateStore(d.name.clone()));
            }
            d.validate()?;
        }

        Ok(Self {
            master_idx: masters[0],
            descriptors,
        })
    }

    #[must_use]
    pub fn master(&self) -> &StoreDescriptor {
        &self.descriptors[self.master_idx]
    }

    pub fn replicas(&self) -> impl Iterator<Item = &StoreDescriptor> {
        self.descriptors.iter().filter(|d| !d.is_master)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StoreDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    #[must_use]
    pub fn descriptors(&self) -> &[StoreDescriptor] {
        &self.descriptors
    }

    /// Check every declared field exists in its store. Fails on the first
    /// store that has drifted, naming all of its missing fields.
    pub async fn validate_schemas(&self, accessor: &dyn StoreAccessor) -> Result<(), StoreError> {
        for d in &self.descriptors {
            let actual = accessor.columns(&d.name).await?;
            let missing: Vec<String> = d.sync_fields.difference(&actual).cloned().collect();
            if !missing.is_empty() {
                warn!(store = %d.name, ?missing, "Store schema has drifted from declared fields");
                return Err(StoreError::SchemaMismatch {
                    store: d.name.clone(),
                    missing,
                });
            }
        }
        info!(stores = self.descriptors.len(), "Store schemas validated");
        Ok(())
    }
}
