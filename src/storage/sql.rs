// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL store accessor (SQLite or MySQL through the sqlx `Any` driver).
//!
//! Each registered store maps to one table in its own database. Every
//! declared sync field is a TEXT column holding the JSON-encoded value:
//!
//! ```sql
//! CREATE TABLE housing_clients (
//!   id VARCHAR(191) PRIMARY KEY,
//!   email TEXT,
//!   name TEXT,
//!   created_at BIGINT NOT NULL,
//!   updated_at BIGINT NOT NULL
//! )
//! ```
//!
//! Stores usually live in separate databases (one SQLite file per module);
//! stores sharing a connection string share a pool, and inside one
//! multi-store transaction they share one database transaction (a second
//! writer on the same SQLite file would only wait on the first). Table and
//! column names come from the validated registry, so splicing them into SQL
//! is safe.
//!
//! ## sqlx Any Driver Quirks
//!
//! MySQL TEXT columns come back as BLOB through `Any`, so text columns are
//! read as `String` first and then as bytes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyConnection, AnyPool, Row, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::traits::{StoreAccessor, StoreError, WriteHandle};
use crate::registry::{StoreDescriptor, StoreRegistry};
use crate::resilience::retry::{retry, RetryConfig};
use crate::types::{now_millis, EntityId, Fields};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// SQLite extended codes for BUSY/LOCKED and the SQLSTATE for a MySQL deadlock.
const CONFLICT_CODES: [&str; 7] = ["5", "6", "261", "262", "517", "773", "40001"];
/// SQLITE_CANTOPEN
const UNAVAILABLE_CODES: [&str; 1] = ["14"];

/// Map a driver error onto the store error taxonomy.
pub(crate) fn classify(store: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StoreError::unavailable(store, err.to_string()),
        sqlx::Error::Database(ref db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            if CONFLICT_CODES.contains(&code.as_str()) {
                StoreError::conflict(store, err.to_string())
            } else if UNAVAILABLE_CODES.contains(&code.as_str()) {
                StoreError::unavailable(store, err.to_string())
            } else {
                StoreError::Backend(format!("{}: {}", store, err))
            }
        }
        other => StoreError::Backend(format!("{}: {}", store, other)),
    }
}

/// Connect a pool with startup-mode retry (fails fast if config is wrong).
///
/// SQLite connections run in WAL mode so replica reads proceed while a
/// repair or transaction holds the write lock.
pub(crate) async fn connect_pool(connection_string: &str) -> Result<AnyPool, StoreError> {
    install_drivers();
    let is_sqlite = connection_string.starts_with("sqlite:");
    retry("sql_connect", &RetryConfig::startup(), || async {
        let options = AnyPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300));
        let options = if is_sqlite {
            options.after_connect(|conn, _meta| Box::pin(enable_wal_mode(conn)))
        } else {
            options
        };
        options
            .connect(connection_string)
            .await
            .map_err(|e| classify(connection_string, e))
    })
    .await
}

/// WAL journal (persistent per file) and NORMAL sync (per connection).
async fn enable_wal_mode(conn: &mut AnyConnection) -> Result<(), sqlx::Error> {
    sqlx::query::<Any>("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
    sqlx::query::<Any>("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
    Ok(())
}

/// Text column, read as String (SQLite) or bytes (MySQL via Any).
pub(crate) fn text_column(row: &AnyRow, name: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(name)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(name)
                .ok()
                .flatten()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
}

/// Values written by other tools may not be JSON; keep them as plain strings.
fn decode_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

struct StorePool {
    pool: AnyPool,
    is_sqlite: bool,
}

struct SqlTable {
    descriptor: StoreDescriptor,
    pool: Arc<StorePool>,
}

pub struct SqlStore {
    tables: HashMap<String, SqlTable>,
}

impl SqlStore {
    /// Connect every store in the registry. `urls` maps store name to its
    /// connection string; every store needs one.
    pub async fn connect(
        registry: &StoreRegistry,
        urls: &BTreeMap<String, String>,
    ) -> Result<Self, StoreError> {
        let mut pools: HashMap<&str, Arc<StorePool>> = HashMap::new();
        let mut tables = HashMap::new();

        for d in registry.descriptors() {
            let url = urls.get(&d.name).ok_or_else(|| {
                StoreError::Validation(format!("no connection string for store '{}'", d.name))
            })?;
            let pool = match pools.get(url.as_str()) {
                Some(pool) => pool.clone(),
                None => {
                    info!(store = %d.name, "Connecting store database");
                    let pool = Arc::new(StorePool {
                        pool: connect_pool(url).await?,
                        is_sqlite: url.starts_with("sqlite:"),
                    });
                    pools.insert(url.as_str(), pool.clone());
                    pool
                }
            };
            tables.insert(
                d.name.clone(),
                SqlTable {
                    descriptor: d.clone(),
                    pool,
                },
            );
        }

        Ok(Self { tables })
    }

    fn table(&self, store: &str) -> Result<&SqlTable, StoreError> {
        self.tables.get(store).ok_or_else(|| StoreError::unknown_store(store))
    }

    /// Create every store's table if missing. Module-owned databases normally
    /// already have their tables; this is for fresh setups and tests.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for (name, table) in &self.tables {
            let d = &table.descriptor;
            let mut cols = vec!["id VARCHAR(191) PRIMARY KEY".to_string()];
            cols.extend(d.sync_fields.iter().map(|f| format!("{} TEXT", f)));
            cols.push("created_at BIGINT NOT NULL".into());
            cols.push("updated_at BIGINT NOT NULL".into());
            let ddl = format!("CREATE TABLE IF NOT EXISTS {} ({})", d.table, cols.join(", "));

            sqlx::query(&ddl)
                .execute(&table.pool.pool)
                .await
                .map_err(|e| classify(name, e))?;
        }
        debug!(tables = self.tables.len(), "Store tables initialized");
        Ok(())
    }
}

fn select_columns(d: &StoreDescriptor) -> String {
    std::iter::once("id")
        .chain(d.sync_fields.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_fields(row: &AnyRow, d: &StoreDescriptor) -> Fields {
    d.sync_fields
        .iter()
        .filter_map(|f| text_column(row, f).map(|text| (f.clone(), decode_value(&text))))
        .collect()
}

async fn fetch_fields(
    conn: &mut AnyConnection,
    d: &StoreDescriptor,
    id: &str,
) -> Result<Option<Fields>, sqlx::Error> {
    let sql = format!("SELECT {} FROM {} WHERE id = ?", select_columns(d), d.table);
    let row = sqlx::query::<Any>(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|r| row_to_fields(&r, d)))
}

/// Insert-or-update the projected fields. Only the named columns (and
/// `updated_at`) change on an existing row.
async fn upsert(
    conn: &mut AnyConnection,
    d: &StoreDescriptor,
    is_sqlite: bool,
    id: &str,
    fields: &Fields,
) -> Result<(), sqlx::Error> {
    let projected = d.project(fields);
    let names: Vec<&str> = projected.keys().map(String::as_str).collect();

    let mut columns = vec!["id"];
    columns.extend(&names);
    columns.extend(["created_at", "updated_at"]);
    let placeholders = vec!["?"; columns.len()].join(", ");

    let updates: Vec<String> = names
        .iter()
        .copied()
        .chain(std::iter::once("updated_at"))
        .map(|c| {
            if is_sqlite {
                format!("{c} = excluded.{c}")
            } else {
                format!("{c} = VALUES({c})")
            }
        })
        .collect();

    let sql = if is_sqlite {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
            d.table,
            columns.join(", "),
            placeholders,
            updates.join(", ")
        )
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
            d.table,
            columns.join(", "),
            placeholders,
            updates.join(", ")
        )
    };

    let now = now_millis();
    let mut query = sqlx::query::<Any>(&sql).bind(id.to_string());
    for value in projected.values() {
        query = query.bind(value.to_string());
    }
    query.bind(now).bind(now).execute(&mut *conn).await?;
    Ok(())
}

#[async_trait]
impl StoreAccessor for SqlStore {
    async fn get(&self, store: &str, id: &str) -> Result<Option<Fields>, StoreError> {
        let table = self.table(store)?;
        let mut conn = table.pool.pool.acquire().await.map_err(|e| classify(store, e))?;
        fetch_fields(&mut conn, &table.descriptor, id)
            .await
            .map_err(|e| classify(store, e))
    }

    async fn put(&self, store: &str, id: &str, fields: &Fields) -> Result<(), StoreError> {
        let table = self.table(store)?;
        let mut conn = table.pool.pool.acquire().await.map_err(|e| classify(store, e))?;
        upsert(&mut conn, &table.descriptor, table.pool.is_sqlite, id, fields)
            .await
            .map_err(|e| classify(store, e))
    }

    async fn scan(
        &self,
        store: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<(EntityId, Fields)>, StoreError> {
        let table = self.table(store)?;
        let d = &table.descriptor;
        let sql = format!(
            "SELECT {} FROM {} ORDER BY id LIMIT ? OFFSET ?",
            select_columns(d),
            d.table
        );
        let rows = sqlx::query::<Any>(&sql)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&table.pool.pool)
            .await
            .map_err(|e| classify(store, e))?;

        // Dropping a row would shorten the page and end the caller's walk early
        rows.iter()
            .enumerate()
            .map(|(i, row)| match text_column(row, "id") {
                Some(id) => Ok((id, row_to_fields(row, d))),
                None => Err(StoreError::Backend(format!(
                    "{}: row at offset {} has an unreadable id",
                    store,
                    offset + i as u64
                ))),
            })
            .collect()
    }

    async fn columns(&self, store: &str) -> Result<BTreeSet<String>, StoreError> {
        let table = self.table(store)?;
        let sql = if table.pool.is_sqlite {
            "SELECT name FROM pragma_table_info(?)"
        } else {
            "SELECT COLUMN_NAME AS name FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?"
        };
        let rows = sqlx::query::<Any>(sql)
            .bind(table.descriptor.table.clone())
            .fetch_all(&table.pool.pool)
            .await
            .map_err(|e| classify(store, e))?;
        Ok(rows.iter().filter_map(|r| text_column(r, "name")).collect())
    }

    async fn open_handle(&self, store: &str) -> Result<Box<dyn WriteHandle>, StoreError> {
        let table = self.table(store)?;
        let tx = table.pool.pool.begin().await.map_err(|e| classify(store, e))?;
        Ok(Box::new(SqlWriteHandle::new(store, table, SharedTx::begun(tx))))
    }

    /// One database transaction per pool. Stores on the same pool come back
    /// adjacent, so committing the first of them commits the group.
    async fn open_handles(&self, stores: &[String]) -> Result<Vec<Box<dyn WriteHandle>>, StoreError> {
        let mut groups: Vec<(&Arc<StorePool>, Vec<(&str, &SqlTable)>)> = Vec::new();
        for store in stores {
            let table = self.table(store)?;
            match groups.iter().position(|(pool, _)| Arc::ptr_eq(*pool, &table.pool)) {
                Some(i) => groups[i].1.push((store.as_str(), table)),
                None => groups.push((&table.pool, vec![(store.as_str(), table)])),
            }
        }

        let mut handles: Vec<Box<dyn WriteHandle>> = Vec::with_capacity(stores.len());
        for (pool, members) in groups {
            let first = members.first().map_or("", |(store, _)| *store);
            let tx = pool.pool.begin().await.map_err(|e| classify(first, e))?;
            if members.len() > 1 {
                let names: Vec<&str> = members.iter().map(|(store, _)| *store).collect();
                debug!(stores = ?names, "Stores share one database transaction");
            }
            let shared = SharedTx::begun(tx);
            for (store, table) in members {
                handles.push(Box::new(SqlWriteHandle::new(store, table, shared.clone())));
            }
        }
        Ok(handles)
    }
}

/// Database transaction behind one or more write handles.
enum SharedTx {
    Open(Transaction<'static, Any>),
    Committed,
    Closed,
}

impl SharedTx {
    fn begun(tx: Transaction<'static, Any>) -> Arc<Mutex<SharedTx>> {
        Arc::new(Mutex::new(SharedTx::Open(tx)))
    }

    fn open(&mut self, store: &str) -> Result<&mut Transaction<'static, Any>, StoreError> {
        match self {
            SharedTx::Open(tx) => Ok(tx),
            SharedTx::Committed | SharedTx::Closed => Err(StoreError::Backend(format!(
                "{}: write handle used after its transaction finished",
                store
            ))),
        }
    }
}

/// Write handle over a database transaction, possibly shared with other
/// stores on the same pool. The first commit or rollback settles the shared
/// transaction; later ones on a committed transaction are no-ops, and a
/// rollback after a commit fails. Dropping every handle rolls back.
pub struct SqlWriteHandle {
    store: String,
    descriptor: StoreDescriptor,
    is_sqlite: bool,
    tx: Arc<Mutex<SharedTx>>,
}

impl SqlWriteHandle {
    fn new(store: &str, table: &SqlTable, tx: Arc<Mutex<SharedTx>>) -> Self {
        Self {
            store: store.to_string(),
            descriptor: table.descriptor.clone(),
            is_sqlite: table.pool.is_sqlite,
            tx,
        }
    }
}

#[async_trait]
impl WriteHandle for SqlWriteHandle {
    fn store_name(&self) -> &str {
        &self.store
    }

    async fn get(&mut self, id: &str) -> Result<Option<Fields>, StoreError> {
        let mut shared = self.tx.lock().await;
        let tx = shared.open(&self.store)?;
        fetch_fields(tx, &self.descriptor, id)
            .await
            .map_err(|e| classify(&self.store, e))
    }

    async fn put(&mut self, id: &str, fields: &Fields) -> Result<(), StoreError> {
        let mut shared = self.tx.lock().await;
        let tx = shared.open(&self.store)?;
        upsert(tx, &self.descriptor, self.is_sqlite, id, fields)
            .await
            .map_err(|e| classify(&self.store, e))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut shared = self.tx.lock().await;
        match std::mem::replace(&mut *shared, SharedTx::Closed) {
            SharedTx::Open(tx) => {
                tx.commit().await.map_err(|e| classify(&self.store, e))?;
                *shared = SharedTx::Committed;
                Ok(())
            }
            SharedTx::Committed => {
                *shared = SharedTx::Committed;
                Ok(())
            }
            SharedTx::Closed => Err(StoreError::Backend(format!(
                "{}: shared transaction was already rolled back",
                self.store
            ))),
        }
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let mut shared = self.tx.lock().await;
        match std::mem::replace(&mut *shared, SharedTx::Closed) {
            SharedTx::Open(tx) => tx.rollback().await.map_err(|e| classify(&self.store, e)),
            SharedTx::Committed => {
                *shared = SharedTx::Committed;
                Err(StoreError::Backend(format!(
                    "{}: shared transaction was already committed",
                    self.store
                )))
            }
            SharedTx::Closed => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn registry() -> StoreRegistry {
        StoreRegistry::new(vec![
            StoreDescriptor::master("clients", "clients", &["name", "email", "age"]),
            StoreDescriptor::replica("housing", "housing_clients", &["name", "email"], &["name"]),
        ])
        .unwrap()
    }

    async fn open(dir: &TempDir) -> SqlStore {
        let mut urls = BTreeMap::new();
        for store in ["clients", "housing"] {
            let path = dir.path().join(format!("{}.db", store));
            urls.insert(store.to_string(), format!("sqlite://{}?mode=rwc", path.display()));
        }
        let store = SqlStore::connect(&registry(), &urls).await.unwrap();
        store.init_schema().await.unwrap();
        store
    }

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_put_get_preserves_json_types() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        let row = fields(&[("name", json!("Ann")), ("email", json!("a@x.com")), ("age", json!(42))]);
        store.put("clients", "C1", &row).await.unwrap();

        assert_eq!(store.get("clients", "C1").await.unwrap(), Some(row));
        assert_eq!(store.get("clients", "C9").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_upsert_updates_only_named_columns() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        store
            .put("housing", "C1", &fields(&[("name", json!("Ann")), ("email", json!("old@x.com"))]))
            .await
            .unwrap();
        store
            .put("housing", "C1", &fields(&[("email", json!("a@x.com")), ("age", json!(3))]))
            .await
            .unwrap();

        let row = store.get("housing", "C1").await.unwrap().unwrap();
        assert_eq!(row, fields(&[("name", json!("Ann")), ("email", json!("a@x.com"))]));
    }

    #[tokio::test]
    async fn test_scan_pages_in_id_order() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        for id in ["C2", "C3", "C1"] {
            store.put("clients", id, &fields(&[("name", json!(id))])).await.unwrap();
        }

        let page = store.scan("clients", 1, 5).await.unwrap();
        let ids: Vec<_> = page.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["C2", "C3"]);
    }

    #[tokio::test]
    async fn test_columns_reflect_table() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        let cols = store.columns("housing").await.unwrap();
        assert!(cols.contains("email"));
        assert!(cols.contains("updated_at"));
        assert!(!cols.contains("age"));
    }

    #[tokio::test]
    async fn test_handle_commit_and_rollback() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        let mut handle = store.open_handle("housing").await.unwrap();
        handle.put("C1", &fields(&[("name", json!("Ann"))])).await.unwrap();
        assert!(handle.get("C1").await.unwrap().is_some());
        handle.rollback().await.unwrap();
        assert!(store.get("housing", "C1").await.unwrap().is_none());

        let mut handle = store.open_handle("housing").await.unwrap();
        handle.put("C1", &fields(&[("name", json!("Bea"))])).await.unwrap();
        handle.commit().await.unwrap();
        assert_eq!(store.get("housing", "C1").await.unwrap().unwrap()["name"], json!("Bea"));
    }

    /// Both stores in one database file, as a single-database deployment has.
    async fn open_shared(dir: &TempDir) -> SqlStore {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("shared.db").display());
        let urls = ["clients", "housing"]
            .into_iter()
            .map(|store| (store.to_string(), url.clone()))
            .collect();
        let store = SqlStore::connect(&registry(), &urls).await.unwrap();
        store.init_schema().await.unwrap();
        store
    }

    fn names(stores: &[&str]) -> Vec<String> {
        stores.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_shared_database_handles_commit_together() {
        let dir = TempDir::new().unwrap();
        let store = open_shared(&dir).await;

        let mut handles = store.open_handles(&names(&["clients", "housing"])).await.unwrap();
        for handle in handles.iter_mut() {
            handle.put("C1", &fields(&[("name", json!("Ann"))])).await.unwrap();
        }
        assert_eq!(handles[1].get("C1").await.unwrap().unwrap()["name"], json!("Ann"));
        for handle in handles {
            handle.commit().await.unwrap();
        }

        assert_eq!(store.get("clients", "C1").await.unwrap().unwrap()["name"], json!("Ann"));
        assert_eq!(store.get("housing", "C1").await.unwrap().unwrap()["name"], json!("Ann"));
    }

    #[tokio::test]
    async fn test_shared_database_handles_roll_back_together() {
        let dir = TempDir::new().unwrap();
        let store = open_shared(&dir).await;

        let mut handles = store.open_handles(&names(&["housing", "clients"])).await.unwrap();
        for handle in handles.iter_mut() {
            handle.put("C1", &fields(&[("name", json!("Ann"))])).await.unwrap();
        }
        for handle in handles {
            handle.rollback().await.unwrap();
        }

        assert!(store.get("clients", "C1").await.unwrap().is_none());
        assert!(store.get("housing", "C1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rollback_after_shared_commit_is_refused() {
        let dir = TempDir::new().unwrap();
        let store = open_shared(&dir).await;

        let mut handles = store.open_handles(&names(&["clients", "housing"])).await.unwrap();
        handles[1].put("C1", &fields(&[("name", json!("Ann"))])).await.unwrap();
        let housing = handles.pop().unwrap();
        handles.pop().unwrap().commit().await.unwrap();

        // the housing write went out with the clients commit
        assert!(matches!(housing.rollback().await, Err(StoreError::Backend(_))));
        assert!(store.get("housing", "C1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_separate_databases_get_separate_transactions() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        let mut handles = store.open_handles(&names(&["housing", "clients"])).await.unwrap();
        let stores: Vec<&str> = handles.iter().map(|h| h.store_name()).collect();
        assert_eq!(stores, vec!["housing", "clients"]);
        handles[0].put("C1", &fields(&[("name", json!("Ann"))])).await.unwrap();
        let clients = handles.pop().unwrap();
        handles.pop().unwrap().commit().await.unwrap();
        clients.rollback().await.unwrap();

        assert!(store.get("housing", "C1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sqlite_pool_uses_wal_journal() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("wal.db").display());
        let pool = connect_pool(&url).await.unwrap();

        let row = sqlx::query::<Any>("PRAGMA journal_mode").fetch_one(&pool).await.unwrap();
        assert_eq!(text_column(&row, "journal_mode").as_deref(), Some("wal"));
    }

    #[tokio::test]
    async fn test_reads_proceed_during_open_write_transaction() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.put("housing", "C1", &fields(&[("name", json!("Ann"))])).await.unwrap();

        let mut handle = store.open_handle("housing").await.unwrap();
        handle.put("C1", &fields(&[("name", json!("Bea"))])).await.unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(2), store.get("housing", "C1"))
            .await
            .expect("read blocked by the writer")
            .unwrap();
        assert_eq!(seen.unwrap()["name"], json!("Ann"));
        handle.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_rejects_row_without_readable_id() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.put("clients", "C1", &fields(&[("name", json!("Ann"))])).await.unwrap();
        // SQLite lets a non-integer primary key hold NULL
        sqlx::query::<Any>("INSERT INTO clients (id, created_at, updated_at) VALUES (NULL, 0, 0)")
            .execute(&store.table("clients").unwrap().pool.pool)
            .await
            .unwrap();

        let err = store.scan("clients", 0, 10).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(ref m) if m.contains("offset 0")), "{err}");
    }

    #[tokio::test]
    async fn test_missing_url_is_validation_error() {
        let urls = BTreeMap::new();
        let err = SqlStore::connect(&registry(), &urls).await.err().unwrap();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn test_classify_pool_timeout_is_retryable() {
        use crate::resilience::retry::Retryable;
        let err = classify("housing", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::Unavailable { .. }));
        assert!(err.is_retryable());
        assert!(!classify("housing", sqlx::Error::RowNotFound).is_retryable());
    }
}
