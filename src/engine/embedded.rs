//! Embedded store adapter backed by redb.
//!
//! Each instance owns one table in a database file the caller opened. Entries
//! are JSON envelopes carrying an optional expiry, checked lazily on access.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{mismatch, write_ttl, Backend, BackendKind, Capabilities, Connection, Operation};
use crate::options::Options;
use crate::{Error, Result};

/// Table used when the options name no database.
pub const DEFAULT_TABLE: &str = "dynamis";

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    value: Value,
    /// Unix time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<u64>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| now_millis() >= at)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn deadline(ttl: Duration) -> u64 {
    now_millis().saturating_add(ttl.as_millis() as u64)
}

fn store_error<E: Into<redb::Error>>(e: E) -> Error {
    Error::Embedded(e.into())
}

struct Store {
    db: Arc<Database>,
    table: String,
}

impl Store {
    fn definition(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.table)
    }

    fn get_sync(&self, key: &str) -> Result<Option<Value>> {
        let entry = {
            let read_txn = self.db.begin_read().map_err(store_error)?;
            let table = match read_txn.open_table(self.definition()) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(store_error(e)),
            };
            let found = table.get(key).map_err(store_error)?;
            let entry = match found {
                Some(guard) => serde_json::from_slice::<Entry>(guard.value())?,
                None => return Ok(None),
            };
            entry
        };

        if entry.is_expired() {
            self.purge_expired_sync(key)?;
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    /// Removes `key` if the row is still expired when the write lock is held.
    ///
    /// A write that landed after the read saw the stale row is left alone.
    fn purge_expired_sync(&self, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write().map_err(store_error)?;
        let purged = {
            let mut table = write_txn.open_table(self.definition()).map_err(store_error)?;
            let expired = match table.get(key).map_err(store_error)? {
                Some(guard) => serde_json::from_slice::<Entry>(guard.value())?.is_expired(),
                None => false,
            };
            if expired {
                table.remove(key).map_err(store_error)?;
            }
            expired
        };
        write_txn.commit().map_err(store_error)?;
        Ok(purged)
    }

    fn set_sync(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let entry = Entry {
            value,
            expires_at: write_ttl(ttl).map(deadline),
        };
        let bytes = serde_json::to_vec(&entry)?;

        let write_txn = self.db.begin_write().map_err(store_error)?;
        {
            let mut table = write_txn.open_table(self.definition()).map_err(store_error)?;
            table.insert(key, bytes.as_slice()).map_err(store_error)?;
        }
        write_txn.commit().map_err(store_error)?;
        Ok(())
    }

    fn del_sync(&self, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write().map_err(store_error)?;
        let existed = {
            let mut table = write_txn.open_table(self.definition()).map_err(store_error)?;
            let removed = table.remove(key).map_err(store_error)?;
            let existed = match removed {
                Some(guard) => serde_json::from_slice::<Entry>(guard.value())
                    .map(|entry| !entry.is_expired())
                    .unwrap_or(true),
                None => false,
            };
            existed
        };
        write_txn.commit().map_err(store_error)?;
        Ok(existed)
    }

    fn expire_sync(&self, key: &str, ttl: Duration) -> Result<bool> {
        let write_txn = self.db.begin_write().map_err(store_error)?;
        let touched = {
            let mut table = write_txn.open_table(self.definition()).map_err(store_error)?;
            let current = match table.get(key).map_err(store_error)? {
                Some(guard) => Some(serde_json::from_slice::<Entry>(guard.value())?),
                None => None,
            };
            let touched = match current {
                Some(entry) if entry.is_expired() => {
                    table.remove(key).map_err(store_error)?;
                    false
                }
                Some(mut entry) => {
                    entry.expires_at = Some(deadline(ttl));
                    let bytes = serde_json::to_vec(&entry)?;
                    table.insert(key, bytes.as_slice()).map_err(store_error)?;
                    true
                }
                None => false,
            };
            touched
        };
        write_txn.commit().map_err(store_error)?;
        Ok(touched)
    }

    fn flush_sync(&self) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(store_error)?;
        write_txn.delete_table(self.definition()).map_err(store_error)?;
        write_txn.open_table(self.definition()).map_err(store_error)?;
        write_txn.commit().map_err(store_error)?;
        Ok(())
    }

    fn prepare_sync(&self) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(store_error)?;
        write_txn.open_table(self.definition()).map_err(store_error)?;
        write_txn.commit().map_err(store_error)?;
        Ok(())
    }
}

/// Adapter over a shared redb [`Database`].
///
/// redb transactions are blocking, so every operation runs on the blocking
/// pool. Misses are `Ok(None)`.
pub struct EmbeddedAdapter {
    store: Arc<Store>,
}

impl EmbeddedAdapter {
    pub fn new(db: Arc<Database>, table: &str) -> Result<Self> {
        if table.is_empty() {
            return Err(Error::Config("[LevelUp] Provide a database name".to_string()));
        }
        Ok(Self {
            store: Arc::new(Store {
                db,
                table: table.to_string(),
            }),
        })
    }

    pub(crate) fn construct(options: &Options, connection: Connection) -> Result<Arc<dyn Backend>> {
        match connection {
            Connection::Embedded(db) => {
                let table = match &options.database {
                    None => DEFAULT_TABLE,
                    Some(_) => options
                        .database_name()
                        .ok_or_else(|| Error::Config("[LevelUp] Provide a database name".to_string()))?,
                };
                Ok(Arc::new(Self::new(db, table)?))
            }
            other => Err(mismatch(BackendKind::Embedded, &other)),
        }
    }

    pub fn table(&self) -> &str {
        &self.store.table
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| Error::Internal(format!("embedded task failed: {}", e)))?
    }
}

#[async_trait]
impl Backend for EmbeddedAdapter {
    fn name(&self) -> &'static str {
        BackendKind::Embedded.store_name()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::STANDARD.with(Operation::Prepare)
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let key = key.to_string();
        self.run(move |store| store.get_sync(&key)).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<String> {
        let key = key.to_string();
        self.run(move |store| store.set_sync(&key, value, ttl)).await?;
        Ok("OK".to_string())
    }

    async fn del(&self, key: &str) -> Result<u64> {
        let key = key.to_string();
        Ok(self.run(move |store| store.del_sync(&key)).await? as u64)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<u64> {
        let key = key.to_string();
        Ok(self.run(move |store| store.expire_sync(&key, ttl)).await? as u64)
    }

    async fn flush(&self) -> Result<String> {
        self.run(|store| store.flush_sync()).await?;
        Ok("OK".to_string())
    }

    async fn prepare(&self) -> Result<()> {
        self.run(|store| store.prepare_sync()).await
    }
}
