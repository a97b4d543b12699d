use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::engine::{mismatch, write_ttl, Backend, BackendKind, Capabilities, Connection};
use crate::options::Options;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process store shared between the caller and a memory adapter.
///
/// Expired entries are evicted lazily, the next time their key is touched.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    data: RwLock<HashMap<String, Entry>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.read()
            .map(|data| data.values().filter(|e| !e.is_expired()).count())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read()
            .map(|data| data.get(key).is_some_and(|e| !e.is_expired()))
            .unwrap_or_default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Entry>>> {
        self.data
            .read()
            .map_err(|_| Error::Internal("memory database lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Entry>>> {
        self.data
            .write()
            .map_err(|_| Error::Internal("memory database lock poisoned".to_string()))
    }
}

/// Adapter over a [`MemoryDatabase`].
///
/// Misses are `Ok(None)`, `del` and `expire` answer 1/0 the way Redis does.
/// Reads hand out deep copies, so mutating a returned value never reaches the
/// stored one.
pub struct MemoryAdapter {
    database: Arc<MemoryDatabase>,
}

impl MemoryAdapter {
    pub fn new(database: Arc<MemoryDatabase>) -> Self {
        Self { database }
    }

    pub(crate) fn construct(_options: &Options, connection: Connection) -> Result<Arc<dyn Backend>> {
        match connection {
            Connection::Memory(database) => Ok(Arc::new(Self::new(database))),
            other => Err(mismatch(BackendKind::Memory, &other)),
        }
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.database
    }
}

#[async_trait]
impl Backend for MemoryAdapter {
    fn name(&self) -> &'static str {
        BackendKind::Memory.store_name()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::STANDARD
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut data = self.database.write()?;
        let expired = match data.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            data.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<String> {
        let expires_at = write_ttl(ttl).map(|d| Instant::now() + d);
        let mut data = self.database.write()?;
        data.insert(key.to_string(), Entry { value, expires_at });
        Ok("OK".to_string())
    }

    async fn del(&self, key: &str) -> Result<u64> {
        let mut data = self.database.write()?;
        let existed = data.remove(key).is_some_and(|e| !e.is_expired());
        Ok(existed as u64)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut data = self.database.write()?;
        if data.get(key).is_some_and(Entry::is_expired) {
            data.remove(key);
        }
        match data.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn flush(&self) -> Result<String> {
        self.database.write()?.clear();
        Ok("OK".to_string())
    }
}
