use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::{ceil_secs, mismatch, write_ttl, Backend, BackendKind, Capabilities, Connection};
use crate::options::Options;
use crate::sdk::Client;
use crate::Result;

/// Memcached reads expiration times above 30 days as absolute unix timestamps.
const RELATIVE_EXPTIME_LIMIT: u64 = 60 * 60 * 24 * 30;

/// Adapter over a shared Memcached [`Client`].
///
/// Values are stored as JSON text. Misses are `Ok(None)`, `del` and `expire`
/// map `DELETED`/`TOUCHED` to 1 and `NOT_FOUND` to 0.
pub struct MemcachedAdapter {
    client: Arc<Client>,
}

impl MemcachedAdapter {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }

    pub(crate) fn construct(_options: &Options, connection: Connection) -> Result<Arc<dyn Backend>> {
        match connection {
            Connection::Memcached(client) => Ok(Arc::new(Self::new(client))),
            other => Err(mismatch(BackendKind::Memcached, &other)),
        }
    }
}

/// Wire expiration for a write: 0 never expires, anything else is at least a second.
fn exptime(ttl: Option<Duration>) -> u64 {
    match write_ttl(ttl).map(ceil_secs) {
        None => 0,
        Some(secs) if secs <= RELATIVE_EXPTIME_LIMIT => secs,
        Some(secs) => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            now + secs
        }
    }
}

#[async_trait]
impl Backend for MemcachedAdapter {
    fn name(&self) -> &'static str {
        BackendKind::Memcached.store_name()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::STANDARD
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.client.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<String> {
        let bytes = serde_json::to_vec(&value)?;
        self.client.set(key, &bytes, exptime(ttl)).await
    }

    async fn del(&self, key: &str) -> Result<u64> {
        Ok(self.client.delete(key).await? as u64)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<u64> {
        // `touch k 0` would clear the expiry, so an immediate one is a delete.
        if ttl.is_zero() {
            return self.del(key).await;
        }
        Ok(self.client.touch(key, exptime(Some(ttl))).await? as u64)
    }

    async fn flush(&self) -> Result<String> {
        self.client.flush_all().await
    }
}
