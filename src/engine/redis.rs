use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{cmd, Client, Cmd};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::engine::{ceil_millis, mismatch, write_ttl, Backend, BackendKind, Capabilities, Connection, Operation};
use crate::options::{Database, Options};
use crate::{Error, Result};

/// Adapter over a shared [`redis::Client`](::redis::Client).
///
/// The configured database number goes into the client's connection info, so
/// every connection it opens selects it during setup. The multiplexed
/// connection is opened on first use. Values are stored as JSON text; misses
/// are `Ok(None)` and `del`/`expire` return Redis' own integer replies. TTLs are
/// sent in milliseconds.
pub struct RedisAdapter {
    client: Client,
    database: i64,
    connection: OnceCell<MultiplexedConnection>,
}

impl RedisAdapter {
    /// Fails when `database` is not a non-negative database number.
    pub fn new(client: Client, database: Option<&Database>) -> Result<Self> {
        let database = match database {
            None => 0,
            Some(Database::Number(n)) if *n >= 0 => *n,
            Some(_) => return Err(Error::Config("[Redis] Provide a database number".to_string())),
        };

        let client = if client.get_connection_info().redis.db == database {
            client
        } else {
            let mut info = client.get_connection_info().clone();
            info.redis.db = database;
            Client::open(info)?
        };

        Ok(Self {
            client,
            database,
            connection: OnceCell::new(),
        })
    }

    pub(crate) fn construct(options: &Options, connection: Connection) -> Result<Arc<dyn Backend>> {
        match connection {
            Connection::Redis(client) => Ok(Arc::new(Self::new(client, options.database.as_ref())?)),
            other => Err(mismatch(BackendKind::Redis, &other)),
        }
    }

    pub fn database(&self) -> i64 {
        self.database
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                let connection = self.client.get_multiplexed_async_connection().await?;
                log::debug!("redis connection ready on database {}", self.database);
                Ok::<_, Error>(connection)
            })
            .await?;
        Ok(connection.clone())
    }
}

/// `SET`, or `PSETEX` when the write carries a TTL.
fn set_command(key: &str, payload: &str, ttl: Option<Duration>) -> Cmd {
    match write_ttl(ttl) {
        Some(ttl) => {
            let mut command = cmd("PSETEX");
            command.arg(key).arg(ceil_millis(ttl)).arg(payload);
            command
        }
        None => {
            let mut command = cmd("SET");
            command.arg(key).arg(payload);
            command
        }
    }
}

fn expire_command(key: &str, ttl: Duration) -> Cmd {
    let mut command = cmd("PEXPIRE");
    command.arg(key).arg(ceil_millis(ttl));
    command
}

#[async_trait]
impl Backend for RedisAdapter {
    fn name(&self) -> &'static str {
        BackendKind::Redis.store_name()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::STANDARD.with(Operation::Prepare)
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut connection = self.connection().await?;
        let raw: Option<Vec<u8>> = cmd("GET").arg(key).query_async(&mut connection).await?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<String> {
        let payload = serde_json::to_string(&value)?;
        let mut connection = self.connection().await?;
        Ok(set_command(key, &payload, ttl).query_async(&mut connection).await?)
    }

    async fn del(&self, key: &str) -> Result<u64> {
        let mut connection = self.connection().await?;
        Ok(cmd("DEL").arg(key).query_async(&mut connection).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut connection = self.connection().await?;
        Ok(expire_command(key, ttl).query_async(&mut connection).await?)
    }

    async fn flush(&self) -> Result<String> {
        let mut connection = self.connection().await?;
        Ok(cmd("FLUSHDB").query_async(&mut connection).await?)
    }

    async fn prepare(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::open("redis://127.0.0.1:6379/").unwrap()
    }

    fn wire(parts: &[&str]) -> Vec<u8> {
        let mut out = format!("*{}\r\n", parts.len()).into_bytes();
        for part in parts {
            out.extend_from_slice(format!("${}\r\n{}\r\n", part.len(), part).as_bytes());
        }
        out
    }

    #[test]
    fn test_database_must_be_a_number() {
        let adapter = RedisAdapter::new(client(), Some(&Database::Number(2))).unwrap();
        assert_eq!(adapter.database(), 2);
        assert_eq!(adapter.client.get_connection_info().redis.db, 2);

        let adapter = RedisAdapter::new(client(), None).unwrap();
        assert_eq!(adapter.database(), 0);
        assert_eq!(adapter.client.get_connection_info().redis.db, 0);

        let res = RedisAdapter::new(client(), Some(&Database::from("dynamis")));
        assert!(matches!(res, Err(Error::Config(_))));

        let res = RedisAdapter::new(client(), Some(&Database::Number(-1)));
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[test]
    fn test_redis_registers_prepare() {
        let adapter = RedisAdapter::new(client(), None).unwrap();
        assert!(adapter.capabilities().contains(Operation::Prepare));
        assert!(adapter.capabilities().contains(Operation::Expire));
    }

    #[test]
    fn test_set_picks_psetex_only_with_a_ttl() {
        let plain = set_command("k", "1", None);
        assert_eq!(plain.get_packed_command(), wire(&["SET", "k", "1"]));

        let zero = set_command("k", "1", Some(Duration::ZERO));
        assert_eq!(zero.get_packed_command(), wire(&["SET", "k", "1"]));

        let short = set_command("k", "1", Some(Duration::from_millis(500)));
        assert_eq!(short.get_packed_command(), wire(&["PSETEX", "k", "500", "1"]));

        let long = set_command("k", "{\"a\":1}", Some(Duration::from_secs(60)));
        assert_eq!(long.get_packed_command(), wire(&["PSETEX", "k", "60000", "{\"a\":1}"]));
    }

    #[test]
    fn test_expire_keeps_sub_second_ttls() {
        let command = expire_command("k", Duration::from_millis(250));
        assert_eq!(command.get_packed_command(), wire(&["PEXPIRE", "k", "250"]));
    }
}
