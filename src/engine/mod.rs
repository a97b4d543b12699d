//! Backend adapters and the capability contract they implement.
//!
//! Every adapter wraps a client handle supplied by the caller and registers the
//! subset of operations its store can honour. The facade never talks to a
//! client directly, it only goes through [`Backend`].

pub mod couch;
pub mod embedded;
pub mod memcached;
pub mod memory;
pub mod redis;

pub use couch::{CouchAdapter, CouchConnection};
pub use embedded::EmbeddedAdapter;
pub use memcached::MemcachedAdapter;
pub use memory::{MemoryAdapter, MemoryDatabase};
pub use self::redis::RedisAdapter;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::options::Options;
use crate::{Error, Result};

/// Operations an adapter may register on an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Get,
    Set,
    Del,
    Expire,
    Flush,
    /// Provision the backing store (create the database, select the keyspace).
    Prepare,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Get,
        Operation::Set,
        Operation::Del,
        Operation::Expire,
        Operation::Flush,
        Operation::Prepare,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Set => "set",
            Operation::Del => "del",
            Operation::Expire => "expire",
            Operation::Flush => "flush",
            Operation::Prepare => "prepare",
        }
    }

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown operation `{}`", s)))
    }
}

/// The capability table an adapter registers at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);

    /// `get`, `set`, `del`, `expire` and `flush`.
    pub const STANDARD: Capabilities = Capabilities::NONE
        .with(Operation::Get)
        .with(Operation::Set)
        .with(Operation::Del)
        .with(Operation::Expire)
        .with(Operation::Flush);

    pub const fn with(self, op: Operation) -> Self {
        Capabilities(self.0 | op.bit())
    }

    pub const fn without(self, op: Operation) -> Self {
        Capabilities(self.0 & !op.bit())
    }

    pub const fn contains(self, op: Operation) -> bool {
        self.0 & op.bit() != 0
    }

    pub fn iter(self) -> impl Iterator<Item = Operation> {
        Operation::ALL.into_iter().filter(move |op| self.contains(*op))
    }
}

/// The persistence layers Dynamis ships adapters for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Memory,
    Redis,
    Couch,
    Memcached,
    Embedded,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Redis => "redis",
            BackendKind::Couch => "cradle",
            BackendKind::Memcached => "memcached",
            BackendKind::Embedded => "levelup",
        }
    }

    /// Name of the store behind the adapter.
    pub fn store_name(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Redis => "redis",
            BackendKind::Couch => "couchdb",
            BackendKind::Memcached => "memcached",
            BackendKind::Embedded => "redb",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(BackendKind::Memory),
            "redis" => Ok(BackendKind::Redis),
            "cradle" | "couchdb" => Ok(BackendKind::Couch),
            "memcached" => Ok(BackendKind::Memcached),
            "levelup" | "embedded" | "redb" => Ok(BackendKind::Embedded),
            _ => Err(Error::Config(format!("unknown persistence layer `{}`", s))),
        }
    }
}

/// The client handle a caller hands to an instance.
///
/// Handles are shared: the caller keeps its own copy and stays responsible for
/// the client's lifecycle.
#[derive(Clone)]
pub enum Connection {
    Memory(Arc<MemoryDatabase>),
    Redis(::redis::Client),
    Couch(CouchConnection),
    Memcached(Arc<crate::sdk::Client>),
    Embedded(Arc<::redb::Database>),
}

impl Connection {
    /// A fresh, unshared in-process database.
    pub fn memory() -> Self {
        Connection::Memory(Arc::new(MemoryDatabase::new()))
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Connection::Memory(_) => BackendKind::Memory,
            Connection::Redis(_) => BackendKind::Redis,
            Connection::Couch(_) => BackendKind::Couch,
            Connection::Memcached(_) => BackendKind::Memcached,
            Connection::Embedded(_) => BackendKind::Embedded,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Connection").field(&self.kind()).finish()
    }
}

pub(crate) fn mismatch(expected: BackendKind, connection: &Connection) -> Error {
    Error::Config(format!(
        "[{}] expected a {} connection, got {}",
        expected.store_name(),
        expected.store_name(),
        connection.kind().store_name()
    ))
}

/// The five-operation contract every adapter implements.
///
/// Operations the adapter leaves out of [`Backend::capabilities`] keep the
/// default body, which reports [`Error::Unsupported`]. "Not found" is reported
/// the way the backend natively does it and is not normalized here.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    async fn get(&self, _key: &str) -> Result<Option<Value>> {
        Err(Error::Unsupported(Operation::Get))
    }

    /// Stores `value`, expiring it after `ttl` when the backend supports it.
    async fn set(&self, _key: &str, _value: Value, _ttl: Option<Duration>) -> Result<String> {
        Err(Error::Unsupported(Operation::Set))
    }

    /// Removes `key`, returning 1 if it existed and 0 otherwise.
    async fn del(&self, _key: &str) -> Result<u64> {
        Err(Error::Unsupported(Operation::Del))
    }

    /// Sets or refreshes the TTL of an existing key, returning 1 if it existed.
    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<u64> {
        Err(Error::Unsupported(Operation::Expire))
    }

    /// Destroys every key in this instance's namespace.
    async fn flush(&self) -> Result<String> {
        Err(Error::Unsupported(Operation::Flush))
    }

    async fn prepare(&self) -> Result<()> {
        Err(Error::Unsupported(Operation::Prepare))
    }
}

/// Builds an adapter from the instance options and the caller's connection.
pub type Constructor = fn(&Options, Connection) -> Result<Arc<dyn Backend>>;

struct Registration {
    kind: BackendKind,
    construct: Constructor,
}

const REGISTRY: &[Registration] = &[
    Registration { kind: BackendKind::Memory, construct: MemoryAdapter::construct },
    Registration { kind: BackendKind::Redis, construct: RedisAdapter::construct },
    Registration { kind: BackendKind::Couch, construct: CouchAdapter::construct },
    Registration { kind: BackendKind::Memcached, construct: MemcachedAdapter::construct },
    Registration { kind: BackendKind::Embedded, construct: EmbeddedAdapter::construct },
];

/// Looks up the adapter constructor registered for `kind`.
pub fn constructor(kind: BackendKind) -> Option<Constructor> {
    REGISTRY.iter().find(|r| r.kind == kind).map(|r| r.construct)
}

/// Kinds with a registered adapter.
pub fn enabled() -> impl Iterator<Item = BackendKind> {
    REGISTRY.iter().map(|r| r.kind)
}

/// Drops a zero TTL, which every adapter treats as "no expiry" on writes.
pub(crate) fn write_ttl(ttl: Option<Duration>) -> Option<Duration> {
    ttl.filter(|d| !d.is_zero())
}

/// Whole seconds, rounded up so a sub-second TTL still expires.
pub(crate) fn ceil_secs(ttl: Duration) -> u64 {
    ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0)
}

/// Whole milliseconds, rounded up.
pub(crate) fn ceil_millis(ttl: Duration) -> u64 {
    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    millis.saturating_add(u64::from(ttl.subsec_nanos() % 1_000_000 > 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names_round_trip() {
        for op in Operation::ALL {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert!(matches!("destroy".parse::<Operation>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_capabilities() {
        let caps = Capabilities::STANDARD.without(Operation::Expire);
        assert!(caps.contains(Operation::Get));
        assert!(!caps.contains(Operation::Expire));
        assert!(!caps.contains(Operation::Prepare));
        assert_eq!(
            caps.iter().collect::<Vec<_>>(),
            vec![Operation::Get, Operation::Set, Operation::Del, Operation::Flush]
        );
        assert_eq!(Capabilities::NONE.iter().count(), 0);
    }

    #[test]
    fn test_backend_kind_aliases() {
        assert_eq!("cradle".parse::<BackendKind>().unwrap(), BackendKind::Couch);
        assert_eq!("couchdb".parse::<BackendKind>().unwrap(), BackendKind::Couch);
        assert_eq!("levelup".parse::<BackendKind>().unwrap(), BackendKind::Embedded);
        assert!(matches!("mongo".parse::<BackendKind>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_every_kind_is_registered() {
        let kinds: Vec<_> = enabled().collect();
        assert_eq!(kinds.len(), 5);
        for kind in kinds {
            assert!(constructor(kind).is_some());
        }
    }

    #[test]
    fn test_ttl_conversions_round_up() {
        assert_eq!(write_ttl(None), None);
        assert_eq!(write_ttl(Some(Duration::ZERO)), None);
        assert_eq!(write_ttl(Some(Duration::from_millis(1))), Some(Duration::from_millis(1)));

        assert_eq!(ceil_secs(Duration::from_millis(500)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ceil_secs(Duration::from_secs(10)), 10);
        assert_eq!(ceil_secs(Duration::ZERO), 0);

        assert_eq!(ceil_millis(Duration::from_micros(1)), 1);
        assert_eq!(ceil_millis(Duration::from_millis(500)), 500);
        assert_eq!(ceil_millis(Duration::from_micros(1500)), 2);
    }
}
