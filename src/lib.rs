//! Dynamis is a uniform key-value facade over interchangeable persistence backends.
//!
//! A [`Dynamis`] instance is bound to one backend kind and the client handle the
//! caller already owns. It exposes `get`, `set`, `del`, `expire` and `flush`
//! without leaking backend-specific APIs, and runs a configured set of
//! "before" hooks exactly once, ahead of the first operation that reaches it.
//!
//! ## Core Components
//! - [`facade`]: The facade and its error channel.
//! - [`hooks`]: The one-time gate and the pre-hook configuration it runs.
//! - [`engine`]: The backend capability contract and the bundled adapters.
//! - [`sdk`]: The Memcached client and environment-driven options.
//!
//! ## Example
//!
//! ```no_run
//! use dynamis::{Connection, Dynamis, Options};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = Dynamis::new("memory", Some(Connection::memory()), Options::default());
//!
//!     cache.set("a", &json!({ "x": 1 }), None).await?;
//!     assert_eq!(cache.get("a").await?, Some(json!({ "x": 1 })));
//!     assert_eq!(cache.del("a").await?, 1);
//!     Ok(())
//! }
//! ```

pub mod facade;
pub mod engine;
pub mod hooks;
pub mod options;
pub mod sdk;

pub use facade::Dynamis;
pub use engine::{Backend, BackendKind, Capabilities, Connection, Operation};
pub use hooks::{Gate, PreHook};
pub use options::{Database, Options};

use thiserror::Error;

/// Errors returned by Dynamis and its adapters.
#[derive(Error, Debug)]
pub enum Error {
    /// The instance or one of its hooks was configured incorrectly.
    #[error("configuration error: {0}")]
    Config(String),
    /// The instance failed to construct an adapter and cannot serve operations.
    #[error("no persistence layer is configured")]
    NotConfigured,
    /// The adapter did not register the requested operation.
    #[error("operation `{0}` is not supported by this backend")]
    Unsupported(Operation),
    /// A pre-hook failed while the gate was running.
    #[error("pre-hook `{hook}` failed: {source}")]
    Hook {
        hook: Operation,
        #[source]
        source: Box<Error>,
    },
    /// The backend reported the key as missing through an explicit error.
    #[error("key not found")]
    NotFound,
    /// A value could not be converted to or from its stored representation.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// An I/O error occurred while talking to a backend.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error reported by the Redis client.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// Error reported by the HTTP client used for the document store.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// Error reported by the embedded store.
    #[error("embedded store error: {0}")]
    Embedded(#[from] redb::Error),
    /// A backend answered with an error of its own.
    #[error("backend error: {0}")]
    Backend(String),
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for Dynamis operations.
pub type Result<T> = std::result::Result<T, Error>;
