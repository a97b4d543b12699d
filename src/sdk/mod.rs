/// Async Memcached client used as the cache backend's handle.
pub mod client;
/// Environment-driven adjustments applied when an instance is built.
pub mod discovery;

pub use client::Client;
pub use discovery::{apply_env, FLUSH_ENV};
