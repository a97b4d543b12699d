//! The caller-facing instance.
//!
//! A [`Dynamis`] is bound to one adapter for its whole life. Construction never
//! fails: configuration problems are sent on the error channel and leave an
//! inert instance whose operations each report [`Error::NotConfigured`].
//! Every operation goes through [`Dynamis::execute`], which passes the
//! one-time [`Gate`] before reaching the adapter.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::engine::{self, Backend, BackendKind, Connection, Operation};
use crate::hooks::{self, Gate, PreHook};
use crate::options::Options;
use crate::sdk::discovery;
use crate::{Error, Result};

/// Out-of-band errors: misconfiguration and pre-hook failures.
#[derive(Clone)]
struct ErrorChannel {
    tx: UnboundedSender<Error>,
    rx: Arc<Mutex<Option<UnboundedReceiver<Error>>>>,
}

impl ErrorChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
        }
    }

    fn emit(&self, error: Error) {
        log::error!("{}", error);
        if self.tx.send(error).is_err() {
            log::debug!("error channel receiver dropped");
        }
    }
}

/// A key-value facade bound to one backend.
pub struct Dynamis {
    kind: Option<BackendKind>,
    options: Options,
    backend: Option<Arc<dyn Backend>>,
    gate: Gate,
    errors: ErrorChannel,
}

impl Dynamis {
    /// Builds an instance for the backend tagged `kind` over the caller's `connection`.
    ///
    /// Unknown kinds, a missing or mismatched connection, adapter validation
    /// failures and malformed pre-hooks are reported on the error channel
    /// (see [`Dynamis::take_errors`]).
    pub fn new(kind: &str, connection: Option<Connection>, mut options: Options) -> Self {
        let errors = ErrorChannel::new();
        discovery::apply_env(kind, &mut options);

        let parsed = match kind.parse::<BackendKind>() {
            Ok(parsed) if engine::constructor(parsed).is_some() => Some(parsed),
            Ok(_) | Err(_) => {
                errors.emit(Error::Config(format!("[Dynamis] unknown persistence layer `{}`", kind)));
                None
            }
        };

        if connection.is_none() {
            errors.emit(Error::Config("[Dynamis] persistence layer is not provided".to_string()));
        }

        let backend = match (parsed.and_then(engine::constructor), connection) {
            (Some(construct), Some(connection)) => match construct(&options, connection) {
                Ok(backend) => Some(backend),
                Err(e) => {
                    errors.emit(e);
                    None
                }
            },
            _ => None,
        };

        Self::assemble(parsed, backend, options, errors)
    }

    /// Binds an adapter the caller built, such as a custom [`Backend`].
    pub fn with_backend(backend: Arc<dyn Backend>, options: Options) -> Self {
        let kind = backend.name().parse().ok();
        Self::assemble(kind, Some(backend), options, ErrorChannel::new())
    }

    fn assemble(
        kind: Option<BackendKind>,
        backend: Option<Arc<dyn Backend>>,
        options: Options,
        errors: ErrorChannel,
    ) -> Self {
        let mut hooks = Vec::new();
        if let Some(backend) = &backend {
            for (name, args) in &options.before {
                match PreHook::parse(name, args) {
                    Ok(hook) if backend.capabilities().contains(hook.operation()) => hooks.push(hook),
                    Ok(hook) => errors.emit(Error::Config(format!(
                        "pre-hook `{}` is not supported by {}",
                        hook,
                        backend.name()
                    ))),
                    Err(e) => errors.emit(e),
                }
            }
        }

        Self {
            kind,
            options,
            backend,
            gate: Gate::new(hooks),
            errors,
        }
    }

    pub fn kind(&self) -> Option<BackendKind> {
        self.kind
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The pre-hooks that survived validation.
    pub fn hooks(&self) -> &[PreHook] {
        self.gate.hooks()
    }

    /// Whether the one-time gate has fired (or was never needed).
    pub fn is_armed(&self) -> bool {
        self.gate.is_armed()
    }

    /// Whether the bound adapter registered `op`.
    pub fn supports(&self, op: Operation) -> bool {
        self.backend
            .as_ref()
            .is_some_and(|backend| backend.capabilities().contains(op))
    }

    /// Takes the receiving end of the error channel. Only the first call gets it.
    ///
    /// Errors emitted before the receiver is taken are kept until it is read.
    pub fn take_errors(&self) -> Option<UnboundedReceiver<Error>> {
        self.errors.rx.lock().ok()?.take()
    }

    /// Awaits `target` once the gate lets it through.
    ///
    /// The first call to arrive runs the pre-hooks; calls arriving while they
    /// run wait for them. Hook failures go to the error channel and `target`
    /// still runs.
    pub async fn execute<F, T>(&self, target: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.gate.pass(|| self.before()).await;
        target.await
    }

    fn before(&self) -> impl Future<Output = ()> + Send + 'static {
        let backend = self.backend.clone();
        let hooks = self.gate.shared_hooks();
        let errors = self.errors.clone();

        async move {
            let Some(backend) = backend else {
                return;
            };
            log::debug!("running {} pre-hook(s) on {}", hooks.len(), backend.name());
            for failure in hooks::run_all(&hooks, backend.as_ref()).await {
                errors.emit(failure);
            }
        }
    }

    fn backend_for(&self, op: Operation) -> Result<&Arc<dyn Backend>> {
        let backend = self.backend.as_ref().ok_or(Error::NotConfigured)?;
        if !backend.capabilities().contains(op) {
            return Err(Error::Unsupported(op));
        }
        Ok(backend)
    }

    /// Fetches `key`. Misses follow the backend's own convention: most return
    /// `Ok(None)`, the document store returns [`Error::NotFound`].
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let backend = self.backend_for(Operation::Get)?;
        self.execute(backend.get(key)).await
    }

    /// Fetches `key` and deserializes it into `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Stores `value` under `key`, expiring it after `ttl` when given.
    ///
    /// A value that cannot be serialized is rejected before the backend is touched.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<String> {
        let backend = self.backend_for(Operation::Set)?;
        let value = serde_json::to_value(value)?;
        self.execute(backend.set(key, value, ttl)).await
    }

    /// Removes `key`, returning 1 if it existed and 0 otherwise.
    pub async fn del(&self, key: &str) -> Result<u64> {
        let backend = self.backend_for(Operation::Del)?;
        self.execute(backend.del(key)).await
    }

    /// Sets the TTL of an existing key, returning 0 if it does not exist.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<u64> {
        let backend = self.backend_for(Operation::Expire)?;
        self.execute(backend.expire(key, ttl)).await
    }

    /// Destroys every key in this instance's database.
    pub async fn flush(&self) -> Result<String> {
        let backend = self.backend_for(Operation::Flush)?;
        self.execute(backend.flush()).await
    }

    /// Provisions the backing store (creates the database, opens the connection).
    pub async fn prepare(&self) -> Result<()> {
        let backend = self.backend_for(Operation::Prepare)?;
        self.execute(backend.prepare()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Capabilities, CouchConnection, MemoryDatabase};
    use async_trait::async_trait;
    use serde::ser::Error as _;
    use serde::Serializer;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::error::TryRecvError;

    /// Records every call it receives; `prepare` is slow and may fail.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        prepares: AtomicUsize,
        fail_prepare: bool,
    }

    impl Recorder {
        fn failing() -> Self {
            Self {
                fail_prepare: true,
                ..Self::default()
            }
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backend for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::NONE
                .with(Operation::Get)
                .with(Operation::Set)
                .with(Operation::Prepare)
        }

        async fn get(&self, key: &str) -> Result<Option<Value>> {
            self.record(&format!("get {}", key));
            Ok(Some(json!(key)))
        }

        async fn set(&self, key: &str, _value: Value, _ttl: Option<Duration>) -> Result<String> {
            self.record(&format!("set {}", key));
            Ok("OK".to_string())
        }

        async fn prepare(&self) -> Result<()> {
            self.prepares.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.record("prepare");
            if self.fail_prepare {
                return Err(Error::Backend("boom".to_string()));
            }
            Ok(())
        }
    }

    struct Cyclic;

    impl Serialize for Cyclic {
        fn serialize<S: Serializer>(&self, _serializer: S) -> std::result::Result<S::Ok, S::Error> {
            Err(S::Error::custom("cyclic structure"))
        }
    }

    fn memory() -> Dynamis {
        Dynamis::new("memory", Some(Connection::memory()), Options::default())
    }

    #[tokio::test]
    async fn test_memory_scenario() {
        let cache = memory();

        assert_eq!(cache.set("a", &json!({ "x": 1 }), None).await.unwrap(), "OK");
        assert_eq!(cache.get("a").await.unwrap(), Some(json!({ "x": 1 })));
        assert_eq!(cache.del("a").await.unwrap(), 1);
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert_eq!(cache.del("a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_no_hooks_means_born_armed() {
        let cache = memory();
        assert!(cache.is_armed());
        assert!(cache.hooks().is_empty());
        assert_eq!(cache.gate.fired(), 0);

        cache.get("k").await.unwrap();
        assert_eq!(cache.gate.fired(), 0);
    }

    #[tokio::test]
    async fn test_gate_fires_once_across_operations() {
        let recorder = Arc::new(Recorder::default());
        let cache = Dynamis::with_backend(recorder.clone(), Options::new().before("prepare", vec![]));
        assert!(!cache.is_armed());

        cache.set("a", &1, None).await.unwrap();
        cache.get("a").await.unwrap();
        cache.get("b").await.unwrap();

        assert!(cache.is_armed());
        assert_eq!(cache.gate.fired(), 1);
        assert_eq!(recorder.prepares.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.calls(), vec!["prepare", "set a", "get a", "get b"]);
    }

    #[tokio::test]
    async fn test_racing_operations_wait_for_the_gate() {
        let recorder = Arc::new(Recorder::default());
        let cache = Dynamis::with_backend(recorder.clone(), Options::new().before("prepare", vec![]));

        let (first, second) = tokio::join!(cache.get("x"), cache.set("y", "v", None));
        first.unwrap();
        second.unwrap();

        assert_eq!(recorder.prepares.load(Ordering::SeqCst), 1);
        let calls = recorder.calls();
        assert_eq!(calls[0], "prepare");
        assert_eq!(calls.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_first_operation_keeps_hooks_to_one_run() {
        let recorder = Arc::new(Recorder::default());
        let cache = Dynamis::with_backend(recorder.clone(), Options::new().before("prepare", vec![]));

        let first = tokio::time::timeout(Duration::from_millis(10), cache.get("a")).await;
        assert!(first.is_err());

        assert_eq!(cache.get("b").await.unwrap(), Some(json!("b")));
        assert!(cache.is_armed());
        assert_eq!(cache.gate.fired(), 1);
        assert_eq!(recorder.prepares.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.calls(), vec!["prepare", "get b"]);
    }

    #[tokio::test]
    async fn test_failing_hook_fails_open() {
        let recorder = Arc::new(Recorder::failing());
        let cache = Dynamis::with_backend(recorder.clone(), Options::new().before("prepare", vec![]));
        let mut errors = cache.take_errors().unwrap();

        assert_eq!(cache.get("k").await.unwrap(), Some(json!("k")));

        match errors.try_recv() {
            Ok(Error::Hook { hook, source }) => {
                assert_eq!(hook, Operation::Prepare);
                assert!(matches!(*source, Error::Backend(_)));
            }
            other => panic!("expected a hook error, got {:?}", other),
        }
        assert!(matches!(errors.try_recv(), Err(TryRecvError::Empty)));

        cache.get("k").await.unwrap();
        assert!(matches!(errors.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_flush_hook_runs_before_the_first_operation() {
        let database = Arc::new(MemoryDatabase::new());
        let seeded = Dynamis::new("memory", Some(Connection::Memory(database.clone())), Options::default());
        seeded.set("stale", "value", None).await.unwrap();

        let cache = Dynamis::new(
            "memory",
            Some(Connection::Memory(database.clone())),
            Options::new().before("flush", vec![]),
        );
        assert!(database.contains_key("stale"));

        assert_eq!(cache.get("stale").await.unwrap(), None);
        assert!(database.is_empty());
    }

    #[tokio::test]
    async fn test_set_hook_seeds_a_value() {
        let options = Options::new().before("set", vec![json!("boot"), json!({ "ready": true })]);
        let cache = Dynamis::new("memory", Some(Connection::memory()), options);

        assert_eq!(cache.get("boot").await.unwrap(), Some(json!({ "ready": true })));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_reported_and_inert() {
        let cache = Dynamis::new("mongo", Some(Connection::memory()), Options::default());
        let mut errors = cache.take_errors().unwrap();

        assert!(matches!(errors.try_recv(), Ok(Error::Config(_))));
        assert_eq!(cache.kind(), None);
        assert!(matches!(cache.get("k").await, Err(Error::NotConfigured)));
        assert!(matches!(cache.flush().await, Err(Error::NotConfigured)));
    }

    #[tokio::test]
    async fn test_missing_connection_is_reported() {
        let cache = Dynamis::new("memory", None, Options::default());
        let mut errors = cache.take_errors().unwrap();

        assert!(matches!(errors.try_recv(), Ok(Error::Config(_))));
        assert!(matches!(errors.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(cache.kind(), Some(BackendKind::Memory));
        assert!(matches!(cache.set("k", &1, None).await, Err(Error::NotConfigured)));
    }

    #[tokio::test]
    async fn test_mismatched_connection_is_reported() {
        let cache = Dynamis::new("redis", Some(Connection::memory()), Options::default());
        let mut errors = cache.take_errors().unwrap();
        assert!(matches!(errors.try_recv(), Ok(Error::Config(_))));
        assert!(matches!(cache.del("k").await, Err(Error::NotConfigured)));
    }

    #[tokio::test]
    async fn test_malformed_hooks_are_dropped() {
        let options = Options::new()
            .before("destroy", vec![])
            .before("prepare", vec![])
            .before("flush", vec![]);
        let cache = Dynamis::new("memory", Some(Connection::memory()), options);
        let mut errors = cache.take_errors().unwrap();

        // `destroy` is unknown and memory registers no `prepare`.
        assert!(matches!(errors.try_recv(), Ok(Error::Config(_))));
        assert!(matches!(errors.try_recv(), Ok(Error::Config(_))));
        assert!(matches!(errors.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(cache.hooks(), &[PreHook::Flush]);

        cache.set("k", &1, None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_unsupported_operation() {
        let couch = CouchConnection::new("http://127.0.0.1:5984").unwrap();
        let cache = Dynamis::new("cradle", Some(Connection::Couch(couch)), Options::new().database("dynamis"));

        assert!(!cache.supports(Operation::Expire));
        assert!(matches!(
            cache.expire("k", Duration::from_secs(1)).await,
            Err(Error::Unsupported(Operation::Expire))
        ));
    }

    #[tokio::test]
    async fn test_serialization_failure_skips_backend() {
        let recorder = Arc::new(Recorder::default());
        let cache = Dynamis::with_backend(recorder.clone(), Options::new().before("prepare", vec![]));

        assert!(matches!(cache.set("k", &Cyclic, None).await, Err(Error::Serialization(_))));
        assert!(recorder.calls().is_empty());
        assert!(!cache.is_armed());
    }

    #[tokio::test]
    async fn test_get_as_typed_values() {
        #[derive(Serialize, serde::Deserialize, Debug, PartialEq)]
        struct User {
            name: String,
            age: i32,
        }

        let cache = memory();
        let user = User { name: "Alice".to_string(), age: 30 };
        cache.set("user1", &user, None).await.unwrap();

        assert_eq!(cache.get_as::<User>("user1").await.unwrap(), Some(user));
        assert_eq!(cache.get_as::<User>("missing").await.unwrap(), None);
        assert!(matches!(cache.get_as::<u32>("user1").await, Err(Error::Serialization(_))));
    }

    #[test]
    fn test_take_errors_once() {
        let cache = memory();
        assert!(cache.take_errors().is_some());
        assert!(cache.take_errors().is_none());
    }
}
