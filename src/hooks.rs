//! Pre-hooks and the one-time gate in front of the first dispatched operation.
//!
//! Hooks are configured by operation name (`"flush"`, `"set"`, ...) with a list
//! of arguments, parsed into [`PreHook`] when the instance is built. The
//! [`Gate`] runs them at most once per instance: the first operation to arrive
//! drives the hooks, operations racing it wait for the same resolution, and
//! everything after goes straight through.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde_json::Value;

use crate::engine::{Backend, Operation};
use crate::{Error, Result};

/// A configured operation to run once before the first real one.
#[derive(Debug, Clone, PartialEq)]
pub enum PreHook {
    Prepare,
    Flush,
    Get { key: String },
    Set { key: String, value: Value, ttl: Option<Duration> },
    Del { key: String },
    Expire { key: String, ttl: Duration },
}

impl PreHook {
    /// Builds a hook from its configured name and arguments.
    ///
    /// Keys must be strings and TTLs a non-negative number of seconds.
    ///
    /// ```
    /// use dynamis::PreHook;
    /// use serde_json::json;
    ///
    /// let hook = PreHook::parse("set", &[json!("boot"), json!(true)]).unwrap();
    /// assert_eq!(hook.to_string(), "set");
    /// assert!(PreHook::parse("destroy", &[]).is_err());
    /// ```
    pub fn parse(name: &str, args: &[Value]) -> Result<Self> {
        let operation: Operation = name
            .parse()
            .map_err(|_| Error::Config(format!("pre-hook `{}` does not name an operation", name)))?;

        let hook = match (operation, args) {
            (Operation::Prepare, []) => PreHook::Prepare,
            (Operation::Flush, []) => PreHook::Flush,
            (Operation::Get, [key]) => PreHook::Get { key: key_arg(name, key)? },
            (Operation::Del, [key]) => PreHook::Del { key: key_arg(name, key)? },
            (Operation::Set, [key, value]) => PreHook::Set {
                key: key_arg(name, key)?,
                value: value.clone(),
                ttl: None,
            },
            (Operation::Set, [key, value, ttl]) => PreHook::Set {
                key: key_arg(name, key)?,
                value: value.clone(),
                ttl: Some(ttl_arg(name, ttl)?),
            },
            (Operation::Expire, [key, ttl]) => PreHook::Expire {
                key: key_arg(name, key)?,
                ttl: ttl_arg(name, ttl)?,
            },
            _ => {
                return Err(Error::Config(format!(
                    "pre-hook `{}` does not take {} argument(s)",
                    name,
                    args.len()
                )))
            }
        };
        Ok(hook)
    }

    pub fn operation(&self) -> Operation {
        match self {
            PreHook::Prepare => Operation::Prepare,
            PreHook::Flush => Operation::Flush,
            PreHook::Get { .. } => Operation::Get,
            PreHook::Set { .. } => Operation::Set,
            PreHook::Del { .. } => Operation::Del,
            PreHook::Expire { .. } => Operation::Expire,
        }
    }

    /// Invokes the hook directly on the adapter, bypassing the gate.
    pub async fn run(&self, backend: &dyn Backend) -> Result<()> {
        match self {
            PreHook::Prepare => backend.prepare().await,
            PreHook::Flush => backend.flush().await.map(|_| ()),
            PreHook::Get { key } => backend.get(key).await.map(|_| ()),
            PreHook::Set { key, value, ttl } => backend.set(key, value.clone(), *ttl).await.map(|_| ()),
            PreHook::Del { key } => backend.del(key).await.map(|_| ()),
            PreHook::Expire { key, ttl } => backend.expire(key, *ttl).await.map(|_| ()),
        }
    }
}

impl std::fmt::Display for PreHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.operation().as_str())
    }
}

fn key_arg(hook: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::Config(format!("pre-hook `{}` expects a string key, got {}", hook, value)))
}

fn ttl_arg(hook: &str, value: &Value) -> Result<Duration> {
    value
        .as_f64()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| Error::Config(format!("pre-hook `{}` expects a ttl in seconds, got {}", hook, value)))
}

/// Starts every hook at once and waits for all of them.
///
/// Returns one [`Error::Hook`] per failed hook; an empty list resolves at once.
pub async fn run_all(hooks: &[PreHook], backend: &dyn Backend) -> Vec<Error> {
    let outcomes = join_all(hooks.iter().map(|hook| hook.run(backend))).await;

    hooks
        .iter()
        .zip(outcomes)
        .filter_map(|(hook, outcome)| {
            outcome.err().map(|source| Error::Hook {
                hook: hook.operation(),
                source: Box::new(source),
            })
        })
        .collect()
}

/// The one-time barrier in front of the first dispatched operation.
///
/// Unarmed until its body has run once; a gate with no hooks is born armed.
/// The body runs on its own task, so a caller dropped mid-flight (a timeout,
/// a `select!`) neither cancels it nor lets a later caller start it again.
pub struct Gate {
    hooks: Arc<[PreHook]>,
    armed: AtomicBool,
    run: Mutex<Option<Shared<BoxFuture<'static, ()>>>>,
    fired: AtomicUsize,
}

impl Gate {
    pub fn new(hooks: Vec<PreHook>) -> Self {
        Self {
            armed: AtomicBool::new(hooks.is_empty()),
            hooks: hooks.into(),
            run: Mutex::new(None),
            fired: AtomicUsize::new(0),
        }
    }

    pub fn hooks(&self) -> &[PreHook] {
        &self.hooks
    }

    /// A handle on the hooks that can move into the gate body.
    pub fn shared_hooks(&self) -> Arc<[PreHook]> {
        self.hooks.clone()
    }

    /// Whether the gate has already let an operation through.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// How many times the gate body ran: 0 before the first operation, 1 after.
    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }

    /// Waits until the gate is armed, starting `before` if this caller is first.
    ///
    /// Callers arriving while `before` is in flight wait for it rather than
    /// running it again. Once armed this returns without suspending.
    pub async fn pass<F, Fut>(&self, before: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_armed() {
            return;
        }

        let run = {
            let mut slot = match self.run.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.get_or_insert_with(|| {
                self.fired.fetch_add(1, Ordering::SeqCst);
                let handle = tokio::spawn(before());
                async move {
                    if let Err(e) = handle.await {
                        log::error!("pre-hook task failed: {}", e);
                    }
                }
                .boxed()
                .shared()
            })
            .clone()
        };

        run.await;
        self.armed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("hooks", &self.hooks)
            .field("armed", &self.is_armed())
            .field("fired", &self.fired())
            .finish()
    }
}
