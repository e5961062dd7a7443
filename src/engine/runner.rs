//! Drives a [`Reconciler`] from a kube-runtime [`Controller`]

use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::controller::{self, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use super::backoff::RateLimiter;
use super::shutdown::Shutdown;
use crate::controller::metrics;
use crate::error::{Error, Result};

/// Identity of the object a reconcile is keyed on
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    pub fn cluster(name: &str) -> Self {
        Self::new(None, name)
    }

    pub fn from_obj<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }

    /// The controller trigger for this key as an object of kind `K`.
    pub fn object_ref<K>(&self) -> ObjectRef<K>
    where
        K: Resource<DynamicType = ()>,
    {
        let obj = ObjectRef::new(&self.name);
        match &self.namespace {
            Some(ns) => obj.within(ns),
            None => obj,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// What should happen to a key after a successful reconcile
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile the key again after `duration`.
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Nothing more to do until the next change event.
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

impl From<Action> for controller::Action {
    fn from(action: Action) -> Self {
        match action.requeue_after {
            Some(after) => controller::Action::requeue(after),
            None => controller::Action::await_change(),
        }
    }
}

/// A single-key reconcile function bound to a controller
///
/// Implementations must be safe to re-run: failures are retried and a
/// reconcile may run for a key whose object has since disappeared.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Controller name used in logs and metrics
    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action>;
}

/// Shared state handed to every reconcile of one controller
pub struct Context<R> {
    reconciler: Arc<R>,
    fixed_key: Option<ObjectKey>,
    retries: Mutex<RateLimiter<ObjectKey>>,
    shutdown: Shutdown,
    fatal: Mutex<Option<String>>,
}

impl<R: Reconciler> Context<R> {
    pub fn new(reconciler: Arc<R>, shutdown: Shutdown) -> Self {
        Self {
            reconciler,
            fixed_key: None,
            retries: Mutex::new(RateLimiter::default()),
            shutdown,
            fatal: Mutex::new(None),
        }
    }

    /// Reconcile `key` whichever watched object triggered the run.
    pub fn with_fixed_key(mut self, key: ObjectKey) -> Self {
        self.fixed_key = Some(key);
        self
    }

    fn key_for<K: Resource>(&self, obj: &K) -> ObjectKey {
        self.fixed_key
            .clone()
            .unwrap_or_else(|| ObjectKey::from_obj(obj))
    }

    fn retries(&self) -> MutexGuard<'_, RateLimiter<ObjectKey>> {
        self.retries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_fatal(&self, e: &Error) {
        let mut fatal = self.fatal.lock().unwrap_or_else(|p| p.into_inner());
        fatal.get_or_insert_with(|| e.to_string());
    }

    /// The fatal error that stopped this controller, if any.
    pub fn fatal_error(&self) -> Option<Error> {
        self.fatal
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .map(Error::Fatal)
    }
}

/// Reconcile callback passed to [`Controller::run`].
pub async fn reconcile<K, R>(obj: Arc<K>, ctx: Arc<Context<R>>) -> Result<controller::Action>
where
    K: Resource,
    R: Reconciler,
{
    let key = ctx.key_for(obj.as_ref());
    let name = ctx.reconciler.name();

    metrics::add_reconciles_in_flight(name, 1);
    let started = Instant::now();
    let result = ctx.reconciler.reconcile(&key).await;
    metrics::add_reconciles_in_flight(name, -1);
    metrics::observe_reconcile_duration_seconds(name, started.elapsed().as_secs_f64());

    match result {
        Ok(action) => {
            ctx.retries().forget(&key);
            if let Some(after) = action.requeue_after() {
                debug!(controller = name, %key, ?after, "Requeue requested");
            }
            Ok(action.into())
        }
        Err(e) => {
            metrics::inc_reconcile_error(name, e.kind_label());
            if e.is_fatal() {
                error!(controller = name, %key, "Fatal reconcile error: {e}");
                ctx.record_fatal(&e);
                ctx.shutdown.trigger();
            }
            Err(e)
        }
    }
}

/// Error callback passed to [`Controller::run`]: per-key exponential backoff.
pub fn error_policy<K, R>(obj: Arc<K>, error: &Error, ctx: Arc<Context<R>>) -> controller::Action
where
    K: Resource,
    R: Reconciler,
{
    let key = ctx.key_for(obj.as_ref());
    let name = ctx.reconciler.name();

    if error.is_fatal() {
        return controller::Action::await_change();
    }
    if error.is_not_found() {
        debug!(controller = name, %key, "Object gone: {error}");
        ctx.retries().forget(&key);
        return controller::Action::await_change();
    }

    let (retries, delay) = {
        let mut limiter = ctx.retries();
        let retries = limiter.retries(&key);
        (retries, limiter.when(&key))
    };
    if error.is_retriable() {
        warn!(controller = name, %key, retries, ?delay, "Reconcile failed, retrying: {error}");
    } else {
        error!(controller = name, %key, retries, ?delay, "Reconcile failed: {error}");
    }
    controller::Action::requeue(delay)
}

/// Run `controller` with `concurrency` parallel reconciles until shutdown.
///
/// Returns the fatal error that stopped it, if any.
pub async fn run<K, R>(controller: Controller<K>, ctx: Arc<Context<R>>, concurrency: u16) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    R: Reconciler,
{
    let name = ctx.reconciler.name();
    info!(controller = name, concurrency, "Starting controller");

    controller
        .with_config(controller::Config::default().concurrency(concurrency))
        .graceful_shutdown_on(ctx.shutdown.triggered())
        .run(reconcile::<K, R>, error_policy::<K, R>, Arc::clone(&ctx))
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(controller = name, object = %obj, "Reconciled"),
                // already logged by the error policy
                Err(controller::Error::ReconcilerFailed(_, obj)) => {
                    debug!(controller = name, object = %obj, "Reconcile failed")
                }
                Err(e) => warn!(controller = name, "Controller error: {e}"),
            }
        })
        .await;

    info!(controller = name, "Controller stopped");
    match ctx.fatal_error() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
