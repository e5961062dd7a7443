//! Reflector caches for kinds read outside their own controller
//!
//! A [`Controller`](kube::runtime::Controller) keeps a store of its primary
//! kind. Kinds a reconciler lists without owning, such as the Machines of a
//! MachineSet, get their own reflector here.

use std::fmt::Debug;
use std::future::Future;

use futures::StreamExt;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::runner::ObjectKey;
use super::shutdown::ShutdownSignal;
use crate::error::{Error, Result};

/// A store for `api` and the task that keeps it current until shutdown.
pub fn reflect<K>(
    api: Api<K>,
    mut shutdown: ShutdownSignal,
) -> (Store<K>, impl Future<Output = Result<()>> + Send + 'static)
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let task = async move {
        let kind = K::kind(&()).to_string();
        let stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .touched_objects();
        futures::pin_mut!(stream);

        info!(%kind, "Starting reflector");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = stream.next() => match event {
                    Some(Ok(obj)) => debug!(%kind, object = %obj.name_any(), "Cached"),
                    Some(Err(e)) => warn!(%kind, "Watch error: {e}"),
                    None => break,
                },
            }
        }
        info!(%kind, "Reflector stopped");
        Ok(())
    };
    (reader, task)
}

/// Block until the cache has seen its first full list.
pub async fn wait_for_cache_sync<K>(kind: &str, reader: &Store<K>) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    reader
        .wait_until_ready()
        .await
        .map_err(|e| Error::Fatal(format!("{kind} cache never synced: {e}")))?;
    info!(%kind, objects = reader.state().len(), "Cache synced");
    Ok(())
}

/// Map an object to the key of its controller owner of kind `owner_kind`.
pub fn controller_owner_key<K: Resource>(owner_kind: &str, obj: &K) -> Vec<ObjectKey> {
    obj.owner_references()
        .iter()
        .filter(|r| r.controller == Some(true) && r.kind == owner_kind)
        .map(|r| ObjectKey::new(obj.namespace().as_deref(), &r.name))
        .collect()
}
