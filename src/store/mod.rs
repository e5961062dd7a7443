//! Typed object store
//!
//! Reconcilers talk to the cluster through [`ObjectStore`], never through a
//! raw client. Each store instance is bound to one kind and one namespace (or
//! the cluster scope). Two backends exist:
//!
//! - [`KubeStore`]: kube `Api` calls with a per-call deadline, optionally
//!   serving reads from a reflector cache.
//! - [`MemoryStore`]: in-process objects with resource versions, generations
//!   and finalizer-aware deletion, used by the test suites.

mod kube_store;
mod memory;


use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::error::Result;

pub use kube_store::{KubeStore, DEFAULT_CALL_TIMEOUT};
pub use memory::{MemoryStore, Verb};

/// Optimistic-concurrency object store for a single kind
///
/// `update`, `update_status` and `patch_merge` (when the patch carries
/// `metadata.resourceVersion`) fail with `Error::Conflict` if the stored
/// resource version moved on.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Namespace this store is bound to; `None` for cluster scope.
    fn namespace(&self) -> Option<&str>;

    async fn get(&self, name: &str) -> Result<Option<K>>;

    /// List objects, optionally filtered by a label selector.
    async fn list(&self, selector: Option<&LabelSelector>) -> Result<Vec<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace the object (spec and metadata). Status is ignored.
    async fn update(&self, obj: &K) -> Result<K>;

    /// Replace only the status.
    async fn update_status(&self, obj: &K) -> Result<K>;

    /// Apply an RFC 7386 JSON merge patch.
    async fn patch_merge(&self, name: &str, patch: &serde_json::Value) -> Result<K>;

    /// Request deletion. Deleting an object that is already gone succeeds.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Get an object, mapping absence to `Error::NotFound`.
pub async fn get_required<K, S>(store: &S, kind: &str, name: &str) -> Result<K>
where
    K: Send + Sync + 'static,
    S: ObjectStore<K> + ?Sized,
{
    store
        .get(name)
        .await?
        .ok_or_else(|| crate::error::Error::not_found(kind, name))
}
