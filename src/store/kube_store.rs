//! Object store backed by the Kubernetes API

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::ObjectStore;
use crate::crd::selector;
use crate::error::{Error, Result};

/// Deadline applied to every API call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    api: Api<K>,
    namespace: Option<String>,
    cache: Option<Store<K>>,
    timeout: Duration,
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + 'static,
{
    /// Store for a namespaced kind bound to `namespace`.
    pub fn namespaced(client: Client, namespace: &str) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
    {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: Some(namespace.to_string()),
            cache: None,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Store for a cluster-scoped kind.
    pub fn cluster(client: Client) -> Self {
        Self {
            api: Api::all(client),
            namespace: None,
            cache: None,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Serve `get` and `list` from a reflector cache instead of the API.
    pub fn with_cache(mut self, cache: Store<K>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn kind(&self) -> String {
        K::kind(&()).to_string()
    }

    async fn call<T, F>(&self, verb: &str, name: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| Error::from_kube(&self.kind(), name, e)),
            Err(_) => Err(Error::Transient(format!(
                "{verb} {} {name}: timed out after {:?}",
                self.kind(),
                self.timeout
            ))),
        }
    }

    fn in_scope(&self, obj: &K) -> bool {
        match &self.namespace {
            Some(ns) => obj.namespace().as_deref() == Some(ns.as_str()),
            None => true,
        }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    async fn get(&self, name: &str) -> Result<Option<K>> {
        if let Some(cache) = &self.cache {
            let mut key = ObjectRef::<K>::new(name);
            if let Some(ns) = &self.namespace {
                key = key.within(ns);
            }
            return Ok(cache.get(&key).map(|obj| (*obj).clone()));
        }
        self.call("get", name, self.api.get_opt(name)).await
    }

    async fn list(&self, label_selector: Option<&LabelSelector>) -> Result<Vec<K>> {
        if let Some(cache) = &self.cache {
            return Ok(cache
                .state()
                .into_iter()
                .filter(|obj| self.in_scope(obj))
                .filter(|obj| {
                    label_selector
                        .map(|sel| selector::matches(sel, obj.labels()))
                        .unwrap_or(true)
                })
                .map(|obj| (*obj).clone())
                .collect());
        }

        let mut params = ListParams::default();
        if let Some(sel) = label_selector {
            let query = selector::to_query(sel)?;
            if !query.is_empty() {
                params = params.labels(&query);
            }
        }
        let list = self.call("list", "", self.api.list(&params)).await?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        debug!(kind = %self.kind(), %name, "Creating object");
        self.call("create", &name, self.api.create(&PostParams::default(), obj))
            .await
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        debug!(kind = %self.kind(), %name, "Updating object");
        self.call(
            "update",
            &name,
            self.api.replace(&name, &PostParams::default(), obj),
        )
        .await
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let value = serde_json::to_value(obj)?;
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": value.get("status").cloned().unwrap_or(serde_json::Value::Null),
        });
        self.call(
            "update status",
            &name,
            self.api
                .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
    }

    async fn patch_merge(&self, name: &str, patch: &serde_json::Value) -> Result<K> {
        self.call(
            "patch",
            name,
            self.api
                .patch(name, &PatchParams::default(), &Patch::Merge(patch)),
        )
        .await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        debug!(kind = %self.kind(), %name, "Deleting object");
        match self
            .call("delete", name, self.api.delete(name, &DeleteParams::background()))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
