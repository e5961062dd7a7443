//! Generation-aware apply for operands
//!
//! An operand is rewritten only when its rendered content changed (tracked by
//! the `spec-hash` annotation) or when its generation moved away from the one
//! recorded after our last write, which means someone else edited it.

use std::collections::HashMap;
use std::sync::Mutex;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::store::ObjectStore;

pub const SPEC_HASH_ANNOTATION: &str = "operator.openshift.io/spec-hash";

/// A resource the operator renders and applies
pub trait Operand:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Carry over fields another controller owns from the live object.
    fn preserve(&mut self, _existing: &Self) {}
}

impl Operand for Deployment {}

impl Operand for DaemonSet {}

fn carry_ca_bundle<'a>(
    required: impl Iterator<Item = (&'a str, &'a mut WebhookClientConfig)>,
    existing: &[(&str, &WebhookClientConfig)],
) {
    for (name, client) in required {
        if let Some((_, live)) = existing.iter().find(|(n, _)| *n == name) {
            if client.ca_bundle.is_none() {
                client.ca_bundle = live.ca_bundle.clone();
            }
        }
    }
}

impl Operand for ValidatingWebhookConfiguration {
    fn preserve(&mut self, existing: &Self) {
        let live: Vec<_> = existing
            .webhooks
            .iter()
            .flatten()
            .map(|w| (w.name.as_str(), &w.client_config))
            .collect();
        carry_ca_bundle(
            self.webhooks
                .iter_mut()
                .flatten()
                .map(|w| (w.name.as_str(), &mut w.client_config)),
            &live,
        );
    }
}

impl Operand for MutatingWebhookConfiguration {
    fn preserve(&mut self, existing: &Self) {
        let live: Vec<_> = existing
            .webhooks
            .iter()
            .flatten()
            .map(|w| (w.name.as_str(), &w.client_config))
            .collect();
        carry_ca_bundle(
            self.webhooks
                .iter_mut()
                .flatten()
                .map(|w| (w.name.as_str(), &mut w.client_config)),
            &live,
        );
    }
}

/// Hash of the rendered object, excluding the hash annotation itself.
pub fn spec_hash<K: Operand>(obj: &K) -> Result<String> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(meta) = value.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        let now_empty = meta
            .get_mut("annotations")
            .and_then(|a| a.as_object_mut())
            .map(|a| {
                a.remove(SPEC_HASH_ANNOTATION);
                a.is_empty()
            })
            .unwrap_or(false);
        if now_empty {
            meta.remove("annotations");
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&value)?);
    Ok(hex::encode(hasher.finalize()))
}

/// Generations observed right after our own writes, keyed by kind and name
#[derive(Debug, Default)]
pub struct GenerationCache {
    generations: Mutex<HashMap<String, i64>>,
}

impl GenerationCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key<K: Operand>(obj: &K) -> String {
        format!(
            "{}/{}/{}",
            K::kind(&()),
            obj.namespace().unwrap_or_default(),
            obj.name_any()
        )
    }

    pub fn expected<K: Operand>(&self, obj: &K) -> Option<i64> {
        self.generations
            .lock()
            .ok()
            .and_then(|g| g.get(&Self::key(obj)).copied())
    }

    pub fn record<K: Operand>(&self, obj: &K) {
        if let (Some(generation), Ok(mut g)) = (obj.meta().generation, self.generations.lock()) {
            g.insert(Self::key(obj), generation);
        }
    }
}

/// Create or update `required`. Returns the live object and whether a write
/// happened.
pub async fn apply<K: Operand>(
    store: &dyn ObjectStore<K>,
    cache: &GenerationCache,
    mut required: K,
) -> Result<(K, bool)> {
    let name = required.name_any();
    let kind = K::kind(&()).to_string();
    let hash = spec_hash(&required)?;
    required
        .annotations_mut()
        .insert(SPEC_HASH_ANNOTATION.to_string(), hash.clone());

    let Some(existing) = store.get(&name).await? else {
        let created = store.create(&required).await?;
        info!(%kind, %name, "Created operand");
        cache.record(&created);
        return Ok((created, true));
    };

    let unchanged = existing.annotations().get(SPEC_HASH_ANNOTATION) == Some(&hash);
    let expected = cache.expected(&existing);
    if unchanged && expected.is_some() && expected == existing.meta().generation {
        debug!(%kind, %name, "Operand up to date");
        return Ok((existing, false));
    }

    let meta = required.meta_mut();
    meta.resource_version = existing.meta().resource_version.clone();
    // Keep labels and annotations others added; ours win on conflict.
    let mut labels = existing.labels().clone();
    labels.extend(meta.labels.take().unwrap_or_default());
    meta.labels = Some(labels);
    let mut annotations = existing.annotations().clone();
    annotations.extend(meta.annotations.take().unwrap_or_default());
    meta.annotations = Some(annotations);
    required.preserve(&existing);

    let updated = match store.update(&required).await {
        Ok(updated) => updated,
        Err(Error::Conflict(msg)) => {
            return Err(Error::Conflict(format!("{kind} {name} changed during apply: {msg}")))
        }
        Err(e) => return Err(e),
    };
    info!(
        %kind,
        %name,
        generation = ?updated.meta().generation,
        "Updated operand"
    );
    cache.record(&updated);
    Ok((updated, true))
}
