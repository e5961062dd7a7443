//! In-process object store
//!
//! Behaves like the API server for the parts reconcilers depend on:
//! resource versions bump on every write, `metadata.generation` bumps when
//! anything outside metadata and status changes, updates with a stale
//! resource version conflict, and deletion of an object with finalizers only
//! sets `deletionTimestamp`.

use std::collections::{BTreeMap, VecDeque};
use std::marker::PhantomData;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::ObjectStore;
use crate::crd::selector;
use crate::error::{Error, Result};

/// Store operation, used for failure injection and the action log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Create,
    Update,
    UpdateStatus,
    Patch,
    Delete,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Value>,
    resource_version: u64,
    uid: u64,
    failures: VecDeque<(Verb, Option<Error>)>,
    actions: Vec<(Verb, String)>,
    frozen: Option<BTreeMap<String, Value>>,
}

pub struct MemoryStore<K> {
    namespace: Option<String>,
    state: Mutex<State>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn namespaced(namespace: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            state: Mutex::new(State::default()),
            _kind: PhantomData,
        }
    }

    pub fn cluster() -> Self {
        Self {
            namespace: None,
            state: Mutex::new(State::default()),
            _kind: PhantomData,
        }
    }

    /// Insert an object as-is, keeping its timestamps. Missing uid and
    /// resource version are filled in.
    pub fn seed(&self, obj: K) -> Result<K> {
        let mut state = self.lock()?;
        let mut value = serde_json::to_value(&obj)?;
        let name = obj.name_any();
        state.resource_version += 1;
        state.uid += 1;
        let (rv, uid) = (state.resource_version, state.uid);
        let meta = metadata_mut(&mut value)?;
        meta.insert("resourceVersion".into(), Value::String(rv.to_string()));
        if !meta.contains_key("uid") {
            meta.insert("uid".into(), Value::String(format!("uid-{uid}")));
        }
        if !meta.contains_key("generation") {
            meta.insert("generation".into(), Value::from(1));
        }
        if let Some(ns) = &self.namespace {
            meta.insert("namespace".into(), Value::String(ns.clone()));
        }
        state.objects.insert(name, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    /// Make the next write with this verb fail with a transient error.
    pub fn fail_next(&self, verb: Verb) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.push_back((verb, None));
        }
    }

    /// Make the next write with this verb fail with `error`.
    pub fn fail_next_with(&self, verb: Verb, error: Error) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.push_back((verb, Some(error)));
        }
    }

    /// Serve `get` and `list` from a snapshot of the current objects, the way
    /// a lagging watch cache would, until [`MemoryStore::thaw_reads`].
    /// Writes still apply to the live objects.
    pub fn freeze_reads(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.frozen = Some(state.objects.clone());
        }
    }

    pub fn thaw_reads(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.frozen = None;
        }
    }

    /// Writes performed so far, in order.
    pub fn actions(&self) -> Vec<(Verb, String)> {
        self.state
            .lock()
            .map(|s| s.actions.clone())
            .unwrap_or_default()
    }

    pub fn clear_actions(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.actions.clear();
        }
    }

    /// Snapshot of every stored object.
    pub fn objects(&self) -> Vec<K> {
        self.state
            .lock()
            .map(|s| {
                s.objects
                    .values()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Fatal("memory store lock poisoned".to_string()))
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    fn begin_write(&self, state: &mut State, verb: Verb, name: &str) -> Result<()> {
        if let Some(pos) = state.failures.iter().position(|(v, _)| *v == verb) {
            let injected = state.failures.remove(pos).and_then(|(_, e)| e);
            return Err(injected.unwrap_or_else(|| {
                Error::Transient(format!("injected {verb:?} failure for {} {name}", Self::kind()))
            }));
        }
        state.actions.push((verb, name.to_string()));
        Ok(())
    }

    fn check_resource_version(stored: &Value, incoming: Option<&str>, name: &str) -> Result<()> {
        let Some(incoming) = incoming else {
            return Ok(());
        };
        let current = stored
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if incoming != current {
            return Err(Error::Conflict(format!(
                "{} {name}: resourceVersion {incoming} is stale (current {current})",
                Self::kind()
            )));
        }
        Ok(())
    }

    /// Store `next`, bumping resourceVersion and (if content changed) generation.
    /// A deleting object whose finalizers are all gone is removed.
    fn commit(state: &mut State, name: &str, previous: &Value, mut next: Value) -> Result<K> {
        state.resource_version += 1;
        let rv = state.resource_version;
        let generation = previous
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let bump = content(previous) != content(&next);

        let meta = metadata_mut(&mut next)?;
        meta.insert("resourceVersion".into(), Value::String(rv.to_string()));
        meta.insert(
            "generation".into(),
            Value::from(if bump { generation + 1 } else { generation }),
        );

        let deleting = meta.contains_key("deletionTimestamp");
        let finalizers_empty = meta
            .get("finalizers")
            .and_then(Value::as_array)
            .map(Vec::is_empty)
            .unwrap_or(true);
        if deleting && finalizers_empty {
            state.objects.remove(name);
        } else {
            state.objects.insert(name.to_string(), next.clone());
        }
        Ok(serde_json::from_value(next)?)
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    async fn get(&self, name: &str) -> Result<Option<K>> {
        let state = self.lock()?;
        let objects = state.frozen.as_ref().unwrap_or(&state.objects);
        match objects.get(name) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    async fn list(&self, label_selector: Option<&LabelSelector>) -> Result<Vec<K>> {
        let state = self.lock()?;
        let mut out = Vec::new();
        let objects = state.frozen.as_ref().unwrap_or(&state.objects);
        for value in objects.values() {
            let obj: K = serde_json::from_value(value.clone())?;
            let matched = label_selector
                .map(|sel| selector::matches(sel, obj.labels()))
                .unwrap_or(true);
            if matched {
                out.push(obj);
            }
        }
        Ok(out)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let mut state = self.lock()?;
        let mut value = serde_json::to_value(obj)?;
        let mut name = obj.meta().name.clone().unwrap_or_default();
        if name.is_empty() {
            let prefix = obj.meta().generate_name.clone().ok_or_else(|| {
                Error::Invalid(format!("{}: name or generateName is required", Self::kind()))
            })?;
            name = format!("{prefix}{:05}", state.uid + 1);
        }
        if state.objects.contains_key(&name) {
            return Err(Error::Conflict(format!(
                "{} {name} already exists",
                Self::kind()
            )));
        }
        self.begin_write(&mut state, Verb::Create, &name)?;

        state.resource_version += 1;
        state.uid += 1;
        let (rv, uid) = (state.resource_version, state.uid);
        let meta = metadata_mut(&mut value)?;
        meta.insert("name".into(), Value::String(name.clone()));
        meta.insert("resourceVersion".into(), Value::String(rv.to_string()));
        meta.insert("uid".into(), Value::String(format!("uid-{uid}")));
        meta.insert("generation".into(), Value::from(1));
        meta.insert(
            "creationTimestamp".into(),
            serde_json::to_value(Time(chrono::Utc::now()))?,
        );
        meta.remove("deletionTimestamp");
        if let Some(ns) = &self.namespace {
            meta.insert("namespace".into(), Value::String(ns.clone()));
        }

        state.objects.insert(name, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let mut state = self.lock()?;
        let name = obj.name_any();
        let previous = state
            .objects
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::not_found(Self::kind(), &name))?;
        Self::check_resource_version(&previous, obj.meta().resource_version.as_deref(), &name)?;
        self.begin_write(&mut state, Verb::Update, &name)?;

        let mut next = serde_json::to_value(obj)?;
        // status and server-owned metadata are not writable through update
        if let Some(map) = next.as_object_mut() {
            match previous.get("status") {
                Some(status) => map.insert("status".into(), status.clone()),
                None => map.remove("status"),
            };
        }
        preserve_server_fields(&previous, &mut next)?;

        Self::commit(&mut state, &name, &previous, next)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let mut state = self.lock()?;
        let name = obj.name_any();
        let previous = state
            .objects
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::not_found(Self::kind(), &name))?;
        Self::check_resource_version(&previous, obj.meta().resource_version.as_deref(), &name)?;
        self.begin_write(&mut state, Verb::UpdateStatus, &name)?;

        let incoming = serde_json::to_value(obj)?;
        let mut next = previous.clone();
        if let Some(map) = next.as_object_mut() {
            match incoming.get("status") {
                Some(status) => map.insert("status".into(), status.clone()),
                None => map.remove("status"),
            };
        }

        Self::commit(&mut state, &name, &previous, next)
    }

    async fn patch_merge(&self, name: &str, patch: &Value) -> Result<K> {
        let mut state = self.lock()?;
        let previous = state
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(Self::kind(), name))?;
        Self::check_resource_version(
            &previous,
            patch
                .pointer("/metadata/resourceVersion")
                .and_then(Value::as_str),
            name,
        )?;
        self.begin_write(&mut state, Verb::Patch, name)?;

        let mut next = previous.clone();
        merge_patch(&mut next, patch);
        preserve_server_fields(&previous, &mut next)?;
        // validate the result still deserializes before committing
        let _: K = serde_json::from_value(next.clone())
            .map_err(|e| Error::Invalid(format!("{} {name}: {e}", Self::kind())))?;

        Self::commit(&mut state, name, &previous, next)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut state = self.lock()?;
        let Some(previous) = state.objects.get(name).cloned() else {
            return Ok(());
        };
        self.begin_write(&mut state, Verb::Delete, name)?;

        let has_finalizers = previous
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .map(|f| !f.is_empty())
            .unwrap_or(false);
        if !has_finalizers {
            state.objects.remove(name);
            return Ok(());
        }
        if previous.pointer("/metadata/deletionTimestamp").is_some() {
            return Ok(());
        }

        let mut next = previous.clone();
        metadata_mut(&mut next)?.insert(
            "deletionTimestamp".into(),
            serde_json::to_value(Time(chrono::Utc::now()))?,
        );
        Self::commit(&mut state, name, &previous, next)?;
        Ok(())
    }
}

fn metadata_mut(value: &mut Value) -> Result<&mut serde_json::Map<String, Value>> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| Error::Invalid("object is not a JSON map".to_string()))?;
    obj.entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()))
        .as_object_mut()
        .ok_or_else(|| Error::Invalid("metadata is not a JSON map".to_string()))
}

/// Fields only the server sets, carried over from the stored copy.
fn preserve_server_fields(previous: &Value, next: &mut Value) -> Result<()> {
    let meta = metadata_mut(next)?;
    for key in ["uid", "creationTimestamp", "generation", "namespace", "deletionTimestamp"] {
        match previous.pointer(&format!("/metadata/{key}")) {
            Some(v) => meta.insert(key.to_string(), v.clone()),
            None => meta.remove(key),
        };
    }
    Ok(())
}

/// Everything that counts toward `metadata.generation`.
fn content(value: &Value) -> Value {
    let mut v = value.clone();
    if let Some(map) = v.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    v
}

/// RFC 7386 JSON merge patch
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(
                    target_map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}
