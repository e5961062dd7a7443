//! MachineSet replica control loop

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::{delete_policy, status};
use crate::clock::Clock;
use crate::controller::metrics;
use crate::crd::{selector, Machine, MachineSet};
use crate::engine::{Action, ObjectKey, Reconciler};
use crate::error::{Error, Result};
use crate::store::ObjectStore;

/// Most Machines created or deleted in one reconcile
pub const BURST_REPLICAS: usize = 500;

/// Alphabet used for generated name suffixes (no vowels, no look-alikes)
const NAME_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const NAME_SUFFIX_LEN: usize = 5;
const MAX_NAME_LEN: usize = 63;

/// How often, and for how long, to wait for our own writes to reach the cache
const CACHE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CACHE_POLL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MachineSetReconciler {
    machine_sets: Arc<dyn ObjectStore<MachineSet>>,
    machines: Arc<dyn ObjectStore<Machine>>,
    nodes: Arc<dyn ObjectStore<Node>>,
    clock: Arc<dyn Clock>,
    rng_seed: Option<u64>,
    passes: AtomicU64,
}

impl MachineSetReconciler {
    pub fn new(
        machine_sets: Arc<dyn ObjectStore<MachineSet>>,
        machines: Arc<dyn ObjectStore<Machine>>,
        nodes: Arc<dyn ObjectStore<Node>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            machine_sets,
            machines,
            nodes,
            clock,
            rng_seed: None,
            passes: AtomicU64::new(0),
        }
    }

    /// Seed name generation and the Random delete policy.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    fn rng(&self) -> StdRng {
        let pass = self.passes.fetch_add(1, Ordering::Relaxed);
        match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(pass)),
            None => StdRng::from_entropy(),
        }
    }

    #[instrument(skip(self, ms), fields(name = %ms.name_any(), namespace = ms.namespace()))]
    async fn reconcile_machine_set(&self, ms: &MachineSet) -> Result<Action> {
        let mut rng = self.rng();

        // Claim: the full namespace listing is needed to find owned Machines
        // whose labels no longer match.
        let all = self.machines.list(None).await?;
        let owned = self.claim_machines(ms, all).await?;

        let errors = self.sync_replicas(ms, &owned, &mut rng).await;

        let status = self.calculate_status(ms, &owned).await?;
        metrics::set_machine_set_replicas(
            &ms.namespace().unwrap_or_default(),
            &ms.name_any(),
            ms.spec.replicas,
            status.replicas,
            status.ready_replicas,
            status.available_replicas,
        );
        let ready = status.ready_replicas;
        let available = status.available_replicas;
        self.update_status(ms, status).await?;

        Error::aggregate(errors)?;

        // No event fires when a Machine crosses minReadySeconds, so poll for it.
        if ms.spec.min_ready_seconds > 0
            && ready == ms.spec.replicas
            && available != ms.spec.replicas
        {
            return Ok(Action::requeue(Duration::from_secs(
                ms.spec.min_ready_seconds as u64,
            )));
        }
        Ok(Action::await_change())
    }

    /// Adopt matching orphans, release owned Machines that stopped matching,
    /// and return the Machines this set owns.
    async fn claim_machines(&self, ms: &MachineSet, all: Vec<Machine>) -> Result<Vec<Machine>> {
        let ms_uid = ms.uid().unwrap_or_default();
        let mut owned = Vec::new();
        let mut errors = Vec::new();

        for machine in all {
            let matches = selector::matches(&ms.spec.selector, machine.labels());
            let controller = controller_ref(&machine).cloned();

            match controller {
                Some(owner) if owner.uid != ms_uid => continue,
                Some(_) if matches => owned.push(machine),
                Some(_) => {
                    if machine.is_deleting() {
                        continue;
                    }
                    match self.release(ms, &machine).await {
                        Ok(()) => info!(machine = %machine.name_any(), "Released Machine whose labels no longer match"),
                        Err(e) if e.is_not_found() => {}
                        Err(e) => errors.push(e),
                    }
                }
                None => {
                    if !matches || machine.is_deleting() {
                        continue;
                    }
                    match self.adopt(ms, &machine).await {
                        Ok(adopted) => {
                            info!(machine = %machine.name_any(), "Adopted orphan Machine");
                            owned.push(adopted);
                        }
                        Err(e) if e.is_not_found() => {}
                        Err(e) => errors.push(e),
                    }
                }
            }
        }

        // A failed claim would make the replica count unreliable.
        Error::aggregate(errors)?;
        Ok(owned)
    }

    async fn adopt(&self, ms: &MachineSet, machine: &Machine) -> Result<Machine> {
        let owner = owner_reference(ms)?;
        let mut refs = machine.owner_references().to_vec();
        refs.push(owner);
        let patch = json!({
            "metadata": {
                "ownerReferences": refs,
                "resourceVersion": machine.resource_version(),
            }
        });
        self.machines.patch_merge(&machine.name_any(), &patch).await
    }

    async fn release(&self, ms: &MachineSet, machine: &Machine) -> Result<()> {
        let ms_uid = ms.uid().unwrap_or_default();
        let refs: Vec<&OwnerReference> = machine
            .owner_references()
            .iter()
            .filter(|r| r.uid != ms_uid)
            .collect();
        let patch = json!({
            "metadata": {
                "ownerReferences": refs,
                "resourceVersion": machine.resource_version(),
            }
        });
        self.machines
            .patch_merge(&machine.name_any(), &patch)
            .await
            .map(|_| ())
    }

    /// Create or delete Machines so the owned count moves toward spec.replicas.
    /// Per-Machine failures are collected, not returned early.
    async fn sync_replicas(
        &self,
        ms: &MachineSet,
        owned: &[Machine],
        rng: &mut StdRng,
    ) -> Vec<Error> {
        let desired = ms.spec.replicas.max(0) as usize;
        let mut errors = Vec::new();
        let mut created = Vec::new();
        let mut deleted = Vec::new();

        if owned.len() < desired {
            let count = (desired - owned.len()).min(BURST_REPLICAS);
            info!(
                current = owned.len(),
                desired, count, "Too few replicas, creating Machines"
            );
            for _ in 0..count {
                let machine = match machine_from_template(ms, rng) {
                    Ok(m) => m,
                    Err(e) => {
                        errors.push(e);
                        break;
                    }
                };
                match self.machines.create(&machine).await {
                    Ok(machine) => {
                        debug!(machine = %machine.name_any(), "Created Machine");
                        created.push(machine.name_any());
                    }
                    Err(e) => {
                        warn!(machine = %machine.name_any(), "Failed to create Machine: {e}");
                        errors.push(e);
                    }
                }
            }
        } else if owned.len() > desired {
            let count = (owned.len() - desired).min(BURST_REPLICAS);
            let victims = delete_policy::select(ms.spec.delete_policy, owned, count, rng);
            info!(
                current = owned.len(),
                desired,
                policy = %ms.spec.delete_policy,
                "Too many replicas, deleting Machines"
            );
            for machine in victims {
                if machine.is_deleting() {
                    debug!(machine = %machine.name_any(), "Machine already deleting");
                    continue;
                }
                match self.machines.delete(&machine.name_any()).await {
                    Ok(()) => {
                        info!(machine = %machine.name_any(), "Deleted Machine");
                        deleted.push(machine.name_any());
                    }
                    Err(e) => {
                        warn!(machine = %machine.name_any(), "Failed to delete Machine: {e}");
                        errors.push(e);
                    }
                }
            }
        }

        // The next reconcile must not count from a cache that misses these writes.
        if let Err(e) = self
            .wait_for_machines(&created, "created", |m| m.is_some())
            .await
        {
            errors.push(e);
        }
        if let Err(e) = self
            .wait_for_machines(&deleted, "deleted", |m| m.map_or(true, Machine::is_deleting))
            .await
        {
            errors.push(e);
        }

        errors
    }

    /// Poll the Machine store until `done` holds for every name.
    async fn wait_for_machines<F>(&self, names: &[String], what: &str, done: F) -> Result<()>
    where
        F: Fn(Option<&Machine>) -> bool,
    {
        if names.is_empty() {
            return Ok(());
        }
        let poll = async {
            for name in names {
                loop {
                    let machine = self.machines.get(name).await?;
                    if done(machine.as_ref()) {
                        break;
                    }
                    tokio::time::sleep(CACHE_POLL_INTERVAL).await;
                }
            }
            Ok::<(), Error>(())
        };
        match tokio::time::timeout(CACHE_POLL_TIMEOUT, poll).await {
            Ok(result) => result,
            Err(_) => {
                warn!(count = names.len(), "Timed out waiting for {what} Machines in the cache");
                Err(Error::Transient(format!(
                    "{} {what} Machines not observed within {CACHE_POLL_TIMEOUT:?}",
                    names.len()
                )))
            }
        }
    }

    async fn calculate_status(
        &self,
        ms: &MachineSet,
        owned: &[Machine],
    ) -> Result<crate::crd::MachineSetStatus> {
        let mut nodes = BTreeMap::new();
        for name in owned.iter().filter_map(Machine::node_name) {
            if let Some(node) = self.nodes.get(name).await? {
                nodes.insert(name.to_string(), node);
            }
        }
        Ok(status::calculate(ms, owned, &nodes, self.clock.now()))
    }

    async fn update_status(
        &self,
        ms: &MachineSet,
        status: crate::crd::MachineSetStatus,
    ) -> Result<()> {
        if ms.status.as_ref() == Some(&status) {
            return Ok(());
        }
        debug!(
            replicas = status.replicas,
            ready = status.ready_replicas,
            available = status.available_replicas,
            "Updating MachineSet status"
        );
        let mut updated = ms.clone();
        updated.status = Some(status);
        self.machine_sets.update_status(&updated).await?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for MachineSetReconciler {
    fn name(&self) -> &'static str {
        "machineset"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(ms) = self.machine_sets.get(&key.name).await? else {
            debug!(%key, "MachineSet not found, nothing to do");
            return Ok(Action::await_change());
        };

        if ms.meta().deletion_timestamp.is_some() {
            debug!(%key, "MachineSet is being deleted, leaving Machines to garbage collection");
            return Ok(Action::await_change());
        }

        if selector::is_empty(&ms.spec.selector) {
            warn!(%key, "MachineSet has an empty selector, refusing to manage every Machine");
            return Ok(Action::await_change());
        }

        if !selector::matches(&ms.spec.selector, &ms.spec.template.metadata.labels) {
            return Err(Error::ConfigError(format!(
                "MachineSet {key}: template labels do not match the selector"
            )));
        }

        self.reconcile_machine_set(&ms).await
    }
}

fn controller_ref(machine: &Machine) -> Option<&OwnerReference> {
    machine
        .owner_references()
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Controller owner reference pointing at `ms`
pub fn owner_reference(ms: &MachineSet) -> Result<OwnerReference> {
    let uid = ms.uid().ok_or_else(|| {
        Error::Invalid(format!(
            "MachineSet {} has no uid yet, cannot own Machines",
            ms.name_any()
        ))
    })?;
    Ok(OwnerReference {
        api_version: MachineSet::api_version(&()).to_string(),
        kind: MachineSet::kind(&()).to_string(),
        name: ms.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// `<base>-xxxxx`, truncating the base so the name stays a valid object name.
pub fn generate_name<R: Rng + ?Sized>(base: &str, rng: &mut R) -> String {
    let prefix = format!("{base}-");
    let prefix: String = prefix
        .chars()
        .take(MAX_NAME_LEN - NAME_SUFFIX_LEN)
        .collect();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
        .collect();
    format!("{prefix}{suffix}")
}

/// Build a new Machine from the set's template.
pub fn machine_from_template<R: Rng + ?Sized>(ms: &MachineSet, rng: &mut R) -> Result<Machine> {
    let template = &ms.spec.template;
    let mut machine = Machine::new(&generate_name(&ms.name_any(), rng), template.spec.clone());
    machine.metadata.namespace = ms.namespace();
    machine.metadata.labels = Some(template.metadata.labels.clone());
    if !template.metadata.annotations.is_empty() {
        machine.metadata.annotations = Some(template.metadata.annotations.clone());
    }
    machine.metadata.owner_references = Some(vec![owner_reference(ms)?]);
    Ok(machine)
}
