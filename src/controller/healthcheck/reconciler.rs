//! Node-keyed health check reconcile

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::unhealthy::{self, UnhealthyCondition, Verdict, CONFIG_MAP_NAME};
use crate::clock::Clock;
use crate::controller::metrics;
use crate::crd::{
    parse_machine_annotation, selector, Machine, MachineHealthCheck, MachineHealthCheckStatus,
    MachineSet, TargetStatus, MACHINE_ANNOTATION, NODE_ROLE_MASTER_LABEL,
};
use crate::engine::{Action, ObjectKey, Reconciler};
use crate::error::Result;
use crate::store::ObjectStore;

/// Added to the remaining timeout so the requeued reconcile lands past expiry
const REQUEUE_SLACK: Duration = Duration::from_secs(1);

/// Why a Machine with an expired condition is left alone
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    Master,
    NotOwnedByMachineSet,
    AlreadyDeleting,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Master => write!(f, "machine is a master"),
            SkipReason::NotOwnedByMachineSet => write!(f, "machine has no MachineSet controller"),
            SkipReason::AlreadyDeleting => write!(f, "machine is already being deleted"),
        }
    }
}

/// Safety checks that forbid deleting a Machine automatically.
///
/// A master is recognized by the role labels of either the Machine or its Node.
pub fn skip_reason(machine: &Machine, node: &Node) -> Option<SkipReason> {
    if machine.is_master() || node.labels().contains_key(NODE_ROLE_MASTER_LABEL) {
        return Some(SkipReason::Master);
    }
    let owned_by_set = machine
        .owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.kind == MachineSet::kind(&()));
    if !owned_by_set {
        return Some(SkipReason::NotOwnedByMachineSet);
    }
    if machine.is_deleting() {
        return Some(SkipReason::AlreadyDeleting);
    }
    None
}

/// Whether an MHC targets the Machine. An empty selector targets nothing.
pub fn targets(mhc: &MachineHealthCheck, machine: &Machine) -> bool {
    !selector::is_empty(&mhc.spec.selector) && selector::matches(&mhc.spec.selector, machine.labels())
}

pub struct MachineHealthCheckReconciler {
    nodes: Arc<dyn ObjectStore<Node>>,
    machines: Arc<dyn ObjectStore<Machine>>,
    health_checks: Arc<dyn ObjectStore<MachineHealthCheck>>,
    config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    clock: Arc<dyn Clock>,
}

impl MachineHealthCheckReconciler {
    pub fn new(
        nodes: Arc<dyn ObjectStore<Node>>,
        machines: Arc<dyn ObjectStore<Machine>>,
        health_checks: Arc<dyn ObjectStore<MachineHealthCheck>>,
        config_maps: Arc<dyn ObjectStore<ConfigMap>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            nodes,
            machines,
            health_checks,
            config_maps,
            clock,
        }
    }

    async fn unhealthy_conditions(&self) -> Result<Vec<UnhealthyCondition>> {
        let cm = self.config_maps.get(CONFIG_MAP_NAME).await?;
        if cm.is_none() {
            debug!("{CONFIG_MAP_NAME} not found, using default unhealthy conditions");
        }
        unhealthy::from_config_map(cm.as_ref())
    }

    /// Machine the Node's annotation points at, if it lives in our namespace.
    async fn machine_for(&self, node: &Node) -> Result<Option<Machine>> {
        let Some(value) = node.annotations().get(MACHINE_ANNOTATION) else {
            debug!(node = %node.name_any(), "Node has no machine annotation");
            return Ok(None);
        };
        let Some((namespace, name)) = parse_machine_annotation(value) else {
            warn!(node = %node.name_any(), annotation = %value, "Malformed machine annotation");
            return Ok(None);
        };
        if self.machines.namespace().is_some_and(|ns| ns != namespace) {
            debug!(node = %node.name_any(), %namespace, "Machine outside the watched namespace");
            return Ok(None);
        }
        self.machines.get(name).await
    }

    #[instrument(skip(self, node, machine, health_checks, conditions), fields(node = %node.name_any(), machine = %machine.key()))]
    async fn reconcile_node(
        &self,
        node: &Node,
        machine: &Machine,
        health_checks: &[MachineHealthCheck],
        conditions: &[UnhealthyCondition],
    ) -> Result<Action> {
        let verdict = unhealthy::evaluate(node, conditions, self.clock.now());

        let action = match (verdict, skip_reason(machine, node)) {
            (Verdict::Healthy, _) => {
                debug!("Node is healthy");
                Action::await_change()
            }
            (_, Some(reason)) => {
                info!(%reason, "Node is unhealthy, skipping remediation");
                Action::await_change()
            }
            (Verdict::Pending { remaining }, None) => {
                debug!(?remaining, "Node is unhealthy, waiting for timeout");
                Action::requeue(remaining + REQUEUE_SLACK)
            }
            (Verdict::Expired { condition }, None) => {
                info!(
                    condition = %condition.name,
                    status = %condition.status,
                    timeout = %crate::duration::format(condition.timeout),
                    "Node unhealthy past timeout, deleting Machine"
                );
                match self.machines.delete(&machine.name_any()).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => debug!("Machine already gone"),
                    Err(e) => return Err(e),
                }
                for mhc in health_checks {
                    metrics::inc_remediation(&mhc.namespace().unwrap_or_default(), &mhc.name_any());
                }
                Action::await_change()
            }
        };

        for mhc in health_checks {
            self.update_status(mhc, conditions).await?;
        }
        Ok(action)
    }

    /// Recompute the MHC's status from all its targets and write it if it changed.
    pub async fn update_status(
        &self,
        mhc: &MachineHealthCheck,
        conditions: &[UnhealthyCondition],
    ) -> Result<()> {
        let status = self.calculate_status(mhc, conditions).await?;
        if mhc.status.as_ref() == Some(&status) {
            return Ok(());
        }
        debug!(
            healthcheck = %mhc.name_any(),
            expected = status.expected_machines,
            healthy = status.current_healthy,
            "Updating MachineHealthCheck status"
        );
        let mut updated = mhc.clone();
        updated.status = Some(status);
        match self.health_checks.update_status(&updated).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn calculate_status(
        &self,
        mhc: &MachineHealthCheck,
        conditions: &[UnhealthyCondition],
    ) -> Result<MachineHealthCheckStatus> {
        if selector::is_empty(&mhc.spec.selector) {
            return Ok(MachineHealthCheckStatus::default());
        }
        let mut machines = self.machines.list(Some(&mhc.spec.selector)).await?;
        machines.sort_by_key(|m| m.name_any());

        let mut status = MachineHealthCheckStatus::default();
        for machine in &machines {
            let node = match machine.node_name() {
                Some(name) => self.nodes.get(name).await?,
                None => None,
            };
            let healthy = match &node {
                Some(n) => {
                    let mut any_active = false;
                    for c in unhealthy::active(n, conditions) {
                        any_active = true;
                        let entry = c.to_status();
                        if !status.unhealthy_conditions.contains(&entry) {
                            status.unhealthy_conditions.push(entry);
                        }
                    }
                    !any_active
                }
                None => false,
            };
            if healthy {
                status.current_healthy += 1;
            }
            status.targets.push(TargetStatus {
                machine: machine.name_any(),
                node: node.map(|n| n.name_any()),
                healthy,
            });
        }
        status.expected_machines = status.targets.len() as i32;
        Ok(status)
    }
}

#[async_trait]
impl Reconciler for MachineHealthCheckReconciler {
    fn name(&self) -> &'static str {
        "machinehealthcheck"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(node) = self.nodes.get(&key.name).await? else {
            debug!(%key, "Node not found, nothing to do");
            return Ok(Action::await_change());
        };
        let Some(machine) = self.machine_for(&node).await? else {
            return Ok(Action::await_change());
        };

        let health_checks: Vec<MachineHealthCheck> = self
            .health_checks
            .list(None)
            .await?
            .into_iter()
            .filter(|mhc| targets(mhc, &machine))
            .collect();
        if health_checks.is_empty() {
            debug!(%key, machine = %machine.key(), "No MachineHealthCheck targets this Machine");
            return Ok(Action::await_change());
        }

        let conditions = self.unhealthy_conditions().await?;
        self.reconcile_node(&node, &machine, &health_checks, &conditions)
            .await
    }
}
