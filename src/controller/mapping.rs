//! Map watched objects to the reconcile keys that depend on them

use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::{Resource, ResourceExt};

use super::healthcheck::unhealthy;
use super::operator::render::TRUSTED_CA_CONFIG_MAP;
use crate::crd::{parse_machine_annotation, selector, Machine, MachineSet, MACHINE_ANNOTATION};
use crate::engine::{controller_owner_key, ObjectKey};

/// MachineSets that should look at `machine`: its controller owner, or for an
/// orphan every MachineSet in its namespace whose selector matches it.
pub fn machine_set_keys_for_machine<'a, I>(machine: &Machine, machine_sets: I) -> Vec<ObjectKey>
where
    I: IntoIterator<Item = &'a MachineSet>,
{
    let owned = controller_owner_key(&MachineSet::kind(&()), machine);
    if !owned.is_empty() {
        return owned;
    }
    let namespace = machine.namespace();
    machine_sets
        .into_iter()
        .filter(|ms| ms.namespace() == namespace)
        .filter(|ms| {
            !selector::is_empty(&ms.spec.selector)
                && selector::matches(&ms.spec.selector, machine.labels())
        })
        .map(ObjectKey::from_obj)
        .collect()
}

/// `(namespace, name)` of the Machine a Node is annotated with.
pub fn machine_ref_for_node(node: &Node) -> Option<(String, String)> {
    let value = node.annotations().get(MACHINE_ANNOTATION)?;
    let (ns, name) = parse_machine_annotation(value)?;
    Some((ns.to_string(), name.to_string()))
}

/// Node reconcile key for the Node a Machine is bound to.
pub fn node_keys_for_machine(machine: &Machine) -> Vec<ObjectKey> {
    machine
        .node_name()
        .map(|node| vec![ObjectKey::cluster(node)])
        .unwrap_or_default()
}

/// Every Node, when `cm` holds the unhealthy condition configuration.
pub fn node_keys_for_config_map<'a, I>(cm: &ConfigMap, nodes: I) -> Vec<ObjectKey>
where
    I: IntoIterator<Item = &'a Node>,
{
    if cm.name_any() != unhealthy::CONFIG_MAP_NAME {
        return Vec::new();
    }
    nodes.into_iter().map(ObjectKey::from_obj).collect()
}

/// Whether a ConfigMap change affects the rendered operands.
pub fn is_operator_config_map(cm: &ConfigMap) -> bool {
    cm.name_any() == TRUSTED_CA_CONFIG_MAP
}
