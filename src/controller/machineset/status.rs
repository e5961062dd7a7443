//! MachineSet status rollup

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use crate::controller::nodes;
use crate::crd::{selector, Machine, MachineSet, MachineSetStatus};

/// Compute the status for `ms` from its owned Machines and their Nodes.
///
/// `nodes` is keyed by Node name; Machines whose Node is missing count as
/// not ready. A Machine is available once its Node has been Ready for at
/// least `minReadySeconds`.
pub fn calculate(
    ms: &MachineSet,
    owned: &[Machine],
    nodes: &BTreeMap<String, Node>,
    now: DateTime<Utc>,
) -> MachineSetStatus {
    let template_labels = &ms.spec.template.metadata.labels;
    let min_ready = Duration::seconds(i64::from(ms.spec.min_ready_seconds.max(0)));

    let mut fully_labeled = 0;
    let mut ready = 0;
    let mut available = 0;

    for machine in owned {
        let labels = machine.labels();
        if template_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
        {
            fully_labeled += 1;
        }

        let Some(node) = machine.node_name().and_then(|n| nodes.get(n)) else {
            continue;
        };
        if !nodes::is_ready(node) {
            continue;
        }
        ready += 1;

        let available_since = nodes::ready_since(node).map(|t| t + min_ready);
        if ms.spec.min_ready_seconds <= 0 || available_since.is_some_and(|t| t <= now) {
            available += 1;
        }
    }

    let previous = ms.status.clone().unwrap_or_default();
    MachineSetStatus {
        replicas: owned.len() as i32,
        fully_labeled_replicas: fully_labeled,
        ready_replicas: ready,
        available_replicas: available,
        observed_generation: ms.metadata.generation.unwrap_or_default(),
        label_selector: selector::to_query(&ms.spec.selector).ok(),
        error_reason: previous.error_reason,
        error_message: previous.error_message,
    }
}
