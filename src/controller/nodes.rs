//! Node helpers shared by the MachineSet and health check controllers

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, NodeCondition};

/// Find a Node condition by type.
pub fn find_condition<'a>(node: &'a Node, type_: &str) -> Option<&'a NodeCondition> {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == type_))
}

/// True when the Node reports Ready=True.
pub fn is_ready(node: &Node) -> bool {
    find_condition(node, "Ready")
        .map(|c| c.status == "True")
        .unwrap_or(false)
}

/// When the Ready condition last transitioned, if the Node is Ready.
pub fn ready_since(node: &Node) -> Option<DateTime<Utc>> {
    find_condition(node, "Ready")
        .filter(|c| c.status == "True")
        .and_then(|c| c.last_transition_time.as_ref())
        .map(|t| t.0)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    /// Node with one condition and an optional machine annotation
    pub fn node(name: &str, machine: Option<&str>, conditions: &[(&str, &str, DateTime<Utc>)]) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        if let Some(m) = machine {
            node.metadata.annotations = Some(BTreeMap::from([(
                crate::crd::MACHINE_ANNOTATION.to_string(),
                m.to_string(),
            )]));
        }
        node.status = Some(NodeStatus {
            conditions: Some(
                conditions
                    .iter()
                    .map(|(type_, status, at)| NodeCondition {
                        type_: type_.to_string(),
                        status: status.to_string(),
                        last_transition_time: Some(Time(*at)),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        });
        node
    }
}

#[cfg(test)]
mod tests {
    use super::testing::node;
    use super::*;

    #[test]
    fn test_ready_since() {
        let at = Utc::now();
        let ready = node("a", None, &[("Ready", "True", at)]);
        assert!(is_ready(&ready));
        assert_eq!(ready_since(&ready), Some(at));

        let not_ready = node("b", None, &[("Ready", "False", at)]);
        assert!(!is_ready(&not_ready));
        assert_eq!(ready_since(&not_ready), None);

        assert!(!is_ready(&Node::default()));
    }
}
