//! Machine custom resource
//!
//! A Machine is the desired instance of a compute node. Providers realize it
//! and set `providerID`; the node link controller binds `nodeRef` once a Node
//! carrying the matching annotation shows up.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::TemplateMeta;

/// Node annotation linking a Node to its Machine ("<namespace>/<name>")
pub const MACHINE_ANNOTATION: &str = "machine.openshift.io/machine";

/// Machine annotation marking it as preferred for scale-down
pub const DELETE_MACHINE_ANNOTATION: &str = "machine.openshift.io/delete-machine";

/// Older spelling of [`DELETE_MACHINE_ANNOTATION`], still honored
pub const OLD_DELETE_MACHINE_ANNOTATION: &str = "cluster.k8s.io/delete-machine";

/// Machine role label
pub const MACHINE_ROLE_LABEL: &str = "machine.openshift.io/cluster-api-machine-role";

/// Machine type label
pub const MACHINE_TYPE_LABEL: &str = "machine.openshift.io/cluster-api-machine-type";

/// Node role label for control-plane nodes
pub const NODE_ROLE_MASTER_LABEL: &str = "node-role.kubernetes.io/master";

/// Machine lifecycle phase
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum MachinePhase {
    Provisioning,
    Provisioned,
    Running,
    Failed,
    Deleting,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MachinePhase::Provisioning => "Provisioning",
            MachinePhase::Provisioned => "Provisioned",
            MachinePhase::Running => "Running",
            MachinePhase::Failed => "Failed",
            MachinePhase::Deleting => "Deleting",
            MachinePhase::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

/// Opaque provider configuration, passed through to the provider controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ProviderSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "Machine",
    namespaced,
    status = "MachineStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeRef.name"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".spec.providerID","priority":1}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Labels and annotations propagated to the Node
    #[serde(default)]
    pub metadata: TemplateMeta,

    #[serde(default)]
    pub provider_spec: ProviderSpec,

    /// Set once the infrastructure provider has realized the Machine
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Node bound to this Machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub node_ref: Option<ObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<MachinePhase>,

    /// Terminal problem reported by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<serde_json::Value>,
}

impl Machine {
    pub fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    pub fn phase(&self) -> Option<MachinePhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    pub fn node_ref(&self) -> Option<&ObjectReference> {
        self.status.as_ref().and_then(|s| s.node_ref.as_ref())
    }

    /// Name of the bound Node, if any
    pub fn node_name(&self) -> Option<&str> {
        self.node_ref().and_then(|r| r.name.as_deref())
    }

    /// True when the provider reported an error reason or message.
    pub fn has_error(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.error_reason.as_deref().is_some_and(|r| !r.is_empty())
                    || s.error_message.as_deref().is_some_and(|m| !m.is_empty())
            })
            .unwrap_or(false)
    }

    /// True when either delete annotation carries a non-empty value.
    pub fn is_marked_for_deletion(&self) -> bool {
        let annotations = self.annotations();
        [DELETE_MACHINE_ANNOTATION, OLD_DELETE_MACHINE_ANNOTATION]
            .iter()
            .any(|key| annotations.get(*key).is_some_and(|v| !v.is_empty()))
    }

    /// True for control-plane Machines.
    pub fn is_master(&self) -> bool {
        let labels = self.labels();
        labels.get(MACHINE_ROLE_LABEL).map(String::as_str) == Some("master")
            || labels.get(MACHINE_TYPE_LABEL).map(String::as_str) == Some("master")
            || labels.contains_key(NODE_ROLE_MASTER_LABEL)
    }

    pub fn creation_time(&self) -> Option<DateTime<Utc>> {
        self.meta().creation_timestamp.as_ref().map(|t| t.0)
    }

    /// "<namespace>/<name>", the form used by the Node machine annotation.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }
}

/// Parse a Node `machine` annotation into (namespace, name).
pub fn parse_machine_annotation(value: &str) -> Option<(&str, &str)> {
    let (ns, name) = value.split_once('/')?;
    if ns.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((ns, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn machine_with_annotations(pairs: &[(&str, &str)]) -> Machine {
        let mut m = Machine::new("m", MachineSpec::default());
        m.metadata.annotations = Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        m
    }

    #[test]
    fn test_delete_annotation_spellings() {
        assert!(machine_with_annotations(&[(DELETE_MACHINE_ANNOTATION, "yes")]).is_marked_for_deletion());
        assert!(machine_with_annotations(&[(OLD_DELETE_MACHINE_ANNOTATION, "true")]).is_marked_for_deletion());
        assert!(!machine_with_annotations(&[(DELETE_MACHINE_ANNOTATION, "")]).is_marked_for_deletion());
        assert!(!machine_with_annotations(&[]).is_marked_for_deletion());
    }

    #[test]
    fn test_has_error() {
        let mut m = Machine::new("m", MachineSpec::default());
        assert!(!m.has_error());

        m.status = Some(MachineStatus {
            error_message: Some("instance terminated".to_string()),
            ..Default::default()
        });
        assert!(m.has_error());
    }

    #[test]
    fn test_phase_roundtrip_unknown() {
        let status: MachineStatus = serde_json::from_str(r#"{"phase":"Rebooting"}"#).unwrap();
        assert_eq!(status.phase, Some(MachinePhase::Unknown));

        let status: MachineStatus = serde_json::from_str(r#"{"phase":"Running"}"#).unwrap();
        assert_eq!(status.phase, Some(MachinePhase::Running));
    }

    #[test]
    fn test_parse_machine_annotation() {
        assert_eq!(
            parse_machine_annotation("openshift-machine-api/worker-a"),
            Some(("openshift-machine-api", "worker-a"))
        );
        assert_eq!(parse_machine_annotation("worker-a"), None);
        assert_eq!(parse_machine_annotation("/worker-a"), None);
        assert_eq!(parse_machine_annotation("a/b/c"), None);
    }

    #[test]
    fn test_is_master() {
        let mut m = Machine::new("m", MachineSpec::default());
        m.metadata.labels = Some(BTreeMap::from([(
            MACHINE_ROLE_LABEL.to_string(),
            "master".to_string(),
        )]));
        assert!(m.is_master());

        m.metadata.labels = Some(BTreeMap::from([(
            MACHINE_ROLE_LABEL.to_string(),
            "worker".to_string(),
        )]));
        assert!(!m.is_master());
    }
}
