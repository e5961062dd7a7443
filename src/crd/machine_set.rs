//! MachineSet custom resource

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::machine::MachineSpec;
use super::types::TemplateMeta;

/// Order in which Machines are picked when scaling in
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeletePolicy {
    #[default]
    Random,
    Newest,
    Oldest,
}

impl std::fmt::Display for DeletePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeletePolicy::Random => write!(f, "Random"),
            DeletePolicy::Newest => write!(f, "Newest"),
            DeletePolicy::Oldest => write!(f, "Oldest"),
        }
    }
}

/// Template the MachineSet stamps new Machines from
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateSpec {
    #[serde(default)]
    pub metadata: TemplateMeta,

    #[serde(default)]
    pub spec: MachineSpec,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "MachineSet",
    namespaced,
    status = "MachineSetStatus",
    scale = r#"{"specReplicasPath":".spec.replicas","statusReplicasPath":".status.replicas","labelSelectorPath":".status.labelSelector"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSpec {
    /// Desired number of Machines
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Seconds a Machine's Node must be Ready before it counts as available
    #[serde(default)]
    pub min_ready_seconds: i32,

    #[serde(default)]
    pub delete_policy: DeletePolicy,

    #[serde(default)]
    #[schemars(with = "serde_json::Value")]
    pub selector: LabelSelector,

    #[serde(default)]
    pub template: MachineTemplateSpec,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetStatus {
    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub fully_labeled_replicas: i32,

    #[serde(default)]
    pub ready_replicas: i32,

    #[serde(default)]
    pub available_replicas: i32,

    #[serde(default)]
    pub observed_generation: i64,

    /// Selector rendered as a string, for the scale subresource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}
