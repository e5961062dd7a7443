//! MachineHealthCheck custom resource

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "healthchecking.openshift.io",
    version = "v1alpha1",
    kind = "MachineHealthCheck",
    namespaced,
    status = "MachineHealthCheckStatus",
    shortname = "mhc",
    printcolumn = r#"{"name":"Expected","type":"integer","jsonPath":".status.expectedMachines"}"#,
    printcolumn = r#"{"name":"Healthy","type":"integer","jsonPath":".status.currentHealthy"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineHealthCheckSpec {
    /// Machines this check targets. An empty selector targets nothing.
    #[serde(default)]
    #[schemars(with = "serde_json::Value")]
    pub selector: LabelSelector,
}

/// A configured unhealthy Node condition, active on at least one target
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnhealthyConditionStatus {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub timeout: String,
}

/// Health of a single targeted Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    pub machine: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    pub healthy: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineHealthCheckStatus {
    /// Number of Machines the selector targets
    #[serde(default)]
    pub expected_machines: i32,

    /// Targets whose Node is bound and shows no configured unhealthy condition
    #[serde(default)]
    pub current_healthy: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<TargetStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unhealthy_conditions: Vec<UnhealthyConditionStatus>,
}
