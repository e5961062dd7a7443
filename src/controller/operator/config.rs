//! Operator inputs: the images bundle, cluster platform and proxy
//!
//! The images file is produced at release time and mounted into the operator
//! pod. Platform and proxy come from the cluster-scoped `Infrastructure` and
//! `Proxy` objects named `cluster`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crd::{InfrastructureStatus, ProxyStatus};
use crate::error::{Error, Result};

/// Provider image sentinel for platforms without a machine controller
pub const NO_OP_PROVIDER: &str = "no-op";

/// Platforms whose instances can be interrupted (spot/preemptible)
const TERMINATION_HANDLER_PLATFORMS: &[&str] = &["AWS", "Azure", "GCP"];

pub const MACHINE_HEALTH_CHECK_GATE: &str = "MachineHealthCheck";

/// Release image bundle
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Images {
    #[serde(rename = "machineAPIOperator")]
    pub machine_api_operator: String,
    #[serde(rename = "kubeRBACProxy", default)]
    pub kube_rbac_proxy: String,
    #[serde(rename = "clusterAPIControllerAWS", default)]
    pub aws: String,
    #[serde(rename = "clusterAPIControllerAzure", default)]
    pub azure: String,
    #[serde(rename = "clusterAPIControllerGCP", default)]
    pub gcp: String,
    #[serde(rename = "clusterAPIControllerOpenStack", default)]
    pub openstack: String,
    #[serde(rename = "clusterAPIControllerLibvirt", default)]
    pub libvirt: String,
    #[serde(rename = "clusterAPIControllerBareMetal", default)]
    pub baremetal: String,
    #[serde(rename = "clusterAPIControllerOvirt", default)]
    pub ovirt: String,
    #[serde(rename = "clusterAPIControllerVSphere", default)]
    pub vsphere: String,
}

impl Images {
    pub fn parse(raw: &str) -> Result<Self> {
        let images: Images = serde_json::from_str(raw)?;
        if images.machine_api_operator.is_empty() {
            return Err(Error::ConfigError(
                "images file has no machineAPIOperator image".to_string(),
            ));
        }
        Ok(images)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Provider controller image for a platform type.
    ///
    /// Platforms with no machine controller get the no-op sentinel. A known
    /// platform whose image is missing from the bundle is a configuration
    /// error.
    pub fn provider_image(&self, platform: &str) -> Result<String> {
        let image = match platform {
            "AWS" => &self.aws,
            "Azure" => &self.azure,
            "GCP" => &self.gcp,
            "OpenStack" => &self.openstack,
            "Libvirt" => &self.libvirt,
            "BareMetal" => &self.baremetal,
            "oVirt" => &self.ovirt,
            "VSphere" => &self.vsphere,
            _ => return Ok(NO_OP_PROVIDER.to_string()),
        };
        if image.is_empty() {
            return Err(Error::ConfigError(format!(
                "images file has no provider image for platform {platform}"
            )));
        }
        Ok(image.clone())
    }
}

/// `--feature-gates Name=true,Other=false`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeatureGates(BTreeMap<String, bool>);

impl FeatureGates {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut gates = BTreeMap::new();
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::ConfigError(format!("feature gate {pair:?} is not name=bool")))?;
            let enabled = value.trim().parse::<bool>().map_err(|_| {
                Error::ConfigError(format!("feature gate {name}: {value:?} is not a bool"))
            })?;
            gates.insert(name.trim().to_string(), enabled);
        }
        Ok(Self(gates))
    }

    /// Gate value, `default` when unset.
    pub fn enabled(&self, name: &str, default: bool) -> bool {
        self.0.get(name).copied().unwrap_or(default)
    }
}

impl std::str::FromStr for FeatureGates {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Images for each container in the rendered operands
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Controllers {
    pub provider: String,
    pub node_link: String,
    pub machine_health_check: Option<String>,
    pub kube_rbac_proxy: String,
    pub termination_handler: Option<String>,
}

/// Proxy settings injected into provider-facing containers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

impl ProxyConfig {
    pub fn from_status(status: &ProxyStatus) -> Self {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        Self {
            http_proxy: non_empty(&status.http_proxy),
            https_proxy: non_empty(&status.https_proxy),
            no_proxy: non_empty(&status.no_proxy),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.http_proxy.is_none() && self.https_proxy.is_none() && self.no_proxy.is_none()
    }
}

/// Settings that come from the operator's own command line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorSettings {
    pub namespace: String,
    pub release_version: String,
    pub webhook_port: u16,
    pub webhook_cert_dir: String,
    pub features: FeatureGates,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            namespace: "openshift-machine-api".to_string(),
            release_version: "0.0.1-snapshot".to_string(),
            webhook_port: 8443,
            webhook_cert_dir: "/etc/machine-api-operator/tls".to_string(),
            features: FeatureGates::default(),
        }
    }
}

/// Everything the renderer needs, resolved for one reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    pub target_namespace: String,
    pub platform: String,
    pub controllers: Controllers,
    pub proxy: ProxyConfig,
    pub webhook_port: u16,
    pub webhook_cert_dir: String,
}

impl OperatorConfig {
    pub fn resolve(
        images: &Images,
        settings: &OperatorSettings,
        infrastructure: Option<&InfrastructureStatus>,
        proxy: Option<&ProxyStatus>,
    ) -> Result<Self> {
        let platform = infrastructure
            .and_then(|s| s.platform.clone())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "None".to_string());
        let provider = images.provider_image(&platform)?;

        let termination_handler = TERMINATION_HANDLER_PLATFORMS
            .contains(&platform.as_str())
            .then(|| provider.clone());
        let machine_health_check = settings
            .features
            .enabled(MACHINE_HEALTH_CHECK_GATE, true)
            .then(|| images.machine_api_operator.clone());

        Ok(Self {
            target_namespace: settings.namespace.clone(),
            platform,
            controllers: Controllers {
                provider,
                node_link: images.machine_api_operator.clone(),
                machine_health_check,
                kube_rbac_proxy: images.kube_rbac_proxy.clone(),
                termination_handler,
            },
            proxy: proxy.map(ProxyConfig::from_status).unwrap_or_default(),
            webhook_port: settings.webhook_port,
            webhook_cert_dir: settings.webhook_cert_dir.clone(),
        })
    }

    pub fn is_no_op(&self) -> bool {
        self.controllers.provider == NO_OP_PROVIDER
    }
}
