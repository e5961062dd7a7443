//! Operand manifests rendered from an [`OperatorConfig`]

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, KeyToPath,
    ObjectFieldSelector, PodSpec, PodTemplateSpec, ResourceRequirements, SecretVolumeSource,
    Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use super::config::{OperatorConfig, ProxyConfig};
use crate::error::Result;

pub const DEPLOYMENT_NAME: &str = "machine-api-controllers";
pub const TERMINATION_HANDLER_NAME: &str = "machine-api-termination-handler";
pub const WEBHOOK_CONFIGURATION_NAME: &str = "machine-api";
pub const WEBHOOK_SERVICE_NAME: &str = "machine-api-operator-webhook";
pub const TRUSTED_CA_CONFIG_MAP: &str = "mao-trusted-ca";

/// Prefix of the annotations carrying referenced-resource content hashes
pub const DEPENDENCY_ANNOTATION_PREFIX: &str = "operator.openshift.io/dep-";

const METRICS_TLS_SECRET: &str = "machine-api-controllers-tls";
const WEBHOOK_TLS_SECRET: &str = "machine-api-operator-webhook-cert";
const INTERRUPTIBLE_LABEL: &str = "machine.openshift.io/interruptible-instance";
const MASTER_NODE_LABEL: &str = "node-role.kubernetes.io/master";
const INJECT_CA_ANNOTATION: &str = "service.beta.openshift.io/inject-cabundle";

/// A metrics endpoint fronted by a TLS-terminating kube-rbac-proxy sidecar
struct MetricsEndpoint {
    name: &'static str,
    secure_port: i32,
    upstream_port: i32,
}

const METRICS_ENDPOINTS: &[MetricsEndpoint] = &[
    MetricsEndpoint {
        name: "machineset-mtrc",
        secure_port: 8442,
        upstream_port: 8082,
    },
    MetricsEndpoint {
        name: "machine-mtrc",
        secure_port: 8441,
        upstream_port: 8081,
    },
    MetricsEndpoint {
        name: "mhc-mtrc",
        secure_port: 8444,
        upstream_port: 8083,
    },
];

fn labels(k8s_app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("api".to_string(), "clusterapi".to_string()),
        ("k8s-app".to_string(), k8s_app.to_string()),
    ])
}

/// Annotation key recording the hash of a referenced namespaced resource.
pub fn dependency_annotation(namespace: &str, name: &str, kind: &str) -> String {
    format!("{DEPENDENCY_ANNOTATION_PREFIX}{namespace}.{name}.{}", kind.to_lowercase())
}

/// Content hash of a ConfigMap's data, used to force rollouts when it changes.
pub fn config_map_hash(cm: &ConfigMap) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&cm.data)?);
    hasher.update(serde_json::to_vec(&cm.binary_data)?);
    Ok(hex::encode(hasher.finalize()))
}

/// Dependency annotations for the trusted CA bundle.
pub fn dependency_annotations(trusted_ca: &ConfigMap) -> Result<BTreeMap<String, String>> {
    let key = dependency_annotation(
        &trusted_ca.namespace().unwrap_or_default(),
        &trusted_ca.name_any(),
        "ConfigMap",
    );
    Ok(BTreeMap::from([(key, config_map_hash(trusted_ca)?)]))
}

fn master_tolerations() -> Vec<Toleration> {
    vec![
        Toleration {
            key: Some(MASTER_NODE_LABEL.to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        },
        Toleration {
            key: Some("CriticalAddonsOnly".to_string()),
            operator: Some("Exists".to_string()),
            ..Default::default()
        },
        Toleration {
            key: Some("node.kubernetes.io/not-ready".to_string()),
            effect: Some("NoExecute".to_string()),
            operator: Some("Exists".to_string()),
            toleration_seconds: Some(120),
            ..Default::default()
        },
        Toleration {
            key: Some("node.kubernetes.io/unreachable".to_string()),
            effect: Some("NoExecute".to_string()),
            operator: Some("Exists".to_string()),
            toleration_seconds: Some(120),
            ..Default::default()
        },
    ]
}

fn requests(cpu: &str, memory: &str) -> Option<ResourceRequirements> {
    Some(ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])),
        ..Default::default()
    })
}

fn proxy_env(proxy: &ProxyConfig) -> Vec<EnvVar> {
    [
        ("HTTP_PROXY", &proxy.http_proxy),
        ("HTTPS_PROXY", &proxy.https_proxy),
        ("NO_PROXY", &proxy.no_proxy),
    ]
    .into_iter()
    .filter_map(|(name, value)| {
        value.as_ref().map(|v| EnvVar {
            name: name.to_string(),
            value: Some(v.clone()),
            ..Default::default()
        })
    })
    .collect()
}

fn node_name_env() -> EnvVar {
    EnvVar {
        name: "NODE_NAME".to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "spec.nodeName".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn controller_args(cfg: &OperatorConfig, metrics_port: i32) -> Vec<String> {
    vec![
        "--logtostderr=true".to_string(),
        "--v=3".to_string(),
        format!("--namespace={}", cfg.target_namespace),
        format!("--metrics-addr=127.0.0.1:{metrics_port}"),
    ]
}

// ============================================================================
// Controllers Deployment
// ============================================================================

fn controller_containers(cfg: &OperatorConfig) -> Vec<Container> {
    let images = &cfg.controllers;
    let proxy = proxy_env(&cfg.proxy);

    let mut machine_set_args = controller_args(cfg, 8082);
    machine_set_args.extend([
        "--webhook-enabled=true".to_string(),
        format!("--webhook-port={}", cfg.webhook_port),
        format!("--webhook-cert-dir={}", cfg.webhook_cert_dir),
    ]);

    let mut containers = vec![
        Container {
            name: "machineset-controller".to_string(),
            image: Some(images.provider.clone()),
            command: Some(vec!["/machineset-controller".to_string()]),
            args: Some(machine_set_args),
            ports: Some(vec![ContainerPort {
                name: Some("webhook-server".to_string()),
                container_port: i32::from(cfg.webhook_port),
                ..Default::default()
            }]),
            volume_mounts: Some(vec![VolumeMount {
                name: "cert".to_string(),
                mount_path: cfg.webhook_cert_dir.clone(),
                read_only: Some(true),
                ..Default::default()
            }]),
            resources: requests("10m", "20Mi"),
            ..Default::default()
        },
        Container {
            name: "machine-controller".to_string(),
            image: Some(images.provider.clone()),
            command: Some(vec!["/machine-controller-manager".to_string()]),
            args: Some(controller_args(cfg, 8081)),
            env: Some(
                proxy
                    .iter()
                    .cloned()
                    .chain(std::iter::once(node_name_env()))
                    .collect(),
            ),
            volume_mounts: Some(vec![VolumeMount {
                name: "trusted-ca".to_string(),
                mount_path: "/etc/pki/ca-trust/extracted/pem".to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            resources: requests("10m", "20Mi"),
            ..Default::default()
        },
        Container {
            name: "nodelink-controller".to_string(),
            image: Some(images.node_link.clone()),
            command: Some(vec!["/nodelink-controller".to_string()]),
            args: Some(vec![
                "--logtostderr=true".to_string(),
                "--v=3".to_string(),
                format!("--namespace={}", cfg.target_namespace),
            ]),
            resources: requests("10m", "20Mi"),
            ..Default::default()
        },
    ];

    if let Some(image) = &images.machine_health_check {
        containers.push(Container {
            name: "machine-healthcheck-controller".to_string(),
            image: Some(image.clone()),
            command: Some(vec!["/machine-healthcheck".to_string()]),
            args: Some(controller_args(cfg, 8083)),
            resources: requests("10m", "20Mi"),
            ..Default::default()
        });
    }

    for endpoint in metrics_endpoints(cfg) {
        containers.push(rbac_proxy_container(cfg, endpoint));
    }
    containers
}

fn metrics_endpoints(cfg: &OperatorConfig) -> impl Iterator<Item = &'static MetricsEndpoint> {
    let with_mhc = cfg.controllers.machine_health_check.is_some();
    METRICS_ENDPOINTS
        .iter()
        .filter(move |e| with_mhc || e.name != "mhc-mtrc")
}

fn rbac_proxy_container(cfg: &OperatorConfig, endpoint: &MetricsEndpoint) -> Container {
    Container {
        name: format!("kube-rbac-proxy-{}", endpoint.name.trim_end_matches("-mtrc")),
        image: Some(cfg.controllers.kube_rbac_proxy.clone()),
        args: Some(vec![
            format!("--secure-listen-address=0.0.0.0:{}", endpoint.secure_port),
            format!("--upstream=http://localhost:{}", endpoint.upstream_port),
            "--config-file=/etc/kube-rbac-proxy/config-file.yaml".to_string(),
            "--tls-cert-file=/etc/tls/private/tls.crt".to_string(),
            "--tls-private-key-file=/etc/tls/private/tls.key".to_string(),
            "--logtostderr=true".to_string(),
            "--v=3".to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some(endpoint.name.to_string()),
            container_port: endpoint.secure_port,
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "config".to_string(),
                mount_path: "/etc/kube-rbac-proxy".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: METRICS_TLS_SECRET.to_string(),
                mount_path: "/etc/tls/private".to_string(),
                ..Default::default()
            },
        ]),
        resources: requests("10m", "20Mi"),
        ..Default::default()
    }
}

fn controller_volumes() -> Vec<Volume> {
    vec![
        Volume {
            name: "config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some("kube-rbac-proxy".to_string()),
                default_mode: Some(0o440),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: METRICS_TLS_SECRET.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(METRICS_TLS_SECRET.to_string()),
                default_mode: Some(0o440),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "cert".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(WEBHOOK_TLS_SECRET.to_string()),
                default_mode: Some(0o440),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "trusted-ca".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(TRUSTED_CA_CONFIG_MAP.to_string()),
                items: Some(vec![KeyToPath {
                    key: "ca-bundle.crt".to_string(),
                    path: "tls-ca-bundle.pem".to_string(),
                    ..Default::default()
                }]),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

/// The machine-api-controllers Deployment. `dependencies` is stamped on both
/// the Deployment and its pod template.
pub fn controllers_deployment(
    cfg: &OperatorConfig,
    dependencies: &BTreeMap<String, String>,
) -> Deployment {
    let labels = labels("controller");
    let annotations = (!dependencies.is_empty()).then(|| dependencies.clone());

    Deployment {
        metadata: ObjectMeta {
            name: Some(DEPLOYMENT_NAME.to_string()),
            namespace: Some(cfg.target_namespace.clone()),
            labels: Some(labels.clone()),
            annotations: annotations.clone(),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations,
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: controller_containers(cfg),
                    priority_class_name: Some("system-node-critical".to_string()),
                    service_account_name: Some("machine-api-controllers".to_string()),
                    node_selector: Some(BTreeMap::from([(
                        MASTER_NODE_LABEL.to_string(),
                        String::new(),
                    )])),
                    tolerations: Some(master_tolerations()),
                    volumes: Some(controller_volumes()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// Termination handler DaemonSet
// ============================================================================

/// Spot/preemptible termination watcher; `None` on platforms without one.
pub fn termination_handler_daemonset(cfg: &OperatorConfig) -> Option<DaemonSet> {
    let image = cfg.controllers.termination_handler.clone()?;
    let labels = labels("termination-handler");

    let mut env = proxy_env(&cfg.proxy);
    env.push(node_name_env());

    Some(DaemonSet {
        metadata: ObjectMeta {
            name: Some(TERMINATION_HANDLER_NAME.to_string()),
            namespace: Some(cfg.target_namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "termination-handler".to_string(),
                        image: Some(image),
                        command: Some(vec!["/termination-handler".to_string()]),
                        args: Some(vec![
                            "--logtostderr=true".to_string(),
                            "--v=3".to_string(),
                            "--node-name=$(NODE_NAME)".to_string(),
                            format!("--namespace={}", cfg.target_namespace),
                            "--poll-interval-seconds=5".to_string(),
                        ]),
                        env: Some(env),
                        resources: requests("10m", "20Mi"),
                        ..Default::default()
                    }],
                    host_network: Some(true),
                    priority_class_name: Some("system-node-critical".to_string()),
                    service_account_name: Some(TERMINATION_HANDLER_NAME.to_string()),
                    node_selector: Some(BTreeMap::from([(
                        INTERRUPTIBLE_LABEL.to_string(),
                        String::new(),
                    )])),
                    tolerations: Some(vec![Toleration {
                        key: Some(MASTER_NODE_LABEL.to_string()),
                        effect: Some("NoSchedule".to_string()),
                        operator: Some("Exists".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

// ============================================================================
// Webhook configurations
// ============================================================================

fn webhook_client(cfg: &OperatorConfig, path: &str) -> WebhookClientConfig {
    WebhookClientConfig {
        service: Some(ServiceReference {
            name: WEBHOOK_SERVICE_NAME.to_string(),
            namespace: cfg.target_namespace.clone(),
            path: Some(path.to_string()),
            port: Some(443),
        }),
        ..Default::default()
    }
}

fn webhook_rules(resource: &str) -> Option<Vec<RuleWithOperations>> {
    Some(vec![RuleWithOperations {
        api_groups: Some(vec!["machine.openshift.io".to_string()]),
        api_versions: Some(vec!["v1beta1".to_string()]),
        operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
        resources: Some(vec![resource.to_string()]),
        ..Default::default()
    }])
}

fn webhook_meta() -> ObjectMeta {
    ObjectMeta {
        name: Some(WEBHOOK_CONFIGURATION_NAME.to_string()),
        annotations: Some(BTreeMap::from([(
            INJECT_CA_ANNOTATION.to_string(),
            "true".to_string(),
        )])),
        ..Default::default()
    }
}

pub fn validating_webhook_configuration(cfg: &OperatorConfig) -> ValidatingWebhookConfiguration {
    let webhook = |kind: &str, resource: &str| ValidatingWebhook {
        name: format!("validation.{kind}.machine.openshift.io"),
        client_config: webhook_client(
            cfg,
            &format!("/validate-machine-openshift-io-v1beta1-{kind}"),
        ),
        rules: webhook_rules(resource),
        failure_policy: Some("Ignore".to_string()),
        side_effects: "None".to_string(),
        admission_review_versions: vec!["v1".to_string()],
        ..Default::default()
    };
    ValidatingWebhookConfiguration {
        metadata: webhook_meta(),
        webhooks: Some(vec![
            webhook("machine", "machines"),
            webhook("machineset", "machinesets"),
        ]),
    }
}

pub fn mutating_webhook_configuration(cfg: &OperatorConfig) -> MutatingWebhookConfiguration {
    let webhook = |kind: &str, resource: &str| MutatingWebhook {
        name: format!("default.{kind}.machine.openshift.io"),
        client_config: webhook_client(cfg, &format!("/mutate-machine-openshift-io-v1beta1-{kind}")),
        rules: webhook_rules(resource),
        failure_policy: Some("Ignore".to_string()),
        side_effects: "None".to_string(),
        admission_review_versions: vec!["v1".to_string()],
        ..Default::default()
    };
    MutatingWebhookConfiguration {
        metadata: webhook_meta(),
        webhooks: Some(vec![
            webhook("machine", "machines"),
            webhook("machineset", "machinesets"),
        ]),
    }
}
