//! End-to-end lifecycle against the in-memory store: scale out, remediate an
//! unhealthy Node, replace the Machine, scale in.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Node, NodeCondition, NodeStatus, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::ResourceExt;
use machine_api_operator::clock::FixedClock;
use machine_api_operator::controller::{MachineHealthCheckReconciler, MachineSetReconciler};
use machine_api_operator::crd::{
    Machine, MachineHealthCheck, MachineHealthCheckSpec, MachineSet, MachineSetSpec,
    MachineTemplateSpec, TemplateMeta, MACHINE_ANNOTATION,
};
use machine_api_operator::engine::{ObjectKey, Reconciler};
use machine_api_operator::store::{MemoryStore, ObjectStore};

const NS: &str = "openshift-machine-api";

struct Cluster {
    machine_sets: Arc<MemoryStore<MachineSet>>,
    machines: Arc<MemoryStore<Machine>>,
    nodes: Arc<MemoryStore<Node>>,
    health_checks: Arc<MemoryStore<MachineHealthCheck>>,
    clock: Arc<FixedClock>,
    t0: DateTime<Utc>,
    machine_set_reconciler: MachineSetReconciler,
    health_check_reconciler: MachineHealthCheckReconciler,
}

impl Cluster {
    fn new() -> Self {
        let machine_sets: Arc<MemoryStore<MachineSet>> = Arc::new(MemoryStore::namespaced(NS));
        let machines: Arc<MemoryStore<Machine>> = Arc::new(MemoryStore::namespaced(NS));
        let nodes: Arc<MemoryStore<Node>> = Arc::new(MemoryStore::cluster());
        let health_checks: Arc<MemoryStore<MachineHealthCheck>> =
            Arc::new(MemoryStore::namespaced(NS));
        let config_maps: Arc<MemoryStore<ConfigMap>> = Arc::new(MemoryStore::namespaced(NS));
        let t0 = Utc::now();
        let clock = Arc::new(FixedClock::new(t0));

        let machine_set_reconciler = MachineSetReconciler::new(
            machine_sets.clone(),
            machines.clone(),
            nodes.clone(),
            clock.clone(),
        )
        .with_seed(7);
        let health_check_reconciler = MachineHealthCheckReconciler::new(
            nodes.clone(),
            machines.clone(),
            health_checks.clone(),
            config_maps,
            clock.clone(),
        );
        Self {
            machine_sets,
            machines,
            nodes,
            health_checks,
            clock,
            t0,
            machine_set_reconciler,
            health_check_reconciler,
        }
    }

    async fn sync_machine_set(&self) {
        self.machine_set_reconciler
            .reconcile(&ObjectKey::namespaced(NS, "workers"))
            .await
            .unwrap();
    }

    fn machine_names(&self) -> Vec<String> {
        self.machines
            .objects()
            .iter()
            .map(|m| m.name_any())
            .collect()
    }

    /// Bind `machine` to a new Node whose Ready condition is False since t0.
    async fn bind_unready_node(&self, machine: &str, node: &str) {
        let mut m = self.machines.get(machine).await.unwrap().unwrap();
        m.status.get_or_insert_with(Default::default).node_ref = Some(ObjectReference {
            kind: Some("Node".to_string()),
            name: Some(node.to_string()),
            ..Default::default()
        });
        self.machines.update_status(&m).await.unwrap();

        let mut n = Node::default();
        n.metadata.name = Some(node.to_string());
        n.metadata.annotations = Some(BTreeMap::from([(
            MACHINE_ANNOTATION.to_string(),
            format!("{NS}/{machine}"),
        )]));
        n.status = Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "False".to_string(),
                last_transition_time: Some(Time(self.t0)),
                ..Default::default()
            }]),
            ..Default::default()
        });
        self.nodes.seed(n).unwrap();
    }
}

fn worker_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("machine.openshift.io/cluster-api-machineset".to_string(), "workers".to_string()),
        ("machine.openshift.io/cluster-api-machine-role".to_string(), "worker".to_string()),
    ])
}

fn selector() -> LabelSelector {
    LabelSelector {
        match_labels: Some(worker_labels()),
        match_expressions: None,
    }
}

#[tokio::test]
async fn test_remediated_machine_is_replaced() {
    let cluster = Cluster::new();
    let ms = MachineSet::new(
        "workers",
        MachineSetSpec {
            replicas: 3,
            selector: selector(),
            template: MachineTemplateSpec {
                metadata: TemplateMeta {
                    labels: worker_labels(),
                    annotations: BTreeMap::new(),
                },
                ..Default::default()
            },
            ..Default::default()
        },
    );
    cluster.machine_sets.create(&ms).await.unwrap();
    cluster
        .health_checks
        .create(&MachineHealthCheck::new(
            "workers",
            MachineHealthCheckSpec {
                selector: selector(),
            },
        ))
        .await
        .unwrap();

    // scale out 0 -> 3
    cluster.sync_machine_set().await;
    let created = cluster.machine_names();
    assert_eq!(created.len(), 3);
    assert!(created.iter().all(|n| n.starts_with("workers-")));

    let victim = created[0].clone();
    cluster.bind_unready_node(&victim, "node-0").await;

    // within the timeout nothing is deleted
    cluster.clock.set(cluster.t0 + Duration::seconds(100));
    let action = cluster
        .health_check_reconciler
        .reconcile(&ObjectKey::cluster("node-0"))
        .await
        .unwrap();
    assert!(action.requeue_after().is_some());
    assert_eq!(cluster.machine_names().len(), 3);

    // past the timeout the Machine is remediated
    cluster.clock.set(cluster.t0 + Duration::seconds(301));
    cluster
        .health_check_reconciler
        .reconcile(&ObjectKey::cluster("node-0"))
        .await
        .unwrap();
    let remaining = cluster.machine_names();
    assert_eq!(remaining.len(), 2);
    assert!(!remaining.contains(&victim));

    // the MachineSet replaces it
    cluster.sync_machine_set().await;
    let replaced = cluster.machine_names();
    assert_eq!(replaced.len(), 3);
    assert!(!replaced.contains(&victim));

    // status is recomputed from the owned Machines on the next pass
    cluster.sync_machine_set().await;
    let status = cluster
        .machine_sets
        .get("workers")
        .await
        .unwrap()
        .unwrap()
        .status
        .unwrap_or_default();
    assert_eq!(status.replicas, 3);
}

#[tokio::test]
async fn test_scale_in_converges() {
    let cluster = Cluster::new();
    let ms = MachineSet::new(
        "workers",
        MachineSetSpec {
            replicas: 4,
            selector: selector(),
            template: MachineTemplateSpec {
                metadata: TemplateMeta {
                    labels: worker_labels(),
                    annotations: BTreeMap::new(),
                },
                ..Default::default()
            },
            ..Default::default()
        },
    );
    cluster.machine_sets.create(&ms).await.unwrap();
    cluster.sync_machine_set().await;
    assert_eq!(cluster.machine_names().len(), 4);

    let mut ms = cluster.machine_sets.get("workers").await.unwrap().unwrap();
    ms.spec.replicas = 1;
    cluster.machine_sets.update(&ms).await.unwrap();
    cluster.sync_machine_set().await;
    assert_eq!(cluster.machine_names().len(), 1);

    // a converged set performs no further writes to Machines
    cluster.machines.clear_actions();
    cluster.sync_machine_set().await;
    assert!(cluster.machines.actions().is_empty());
}
