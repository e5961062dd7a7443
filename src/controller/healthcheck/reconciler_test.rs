//! Health check reconcile tests against the in-memory store

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::clock::FixedClock;
    use crate::controller::nodes::testing::node;
    use crate::crd::{
        Machine, MachineHealthCheck, MachineHealthCheckSpec, MachinePhase, MachineSpec,
        MachineStatus, MACHINE_ROLE_LABEL, NODE_ROLE_MASTER_LABEL,
    };
    use crate::error::Error;
    use crate::engine::{ObjectKey, Reconciler};
    use crate::store::{MemoryStore, ObjectStore, Verb};
    use chrono::{DateTime, Duration, Utc};
    use k8s_openapi::api::core::v1::{ConfigMap, Node, ObjectReference};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const NS: &str = "openshift-machine-api";

    struct Harness {
        nodes: Arc<MemoryStore<Node>>,
        machines: Arc<MemoryStore<Machine>>,
        health_checks: Arc<MemoryStore<MachineHealthCheck>>,
        config_maps: Arc<MemoryStore<ConfigMap>>,
        clock: Arc<FixedClock>,
        t0: DateTime<Utc>,
        reconciler: MachineHealthCheckReconciler,
    }

    impl Harness {
        fn new() -> Self {
            let nodes: Arc<MemoryStore<Node>> = Arc::new(MemoryStore::cluster());
            let machines: Arc<MemoryStore<Machine>> = Arc::new(MemoryStore::namespaced(NS));
            let health_checks: Arc<MemoryStore<MachineHealthCheck>> =
                Arc::new(MemoryStore::namespaced(NS));
            let config_maps: Arc<MemoryStore<ConfigMap>> = Arc::new(MemoryStore::namespaced(NS));
            let t0 = Utc::now();
            let clock = Arc::new(FixedClock::new(t0));
            let reconciler = MachineHealthCheckReconciler::new(
                nodes.clone(),
                machines.clone(),
                health_checks.clone(),
                config_maps.clone(),
                clock.clone(),
            );
            Self {
                nodes,
                machines,
                health_checks,
                config_maps,
                clock,
                t0,
                reconciler,
            }
        }

        fn at(&self, seconds: i64) {
            self.clock.set(self.t0 + Duration::seconds(seconds));
        }

        async fn reconcile(&self, node: &str) -> crate::error::Result<crate::engine::Action> {
            self.reconciler.reconcile(&ObjectKey::cluster(node)).await
        }

        fn health_check(&self, selector: LabelSelector) {
            self.health_checks
                .seed(MachineHealthCheck::new(
                    "workers",
                    MachineHealthCheckSpec { selector },
                ))
                .unwrap();
        }

        fn machine_deleted(&self, name: &str) -> bool {
            self.machines
                .actions()
                .iter()
                .any(|(verb, n)| *verb == Verb::Delete && n == name)
        }
    }

    fn worker_selector() -> LabelSelector {
        LabelSelector {
            match_labels: Some(BTreeMap::from([("role".to_string(), "worker".to_string())])),
            match_expressions: None,
        }
    }

    fn machine(name: &str, node_name: &str, owned: bool) -> Machine {
        let mut m = Machine::new(name, MachineSpec::default());
        m.metadata.labels = Some(BTreeMap::from([("role".to_string(), "worker".to_string())]));
        if owned {
            m.metadata.owner_references = Some(vec![OwnerReference {
                api_version: "machine.openshift.io/v1beta1".to_string(),
                kind: "MachineSet".to_string(),
                name: "workers".to_string(),
                uid: "ms-uid".to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]);
        }
        m.status = Some(MachineStatus {
            node_ref: Some(ObjectReference {
                kind: Some("Node".to_string()),
                name: Some(node_name.to_string()),
                ..Default::default()
            }),
            phase: Some(MachinePhase::Running),
            ..Default::default()
        });
        m
    }

    fn failing_node(h: &Harness, name: &str, machine: &str) -> Node {
        node(
            name,
            Some(&format!("{NS}/{machine}")),
            &[("Ready", "False", h.t0)],
        )
    }

    #[tokio::test]
    async fn test_remediation_waits_for_timeout() {
        let h = Harness::new();
        h.health_check(worker_selector());
        h.machines.seed(machine("worker-a", "node-a", true)).unwrap();
        h.nodes.seed(failing_node(&h, "node-a", "worker-a")).unwrap();

        h.at(100);
        let action = h.reconcile("node-a").await.unwrap();
        assert_eq!(
            action.requeue_after(),
            Some(std::time::Duration::from_secs(201))
        );
        assert!(h.machines.get("worker-a").await.unwrap().is_some());

        let status = h.health_checks.objects()[0].status.clone().unwrap();
        assert_eq!(status.expected_machines, 1);
        assert_eq!(status.current_healthy, 0);
        assert_eq!(status.targets[0].node.as_deref(), Some("node-a"));
        assert!(!status.targets[0].healthy);
        assert_eq!(status.unhealthy_conditions.len(), 1);
        assert_eq!(status.unhealthy_conditions[0].type_, "Ready");
        assert_eq!(status.unhealthy_conditions[0].status, "False");

        h.at(301);
        let action = h.reconcile("node-a").await.unwrap();
        assert_eq!(action.requeue_after(), None);
        assert!(h.machine_deleted("worker-a"));
        assert!(h.machines.get("worker-a").await.unwrap().is_none());

        let status = h.health_checks.objects()[0].status.clone().unwrap();
        assert_eq!(status.expected_machines, 0);
    }

    #[tokio::test]
    async fn test_masters_are_never_remediated() {
        let h = Harness::new();
        h.health_check(worker_selector());
        let mut master = machine("master-0", "node-m", true);
        if let Some(labels) = master.metadata.labels.as_mut() {
            labels.insert(MACHINE_ROLE_LABEL.to_string(), "master".to_string());
        }
        h.machines.seed(master).unwrap();
        h.nodes.seed(failing_node(&h, "node-m", "master-0")).unwrap();

        h.at(10_000);
        let action = h.reconcile("node-m").await.unwrap();
        assert_eq!(action.requeue_after(), None);
        assert!(!h.machine_deleted("master-0"));
        let node = h.nodes.get("node-m").await.unwrap().unwrap();
        assert_eq!(
            skip_reason(&h.machines.objects()[0], &node),
            Some(SkipReason::Master)
        );
    }

    #[tokio::test]
    async fn test_unowned_machine_is_skipped() {
        let h = Harness::new();
        h.health_check(worker_selector());
        h.machines.seed(machine("loose", "node-l", false)).unwrap();
        h.nodes.seed(failing_node(&h, "node-l", "loose")).unwrap();

        h.at(10_000);
        h.reconcile("node-l").await.unwrap();
        assert!(!h.machine_deleted("loose"));
        let node = h.nodes.get("node-l").await.unwrap().unwrap();
        assert_eq!(
            skip_reason(&h.machines.objects()[0], &node),
            Some(SkipReason::NotOwnedByMachineSet)
        );
    }

    #[tokio::test]
    async fn test_master_node_role_label_blocks_remediation() {
        let h = Harness::new();
        h.health_check(worker_selector());
        // worker labels on the Machine, master role only on the Node
        h.machines.seed(machine("worker-m", "node-m", true)).unwrap();
        let mut failing = failing_node(&h, "node-m", "worker-m");
        failing
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(NODE_ROLE_MASTER_LABEL.to_string(), String::new());
        h.nodes.seed(failing).unwrap();

        h.at(10_000);
        let action = h.reconcile("node-m").await.unwrap();
        assert_eq!(action.requeue_after(), None);
        assert!(!h.machine_deleted("worker-m"));
        assert!(h.machines.get("worker-m").await.unwrap().is_some());

        let node = h.nodes.get("node-m").await.unwrap().unwrap();
        assert_eq!(
            skip_reason(&h.machines.objects()[0], &node),
            Some(SkipReason::Master)
        );
    }

    #[tokio::test]
    async fn test_machine_already_gone_is_not_an_error() {
        let h = Harness::new();
        h.health_check(worker_selector());
        h.machines.seed(machine("worker-a", "node-a", true)).unwrap();
        h.nodes.seed(failing_node(&h, "node-a", "worker-a")).unwrap();
        h.machines
            .fail_next_with(Verb::Delete, Error::not_found("Machine", "worker-a"));

        h.at(10_000);
        let action = h.reconcile("node-a").await.unwrap();
        assert_eq!(action.requeue_after(), None);
        // status is still written after the delete
        assert!(h.health_checks.objects()[0].status.is_some());
    }

    #[tokio::test]
    async fn test_empty_selector_targets_nothing() {
        let h = Harness::new();
        h.health_check(LabelSelector::default());
        h.machines.seed(machine("worker-a", "node-a", true)).unwrap();
        h.nodes.seed(failing_node(&h, "node-a", "worker-a")).unwrap();

        h.at(10_000);
        let action = h.reconcile("node-a").await.unwrap();
        assert_eq!(action.requeue_after(), None);
        assert!(h.machines.actions().is_empty());
        assert!(h.health_checks.actions().is_empty());
    }

    #[tokio::test]
    async fn test_healthy_node_reports_healthy_target() {
        let h = Harness::new();
        h.health_check(worker_selector());
        h.machines.seed(machine("worker-a", "node-a", true)).unwrap();
        h.nodes
            .seed(node(
                "node-a",
                Some(&format!("{NS}/worker-a")),
                &[("Ready", "True", h.t0)],
            ))
            .unwrap();

        let action = h.reconcile("node-a").await.unwrap();
        assert_eq!(action.requeue_after(), None);

        let status = h.health_checks.objects()[0].status.clone().unwrap();
        assert_eq!(status.expected_machines, 1);
        assert_eq!(status.current_healthy, 1);
        assert!(status.unhealthy_conditions.is_empty());

        // unchanged status is not written again
        h.health_checks.clear_actions();
        h.reconcile("node-a").await.unwrap();
        assert!(h.health_checks.actions().is_empty());
    }

    #[tokio::test]
    async fn test_configured_conditions_override_defaults() {
        let h = Harness::new();
        h.health_check(worker_selector());
        h.machines.seed(machine("worker-a", "node-a", true)).unwrap();
        h.nodes.seed(failing_node(&h, "node-a", "worker-a")).unwrap();
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(unhealthy::CONFIG_MAP_NAME.to_string());
        cm.data = Some(BTreeMap::from([(
            unhealthy::CONFIG_MAP_KEY.to_string(),
            "items:\n- name: Ready\n  status: \"False\"\n  timeout: 60s\n".to_string(),
        )]));
        h.config_maps.seed(cm).unwrap();

        h.at(61);
        h.reconcile("node-a").await.unwrap();
        assert!(h.machine_deleted("worker-a"));
    }

    #[tokio::test]
    async fn test_unannotated_or_unknown_nodes_are_ignored() {
        let h = Harness::new();
        h.health_check(worker_selector());
        h.nodes
            .seed(node("bare", None, &[("Ready", "False", h.t0)]))
            .unwrap();
        h.nodes
            .seed(node(
                "elsewhere",
                Some("other-namespace/worker-a"),
                &[("Ready", "False", h.t0)],
            ))
            .unwrap();

        h.at(10_000);
        for name in ["bare", "elsewhere", "missing"] {
            let action = h.reconcile(name).await.unwrap();
            assert_eq!(action.requeue_after(), None);
        }
        assert!(h.machines.actions().is_empty());
    }
}
