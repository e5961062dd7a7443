//! Operator reconcile tests against the in-memory store

#[cfg(test)]
mod tests {
    use super::super::rollout::testing::{available_status, scheduled_status};
    use super::super::*;
    use crate::clock::FixedClock;
    use crate::controller::conditions::{find_condition, is_condition_true};
    use crate::crd::{
        ClusterOperator, ClusterOperatorStatus, Infrastructure, InfrastructureSpec,
        InfrastructureStatus, Machine, MachinePhase, MachineSet, MachineSetSpec, MachineSpec,
        MachineStatus, Proxy,
    };
    use crate::engine::{ObjectKey, Reconciler};
    use crate::store::{MemoryStore, ObjectStore, Verb};
    use chrono::{DateTime, Duration, Utc};
    use k8s_openapi::api::admissionregistration::v1::{
        MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
    };
    use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const NS: &str = "openshift-machine-api";

    const IMAGES: &str = r#"{
        "machineAPIOperator": "quay.io/openshift/mao:4.2",
        "kubeRBACProxy": "quay.io/openshift/kube-rbac-proxy:4.2",
        "clusterAPIControllerAWS": "quay.io/openshift/aws-machine-controllers:4.2",
        "clusterAPIControllerOpenStack": "quay.io/openshift/openstack-machine-controllers:4.2"
    }"#;

    struct Harness {
        deployments: Arc<MemoryStore<Deployment>>,
        daemon_sets: Arc<MemoryStore<DaemonSet>>,
        validating: Arc<MemoryStore<ValidatingWebhookConfiguration>>,
        config_maps: Arc<MemoryStore<ConfigMap>>,
        machine_sets: Arc<MemoryStore<MachineSet>>,
        machines: Arc<MemoryStore<Machine>>,
        infrastructures: Arc<MemoryStore<Infrastructure>>,
        cluster_operators: Arc<MemoryStore<ClusterOperator>>,
        clock: Arc<FixedClock>,
        t0: DateTime<Utc>,
        reconciler: OperatorReconciler,
    }

    impl Harness {
        fn new() -> Self {
            let deployments: Arc<MemoryStore<Deployment>> = Arc::new(MemoryStore::namespaced(NS));
            let daemon_sets: Arc<MemoryStore<DaemonSet>> = Arc::new(MemoryStore::namespaced(NS));
            let validating: Arc<MemoryStore<ValidatingWebhookConfiguration>> =
                Arc::new(MemoryStore::cluster());
            let mutating: Arc<MemoryStore<MutatingWebhookConfiguration>> =
                Arc::new(MemoryStore::cluster());
            let config_maps: Arc<MemoryStore<ConfigMap>> = Arc::new(MemoryStore::namespaced(NS));
            let machine_sets: Arc<MemoryStore<MachineSet>> = Arc::new(MemoryStore::namespaced(NS));
            let machines: Arc<MemoryStore<Machine>> = Arc::new(MemoryStore::namespaced(NS));
            let infrastructures: Arc<MemoryStore<Infrastructure>> =
                Arc::new(MemoryStore::cluster());
            let proxies: Arc<MemoryStore<Proxy>> = Arc::new(MemoryStore::cluster());
            let cluster_operators: Arc<MemoryStore<ClusterOperator>> =
                Arc::new(MemoryStore::cluster());

            let t0 = Utc::now();
            let clock = Arc::new(FixedClock::new(t0));
            let stores = OperatorStores {
                deployments: deployments.clone(),
                daemon_sets: daemon_sets.clone(),
                validating_webhooks: validating.clone(),
                mutating_webhooks: mutating,
                config_maps: config_maps.clone(),
                machine_sets: machine_sets.clone(),
                machines: machines.clone(),
                infrastructures: infrastructures.clone(),
                proxies,
                cluster_operators: cluster_operators.clone(),
            };
            let settings = OperatorSettings {
                namespace: NS.to_string(),
                release_version: "4.2.0".to_string(),
                ..Default::default()
            };
            let reconciler = OperatorReconciler::new(
                stores,
                Images::parse(IMAGES).unwrap(),
                settings,
                clock.clone(),
            );
            Self {
                deployments,
                daemon_sets,
                validating,
                config_maps,
                machine_sets,
                machines,
                infrastructures,
                cluster_operators,
                clock,
                t0,
                reconciler,
            }
        }

        fn platform(&self, platform: &str) {
            let mut infra = Infrastructure::new(CLUSTER_CONFIG_NAME, InfrastructureSpec {});
            infra.status = Some(InfrastructureStatus {
                platform: Some(platform.to_string()),
                ..Default::default()
            });
            self.infrastructures.seed(infra).unwrap();
        }

        fn trusted_ca(&self, bundle: &str) {
            let mut cm = ConfigMap::default();
            cm.metadata.name = Some("mao-trusted-ca".to_string());
            cm.data = Some(BTreeMap::from([(
                "ca-bundle.crt".to_string(),
                bundle.to_string(),
            )]));
            self.config_maps.seed(cm).unwrap();
        }

        fn at(&self, seconds: i64) {
            self.clock.set(self.t0 + Duration::seconds(seconds));
        }

        async fn reconcile(&self) -> crate::error::Result<crate::engine::Action> {
            self.reconciler
                .reconcile(&ObjectKey::namespaced(NS, OPERATOR_KEY))
                .await
        }

        /// Mark the controllers Deployment rolled out and Available since `since`.
        async fn roll_out_deployment(&self, since: DateTime<Utc>) {
            let mut d = self
                .deployments
                .get("machine-api-controllers")
                .await
                .unwrap()
                .unwrap();
            d.status = Some(available_status(d.metadata.generation.unwrap(), since));
            self.deployments.update_status(&d).await.unwrap();
        }

        async fn roll_out_daemon_set(&self) {
            let mut ds = self
                .daemon_sets
                .get("machine-api-termination-handler")
                .await
                .unwrap()
                .unwrap();
            ds.status = Some(scheduled_status(ds.metadata.generation.unwrap(), 3));
            self.daemon_sets.update_status(&ds).await.unwrap();
        }

        fn operator_status(&self) -> ClusterOperatorStatus {
            self.cluster_operators
                .objects()
                .into_iter()
                .next()
                .and_then(|co| co.status)
                .unwrap_or_default()
        }

        fn running_workers(&self, replicas: i32, running: &[&str], pending: &[&str]) {
            self.machine_sets
                .seed(MachineSet::new(
                    "workers",
                    MachineSetSpec {
                        replicas,
                        ..Default::default()
                    },
                ))
                .unwrap();
            for (names, phase) in [(running, MachinePhase::Running), (pending, MachinePhase::Provisioning)] {
                for name in names {
                    let mut m = Machine::new(name, MachineSpec::default());
                    m.metadata.owner_references = Some(vec![OwnerReference {
                        api_version: "machine.openshift.io/v1beta1".to_string(),
                        kind: "MachineSet".to_string(),
                        name: "workers".to_string(),
                        uid: "workers-uid".to_string(),
                        controller: Some(true),
                        block_owner_deletion: Some(true),
                    }]);
                    m.status = Some(MachineStatus {
                        phase: Some(phase),
                        ..Default::default()
                    });
                    self.machines.seed(m).unwrap();
                }
            }
        }
    }

    fn condition_status(status: &ClusterOperatorStatus, type_: &str) -> Option<String> {
        find_condition(&status.conditions, type_).map(|c| c.status.clone())
    }

    #[tokio::test]
    async fn test_rollout_availability_window() {
        let h = Harness::new();
        h.platform("OpenStack");
        h.trusted_ca("ca");
        h.running_workers(2, &["w-1", "w-2"], &[]);

        let action = h.reconcile().await.unwrap();
        assert_eq!(action.requeue_after(), Some(std::time::Duration::from_secs(5)));
        assert_eq!(
            condition_status(&h.operator_status(), "Progressing").as_deref(),
            Some("True")
        );

        h.roll_out_deployment(h.t0).await;
        for offset in [60, 120] {
            h.at(offset);
            let action = h.reconcile().await.unwrap();
            assert_eq!(
                action.requeue_after(),
                Some(std::time::Duration::from_secs(5)),
                "t0+{offset}s"
            );
            assert!(!is_condition_true(&h.operator_status().conditions, "Available"));
        }

        h.at(181);
        let action = h.reconcile().await.unwrap();
        assert_eq!(action.requeue_after(), None);
        let status = h.operator_status();
        assert!(is_condition_true(&status.conditions, "Available"));
        assert_eq!(condition_status(&status, "Progressing").as_deref(), Some("False"));
        assert_eq!(status.versions[0].version, "4.2.0");
        let available = find_condition(&status.conditions, "Available").unwrap();
        assert!(available.message.contains("4.2.0"));

        // the operator never rewrote its own Deployment while waiting
        assert!(!h
            .deployments
            .actions()
            .iter()
            .any(|(verb, _)| *verb == Verb::Update));
    }

    #[tokio::test]
    async fn test_converged_operator_writes_nothing() {
        let h = Harness::new();
        h.platform("AWS");
        h.trusted_ca("ca");
        h.running_workers(2, &["w-1", "w-2"], &[]);

        h.reconcile().await.unwrap();
        h.roll_out_deployment(h.t0 - Duration::hours(1)).await;
        h.roll_out_daemon_set().await;
        let action = h.reconcile().await.unwrap();
        assert_eq!(action.requeue_after(), None);
        assert!(is_condition_true(&h.operator_status().conditions, "Available"));

        h.deployments.clear_actions();
        h.daemon_sets.clear_actions();
        h.validating.clear_actions();
        h.cluster_operators.clear_actions();
        h.reconcile().await.unwrap();
        h.reconcile().await.unwrap();
        assert!(h.deployments.actions().is_empty());
        assert!(h.daemon_sets.actions().is_empty());
        assert!(h.validating.actions().is_empty());
        assert!(h.cluster_operators.actions().is_empty());
    }

    #[tokio::test]
    async fn test_trusted_ca_change_forces_rollout() {
        let h = Harness::new();
        h.platform("OpenStack");
        h.trusted_ca("ca-1");
        h.reconcile().await.unwrap();
        let before = h.deployments.objects()[0].metadata.generation;

        h.trusted_ca("ca-2");
        h.reconcile().await.unwrap();
        let after = h.deployments.objects()[0].metadata.generation;
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_minimum_workers_gate_while_initializing() {
        let h = Harness::new();
        h.platform("OpenStack");
        h.trusted_ca("ca");
        h.running_workers(3, &["w-1"], &["w-2", "w-3"]);

        h.reconcile().await.unwrap();
        h.roll_out_deployment(h.t0 - Duration::hours(1)).await;
        let action = h.reconcile().await.unwrap();
        assert_eq!(action.requeue_after(), Some(std::time::Duration::from_secs(5)));

        let status = h.operator_status();
        assert!(!is_condition_true(&status.conditions, "Available"));
        let degraded = find_condition(&status.conditions, "Degraded").unwrap();
        assert_eq!(degraded.status, "True");
        assert!(degraded.message.contains("w-2, w-3"));

        let mut m = h.machines.get("w-2").await.unwrap().unwrap();
        if let Some(s) = m.status.as_mut() {
            s.phase = Some(MachinePhase::Running);
        }
        h.machines.update_status(&m).await.unwrap();

        h.reconcile().await.unwrap();
        let status = h.operator_status();
        assert!(is_condition_true(&status.conditions, "Available"));
        assert_eq!(condition_status(&status, "Degraded").as_deref(), Some("False"));
    }

    #[tokio::test]
    async fn test_no_op_platform() {
        let h = Harness::new();

        let action = h.reconcile().await.unwrap();
        assert_eq!(action.requeue_after(), None);
        let status = h.operator_status();
        let available = find_condition(&status.conditions, "Available").unwrap();
        assert_eq!(available.status, "True");
        assert!(available.message.contains("NoOp"));
        assert!(h.deployments.objects().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_cluster_operator_creates_once() {
        let h = Harness::new();
        h.reconciler.ensure_cluster_operator().await.unwrap();
        h.reconciler.ensure_cluster_operator().await.unwrap();

        let operators = h.cluster_operators.objects();
        assert_eq!(operators.len(), 1);
        assert_eq!(operators[0].metadata.name.as_deref(), Some("machine-api"));
        assert!(operators[0].status.is_none());
        assert_eq!(
            h.cluster_operators.actions(),
            vec![(Verb::Create, "machine-api".to_string())]
        );
    }

    #[tokio::test]
    async fn test_missing_trusted_ca_degrades_without_writes() {
        let h = Harness::new();
        h.platform("OpenStack");

        let err = h.reconcile().await.unwrap_err();
        assert!(matches!(err, crate::error::Error::ConfigError(_)));
        assert!(h.deployments.actions().is_empty());
        assert!(h.validating.actions().is_empty());

        let status = h.operator_status();
        let degraded = find_condition(&status.conditions, "Degraded").unwrap();
        assert_eq!(degraded.status, "True");
        assert!(degraded.message.contains("mao-trusted-ca"));
    }

    #[tokio::test]
    async fn test_apply_failure_is_returned_and_reported() {
        let h = Harness::new();
        h.platform("OpenStack");
        h.trusted_ca("ca");
        h.deployments.fail_next(Verb::Create);

        let err = h.reconcile().await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(
            condition_status(&h.operator_status(), "Degraded").as_deref(),
            Some("True")
        );

        // next cycle recovers
        h.reconcile().await.unwrap();
        assert_eq!(h.deployments.objects().len(), 1);
    }
}
