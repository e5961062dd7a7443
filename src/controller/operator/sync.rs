//! Operator rollout reconcile

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::ConfigMap;
use tracing::{info, instrument, warn};

use super::apply::{apply, GenerationCache};
use super::config::{Images, OperatorConfig, OperatorSettings};
use super::render::{self, TRUSTED_CA_CONFIG_MAP};
use super::rollout::{self, Rollout, MIN_AVAILABILITY_WINDOW, ROLLOUT_POLL_INTERVAL};
use super::status::StatusReporter;
use super::workers;
use crate::clock::Clock;
use crate::crd::{ClusterOperator, Infrastructure, Machine, MachineSet, Proxy};
use crate::engine::{Action, ObjectKey, Reconciler};
use crate::error::{Error, Result};
use crate::store::ObjectStore;

/// Name of the cluster-scoped Infrastructure and Proxy singletons
pub const CLUSTER_CONFIG_NAME: &str = "cluster";

/// Key every operator reconcile runs under, whichever watched change triggered it.
pub const OPERATOR_KEY: &str = "machine-api-operator";

/// Stores the operator reads and writes
#[derive(Clone)]
pub struct OperatorStores {
    pub deployments: Arc<dyn ObjectStore<Deployment>>,
    pub daemon_sets: Arc<dyn ObjectStore<DaemonSet>>,
    pub validating_webhooks: Arc<dyn ObjectStore<ValidatingWebhookConfiguration>>,
    pub mutating_webhooks: Arc<dyn ObjectStore<MutatingWebhookConfiguration>>,
    pub config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    pub machine_sets: Arc<dyn ObjectStore<MachineSet>>,
    pub machines: Arc<dyn ObjectStore<Machine>>,
    pub infrastructures: Arc<dyn ObjectStore<Infrastructure>>,
    pub proxies: Arc<dyn ObjectStore<Proxy>>,
    pub cluster_operators: Arc<dyn ObjectStore<ClusterOperator>>,
}

pub struct OperatorReconciler {
    stores: OperatorStores,
    images: Images,
    settings: OperatorSettings,
    clock: Arc<dyn Clock>,
    generations: GenerationCache,
    status: StatusReporter,
    availability_window: Duration,
}

impl OperatorReconciler {
    pub fn new(
        stores: OperatorStores,
        images: Images,
        settings: OperatorSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let status = StatusReporter::new(
            stores.cluster_operators.clone(),
            clock.clone(),
            &settings.namespace,
            &settings.release_version,
        );
        Self {
            stores,
            images,
            settings,
            clock,
            generations: GenerationCache::new(),
            status,
            availability_window: MIN_AVAILABILITY_WINDOW,
        }
    }

    pub fn with_availability_window(mut self, window: Duration) -> Self {
        self.availability_window = window;
        self
    }

    /// Make sure the ClusterOperator the controller is keyed on exists.
    pub async fn ensure_cluster_operator(&self) -> Result<()> {
        self.status.get_or_create().await.map(|_| ())
    }

    async fn resolve_config(&self) -> Result<OperatorConfig> {
        let infrastructure = self
            .stores
            .infrastructures
            .get(CLUSTER_CONFIG_NAME)
            .await?
            .and_then(|i| i.status);
        let proxy = self
            .stores
            .proxies
            .get(CLUSTER_CONFIG_NAME)
            .await?
            .and_then(|p| p.status);
        OperatorConfig::resolve(
            &self.images,
            &self.settings,
            infrastructure.as_ref(),
            proxy.as_ref(),
        )
    }

    #[instrument(skip(self), fields(namespace = %self.settings.namespace))]
    async fn sync(&self) -> Result<Action> {
        let cfg = self.resolve_config().await?;
        if cfg.is_no_op() {
            info!(platform = %cfg.platform, "No machine controller for platform, running in no-op mode");
            self.status
                .available("Cluster Machine API Operator is in NoOp mode")
                .await?;
            return Ok(Action::await_change());
        }

        let trusted_ca = self
            .stores
            .config_maps
            .get(TRUSTED_CA_CONFIG_MAP)
            .await?
            .ok_or_else(|| {
                Error::ConfigError(format!(
                    "ConfigMap {}/{TRUSTED_CA_CONFIG_MAP} not found",
                    cfg.target_namespace
                ))
            })?;
        let dependencies = render::dependency_annotations(&trusted_ca)?;

        // Render everything up front so a bad input writes nothing.
        let deployment = render::controllers_deployment(&cfg, &dependencies);
        let daemon_set = render::termination_handler_daemonset(&cfg);
        let validating = render::validating_webhook_configuration(&cfg);
        let mutating = render::mutating_webhook_configuration(&cfg);

        apply(
            self.stores.validating_webhooks.as_ref(),
            &self.generations,
            validating,
        )
        .await?;
        apply(
            self.stores.mutating_webhooks.as_ref(),
            &self.generations,
            mutating,
        )
        .await?;
        let (deployment, _) =
            apply(self.stores.deployments.as_ref(), &self.generations, deployment).await?;
        let daemon_set = match daemon_set {
            Some(ds) => Some(
                apply(self.stores.daemon_sets.as_ref(), &self.generations, ds)
                    .await?
                    .0,
            ),
            None => None,
        };

        let now = self.clock.now();
        if let Rollout::Pending(reason) =
            rollout::deployment_rollout(&deployment, now, self.availability_window)
        {
            info!(%reason, "Waiting for {} rollout", render::DEPLOYMENT_NAME);
            return Ok(Action::requeue(ROLLOUT_POLL_INTERVAL));
        }
        if let Some(Rollout::Pending(reason)) = daemon_set.as_ref().map(rollout::daemonset_rollout)
        {
            info!(%reason, "Waiting for {} rollout", render::TERMINATION_HANDLER_NAME);
            return Ok(Action::requeue(ROLLOUT_POLL_INTERVAL));
        }

        if self.status.is_initializing().await? {
            let machine_sets = self.stores.machine_sets.list(None).await?;
            let machines = self.stores.machines.list(None).await?;
            let check = workers::check(&machine_sets, &machines);
            if !check.is_met() {
                self.status.degraded(&check.message()).await?;
                return Ok(Action::requeue(ROLLOUT_POLL_INTERVAL));
            }
        }

        self.status
            .available(&format!(
                "Cluster Machine API Operator is available at {}",
                self.status.release_version()
            ))
            .await?;
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler for OperatorReconciler {
    fn name(&self) -> &'static str {
        "operator"
    }

    async fn reconcile(&self, _key: &ObjectKey) -> Result<Action> {
        self.status.progressing().await?;
        match self.sync().await {
            Ok(action) => Ok(action),
            Err(e) => {
                if let Err(status_err) = self.status.degraded(&e.to_string()).await {
                    warn!("Failed to report Degraded status: {status_err}");
                }
                Err(e)
            }
        }
    }
}
