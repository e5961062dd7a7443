//! ClusterOperator status reporting
//!
//! The `machine-api` ClusterOperator carries the coarse Available /
//! Progressing / Degraded / Upgradeable state, the operand version once
//! available, and the objects an admin should look at when debugging.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::controller::conditions::{
    is_condition_true, set_condition, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE,
    CONDITION_TYPE_AVAILABLE, CONDITION_TYPE_DEGRADED, CONDITION_TYPE_PROGRESSING,
    CONDITION_TYPE_UPGRADEABLE,
};
use crate::controller::metrics;
use crate::crd::{
    ClusterOperator, ClusterOperatorSpec, ClusterOperatorStatus, OperandVersion, RelatedObject,
};
use crate::error::Result;
use crate::store::ObjectStore;

pub const CLUSTER_OPERATOR_NAME: &str = "machine-api";
pub const OPERATOR_VERSION_NAME: &str = "operator";

pub const REASON_SYNCING: &str = "SyncingResources";
pub const REASON_SYNC_FAILED: &str = "SyncingFailed";
pub const REASON_AS_EXPECTED: &str = "AsExpected";

pub struct StatusReporter {
    store: Arc<dyn ObjectStore<ClusterOperator>>,
    clock: Arc<dyn Clock>,
    namespace: String,
    release_version: String,
}

impl StatusReporter {
    pub fn new(
        store: Arc<dyn ObjectStore<ClusterOperator>>,
        clock: Arc<dyn Clock>,
        namespace: &str,
        release_version: &str,
    ) -> Self {
        Self {
            store,
            clock,
            namespace: namespace.to_string(),
            release_version: release_version.to_string(),
        }
    }

    pub fn release_version(&self) -> &str {
        &self.release_version
    }

    fn desired_versions(&self) -> Vec<OperandVersion> {
        vec![OperandVersion {
            name: OPERATOR_VERSION_NAME.to_string(),
            version: self.release_version.clone(),
        }]
    }

    fn related_objects(&self) -> Vec<RelatedObject> {
        let namespaced = |group: &str, resource: &str, name: &str| RelatedObject {
            group: group.to_string(),
            resource: resource.to_string(),
            namespace: Some(self.namespace.clone()),
            name: name.to_string(),
        };
        vec![
            RelatedObject {
                group: String::new(),
                resource: "namespaces".to_string(),
                namespace: None,
                name: self.namespace.clone(),
            },
            namespaced("machine.openshift.io", "machines", ""),
            namespaced("machine.openshift.io", "machinesets", ""),
            namespaced("healthchecking.openshift.io", "machinehealthchecks", ""),
            namespaced("apps", "deployments", super::render::DEPLOYMENT_NAME),
        ]
    }

    /// The `machine-api` ClusterOperator, created without status if missing.
    pub async fn get_or_create(&self) -> Result<ClusterOperator> {
        if let Some(co) = self.store.get(CLUSTER_OPERATOR_NAME).await? {
            return Ok(co);
        }
        debug!("Creating ClusterOperator {CLUSTER_OPERATOR_NAME}");
        let co = ClusterOperator::new(CLUSTER_OPERATOR_NAME, ClusterOperatorSpec {});
        match self.store.create(&co).await {
            Ok(created) => Ok(created),
            // lost a create race with another writer
            Err(e) if e.is_conflict() => {
                crate::store::get_required(self.store.as_ref(), "ClusterOperator", CLUSTER_OPERATOR_NAME)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Current status, if the ClusterOperator exists.
    pub async fn current(&self) -> Result<Option<ClusterOperatorStatus>> {
        Ok(self
            .store
            .get(CLUSTER_OPERATOR_NAME)
            .await?
            .and_then(|co| co.status))
    }

    /// True until the operator has reported Available at least once.
    pub async fn is_initializing(&self) -> Result<bool> {
        Ok(!self
            .current()
            .await?
            .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_TYPE_AVAILABLE)))
    }

    async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut ClusterOperatorStatus, chrono::DateTime<chrono::Utc>),
    {
        let co = self.get_or_create().await?;
        let mut status = co.status.clone().unwrap_or_default();
        mutate(&mut status, self.clock.now());
        status.related_objects = self.related_objects();

        for type_ in [
            CONDITION_TYPE_AVAILABLE,
            CONDITION_TYPE_PROGRESSING,
            CONDITION_TYPE_DEGRADED,
        ] {
            metrics::set_operator_condition(
                CLUSTER_OPERATOR_NAME,
                type_,
                is_condition_true(&status.conditions, type_),
            );
        }

        if co.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let mut updated = co;
        updated.status = Some(status);
        self.store.update_status(&updated).await?;
        Ok(())
    }

    /// Report that a sync towards the release version is under way.
    ///
    /// Once the operator is Available at the desired version, routine resyncs
    /// do not flip Progressing.
    pub async fn progressing(&self) -> Result<()> {
        let desired = self.desired_versions();
        let version = self.release_version.clone();
        self.update(|status, now| {
            if status.versions == desired
                && is_condition_true(&status.conditions, CONDITION_TYPE_AVAILABLE)
            {
                return;
            }
            let conditions = &mut status.conditions;
            set_condition(
                conditions,
                CONDITION_TYPE_PROGRESSING,
                CONDITION_STATUS_TRUE,
                REASON_SYNCING,
                &format!("Progressing towards operator: {version}"),
                now,
            );
            for type_ in [CONDITION_TYPE_AVAILABLE, CONDITION_TYPE_DEGRADED] {
                if !conditions.iter().any(|c| c.type_ == type_) {
                    set_condition(conditions, type_, CONDITION_STATUS_FALSE, "", "", now);
                }
            }
            if !conditions.iter().any(|c| c.type_ == CONDITION_TYPE_UPGRADEABLE) {
                set_condition(
                    conditions,
                    CONDITION_TYPE_UPGRADEABLE,
                    CONDITION_STATUS_TRUE,
                    "",
                    "",
                    now,
                );
            }
        })
        .await
    }

    pub async fn available(&self, message: &str) -> Result<()> {
        let desired = self.desired_versions();
        self.update(|status, now| {
            let conditions = &mut status.conditions;
            set_condition(
                conditions,
                CONDITION_TYPE_AVAILABLE,
                CONDITION_STATUS_TRUE,
                REASON_AS_EXPECTED,
                message,
                now,
            );
            set_condition(conditions, CONDITION_TYPE_PROGRESSING, CONDITION_STATUS_FALSE, "", "", now);
            set_condition(conditions, CONDITION_TYPE_DEGRADED, CONDITION_STATUS_FALSE, "", "", now);
            set_condition(conditions, CONDITION_TYPE_UPGRADEABLE, CONDITION_STATUS_TRUE, "", "", now);
            status.versions = desired;
        })
        .await
    }

    pub async fn degraded(&self, message: &str) -> Result<()> {
        warn!(%message, "Operator degraded");
        self.update(|status, now| {
            let conditions = &mut status.conditions;
            set_condition(
                conditions,
                CONDITION_TYPE_DEGRADED,
                CONDITION_STATUS_TRUE,
                REASON_SYNC_FAILED,
                message,
                now,
            );
            set_condition(
                conditions,
                CONDITION_TYPE_UPGRADEABLE,
                CONDITION_STATUS_FALSE,
                REASON_SYNC_FAILED,
                "Cannot upgrade while degraded",
                now,
            );
            if !conditions.iter().any(|c| c.type_ == CONDITION_TYPE_AVAILABLE) {
                set_condition(conditions, CONDITION_TYPE_AVAILABLE, CONDITION_STATUS_FALSE, "", "", now);
            }
        })
        .await
    }
}
