//! Rollout progress of the managed workloads

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};

/// How long a Deployment must report Available before it counts as rolled out
pub const MIN_AVAILABILITY_WINDOW: Duration = Duration::from_secs(3 * 60);

/// Poll interval while a rollout is in progress
pub const ROLLOUT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rollout {
    Complete,
    /// Still rolling out, with a human-readable reason
    Pending(String),
}

impl Rollout {
    pub fn is_complete(&self) -> bool {
        matches!(self, Rollout::Complete)
    }
}

pub fn deployment_rollout(d: &Deployment, now: DateTime<Utc>, window: Duration) -> Rollout {
    let Some(status) = d.status.as_ref() else {
        return Rollout::Pending("deployment has no status yet".to_string());
    };
    let generation = d.metadata.generation.unwrap_or_default();
    let observed = status.observed_generation.unwrap_or_default();
    if observed < generation {
        return Rollout::Pending(format!(
            "deployment generation {generation} not yet observed (at {observed})"
        ));
    }

    let replicas = status.replicas.unwrap_or_default();
    let updated = status.updated_replicas.unwrap_or_default();
    if updated != replicas {
        return Rollout::Pending(format!("{updated} of {replicas} replicas updated"));
    }
    let unavailable = status.unavailable_replicas.unwrap_or_default();
    if unavailable != 0 {
        return Rollout::Pending(format!("{unavailable} replicas unavailable"));
    }

    let available = status
        .conditions
        .iter()
        .flatten()
        .find(|c| c.type_ == "Available" && c.status == "True");
    let Some(since) = available.and_then(|c| c.last_transition_time.as_ref()) else {
        return Rollout::Pending("deployment is not Available".to_string());
    };

    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
    let ready_at = since.0 + window;
    if ready_at > now {
        let left = (ready_at - now).num_seconds().max(1);
        return Rollout::Pending(format!(
            "deployment Available for less than the minimum window, {left}s left"
        ));
    }
    Rollout::Complete
}

pub fn daemonset_rollout(ds: &DaemonSet) -> Rollout {
    let Some(status) = ds.status.as_ref() else {
        return Rollout::Pending("daemonset has no status yet".to_string());
    };
    let generation = ds.metadata.generation.unwrap_or_default();
    let observed = status.observed_generation.unwrap_or_default();
    if observed < generation {
        return Rollout::Pending(format!(
            "daemonset generation {generation} not yet observed (at {observed})"
        ));
    }
    let updated = status.updated_number_scheduled.unwrap_or_default();
    if updated != status.desired_number_scheduled {
        return Rollout::Pending(format!(
            "{updated} of {} pods updated",
            status.desired_number_scheduled
        ));
    }
    let unavailable = status.number_unavailable.unwrap_or_default();
    if unavailable != 0 {
        return Rollout::Pending(format!("{unavailable} pods unavailable"));
    }
    Rollout::Complete
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use k8s_openapi::api::apps::v1::{DaemonSetStatus, DeploymentCondition, DeploymentStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    /// Status of a fully rolled out single-replica Deployment, Available since `since`
    pub fn available_status(generation: i64, since: DateTime<Utc>) -> DeploymentStatus {
        DeploymentStatus {
            observed_generation: Some(generation),
            replicas: Some(1),
            updated_replicas: Some(1),
            ready_replicas: Some(1),
            available_replicas: Some(1),
            conditions: Some(vec![DeploymentCondition {
                type_: "Available".to_string(),
                status: "True".to_string(),
                last_transition_time: Some(Time(since)),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    pub fn scheduled_status(generation: i64, desired: i32) -> DaemonSetStatus {
        DaemonSetStatus {
            observed_generation: Some(generation),
            desired_number_scheduled: desired,
            updated_number_scheduled: Some(desired),
            number_available: Some(desired),
            number_ready: desired,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn deployment(generation: i64) -> Deployment {
        let mut d = Deployment::default();
        d.metadata.generation = Some(generation);
        d
    }

    #[test]
    fn test_availability_window() {
        let t0 = Utc::now();
        let mut d = deployment(1);
        d.status = Some(available_status(1, t0));

        for offset in [0, 60, 120, 179] {
            let now = t0 + chrono::Duration::seconds(offset);
            assert!(
                !deployment_rollout(&d, now, MIN_AVAILABILITY_WINDOW).is_complete(),
                "t0+{offset}s"
            );
        }
        let now = t0 + chrono::Duration::seconds(181);
        assert_eq!(
            deployment_rollout(&d, now, MIN_AVAILABILITY_WINDOW),
            Rollout::Complete
        );
    }

    #[test]
    fn test_deployment_pending_states() {
        let t0 = Utc::now() - chrono::Duration::hours(1);
        let now = Utc::now();
        assert!(!deployment_rollout(&deployment(1), now, Duration::ZERO).is_complete());

        let mut stale = deployment(2);
        stale.status = Some(available_status(1, t0));
        assert!(!deployment_rollout(&stale, now, Duration::ZERO).is_complete());

        let mut unavailable = deployment(1);
        let mut status = available_status(1, t0);
        status.unavailable_replicas = Some(1);
        unavailable.status = Some(status);
        assert!(!deployment_rollout(&unavailable, now, Duration::ZERO).is_complete());

        let mut not_available = deployment(1);
        let mut status = available_status(1, t0);
        if let Some(c) = status.conditions.as_mut() {
            c[0].status = "False".to_string();
        }
        not_available.status = Some(status);
        assert!(!deployment_rollout(&not_available, now, Duration::ZERO).is_complete());
    }

    #[test]
    fn test_daemonset_rollout() {
        let mut ds = DaemonSet::default();
        ds.metadata.generation = Some(3);
        assert!(!daemonset_rollout(&ds).is_complete());

        ds.status = Some(scheduled_status(3, 4));
        assert!(daemonset_rollout(&ds).is_complete());

        let mut status = scheduled_status(3, 4);
        status.updated_number_scheduled = Some(2);
        ds.status = Some(status);
        assert!(!daemonset_rollout(&ds).is_complete());

        ds.status = Some(scheduled_status(2, 4));
        assert!(!daemonset_rollout(&ds).is_complete());
    }
}
