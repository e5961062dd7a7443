//! Unhealthy Node condition configuration and evaluation

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use serde::{Deserialize, Serialize};

use crate::controller::nodes;
use crate::crd::UnhealthyConditionStatus;
use crate::error::{Error, Result};

/// ConfigMap in the operator namespace holding the condition list
pub const CONFIG_MAP_NAME: &str = "node-unhealthy-conditions";
pub const CONFIG_MAP_KEY: &str = "conditions";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// A Node condition that counts as unhealthy once it has held for `timeout`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct UnhealthyCondition {
    /// Node condition type, e.g. `Ready`
    pub name: String,
    pub status: String,
    #[serde(with = "crate::duration::serde_duration")]
    pub timeout: Duration,
}

impl UnhealthyCondition {
    pub fn new(name: &str, status: &str, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            status: status.to_string(),
            timeout,
        }
    }

    pub fn to_status(&self) -> UnhealthyConditionStatus {
        UnhealthyConditionStatus {
            type_: self.name.clone(),
            status: self.status.clone(),
            timeout: crate::duration::format(self.timeout),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConditionList {
    #[serde(default)]
    items: Vec<UnhealthyCondition>,
}

/// Conditions used when no ConfigMap exists
pub fn defaults() -> Vec<UnhealthyCondition> {
    vec![
        UnhealthyCondition::new("Ready", "Unknown", DEFAULT_TIMEOUT),
        UnhealthyCondition::new("Ready", "False", DEFAULT_TIMEOUT),
    ]
}

/// Parse the `conditions` document: `items: [{name, status, timeout}]`.
pub fn parse(raw: &str) -> Result<Vec<UnhealthyCondition>> {
    let list: ConditionList = serde_yaml::from_str(raw)?;
    if list.items.is_empty() {
        return Err(Error::ConfigError(format!(
            "{CONFIG_MAP_NAME}: no unhealthy conditions configured"
        )));
    }
    Ok(list.items)
}

/// Resolve the configured conditions, falling back to the defaults when the
/// ConfigMap is absent.
pub fn from_config_map(config_map: Option<&ConfigMap>) -> Result<Vec<UnhealthyCondition>> {
    let Some(cm) = config_map else {
        return Ok(defaults());
    };
    let raw = cm
        .data
        .as_ref()
        .and_then(|d| d.get(CONFIG_MAP_KEY))
        .ok_or_else(|| {
            Error::ConfigError(format!("{CONFIG_MAP_NAME} has no {CONFIG_MAP_KEY:?} key"))
        })?;
    parse(raw)
}

/// Configured conditions currently present on the Node, regardless of age
pub fn active<'a>(
    node: &'a Node,
    conditions: &'a [UnhealthyCondition],
) -> impl Iterator<Item = &'a UnhealthyCondition> + 'a {
    conditions.iter().filter(move |c| {
        nodes::find_condition(node, &c.name).is_some_and(|nc| nc.status == c.status)
    })
}

/// Outcome of checking one Node against the configured conditions
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// Unhealthy but inside every timeout; the earliest expiry is `remaining` away.
    Pending { remaining: Duration },
    /// An unhealthy condition has held past its timeout.
    Expired { condition: UnhealthyCondition },
}

pub fn evaluate(node: &Node, conditions: &[UnhealthyCondition], now: DateTime<Utc>) -> Verdict {
    let mut remaining: Option<Duration> = None;

    for condition in active(node, conditions) {
        let since = nodes::find_condition(node, &condition.name)
            .and_then(|c| c.last_transition_time.as_ref())
            .map(|t| t.0);
        // A condition without a transition time has been observed for zero time.
        let age = since
            .and_then(|t| (now - t).to_std().ok())
            .unwrap_or(Duration::ZERO);

        if age >= condition.timeout {
            return Verdict::Expired {
                condition: condition.clone(),
            };
        }
        let left = condition.timeout - age;
        remaining = Some(remaining.map_or(left, |r| r.min(left)));
    }

    match remaining {
        Some(remaining) => Verdict::Pending { remaining },
        None => Verdict::Healthy,
    }
}
