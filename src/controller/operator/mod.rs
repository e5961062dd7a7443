//! Operator rollout controller
//!
//! Renders the machine-api controller Deployment, the termination handler
//! DaemonSet and the admission webhook configurations from the release image
//! bundle, applies them, waits for the rollout and reports the result on the
//! `machine-api` ClusterOperator.

pub mod apply;
pub mod config;
pub mod render;
pub mod rollout;
pub mod status;
mod sync;
pub mod workers;

#[cfg(test)]
mod sync_test;

pub use config::{FeatureGates, Images, OperatorConfig, OperatorSettings, NO_OP_PROVIDER};
pub use status::{StatusReporter, CLUSTER_OPERATOR_NAME};
pub use sync::{OperatorReconciler, OperatorStores, CLUSTER_CONFIG_NAME, OPERATOR_KEY};
