//! MachineHealthCheck controller
//!
//! Reconciles are keyed by Node. A Node whose configured unhealthy condition
//! outlives its timeout gets its Machine deleted so the owning MachineSet
//! replaces it.

mod reconciler;
pub mod unhealthy;

#[cfg(test)]
mod reconciler_test;

pub use reconciler::{skip_reason, targets, MachineHealthCheckReconciler, SkipReason};
pub use unhealthy::{UnhealthyCondition, Verdict};
