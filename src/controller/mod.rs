//! Controllers for the Machine API
//!
//! Three reconcilers run on the shared engine: MachineSet replica
//! management, MachineHealthCheck remediation, and the operator that rolls
//! out the machine-api controllers and reports ClusterOperator status.

pub mod collector;
pub mod conditions;
pub mod healthcheck;
pub mod machineset;
pub mod mapping;
pub mod metrics;
pub mod nodes;
pub mod operator;

pub use collector::{Collector, COLLECTION_INTERVAL};
pub use healthcheck::MachineHealthCheckReconciler;
pub use machineset::MachineSetReconciler;
pub use operator::{OperatorReconciler, OperatorStores};
