//! MachineSet controller
//!
//! Keeps `spec.replicas` Machines stamped from the template, adopting
//! matching orphans, releasing Machines whose labels drift away, and
//! choosing scale-down victims by delete policy.

pub mod delete_policy;
mod reconciler;
pub mod status;


pub use reconciler::{
    generate_name, machine_from_template, owner_reference, MachineSetReconciler, BURST_REPLICAS,
};
