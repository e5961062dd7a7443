//! Machine API operator
//!
//! Keeps a fleet of Machines consistent with their MachineSets, remediates
//! Machines whose Nodes stay unhealthy past a MachineHealthCheck timeout,
//! and rolls out the machine-api controllers for the cluster's platform.

pub mod clock;
pub mod controller;
pub mod crd;
pub mod duration;
pub mod engine;
pub mod error;
pub mod leader;
pub mod server;
pub mod store;
pub mod telemetry;

pub use crate::error::{Error, Result};
