//! Custom Resource Definitions for the Machine API
//!
//! Machine, MachineSet and MachineHealthCheck are owned by this operator.
//! ClusterOperator, Infrastructure and Proxy belong to the cluster config API
//! and are only read (or, for ClusterOperator, status-written).

mod cluster_operator;
mod machine;
mod machine_health_check;
mod machine_set;
pub mod selector;
pub mod types;


pub use cluster_operator::{
    ClusterOperator, ClusterOperatorSpec, ClusterOperatorStatus, Infrastructure,
    InfrastructureSpec, InfrastructureStatus, OperandVersion, Proxy, ProxySpec, ProxyStatus,
    RelatedObject,
};
pub use machine::{
    parse_machine_annotation, Machine, MachinePhase, MachineSpec, MachineStatus, ProviderSpec,
    DELETE_MACHINE_ANNOTATION, MACHINE_ANNOTATION, MACHINE_ROLE_LABEL, MACHINE_TYPE_LABEL,
    NODE_ROLE_MASTER_LABEL, OLD_DELETE_MACHINE_ANNOTATION,
};
pub use machine_health_check::{
    MachineHealthCheck, MachineHealthCheckSpec, MachineHealthCheckStatus, TargetStatus,
    UnhealthyConditionStatus,
};
pub use machine_set::{
    DeletePolicy, MachineSet, MachineSetSpec, MachineSetStatus, MachineTemplateSpec,
};
pub use types::*;
