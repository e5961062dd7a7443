//! Prometheus metrics for the Machine API operator
//!
//! # Exported metrics
//! - `mapi_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `mapi_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `mapi_reconciles_in_flight` (gauge): running reconciles labeled by controller.
//! - `mapi_machine_set_replicas` (gauge): desired/current/ready/available replicas per MachineSet.
//! - `mapi_machine_items` / `mapi_machineset_items` (gauge): objects seen by the collector.
//! - `mapi_machine_phase` (gauge): Machines per namespace and phase.
//! - `mapi_remediations_total` (counter): Machines deleted by health checks.
//! - `mapi_mao_collector_up` (gauge) and `mapi_collection_failures_total` (counter).
//! - `mapi_operator_condition` (gauge): 1 when the ClusterOperator condition is True.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "machineset"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, see `Error::kind_label`
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MachineSetLabels {
    pub namespace: String,
    pub name: String,
    /// "desired", "current", "ready" or "available"
    pub replicas: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NamespaceLabels {
    pub namespace: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub namespace: String,
    pub phase: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RemediationLabels {
    pub namespace: String,
    pub healthcheck: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConditionLabels {
    pub name: String,
    pub condition: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static RECONCILES_IN_FLIGHT: Lazy<Family<ReconcileLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static MACHINE_SET_REPLICAS: Lazy<Family<MachineSetLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static MACHINE_ITEMS: Lazy<Family<NamespaceLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static MACHINESET_ITEMS: Lazy<Family<NamespaceLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static MACHINE_PHASE: Lazy<Family<PhaseLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static REMEDIATIONS_TOTAL: Lazy<Family<RemediationLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// 1 when the last collection succeeded
pub static COLLECTOR_UP: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

pub static COLLECTION_FAILURES_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static OPERATOR_CONDITION: Lazy<Family<ConditionLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "mapi_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "mapi_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "mapi_reconciles_in_flight",
        "Number of reconciles currently running per controller",
        RECONCILES_IN_FLIGHT.clone(),
    );
    registry.register(
        "mapi_machine_set_replicas",
        "MachineSet replica counts by kind",
        MACHINE_SET_REPLICAS.clone(),
    );
    registry.register(
        "mapi_machine_items",
        "Count of Machine objects currently at the apiserver",
        MACHINE_ITEMS.clone(),
    );
    registry.register(
        "mapi_machineset_items",
        "Count of MachineSet objects currently at the apiserver",
        MACHINESET_ITEMS.clone(),
    );
    registry.register(
        "mapi_machine_phase",
        "Machines by lifecycle phase",
        MACHINE_PHASE.clone(),
    );
    registry.register(
        "mapi_remediations_total",
        "Machines deleted by a MachineHealthCheck",
        REMEDIATIONS_TOTAL.clone(),
    );
    registry.register(
        "mapi_mao_collector_up",
        "Machine API operator metrics are being collected",
        COLLECTOR_UP.clone(),
    );
    registry.register(
        "mapi_collection_failures_total",
        "Number of failed metric collection cycles",
        COLLECTION_FAILURES_TOTAL.clone(),
    );
    registry.register(
        "mapi_operator_condition",
        "ClusterOperator condition status (1 = True)",
        OPERATOR_CONDITION.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

/// Track a reconcile starting (`delta = 1`) or finishing (`delta = -1`).
pub fn add_reconciles_in_flight(controller: &str, delta: i64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILES_IN_FLIGHT.get_or_create(&labels).inc_by(delta);
}

/// Record the replica counters of one MachineSet.
pub fn set_machine_set_replicas(
    namespace: &str,
    name: &str,
    desired: i32,
    current: i32,
    ready: i32,
    available: i32,
) {
    for (kind, value) in [
        ("desired", desired),
        ("current", current),
        ("ready", ready),
        ("available", available),
    ] {
        let labels = MachineSetLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            replicas: kind.to_string(),
        };
        MACHINE_SET_REPLICAS
            .get_or_create(&labels)
            .set(i64::from(value));
    }
}

pub fn set_machine_items(namespace: &str, count: usize) {
    MACHINE_ITEMS
        .get_or_create(&NamespaceLabels {
            namespace: namespace.to_string(),
        })
        .set(count as i64);
}

pub fn set_machineset_items(namespace: &str, count: usize) {
    MACHINESET_ITEMS
        .get_or_create(&NamespaceLabels {
            namespace: namespace.to_string(),
        })
        .set(count as i64);
}

pub fn set_machine_phase(namespace: &str, phase: &str, count: usize) {
    MACHINE_PHASE
        .get_or_create(&PhaseLabels {
            namespace: namespace.to_string(),
            phase: phase.to_string(),
        })
        .set(count as i64);
}

pub fn inc_remediation(namespace: &str, healthcheck: &str) {
    REMEDIATIONS_TOTAL
        .get_or_create(&RemediationLabels {
            namespace: namespace.to_string(),
            healthcheck: healthcheck.to_string(),
        })
        .inc();
}

/// Record the outcome of one collector pass.
pub fn record_collection(success: bool) {
    if success {
        COLLECTOR_UP.set(1);
    } else {
        COLLECTOR_UP.set(0);
        COLLECTION_FAILURES_TOTAL.inc();
    }
}

pub fn set_operator_condition(name: &str, condition: &str, is_true: bool) {
    OPERATOR_CONDITION
        .get_or_create(&ConditionLabels {
            name: name.to_string(),
            condition: condition.to_string(),
        })
        .set(i64::from(is_true));
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_registry_encodes_machine_metrics() {
        set_machine_set_replicas("openshift-machine-api", "workers", 3, 3, 2, 1);
        inc_reconcile_error("machineset", "conflict");

        let mut buffer = String::new();
        encode(&mut buffer, &REGISTRY).unwrap();
        assert!(buffer.contains("mapi_machine_set_replicas"));
        assert!(buffer.contains("replicas=\"available\""));
        assert!(buffer.contains("kind=\"conflict\""));
    }

    #[test]
    fn test_collection_failures_increment() {
        let before = COLLECTION_FAILURES_TOTAL.get();
        record_collection(false);
        assert!(COLLECTION_FAILURES_TOTAL.get() > before);
    }

    #[test]
    fn test_operator_condition_gauge() {
        set_operator_condition("machine-api", "Available", true);
        let labels = ConditionLabels {
            name: "machine-api".to_string(),
            condition: "Available".to_string(),
        };
        assert_eq!(OPERATOR_CONDITION.get_or_create(&labels).get(), 1);
    }
}
