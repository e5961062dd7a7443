//! Minimum running workers gate, applied while the cluster initializes

use std::collections::BTreeSet;

use kube::{Resource, ResourceExt};

use crate::crd::{Machine, MachinePhase, MachineSet, MACHINE_ROLE_LABEL, MACHINE_TYPE_LABEL};
use crate::engine::controller_owner_key;

/// Running workers required before the operator first reports Available
pub const MIN_WORKERS: i32 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerCheck {
    pub required: usize,
    pub running: usize,
    /// Worker Machines not yet Running, by name
    pub waiting_for: Vec<String>,
}

impl WorkerCheck {
    pub fn is_met(&self) -> bool {
        self.running >= self.required
    }

    pub fn message(&self) -> String {
        format!(
            "minimum worker replica count ({}) not yet met: current running replicas {}, waiting for [{}]",
            self.required,
            self.running,
            self.waiting_for.join(", ")
        )
    }
}

fn is_master_template(ms: &MachineSet) -> bool {
    let labels = &ms.spec.template.metadata.labels;
    [MACHINE_ROLE_LABEL, MACHINE_TYPE_LABEL]
        .iter()
        .any(|key| labels.get(*key).map(String::as_str) == Some("master"))
}

/// Compare running worker Machines against `min(MIN_WORKERS, sum(replicas))`
/// over the worker MachineSets. Only Machines controlled by one of those
/// sets count.
pub fn check(machine_sets: &[MachineSet], machines: &[Machine]) -> WorkerCheck {
    let worker_sets: Vec<&MachineSet> = machine_sets
        .iter()
        .filter(|ms| !is_master_template(ms))
        .collect();
    let expected: i32 = worker_sets.iter().map(|ms| ms.spec.replicas.max(0)).sum();
    let required = expected.min(MIN_WORKERS).max(0) as usize;

    let set_names: BTreeSet<String> = worker_sets.iter().map(|ms| ms.name_any()).collect();
    let owned_by_worker_set = |m: &&Machine| {
        controller_owner_key(&MachineSet::kind(&()), *m)
            .iter()
            .any(|key| set_names.contains(&key.name))
    };

    let mut running = 0;
    let mut waiting_for = Vec::new();
    for machine in machines.iter().filter(owned_by_worker_set) {
        if machine.phase() == Some(MachinePhase::Running) {
            running += 1;
        } else {
            waiting_for.push(machine.name_any());
        }
    }
    waiting_for.sort();

    WorkerCheck {
        required,
        running,
        waiting_for,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MachineSetSpec, MachineSpec, MachineStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::collections::BTreeMap;

    fn machine_set(name: &str, replicas: i32, role: &str) -> MachineSet {
        let mut ms = MachineSet::new(
            name,
            MachineSetSpec {
                replicas,
                ..Default::default()
            },
        );
        ms.spec
            .template
            .metadata
            .labels
            .insert(MACHINE_ROLE_LABEL.to_string(), role.to_string());
        ms
    }

    fn machine(name: &str, phase: Option<MachinePhase>, role: &str) -> Machine {
        let owner = if role == "master" { "masters" } else { "workers" };
        let mut m = unowned(name, phase, role);
        m.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "machine.openshift.io/v1beta1".to_string(),
            kind: "MachineSet".to_string(),
            name: owner.to_string(),
            uid: format!("{owner}-uid"),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]);
        m
    }

    fn unowned(name: &str, phase: Option<MachinePhase>, role: &str) -> Machine {
        let mut m = Machine::new(name, MachineSpec::default());
        m.metadata.labels = Some(BTreeMap::from([(
            MACHINE_ROLE_LABEL.to_string(),
            role.to_string(),
        )]));
        m.status = Some(MachineStatus {
            phase,
            ..Default::default()
        });
        m
    }

    #[test]
    fn test_requires_two_running_workers() {
        let sets = vec![machine_set("workers", 3, "worker"), machine_set("masters", 3, "master")];
        let machines = vec![
            machine("w-1", Some(MachinePhase::Running), "worker"),
            machine("w-2", Some(MachinePhase::Provisioning), "worker"),
            machine("w-3", None, "worker"),
            machine("m-1", Some(MachinePhase::Running), "master"),
        ];

        let result = check(&sets, &machines);
        assert_eq!(result.required, 2);
        assert_eq!(result.running, 1);
        assert!(!result.is_met());
        assert_eq!(result.waiting_for, vec!["w-2", "w-3"]);
        assert!(result.message().contains("waiting for [w-2, w-3]"));
    }

    #[test]
    fn test_single_replica_needs_one() {
        let sets = vec![machine_set("workers", 1, "worker")];
        let machines = vec![machine("w-1", Some(MachinePhase::Running), "worker")];
        let result = check(&sets, &machines);
        assert_eq!(result.required, 1);
        assert!(result.is_met());
    }

    #[test]
    fn test_machines_outside_worker_sets_do_not_count() {
        let sets = vec![machine_set("workers", 2, "worker")];
        let machines = vec![
            machine("w-1", Some(MachinePhase::Running), "worker"),
            unowned("stray", Some(MachinePhase::Running), "worker"),
        ];

        let result = check(&sets, &machines);
        assert_eq!(result.required, 2);
        assert_eq!(result.running, 1);
        assert!(!result.is_met());
        assert!(result.waiting_for.is_empty());
    }

    #[test]
    fn test_no_worker_sets() {
        let result = check(&[], &[]);
        assert_eq!(result.required, 0);
        assert!(result.is_met());
    }
}
