//! Periodic Machine and MachineSet gauge refresh

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tracing::{debug, warn};

use super::metrics;
use crate::crd::{Machine, MachineSet};
use crate::engine::ShutdownSignal;
use crate::error::Result;
use crate::store::ObjectStore;

/// Interval between collector passes
pub const COLLECTION_INTERVAL: Duration = Duration::from_secs(30);

pub struct Collector {
    machines: Arc<dyn ObjectStore<Machine>>,
    machine_sets: Arc<dyn ObjectStore<MachineSet>>,
    namespace: String,
}

impl Collector {
    pub fn new(
        machines: Arc<dyn ObjectStore<Machine>>,
        machine_sets: Arc<dyn ObjectStore<MachineSet>>,
        namespace: &str,
    ) -> Self {
        Self {
            machines,
            machine_sets,
            namespace: namespace.to_string(),
        }
    }

    /// List both kinds once and publish the gauges.
    pub async fn collect(&self) -> Result<()> {
        let machine_sets = self.machine_sets.list(None).await?;
        let machines = self.machines.list(None).await?;

        metrics::set_machineset_items(&self.namespace, machine_sets.len());
        metrics::set_machine_items(&self.namespace, machines.len());

        for ms in &machine_sets {
            let status = ms.status.clone().unwrap_or_default();
            metrics::set_machine_set_replicas(
                &self.namespace,
                &ms.name_any(),
                ms.spec.replicas,
                status.replicas,
                status.ready_replicas,
                status.available_replicas,
            );
        }

        let mut phases: BTreeMap<String, usize> = BTreeMap::new();
        for m in &machines {
            let phase = m
                .phase()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "Unknown".to_string());
            *phases.entry(phase).or_default() += 1;
        }
        for (phase, count) in phases {
            metrics::set_machine_phase(&self.namespace, &phase, count);
        }
        debug!(
            machines = machines.len(),
            machine_sets = machine_sets.len(),
            "Collected machine metrics"
        );
        Ok(())
    }

    /// Collect every `interval` until shutdown.
    pub async fn run(self, interval: Duration, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = ticker.tick() => {}
            }
            match self.collect().await {
                Ok(()) => metrics::record_collection(true),
                Err(e) => {
                    warn!("Metrics collection failed: {e}");
                    metrics::record_collection(false);
                }
            }
        }
    }
}
