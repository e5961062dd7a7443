//! Lease-based leader election
//!
//! A candidate takes the `coordination.k8s.io/v1` Lease when it is absent,
//! unheld or expired, then keeps renewing it. Every write carries the
//! resource version that was read, so two candidates racing for the same
//! lease cannot both win. Failing to renew within the renew deadline is
//! fatal; on shutdown the lease is released so a standby can take over
//! without waiting for expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::engine::ShutdownSignal;
use crate::error::{Error, Result};
use crate::store::ObjectStore;

pub const DEFAULT_LEASE_NAME: &str = "machine-api-operator";
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(137);
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(107);
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(26);

#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    /// Holder identity written into the lease, usually the pod hostname
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    pub fn new(identity: &str) -> Self {
        Self {
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            identity: identity.to_string(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity.is_empty() {
            return Err(Error::ConfigError(
                "leader election identity must not be empty".to_string(),
            ));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::ConfigError(format!(
                "lease duration ({:?}) must be greater than renew deadline ({:?})",
                self.lease_duration, self.renew_deadline
            )));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(Error::ConfigError(format!(
                "renew deadline ({:?}) must be greater than retry period ({:?})",
                self.renew_deadline, self.retry_period
            )));
        }
        Ok(())
    }
}

/// Hostname-based identity, falling back to `HOSTNAME` and then a fixed string.
pub fn default_identity() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
        .unwrap_or_else(|| "unknown-host".to_string())
}

pub struct LeaderElector {
    leases: Arc<dyn ObjectStore<Lease>>,
    clock: Arc<dyn Clock>,
    config: LeaderElectionConfig,
}

impl LeaderElector {
    pub fn new(
        leases: Arc<dyn ObjectStore<Lease>>,
        clock: Arc<dyn Clock>,
        config: LeaderElectionConfig,
    ) -> Self {
        Self {
            leases,
            clock,
            config,
        }
    }

    fn lease_seconds(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    fn expired(&self, spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
        let Some(renewed) = spec.renew_time.as_ref() else {
            return true;
        };
        let duration = spec
            .lease_duration_seconds
            .unwrap_or_else(|| self.lease_seconds());
        renewed.0 + chrono::Duration::seconds(i64::from(duration)) < now
    }

    /// One acquire-or-renew attempt. `Ok(false)` means another holder owns a
    /// live lease or won a concurrent write. A write conflict that leaves us
    /// as the holder is returned as a retriable error.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = self.clock.now();
        let identity = self.config.identity.as_str();
        let name = self.config.lease_name.as_str();

        let Some(mut lease) = self.leases.get(name).await? else {
            let mut lease = Lease::default();
            lease.metadata.name = Some(name.to_string());
            lease.spec = Some(LeaseSpec {
                holder_identity: Some(identity.to_string()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(self.lease_seconds()),
                lease_transitions: Some(0),
                ..Default::default()
            });
            return match self.leases.create(&lease).await {
                Ok(_) => {
                    info!(lease = name, %identity, "Created lease");
                    Ok(true)
                }
                Err(e) if e.is_conflict() => Ok(false),
                Err(e) => Err(e),
            };
        };

        let lease_seconds = self.lease_seconds();
        let expired = lease
            .spec
            .as_ref()
            .map(|s| self.expired(s, now))
            .unwrap_or(true);
        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        let holder = spec
            .holder_identity
            .clone()
            .filter(|h| !h.is_empty());

        match holder.as_deref() {
            Some(h) if h == identity => {}
            Some(h) if !expired => {
                debug!(lease = name, holder = h, "Lease held by another candidate");
                return Ok(false);
            }
            previous => {
                info!(lease = name, ?previous, %identity, "Taking over lease");
                spec.holder_identity = Some(identity.to_string());
                spec.acquire_time = Some(MicroTime(now));
                spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
            }
        }
        spec.renew_time = Some(MicroTime(now));
        spec.lease_duration_seconds = Some(lease_seconds);

        match self.leases.update(&lease).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => {
                let current = self
                    .leases
                    .get(name)
                    .await?
                    .and_then(|l| l.spec)
                    .and_then(|s| s.holder_identity);
                if current.as_deref() == Some(identity) {
                    debug!(lease = name, "Lease changed concurrently but is still ours");
                    Err(e)
                } else {
                    debug!(lease = name, holder = ?current, "Lost concurrent lease write");
                    Ok(false)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Retry until the lease is ours. Returns `false` if shutdown came first.
    pub async fn acquire(&self, mut shutdown: ShutdownSignal) -> Result<bool> {
        info!(
            lease = %self.config.lease_name,
            identity = %self.config.identity,
            "Attempting to acquire leader lease"
        );
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(lease = %self.config.lease_name, "Acquired leadership");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Leader election error: {e}"),
            }
            tokio::select! {
                _ = shutdown.recv() => return Ok(false),
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Keep renewing until shutdown, then release.
    ///
    /// Returns `Error::Fatal` once the lease is lost or could not be renewed
    /// within the renew deadline.
    pub async fn hold(&self, mut shutdown: ShutdownSignal) -> Result<()> {
        let deadline = chrono::Duration::from_std(self.config.renew_deadline)
            .map_err(|e| Error::ConfigError(format!("renew deadline out of range: {e}")))?;
        let mut last_renew = self.clock.now();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    if let Err(e) = self.release().await {
                        warn!("Failed to release leader lease: {e}");
                    }
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }

            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    last_renew = self.clock.now();
                    continue;
                }
                Ok(false) => {
                    return Err(Error::Fatal(format!(
                        "leader lease {} taken by another candidate",
                        self.config.lease_name
                    )));
                }
                Err(e) => warn!("Failed to renew leader lease: {e}"),
            }
            if self.clock.now() - last_renew > deadline {
                return Err(Error::Fatal(format!(
                    "leader lease {} not renewed within {:?}",
                    self.config.lease_name, self.config.renew_deadline
                )));
            }
        }
    }

    /// Give the lease up if this instance holds it.
    pub async fn release(&self) -> Result<()> {
        let Some(mut lease) = self.leases.get(&self.config.lease_name).await? else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
            return Ok(());
        }
        spec.holder_identity = None;
        spec.renew_time = Some(MicroTime(self.clock.now()));
        spec.lease_duration_seconds = Some(1);
        self.leases.update(&lease).await?;
        info!(lease = %self.config.lease_name, "Released leadership");
        Ok(())
    }
}
