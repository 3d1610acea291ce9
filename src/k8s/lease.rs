//! Lease-based leader election
//!
//! Only the holder of the lease writes `UrlPerformance` status; every replica
//! keeps its own config store up to date and processes logs.

use crate::{OfficerError, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{ObjectMeta, PostParams};
use kube::Api;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const LEASE_NAME: &str = "traefik-officer-operator-lock";
pub const LEASE_DURATION: Duration = Duration::from_secs(15);
pub const RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Shared view of whether this replica currently leads
#[derive(Debug, Clone, Default)]
pub struct LeaderFlag(Arc<AtomicBool>);

impl LeaderFlag {
    pub fn is_leader(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, leading: bool) -> bool {
        self.0.swap(leading, Ordering::AcqRel)
    }

    /// A flag that always leads, for single-replica deployments
    pub fn always() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

pub struct LeaderElector {
    api: Api<Lease>,
    identity: String,
    flag: LeaderFlag,
}

impl LeaderElector {
    pub fn new(api: Api<Lease>, identity: impl Into<String>) -> Self {
        Self {
            api,
            identity: identity.into(),
            flag: LeaderFlag::default(),
        }
    }

    pub fn flag(&self) -> LeaderFlag {
        self.flag.clone()
    }

    /// Acquire and renew the lease until shutdown
    pub async fn run(self, shutdown: CancellationToken) {
        info!(identity = %self.identity, lease = LEASE_NAME, "Starting leader election");
        let mut ticker = tokio::time::interval(RENEW_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let leading = match self.try_acquire_or_renew().await {
                        Ok(leading) => leading,
                        Err(e) => {
                            warn!("Leader election attempt failed: {}", e);
                            false
                        }
                    };

                    let was_leading = self.flag.set(leading);
                    if leading && !was_leading {
                        info!(identity = %self.identity, "Acquired leadership");
                    } else if !leading && was_leading {
                        warn!(identity = %self.identity, "Lost leadership");
                    }
                }
            }
        }

        self.flag.set(false);
    }

    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();

        let Some(mut lease) = self.api.get_opt(LEASE_NAME).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            return self.write(self.api.create(&PostParams::default(), &lease).await);
        };

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        let held_by_us = spec.holder_identity.as_deref() == Some(self.identity.as_str());

        if held_by_us {
            spec.renew_time = Some(MicroTime(now));
        } else if spec.holder_identity.is_none()
            || lease_expired(
                spec.renew_time.as_ref().map(|t| t.0),
                spec.lease_duration_seconds,
                now,
            )
        {
            spec.holder_identity = Some(self.identity.clone());
            spec.lease_duration_seconds = Some(LEASE_DURATION.as_secs() as i32);
            spec.acquire_time = Some(MicroTime(now));
            spec.renew_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        } else {
            return Ok(false);
        }

        // The resourceVersion in `lease` makes a concurrent writer lose with 409
        let result = self
            .api
            .replace(LEASE_NAME, &PostParams::default(), &lease)
            .await;
        self.write(result)
    }

    fn write(&self, result: std::result::Result<Lease, kube::Error>) -> Result<bool> {
        match result {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(OfficerError::from(e)),
        }
    }
}

/// A lease without a renew time, or renewed longer ago than its duration,
/// can be taken over
pub fn lease_expired(
    renew_time: Option<DateTime<Utc>>,
    duration_secs: Option<i32>,
    now: DateTime<Utc>,
) -> bool {
    let Some(renewed) = renew_time else {
        return true;
    };
    let duration = chrono::Duration::seconds(i64::from(
        duration_secs.unwrap_or(LEASE_DURATION.as_secs() as i32),
    ));
    renewed + duration < now
}

/// Identity of this replica in the lease
pub fn replica_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("traefik-officer-{}", std::process::id()))
}
