//! # Leader Election
//!
//! The change marker assumes a single writer. When more than one watcher
//! replica can run (for example during a rolling update of the watcher
//! itself), replicas compete for a `coordination.k8s.io/v1` Lease and only
//! the holder runs the reconciler loop.

use crate::config::LeaderElectionConfig;
use crate::error::{is_api_status, Error, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const HOLDER_ANNOTATION: &str = "ml-watcher.5dlabs.com/holder";

/// Lease-based leader election for the reconciler.
#[derive(Clone)]
pub struct LeaderElector {
    leases: Api<Lease>,
    namespace: String,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, config: &LeaderElectionConfig) -> Self {
        let identity = config
            .identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "ml-watcher".to_string());

        Self {
            leases: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            lease_name: config.lease_name.clone(),
            identity,
            lease_duration: Duration::from_secs(config.lease_duration_seconds),
            renew_interval: Duration::from_secs(config.renew_interval_seconds),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Attempt to become leader once. `Ok(false)` means another holder is active.
    pub async fn try_acquire(&self) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                annotations: Some(BTreeMap::from([(
                    HOLDER_ANNOTATION.to_string(),
                    self.identity.clone(),
                )])),
                ..Default::default()
            },
            spec: Some(self.lease_spec(Utc::now(), None)),
        };

        match self.leases.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(lease = %self.lease_name, holder = %self.identity, "Acquired leader lease");
                Ok(true)
            }
            Err(e) if is_api_status(&e, 409) => self.try_acquire_existing().await,
            Err(e) => Err(e.into()),
        }
    }

    async fn try_acquire_existing(&self) -> Result<bool> {
        let existing = self.leases.get(&self.lease_name).await?;
        let now = Utc::now();
        let holder = holder_of(&existing);

        if holder.as_deref() != Some(self.identity.as_str()) && !is_expired(&existing, now) {
            debug!(lease = %self.lease_name, holder = ?holder, "Lease held by another replica");
            return Ok(false);
        }

        let transitions = existing
            .spec
            .as_ref()
            .and_then(|s| s.lease_transitions)
            .unwrap_or(0);
        let transitions = if holder.as_deref() == Some(self.identity.as_str()) {
            transitions
        } else {
            transitions.saturating_add(1)
        };

        let mut updated = existing.clone();
        updated.spec = Some(self.lease_spec(now, Some(transitions)));

        // replace carries the resourceVersion, so a concurrent taker wins with a 409
        match self
            .leases
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => {
                info!(lease = %self.lease_name, holder = %self.identity, "Took over leader lease");
                Ok(true)
            }
            Err(e) if is_api_status(&e, 409) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until leadership is acquired or `shutdown` fires. Returns false on shutdown.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> Result<bool> {
        loop {
            match self.try_acquire().await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Leader election attempt failed"),
            }

            tokio::select! {
                () = shutdown.cancelled() => return Ok(false),
                () = tokio::time::sleep(self.renew_interval) => {}
            }
        }
    }

    /// Renew the lease in the background; cancels `lost` if leadership cannot be kept.
    ///
    /// Another holder taking the lease is fatal at once. Failed renewals are
    /// tolerated until the lease duration has passed since the last success.
    pub fn spawn_renewal(&self, lost: CancellationToken) -> tokio::task::JoinHandle<()> {
        let elector = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(elector.renew_interval);
            interval.tick().await;
            let mut last_renewed = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    () = lost.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match elector.renew().await {
                    Ok(()) => {
                        last_renewed = tokio::time::Instant::now();
                        debug!(lease = %elector.lease_name, "Lease renewed successfully");
                    }
                    Err(e) => {
                        let since = last_renewed.elapsed();
                        if !renewal_failure_is_fatal(&e, since, elector.lease_duration) {
                            warn!(
                                lease = %elector.lease_name, error = %e, ?since,
                                "Lease renewal failed, retrying"
                            );
                            continue;
                        }
                        error!(lease = %elector.lease_name, error = %e, "Lost leader lease");
                        lost.cancel();
                        break;
                    }
                }
            }
        })
    }

    async fn renew(&self) -> Result<()> {
        let existing = self.leases.get(&self.lease_name).await?;
        if holder_of(&existing).as_deref() != Some(self.identity.as_str()) {
            return Err(Error::Lease(format!(
                "lease {} is now held by {:?}",
                self.lease_name,
                holder_of(&existing)
            )));
        }

        let mut updated = existing.clone();
        if let Some(spec) = updated.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        self.leases
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await?;
        Ok(())
    }

    /// Give up leadership so a standby replica can take over immediately.
    pub async fn release(&self) -> Result<()> {
        let existing = match self.leases.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(e) if is_api_status(&e, 404) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if holder_of(&existing).as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        match self
            .leases
            .delete(&self.lease_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!(lease = %self.lease_name, "Leader lease released");
                Ok(())
            }
            Err(e) if is_api_status(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn lease_spec(&self, now: DateTime<Utc>, transitions: Option<i32>) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(
                i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX),
            ),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: transitions,
            ..Default::default()
        }
    }
}

/// Whether a failed renewal ends the leadership term.
fn renewal_failure_is_fatal(
    error: &Error,
    since_renewed: Duration,
    lease_duration: Duration,
) -> bool {
    matches!(error, Error::Lease(_)) || since_renewed >= lease_duration
}

fn holder_of(lease: &Lease) -> Option<String> {
    lease
        .spec
        .as_ref()
        .and_then(|spec| spec.holder_identity.clone())
}

/// A lease without a renew time or duration counts as expired.
pub fn is_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let Some(spec) = &lease.spec else {
        return true;
    };
    let (Some(renew_time), Some(duration_seconds)) = (&spec.renew_time, spec.lease_duration_seconds)
    else {
        return true;
    };

    renew_time.0 + chrono::Duration::seconds(i64::from(duration_seconds)) < now
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(renewed_secs_ago: i64, duration: i32) -> Lease {
        Lease {
            spec: Some(LeaseSpec {
                holder_identity: Some("ml-watcher-0".to_string()),
                lease_duration_seconds: Some(duration),
                renew_time: Some(MicroTime(
                    Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
                )),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn fresh_lease_is_not_expired() {
        assert!(!is_expired(&lease(5, 30), Utc::now()));
    }

    #[test]
    fn stale_lease_is_expired() {
        assert!(is_expired(&lease(31, 30), Utc::now()));
    }

    #[test]
    fn incomplete_lease_is_expired() {
        assert!(is_expired(&Lease::default(), Utc::now()));

        let mut no_duration = lease(1, 30);
        if let Some(spec) = no_duration.spec.as_mut() {
            spec.lease_duration_seconds = None;
        }
        assert!(is_expired(&no_duration, Utc::now()));
    }

    #[test]
    fn transient_renewal_errors_are_tolerated_until_expiry() {
        let transient = Error::Timeout {
            operation: "renew lease",
            timeout: Duration::from_secs(10),
        };
        let lease_duration = Duration::from_secs(30);

        assert!(!renewal_failure_is_fatal(
            &transient,
            Duration::from_secs(10),
            lease_duration
        ));
        assert!(renewal_failure_is_fatal(
            &transient,
            Duration::from_secs(30),
            lease_duration
        ));
    }

    #[test]
    fn losing_the_lease_to_another_holder_is_fatal() {
        let taken = Error::Lease("lease ml-watcher-leader is now held by ml-watcher-1".to_string());
        assert!(renewal_failure_is_fatal(
            &taken,
            Duration::ZERO,
            Duration::from_secs(30)
        ));
    }

    #[test]
    fn holder_is_read_from_spec() {
        assert_eq!(holder_of(&lease(0, 30)).as_deref(), Some("ml-watcher-0"));
        assert_eq!(holder_of(&Lease::default()), None);
    }
}
