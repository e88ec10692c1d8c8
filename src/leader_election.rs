//! Kubernetes Lease-based leader election for HA operator deployments.
//!
//! Only the holder of the Lease runs the controllers. Route table mutations
//! in particular must come from a single replica, since the in-process route
//! lock does not span processes. Other replicas block in
//! [`LeaderElector::acquire`] until the current leader's lease expires.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Lease timing
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub name: String,
    pub duration_secs: i32,
    pub renew_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            name: "cloudnet-operator-leader".to_string(),
            duration_secs: 15,
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Detects the namespace for leader election.
///
/// Priority: explicit argument → service account file → `"default"`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Whether a lease last renewed per `spec` has lapsed at `now`.
fn is_expired(spec: Option<&LeaseSpec>, default_duration_secs: i32, now: DateTime<Utc>) -> bool {
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(default_duration_secs) as i64;

    match renew_time {
        Some(MicroTime(t)) => now.signed_duration_since(*t).num_seconds() > duration_secs,
        None => true,
    }
}

/// Lease-based leader election.
///
/// Uses a `coordination.k8s.io/v1` Lease with optimistic concurrency (via
/// `resourceVersion`) so only one operator instance runs the controllers.
pub struct LeaderElector {
    lease_api: Api<Lease>,
    identity: String,
    config: LeaseConfig,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, config: LeaseConfig) -> Self {
        let lease_api = Api::<Lease>::namespaced(client, namespace);
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("cloudnet-operator-{:08x}", rand::random::<u32>()));
        info!(identity = %identity, namespace = %namespace, lease = %config.name, "Initialized leader elector");
        Self {
            lease_api,
            identity,
            config,
        }
    }

    /// Blocks until the lease is successfully acquired.
    pub async fn acquire(&self) -> Result<()> {
        info!(identity = %self.identity, lease = %self.config.name, "Waiting to acquire leader lease");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leader lease");
                    return Ok(());
                }
                Ok(false) => {
                    debug!(retry_in = ?self.config.retry_interval, "Lease held by another instance");
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?self.config.retry_interval, "Lease acquisition error");
                }
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    /// Renews the lease. Returns `Ok(true)` if still leader, `Ok(false)` if lost.
    pub async fn renew(&self) -> Result<bool> {
        let lease = self.lease_api.get(&self.config.name).await?;
        if !self.holds(&lease) {
            return Ok(false);
        }

        let mut updated = lease.clone();
        if let Some(ref mut spec) = updated.spec {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }

        match self
            .lease_api
            .replace(&self.config.name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => {
                debug!("Renewed leader lease");
                Ok(true)
            }
            Err(e) if is_conflict(&e) => {
                warn!("Lease conflict during renewal, lost leadership");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Releases the lease by clearing the holder identity.
    pub async fn release(&self) {
        info!(identity = %self.identity, "Releasing leader lease");
        let lease = match self.lease_api.get(&self.config.name).await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "Failed to read lease for release");
                return;
            }
        };
        if !self.holds(&lease) {
            debug!("Lease not held by us, skipping release");
            return;
        }

        let mut updated = lease.clone();
        if let Some(ref mut spec) = updated.spec {
            spec.holder_identity = None;
        }
        match self
            .lease_api
            .replace(&self.config.name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => info!("Released leader lease"),
            Err(e) => warn!(error = %e, "Failed to release leader lease"),
        }
    }

    pub fn renew_interval(&self) -> Duration {
        self.config.renew_interval
    }

    fn holds(&self, lease: &Lease) -> bool {
        lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            == Some(self.identity.as_str())
    }

    async fn try_acquire(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());

        match self.lease_api.get(&self.config.name).await {
            Ok(existing) => {
                if self.holds(&existing) {
                    self.update_lease(&existing, &now, false).await
                } else if is_expired(existing.spec.as_ref(), self.config.duration_secs, now.0) {
                    self.update_lease(&existing, &now, true).await
                } else {
                    Ok(false)
                }
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => self.create_lease(&now).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn create_lease(&self, now: &MicroTime) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.config.name.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.config.duration_secs),
                acquire_time: Some(now.clone()),
                renew_time: Some(now.clone()),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match self.lease_api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_lease(&self, existing: &Lease, now: &MicroTime, takeover: bool) -> Result<bool> {
        let prev = existing.spec.as_ref();
        let transitions = prev.and_then(|s| s.lease_transitions).unwrap_or(0);

        let mut updated = existing.clone();
        updated.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.config.duration_secs),
            acquire_time: if takeover {
                Some(now.clone())
            } else {
                prev.and_then(|s| s.acquire_time.clone())
            },
            renew_time: Some(now.clone()),
            lease_transitions: Some(if takeover { transitions + 1 } else { transitions }),
            ..Default::default()
        });

        match self
            .lease_api
            .replace(&self.config.name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(renewed_secs_ago: Option<i64>, duration: Option<i32>) -> LeaseSpec {
        LeaseSpec {
            renew_time: renewed_secs_ago.map(|s| MicroTime(Utc::now() - chrono::Duration::seconds(s))),
            lease_duration_seconds: duration,
            ..Default::default()
        }
    }

    #[test]
    fn test_never_renewed_lease_is_expired() {
        assert!(is_expired(None, 15, Utc::now()));
        assert!(is_expired(Some(&spec(None, Some(15))), 15, Utc::now()));
    }

    #[test]
    fn test_expiry_uses_lease_duration() {
        let now = Utc::now();
        assert!(!is_expired(Some(&spec(Some(5), Some(15))), 15, now));
        assert!(is_expired(Some(&spec(Some(20), Some(15))), 15, now));
        // Falls back to the configured duration
        assert!(!is_expired(Some(&spec(Some(20), None)), 30, now));
    }

    #[test]
    fn test_explicit_namespace_wins() {
        assert_eq!(detect_namespace("kube-system"), "kube-system");
    }

    #[test]
    fn test_default_lease_config() {
        let config = LeaseConfig::default();
        assert!(config.renew_interval < Duration::from_secs(config.duration_secs as u64));
    }
}
