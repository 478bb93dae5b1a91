//! Leader election over a coordination/v1 Lease.
//!
//! Multiple controller replicas contend on one lease record; the holder runs
//! the reconcilers while the others idle and re-try. Losing the lease is
//! fatal: the caller exits nonzero and the orchestrator restarts the
//! process, which rejoins the election from scratch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::Client;
use kube::api::{Api, PostParams};
use tracing::{info, warn};

use crate::config::LeaderElectionConfig;
use crate::error::{Error, Result, classify_kube};

/// Decide whether `identity` may take the lease in its observed state.
pub fn can_acquire(
    holder: Option<&str>,
    renew_time: Option<DateTime<Utc>>,
    lease_duration_seconds: i32,
    identity: &str,
    now: DateTime<Utc>,
) -> bool {
    match holder {
        None => true,
        Some(current) if current == identity => true,
        Some(_) => match renew_time {
            // A silent holder forfeits after the lease duration.
            Some(renewed) => {
                now - renewed > chrono::Duration::seconds(lease_duration_seconds as i64)
            }
            None => true,
        },
    }
}

/// Hold the lease while driving `work`. Returns `work`'s result if it
/// finishes, or an error when the lease is lost.
pub async fn run_with_lease<F>(
    client: Client,
    config: &LeaderElectionConfig,
    identity: String,
    work: F,
) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let leases: Api<Lease> = Api::namespaced(client, &config.lease_namespace);

    acquire(&leases, config, &identity).await?;
    info!(lease = %config.lease_name, identity = %identity, "acquired leadership");

    let renew = renew_loop(&leases, config, &identity);
    tokio::pin!(work);
    tokio::pin!(renew);

    tokio::select! {
        result = &mut work => result,
        lost = &mut renew => {
            warn!(lease = %config.lease_name, "leadership lost");
            lost
        }
    }
}

async fn acquire(
    leases: &Api<Lease>,
    config: &LeaderElectionConfig,
    identity: &str,
) -> Result<()> {
    loop {
        let existing = leases
            .get_opt(&config.lease_name)
            .await
            .map_err(|e| classify_kube(e, "lease", &config.lease_name))?;

        match existing {
            None => {
                let lease = fresh_lease(config, identity);
                match leases.create(&PostParams::default(), &lease).await {
                    Ok(_) => return Ok(()),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => {
                        // Another replica won the create; contend again.
                    }
                    Err(e) => return Err(classify_kube(e, "lease", &config.lease_name)),
                }
            }
            Some(mut lease) => {
                let spec = lease.spec.clone().unwrap_or_default();
                let holder = spec.holder_identity.as_deref();
                let renew_time = spec.renew_time.as_ref().map(|t| t.0);

                if can_acquire(
                    holder,
                    renew_time,
                    config.lease_duration_seconds,
                    identity,
                    Utc::now(),
                ) {
                    let transitions = spec.lease_transitions.unwrap_or(0)
                        + i32::from(holder != Some(identity));
                    lease.spec = Some(LeaseSpec {
                        holder_identity: Some(identity.to_string()),
                        lease_duration_seconds: Some(config.lease_duration_seconds),
                        acquire_time: Some(MicroTime(Utc::now())),
                        renew_time: Some(MicroTime(Utc::now())),
                        lease_transitions: Some(transitions),
                        ..Default::default()
                    });
                    match leases
                        .replace(&config.lease_name, &PostParams::default(), &lease)
                        .await
                    {
                        Ok(_) => return Ok(()),
                        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                        Err(e) => return Err(classify_kube(e, "lease", &config.lease_name)),
                    }
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(config.renew_interval_seconds)).await;
    }
}

/// Renew until a renewal fails or the lease is observed held by someone
/// else; either way leadership is gone.
async fn renew_loop(
    leases: &Api<Lease>,
    config: &LeaderElectionConfig,
    identity: &str,
) -> Result<()> {
    loop {
        tokio::time::sleep(Duration::from_secs(config.renew_interval_seconds)).await;

        let mut lease = leases
            .get(&config.lease_name)
            .await
            .map_err(|e| classify_kube(e, "lease", &config.lease_name))?;

        let holder = lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.clone());
        if holder.as_deref() != Some(identity) {
            return Err(Error::Permanent(format!(
                "lease {} taken over by {:?}",
                config.lease_name, holder
            )));
        }

        if let Some(spec) = lease.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        leases
            .replace(&config.lease_name, &PostParams::default(), &lease)
            .await
            .map_err(|e| classify_kube(e, "lease", &config.lease_name))?;
    }
}

fn fresh_lease(config: &LeaderElectionConfig, identity: &str) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(config.lease_name.clone()),
            namespace: Some(config.lease_namespace.clone()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(identity.to_string()),
            lease_duration_seconds: Some(config.lease_duration_seconds),
            acquire_time: Some(MicroTime(Utc::now())),
            renew_time: Some(MicroTime(Utc::now())),
            lease_transitions: Some(0),
            ..Default::default()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_unheld_lease_is_acquirable() {
        assert!(can_acquire(None, None, 15, "me", at("2026-01-01T00:00:00Z")));
    }

    #[test]
    fn test_own_lease_is_reacquirable() {
        assert!(can_acquire(
            Some("me"),
            Some(at("2026-01-01T00:00:00Z")),
            15,
            "me",
            at("2026-01-01T00:00:05Z")
        ));
    }

    #[test]
    fn test_fresh_foreign_lease_is_not_acquirable() {
        assert!(!can_acquire(
            Some("other"),
            Some(at("2026-01-01T00:00:00Z")),
            15,
            "me",
            at("2026-01-01T00:00:10Z")
        ));
    }

    #[test]
    fn test_expired_foreign_lease_is_acquirable() {
        assert!(can_acquire(
            Some("other"),
            Some(at("2026-01-01T00:00:00Z")),
            15,
            "me",
            at("2026-01-01T00:00:20Z")
        ));
    }
}
