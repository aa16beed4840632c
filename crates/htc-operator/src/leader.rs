//! Lease-based leader election
//!
//! A single writer per config: replicas race for a coordination Lease and
//! the holder renews it every retry period. Acquisition uses optimistic
//! concurrency on the Lease's resourceVersion, so two replicas cannot both
//! win a takeover. Disabled election means perpetual leadership (single
//! replica deployments).

use std::time::Duration;

use chrono::Utc;
use htc_core::{Event, EventBus};
use htc_crd::LeaderElectionConfig;
use htc_observability::ControllerMetrics;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Spawn the elector task. Returns a receiver that tracks leadership.
pub fn spawn(
    client: Client,
    namespace: String,
    identity: String,
    config: LeaderElectionConfig,
    bus: EventBus,
    metrics: ControllerMetrics,
) -> (watch::Receiver<bool>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        if !config.enabled {
            info!(identity, "leader election disabled, assuming perpetual leadership");
            metrics.is_leader.set(1);
            let _ = tx.send(true);
            bus.publish(Event::AcquiredLeadership);
            // Keep the sender alive for the process lifetime.
            std::future::pending::<()>().await;
            return;
        }
        run(client, namespace, identity, config, bus, metrics, tx).await;
    });
    (rx, task)
}

async fn run(
    client: Client,
    namespace: String,
    identity: String,
    config: LeaderElectionConfig,
    bus: EventBus,
    metrics: ControllerMetrics,
    tx: watch::Sender<bool>,
) {
    let api: Api<Lease> = Api::namespaced(client, &namespace);
    let retry = Duration::from_secs(config.retry_period_seconds);
    let renew_deadline = Duration::from_secs(config.renew_deadline_seconds);
    let mut leading = false;
    let mut last_renewed = std::time::Instant::now();

    loop {
        let attempt = tick(&api, &identity, &config).await;
        let now_leading = match attempt {
            Ok(holding) => {
                if holding {
                    last_renewed = std::time::Instant::now();
                }
                holding
            }
            Err(e) => {
                warn!(error = %e, "lease operation failed");
                // A holder that cannot renew past the deadline must step
                // down rather than split-brain.
                leading && last_renewed.elapsed() < renew_deadline
            }
        };

        if now_leading != leading {
            leading = now_leading;
            metrics.is_leader.set(i64::from(leading));
            let _ = tx.send(leading);
            if leading {
                info!(identity, lease = %config.lease_name, "acquired leadership");
                bus.publish(Event::AcquiredLeadership);
            } else {
                warn!(identity, lease = %config.lease_name, "lost leadership");
                bus.publish(Event::LostLeadership);
            }
        }

        tokio::time::sleep(retry).await;
    }
}

/// One acquire/renew attempt. `Ok(true)` when we hold the lease.
async fn tick(
    api: &Api<Lease>,
    identity: &str,
    config: &LeaderElectionConfig,
) -> kube::Result<bool> {
    let now = MicroTime(Utc::now());
    match api.get_opt(&config.lease_name).await? {
        None => {
            // First replica creates the lease holding it.
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(config.lease_name.clone()),
                    ..ObjectMeta::default()
                },
                spec: Some(lease_spec(identity, config, now)),
            };
            match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(e),
            }
        }
        Some(lease) => {
            let spec = lease.spec.clone().unwrap_or_default();
            let holder = spec.holder_identity.as_deref().unwrap_or_default();
            if holder == identity {
                // Renew.
                let patch = serde_json::json!({
                    "spec": { "renewTime": now, "holderIdentity": identity }
                });
                api.patch(&config.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                return Ok(true);
            }
            if !expired(&spec, config) {
                debug!(holder, "lease held by another replica");
                return Ok(false);
            }
            // Expired: take over under the observed resourceVersion so a
            // concurrent takeover loses with a 409.
            let mut replacement = lease;
            replacement.spec = Some(LeaseSpec {
                lease_transitions: Some(
                    replacement
                        .spec
                        .as_ref()
                        .and_then(|s| s.lease_transitions)
                        .unwrap_or_default()
                        + 1,
                ),
                ..lease_spec(identity, config, now)
            });
            match api
                .replace(&config.lease_name, &PostParams::default(), &replacement)
                .await
            {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(e),
            }
        }
    }
}

fn lease_spec(identity: &str, config: &LeaderElectionConfig, now: MicroTime) -> LeaseSpec {
    LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(config.lease_duration_seconds as i32),
        acquire_time: Some(now.clone()),
        renew_time: Some(now),
        lease_transitions: None,
    }
}

fn expired(spec: &LeaseSpec, config: &LeaderElectionConfig) -> bool {
    let Some(renewed) = spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) else {
        return true;
    };
    let duration = spec
        .lease_duration_seconds
        .map(i64::from)
        .unwrap_or(config.lease_duration_seconds as i64);
    Utc::now() - renewed.0 > chrono::Duration::seconds(duration)
}
