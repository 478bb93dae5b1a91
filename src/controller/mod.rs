//! Declarative controllers for the sandbox control plane.
//!
//! Three reconcilers share one context: the sandbox state machine, the
//! warm-pool manager, and the warm-pod driver. Each runs as a watch-driven
//! `kube::runtime` controller with per-key serialization and a bounded
//! worker pool; a periodic resync re-reconciles everything to pick up
//! missed events.

pub mod leader;
pub mod resources;
pub mod sandbox;
pub mod warmpod;
pub mod warmpool;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::info;

use crate::cluster::{ClusterGateway, KubeGateway};
use crate::config::Config;
use crate::error::{Error as CrateError, Result as CrateResult, classify_kube};
use crate::metrics::Metrics;
use crate::store::Store;

/// Immediate retries on status-update conflicts before requeueing.
pub(crate) const CONFLICT_RETRIES: usize = 3;

/// Wrapper the kube controller runtime requires for reconcile errors.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct ReconcileError {
    #[from]
    pub source: CrateError,
}

/// Shared state for all reconcilers.
pub struct Ctx {
    pub client: Client,
    pub gateway: Arc<dyn ClusterGateway>,
    pub store: Store,
    pub metrics: Arc<Metrics>,
    pub namespace: String,
    pub gateway_namespace: String,
    pub recycle_max_age_hours: i64,
    pub preload_timeout: Duration,
    pub resync: Duration,
    pub workers: u16,
}

impl Ctx {
    pub fn new(client: Client, config: &Config, store: Store, metrics: Arc<Metrics>) -> Arc<Self> {
        let gateway = Arc::new(KubeGateway::new(
            client.clone(),
            config.kubernetes.namespace.clone(),
        ));
        Arc::new(Self {
            client,
            gateway,
            store,
            metrics,
            namespace: config.kubernetes.namespace.clone(),
            gateway_namespace: config.kubernetes.gateway_namespace.clone(),
            recycle_max_age_hours: config.warm_pools.recycle_max_age_hours,
            preload_timeout: Duration::from_secs(config.execution.preload_timeout_seconds),
            resync: Duration::from_secs(config.controller.resync_seconds),
            workers: config.controller.workers as u16,
        })
    }
}

/// Periodic trigger stream for `reconcile_all_on`.
pub(crate) fn resync_ticks(period: Duration) -> impl futures::Stream<Item = ()> {
    futures::stream::unfold((), move |()| async move {
        tokio::time::sleep(period).await;
        Some(((), ()))
    })
}

/// Read-modify-write a status subresource with compare-and-swap semantics.
/// Conflicts retry immediately up to [`CONFLICT_RETRIES`] times against a
/// freshly fetched copy, then surface as Conflict so the caller requeues.
pub(crate) async fn replace_status_with_retry<K, F>(
    api: &Api<K>,
    name: &str,
    kind: &'static str,
    mutate: F,
) -> CrateResult<K>
where
    K: kube::Resource + Clone + Debug + DeserializeOwned + Serialize,
    F: Fn(&mut K),
{
    for attempt in 0..CONFLICT_RETRIES {
        let mut latest = api
            .get(name)
            .await
            .map_err(|e| classify_kube(e, kind, name))?;
        mutate(&mut latest);

        match api
            .replace_status(name, &PostParams::default(), serde_json::to_vec(&latest)?)
            .await
        {
            Ok(updated) => return Ok(updated),
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt + 1 < CONFLICT_RETRIES => {
                continue;
            }
            Err(e) => return Err(classify_kube(e, kind, name)),
        }
    }
    Err(CrateError::Conflict(format!("{kind}/{name}")))
}

/// Run all reconcilers until shutdown. With leader election enabled the
/// controllers only run while this replica holds the lease; losing it is
/// fatal so the orchestrator restarts the process.
pub async fn run_controllers(ctx: Arc<Ctx>, config: &Config) -> CrateResult<()> {
    let election = &config.controller.leader_election;
    if election.enabled {
        let client = ctx.client.clone();
        let identity = format!(
            "{}-{}",
            hostname(),
            uuid::Uuid::new_v4().to_string().split('-').next().unwrap_or("0")
        );
        leader::run_with_lease(client, election, identity, run_all(ctx)).await
    } else {
        run_all(ctx).await
    }
}

async fn run_all(ctx: Arc<Ctx>) -> CrateResult<()> {
    info!(namespace = %ctx.namespace, "starting reconcilers");
    tokio::select! {
        r = sandbox::run(ctx.clone()) => r,
        r = warmpool::run(ctx.clone()) => r,
        r = warmpod::run(ctx.clone()) => r,
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "llmsafespace".to_string())
}

/// Log the outcome stream of a controller; the stream itself never ends.
pub(crate) async fn drain_controller<S, T, E>(name: &'static str, stream: S)
where
    S: futures::Stream<Item = Result<T, E>>,
    E: std::fmt::Display,
{
    stream
        .for_each(|result| async move {
            match result {
                Ok(_) => {}
                Err(e) => tracing::warn!(controller = name, error = %e, "reconcile error"),
            }
        })
        .await;
}

/// Requeue policy shared by the reconcilers: terminal errors wait for a
/// record change, everything else backs off.
pub(crate) fn error_action(error: &ReconcileError) -> kube::runtime::controller::Action {
    if error.source.is_terminal() {
        kube::runtime::controller::Action::await_change()
    } else {
        kube::runtime::controller::Action::requeue(Duration::from_secs(10))
    }
}

