//! Warm-Pod Reconciler: drives one pool member through
//! Pending -> Ready -> Assigned -> Terminating.
//!
//! On first readiness the pod's preload packages and scripts run exactly
//! once; the idempotency key is the workload uid plus the script name,
//! recorded as annotations on the WarmPod. A failed preload sends the pod to
//! Terminating so the pool manager replaces it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::ResourceExt;
use tracing::{info, warn};

use super::{Ctx, ReconcileError, replace_status_with_retry};
use crate::cluster::ExecRequest;
use crate::error::{Result as CrateResult, classify_kube};
use crate::types::{
    Condition, PreloadScript, Sandbox, WarmPod, WarmPodPhase, WarmPool, set_condition,
};

/// Heartbeat refresh cadence for Ready pods.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Grace before an Assigned pod with no referencing sandbox reverts to
/// Ready (crash between the claim and the sandbox-side update).
const ORPHAN_GRACE_SECS: i64 = 60;

const PRELOAD_ANNOTATION_PREFIX: &str = "llmsafespace.dev/preload-";

pub async fn run(ctx: Arc<Ctx>) -> CrateResult<()> {
    let pods: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &ctx.namespace);

    let stream = Controller::new(pods, WatcherConfig::default())
        .with_config(kube::runtime::controller::Config::default().concurrency(ctx.workers))
        .reconcile_all_on(super::resync_ticks(ctx.resync))
        .run(reconcile, |_obj, err, _ctx| super::error_action(err), ctx);

    super::drain_controller("warmpod", stream).await;
    Ok(())
}

async fn reconcile(
    pod: Arc<WarmPod>,
    ctx: Arc<Ctx>,
) -> std::result::Result<Action, ReconcileError> {
    match pod.phase() {
        WarmPodPhase::Pending => handle_pending(&pod, &ctx).await.map_err(Into::into),
        WarmPodPhase::Ready => handle_ready(&pod, &ctx).await.map_err(Into::into),
        WarmPodPhase::Assigned => handle_assigned(&pod, &ctx).await.map_err(Into::into),
        WarmPodPhase::Terminating => handle_terminating(&pod, &ctx).await.map_err(Into::into),
    }
}

async fn handle_pending(pod: &WarmPod, ctx: &Ctx) -> CrateResult<Action> {
    let name = pod.name_any();
    let Some(workload_name) = pod.status.as_ref().and_then(|s| s.pod_name.clone()) else {
        // The pool manager has not recorded the workload yet.
        return Ok(Action::requeue(Duration::from_secs(5)));
    };

    let workloads: Api<k8s_openapi::api::core::v1::Pod> =
        Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let Some(workload) = workloads
        .get_opt(&workload_name)
        .await
        .map_err(|e| classify_kube(e, "pod", &workload_name))?
    else {
        warn!(warmpod = %name, workload = %workload_name, "workload vanished, terminating");
        mark_terminating(ctx, &name, "WorkloadMissing", "underlying workload not found").await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    };

    if !workload_running(&workload) {
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    let workload_uid = workload.metadata.uid.clone().unwrap_or_default();
    let pool = get_pool(ctx, pod).await?;
    if let Some(pool) = &pool {
        let install_command = match ctx.gateway.get_runtime(&pool.spec.runtime).await? {
            Some(runtime) => runtime.install_command().join(" "),
            None => "pip install".to_string(),
        };
        let annotations = pod.metadata.annotations.clone().unwrap_or_default();
        for script in pending_preloads(pool, &install_command, &annotations, &workload_uid) {
            match run_preload(ctx, &workload_name, &script).await {
                Ok(()) => {
                    record_preload_done(ctx, &name, &script.name, &workload_uid).await?;
                }
                Err(e) => {
                    warn!(warmpod = %name, script = %script.name, error = %e, "preload failed");
                    mark_terminating(
                        ctx,
                        &name,
                        "PreloadFailed",
                        &format!("script {:?}: {e}", script.name),
                    )
                    .await?;
                    return Ok(Action::requeue(Duration::from_secs(1)));
                }
            }
        }
    }

    let workload_namespace = ctx.namespace.clone();
    let api: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    replace_status_with_retry(&api, &name, "warmpod", move |pod: &mut WarmPod| {
        let mut status = pod.status.clone().unwrap_or_default();
        status.phase = WarmPodPhase::Ready;
        status.pod_namespace = Some(workload_namespace.clone());
        pod.status = Some(status);
    })
    .await?;
    touch_heartbeat(ctx, &name).await?;
    info!(warmpod = %name, "warm pod ready");

    Ok(Action::requeue(HEARTBEAT_INTERVAL))
}

async fn handle_ready(pod: &WarmPod, ctx: &Ctx) -> CrateResult<Action> {
    touch_heartbeat(ctx, &pod.name_any()).await?;
    Ok(Action::requeue(HEARTBEAT_INTERVAL))
}

/// The sandbox reconciler owns Assigned pods. The one job left here is the
/// crash-recovery check: an Assigned pod no sandbox references reverts to
/// Ready after a grace period.
async fn handle_assigned(pod: &WarmPod, ctx: &Ctx) -> CrateResult<Action> {
    let name = pod.name_any();
    let assigned_at = pod
        .status
        .as_ref()
        .and_then(|s| s.assigned_at.as_deref())
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc));

    let in_grace = assigned_at
        .map(|t| Utc::now() - t < ChronoDuration::seconds(ORPHAN_GRACE_SECS))
        .unwrap_or(true);
    if in_grace {
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    let sandboxes: Api<Sandbox> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let list = sandboxes
        .list(&ListParams::default())
        .await
        .map_err(|e| classify_kube(e, "sandbox", "*"))?;

    if !is_referenced(&name, &list.items) {
        warn!(warmpod = %name, "assigned pod has no referencing sandbox, reverting to Ready");
        let api: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
        replace_status_with_retry(&api, &name, "warmpod", |pod: &mut WarmPod| {
            let mut status = pod.status.clone().unwrap_or_default();
            status.phase = WarmPodPhase::Ready;
            status.assigned_to = None;
            status.assigned_at = None;
            pod.status = Some(status);
        })
        .await?;
    }

    Ok(Action::requeue(ctx.resync))
}

async fn handle_terminating(pod: &WarmPod, ctx: &Ctx) -> CrateResult<Action> {
    let name = pod.name_any();

    if let Some(workload_name) = pod.status.as_ref().and_then(|s| s.pod_name.clone()) {
        let workloads: Api<k8s_openapi::api::core::v1::Pod> =
            Api::namespaced(ctx.client.clone(), &ctx.namespace);
        match workloads.delete(&workload_name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(e) => match classify_kube(e, "pod", &workload_name) {
                crate::error::Error::NotFound { .. } => {}
                other => return Err(other),
            },
        }
    }

    let api: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(e) => match classify_kube(e, "warmpod", &name) {
            crate::error::Error::NotFound { .. } => {}
            other => return Err(other),
        },
    }

    Ok(Action::await_change())
}

/// Preload work still owed for this workload: packages first (as a
/// synthesized script using the runtime's package manager), then the
/// declared scripts, skipping anything already recorded for this workload
/// uid.
pub fn pending_preloads(
    pool: &WarmPool,
    install_command: &str,
    annotations: &BTreeMap<String, String>,
    workload_uid: &str,
) -> Vec<PreloadScript> {
    let mut scripts = Vec::new();

    if !pool.spec.preload_packages.is_empty() {
        scripts.push(PreloadScript {
            name: "preload-packages".to_string(),
            content: format!("{install_command} {}", pool.spec.preload_packages.join(" ")),
        });
    }
    scripts.extend(pool.spec.preload_scripts.iter().cloned());

    scripts
        .into_iter()
        .filter(|script| {
            annotations.get(&preload_annotation(&script.name)).map(|s| s.as_str())
                != Some(workload_uid)
        })
        .collect()
}

pub fn preload_annotation(script_name: &str) -> String {
    let safe: String = script_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{PRELOAD_ANNOTATION_PREFIX}{safe}")
}

/// Whether any sandbox's status references this warm pod.
pub fn is_referenced(warm_pod_name: &str, sandboxes: &[Sandbox]) -> bool {
    sandboxes.iter().any(|sb| {
        sb.status
            .as_ref()
            .and_then(|s| s.warm_pod_ref.as_ref())
            .map(|r| r.name == warm_pod_name)
            .unwrap_or(false)
    })
}

fn workload_running(pod: &k8s_openapi::api::core::v1::Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|p| p == "Running")
        .unwrap_or(false)
}

async fn run_preload(ctx: &Ctx, workload_name: &str, script: &PreloadScript) -> CrateResult<()> {
    let request = ExecRequest::new(vec!["sh".to_string()], ctx.preload_timeout)
        .with_stdin(script.content.clone().into_bytes());
    let outcome = ctx
        .gateway
        .exec(&ctx.namespace, workload_name, request)
        .await?;
    if !outcome.is_success() {
        return Err(crate::error::Error::Permanent(format!(
            "preload exited {}: {}",
            outcome.exit_code,
            outcome.stderr.trim()
        )));
    }
    Ok(())
}

async fn record_preload_done(
    ctx: &Ctx,
    warm_pod_name: &str,
    script_name: &str,
    workload_uid: &str,
) -> CrateResult<()> {
    let api: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let patch = serde_json::json!({
        "metadata": {"annotations": {preload_annotation(script_name): workload_uid}}
    });
    api.patch(warm_pod_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| classify_kube(e, "warmpod", warm_pod_name))?;
    Ok(())
}

async fn touch_heartbeat(ctx: &Ctx, warm_pod_name: &str) -> CrateResult<()> {
    let api: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let patch = serde_json::json!({
        "spec": {"lastHeartbeat": Utc::now().to_rfc3339()}
    });
    api.patch(warm_pod_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| classify_kube(e, "warmpod", warm_pod_name))?;
    Ok(())
}

async fn mark_terminating(
    ctx: &Ctx,
    warm_pod_name: &str,
    reason: &str,
    message: &str,
) -> CrateResult<()> {
    let api: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let condition = Condition::new("Healthy", false, reason, message);
    replace_status_with_retry(&api, warm_pod_name, "warmpod", move |pod: &mut WarmPod| {
        let mut status = pod.status.clone().unwrap_or_default();
        status.phase = WarmPodPhase::Terminating;
        set_condition(&mut status.conditions, condition.clone());
        pod.status = Some(status);
    })
    .await?;
    Ok(())
}

async fn get_pool(ctx: &Ctx, pod: &WarmPod) -> CrateResult<Option<WarmPool>> {
    let api: Api<WarmPool> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    api.get_opt(&pod.spec.pool_ref.name)
        .await
        .map_err(|e| classify_kube(e, "warmpool", &pod.spec.pool_ref.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObjectRef, SandboxStatus, WarmPodRef, WarmPoolSpec};

    fn pool_with(packages: Vec<&str>, scripts: Vec<(&str, &str)>) -> WarmPool {
        WarmPool::new(
            "pool",
            WarmPoolSpec {
                runtime: "python:3.10".to_string(),
                min_size: 1,
                max_size: 0,
                security_level: "standard".to_string(),
                ttl: 0,
                resources: None,
                profile_ref: None,
                preload_packages: packages.into_iter().map(String::from).collect(),
                preload_scripts: scripts
                    .into_iter()
                    .map(|(name, content)| PreloadScript {
                        name: name.to_string(),
                        content: content.to_string(),
                    })
                    .collect(),
                auto_scaling: None,
            },
        )
    }

    #[test]
    fn test_pending_preloads_includes_packages_and_scripts() {
        let pool = pool_with(vec!["numpy", "pandas"], vec![("warm-cache", "python - <<'EOF'\nEOF")]);
        let scripts = pending_preloads(&pool, "pip install", &BTreeMap::new(), "uid-1");
        assert_eq!(scripts.len(), 2);
        assert_eq!(scripts[0].name, "preload-packages");
        assert_eq!(scripts[0].content, "pip install numpy pandas");
        assert_eq!(scripts[1].name, "warm-cache");
    }

    #[test]
    fn test_pending_preloads_skips_done_scripts() {
        let pool = pool_with(vec![], vec![("a", "true"), ("b", "true")]);
        let mut annotations = BTreeMap::new();
        annotations.insert(preload_annotation("a"), "uid-1".to_string());

        let scripts = pending_preloads(&pool, "pip install", &annotations, "uid-1");
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].name, "b");
    }

    #[test]
    fn test_preloads_rerun_for_new_workload_uid() {
        let pool = pool_with(vec![], vec![("a", "true")]);
        let mut annotations = BTreeMap::new();
        annotations.insert(preload_annotation("a"), "uid-old".to_string());

        // Same script name, different workload: must run again.
        let scripts = pending_preloads(&pool, "pip install", &annotations, "uid-new");
        assert_eq!(scripts.len(), 1);
    }

    #[test]
    fn test_preload_annotation_sanitizes() {
        assert_eq!(
            preload_annotation("warm cache!"),
            "llmsafespace.dev/preload-warm-cache-"
        );
        assert_eq!(
            preload_annotation("setup-1.2"),
            "llmsafespace.dev/preload-setup-1.2"
        );
    }

    #[test]
    fn test_is_referenced_checks_warm_pod_ref() {
        let mut sandbox = Sandbox::new(
            "sb",
            serde_json::from_value(serde_json::json!({"runtime": "python:3.10"})).unwrap(),
        );
        assert!(!is_referenced("wp-1", std::slice::from_ref(&sandbox)));

        sandbox.status = Some(SandboxStatus {
            warm_pod_ref: Some(WarmPodRef {
                name: "wp-1".to_string(),
                namespace: "llmsafespace".to_string(),
            }),
            ..Default::default()
        });
        assert!(is_referenced("wp-1", std::slice::from_ref(&sandbox)));
        assert!(!is_referenced("wp-2", std::slice::from_ref(&sandbox)));
    }

    #[test]
    fn test_workload_running() {
        let mut pod = k8s_openapi::api::core::v1::Pod::default();
        assert!(!workload_running(&pod));
        pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        assert!(workload_running(&pod));
    }

    #[test]
    fn test_object_ref_in_spec() {
        let pod = WarmPod::new(
            "wp",
            crate::types::WarmPodSpec {
                pool_ref: ObjectRef {
                    name: "pool".to_string(),
                    namespace: Some("ns".to_string()),
                },
                created_at: None,
                last_heartbeat: None,
            },
        );
        assert_eq!(pod.spec.pool_ref.name, "pool");
    }
}
