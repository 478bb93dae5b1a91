//! Sandbox Reconciler: the central state machine.
//!
//! Drives each sandbox record through Pending -> Creating -> Running ->
//! Terminating. Creation binds a claimed warm workload when the allocator
//! has one, otherwise materializes a fresh workload with its service and
//! network policies. Deletion is finalizer-guarded; the recycle-vs-destroy
//! decision runs before cleanup tears the owned objects down in order:
//! service and policies, then workload, then the record itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{Event as FinalizerEvent, finalizer};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use super::{Ctx, ReconcileError, replace_status_with_retry, resources};
use crate::allocator::WarmPodAllocator;
use crate::cluster::ExecRequest;
use crate::error::{Error, Result as CrateResult, classify_kube};
use crate::metrics::Metrics;
use crate::types::{
    Condition, LABEL_COMPONENT, LABEL_POOL, LABEL_SANDBOX, SANDBOX_FINALIZER, Sandbox,
    SandboxPhase, SandboxProfile, WarmPod, WarmPodPhase, WarmPodRef, WarmPool, set_condition,
};

/// Inputs to the recycle-vs-destroy decision on sandbox release.
#[derive(Debug, Clone, Copy)]
pub struct RecycleInputs {
    /// The referenced pool still exists.
    pub pool_exists: bool,
    /// The pool's observed ready count.
    pub available_pods: i32,
    /// The pool's floor.
    pub min_size: i32,
    /// Age of the warm workload in hours, when known.
    pub pod_age_hours: Option<i64>,
    /// Whether any tainting condition was recorded on the sandbox.
    pub tainted: bool,
    /// Recycle age cap in hours.
    pub max_age_hours: i64,
}

/// Recycle iff the pool exists and is under its floor, the workload is
/// younger than the cap, and the sandbox was never tainted.
pub fn should_recycle(inputs: &RecycleInputs) -> bool {
    inputs.pool_exists
        && inputs.available_pods < inputs.min_size
        && inputs
            .pod_age_hours
            .map(|age| age < inputs.max_age_hours)
            .unwrap_or(false)
        && !inputs.tainted
}

pub async fn run(ctx: Arc<Ctx>) -> CrateResult<()> {
    let sandboxes: Api<Sandbox> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let pods: Api<k8s_openapi::api::core::v1::Pod> =
        Api::namespaced(ctx.client.clone(), &ctx.namespace);

    let stream = Controller::new(sandboxes, WatcherConfig::default())
        .owns(pods, WatcherConfig::default())
        .with_config(kube::runtime::controller::Config::default().concurrency(ctx.workers))
        .reconcile_all_on(super::resync_ticks(ctx.resync))
        .run(reconcile, |_obj, err, _ctx| super::error_action(err), ctx);

    super::drain_controller("sandbox", stream).await;
    Ok(())
}

async fn reconcile(
    sandbox: Arc<Sandbox>,
    ctx: Arc<Ctx>,
) -> std::result::Result<Action, ReconcileError> {
    let api: Api<Sandbox> = Api::namespaced(ctx.client.clone(), &ctx.namespace);

    finalizer(&api, SANDBOX_FINALIZER, sandbox, |event| {
        let ctx = ctx.clone();
        async move {
            match event {
                FinalizerEvent::Apply(sb) => apply(&sb, &ctx).await,
                FinalizerEvent::Cleanup(sb) => cleanup(&sb, &ctx).await,
            }
        }
    })
    .await
    .map_err(|e| ReconcileError {
        source: match e {
            kube::runtime::finalizer::Error::ApplyFailed(inner)
            | kube::runtime::finalizer::Error::CleanupFailed(inner) => inner,
            other => Error::Transient(format!("finalizer: {other}")),
        },
    })
}

async fn apply(sandbox: &Sandbox, ctx: &Ctx) -> CrateResult<Action> {
    match sandbox.phase() {
        SandboxPhase::Pending => handle_pending(sandbox, ctx).await,
        SandboxPhase::Creating => handle_creating(sandbox, ctx).await,
        SandboxPhase::Running => handle_running(sandbox, ctx).await,
        SandboxPhase::Terminating | SandboxPhase::Terminated | SandboxPhase::Failed => {
            Ok(Action::await_change())
        }
    }
}

async fn handle_pending(sandbox: &Sandbox, ctx: &Ctx) -> CrateResult<Action> {
    let name = sandbox.name_any();

    // Service-created records must have a metadata row; a cluster record
    // without one is the torn half of a failed create and gets compensated
    // by deletion. Records created out-of-band carry no owner annotation
    // and are left alone; fresh records get a grace window so the metadata
    // insert can land.
    let service_created = sandbox
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key("llmsafespace.dev/owner"));
    let age_secs = sandbox
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| (Utc::now() - t.0).num_seconds())
        .unwrap_or(0);
    if service_created && age_secs > 60 && ctx.store.get_sandbox(&name).await?.is_none() {
        warn!(sandbox = %name, "cluster record has no metadata row, compensating");
        let sandboxes: Api<Sandbox> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
        delete_ignoring_missing(&sandboxes, &name, "sandbox").await?;
        return Ok(Action::await_change());
    }

    // Validate the declared runtime against the registry.
    let runtime = match ctx.gateway.get_runtime(&sandbox.spec.runtime).await? {
        Some(runtime) if runtime.is_available() => runtime,
        _ => {
            fail_terminal(
                ctx,
                &name,
                "RuntimeNotFound",
                &format!("runtime {:?} is not available", sandbox.spec.runtime),
            )
            .await?;
            return Ok(Action::await_change());
        }
    };

    // Resolve the profile when one is referenced.
    let mut profile = None;
    if let Some(profile_ref) = &sandbox.spec.profile_ref {
        let profiles: Api<SandboxProfile> = Api::namespaced(
            ctx.client.clone(),
            profile_ref.namespace.as_deref().unwrap_or(&ctx.namespace),
        );
        profile = profiles
            .get_opt(&profile_ref.name)
            .await
            .map_err(|e| classify_kube(e, "profile", &profile_ref.name))?;
        if profile.is_none() {
            fail_terminal(
                ctx,
                &name,
                "ProfileNotFound",
                &format!("profile {:?} not found", profile_ref.name),
            )
            .await?;
            return Ok(Action::await_change());
        }
    }
    let effective = resources::apply_profile(sandbox, profile.as_ref());

    let sandbox_uid = sandbox.metadata.uid.clone().unwrap_or_default();

    // Warm path first, when requested.
    let mut bound_warm_pod: Option<WarmPod> = None;
    if sandbox.spec.use_warm_pool {
        let allocator = WarmPodAllocator::new(ctx.gateway.clone());
        bound_warm_pod = allocator
            .allocate(&sandbox.spec.runtime, &sandbox.spec.security_level, &sandbox_uid)
            .await?;
    }

    let (pod_name, warm_pod_ref) = match bound_warm_pod {
        Some(warm_pod) => {
            let workload = warm_pod
                .status
                .as_ref()
                .and_then(|s| s.pod_name.clone())
                .ok_or_else(|| Error::Transient("claimed warm pod has no workload".into()))?;
            rebind_warm_workload(sandbox, ctx, &workload).await?;
            Metrics::incr(&ctx.metrics.warm_hits);
            info!(sandbox = %name, warmpod = %warm_pod.name_any(), "bound warm workload");
            (
                workload,
                Some(WarmPodRef {
                    name: warm_pod.name_any(),
                    namespace: ctx.namespace.clone(),
                }),
            )
        }
        None => {
            if sandbox.spec.use_warm_pool {
                Metrics::incr(&ctx.metrics.warm_misses);
            }
            create_fresh_workload(&effective, ctx, &runtime).await?;
            (resources::workload_name(&name), None)
        }
    };

    create_service_and_policies(&effective, ctx).await?;

    let namespace = ctx.namespace.clone();
    let api: Api<Sandbox> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    replace_status_with_retry(&api, &name, "sandbox", move |sb: &mut Sandbox| {
        let mut status = sb.status.clone().unwrap_or_default();
        status.phase = SandboxPhase::Creating;
        status.pod_name = Some(pod_name.clone());
        status.pod_namespace = Some(namespace.clone());
        status.warm_pod_ref = warm_pod_ref.clone();
        sb.status = Some(status);
    })
    .await?;

    let _ = ctx.store.update_sandbox_status(&name, "Creating").await;
    Ok(Action::requeue(Duration::from_secs(2)))
}

async fn handle_creating(sandbox: &Sandbox, ctx: &Ctx) -> CrateResult<Action> {
    let name = sandbox.name_any();
    let Some(pod_name) = sandbox.status.as_ref().and_then(|s| s.pod_name.clone()) else {
        // Lost the workload reference; restart materialization.
        return restart_pending(ctx, &name).await;
    };

    let pods: Api<k8s_openapi::api::core::v1::Pod> =
        Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let Some(pod) = pods
        .get_opt(&pod_name)
        .await
        .map_err(|e| classify_kube(e, "pod", &pod_name))?
    else {
        return Ok(Action::requeue(Duration::from_secs(5)));
    };

    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Running") => {}
        Some("Failed") | Some("Succeeded") => {
            fail_terminal(ctx, &name, "WorkloadFailed", "workload exited during startup").await?;
            return Ok(Action::await_change());
        }
        _ => return Ok(Action::requeue(Duration::from_secs(5))),
    }

    // The service endpoint must resolve before the sandbox is Running.
    let services: Api<k8s_openapi::api::core::v1::Service> =
        Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let service_name = resources::service_name(&name);
    if services
        .get_opt(&service_name)
        .await
        .map_err(|e| classify_kube(e, "service", &service_name))?
        .is_none()
    {
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    let endpoint = resources::service_endpoint(&name, &ctx.namespace);
    let api: Api<Sandbox> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    replace_status_with_retry(&api, &name, "sandbox", move |sb: &mut Sandbox| {
        let mut status = sb.status.clone().unwrap_or_default();
        status.phase = SandboxPhase::Running;
        status.start_time = Some(Utc::now().to_rfc3339());
        status.endpoint = Some(endpoint.clone());
        set_condition(
            &mut status.conditions,
            Condition::new("Ready", true, "WorkloadReady", "workload and service are up"),
        );
        sb.status = Some(status);
    })
    .await?;

    let _ = ctx.store.update_sandbox_status(&name, "Running").await;
    info!(sandbox = %name, "sandbox running");
    Ok(Action::requeue(ctx.resync))
}

async fn handle_running(sandbox: &Sandbox, ctx: &Ctx) -> CrateResult<Action> {
    let name = sandbox.name_any();
    let Some(pod_name) = sandbox.status.as_ref().and_then(|s| s.pod_name.clone()) else {
        return restart_pending(ctx, &name).await;
    };

    let pods: Api<k8s_openapi::api::core::v1::Pod> =
        Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let pod = pods
        .get_opt(&pod_name)
        .await
        .map_err(|e| classify_kube(e, "pod", &pod_name))?;

    match pod.and_then(|p| p.status.and_then(|s| s.phase)) {
        Some(phase) if phase == "Running" => Ok(Action::requeue(ctx.resync)),
        _ => {
            fail_terminal(ctx, &name, "WorkloadLost", "workload is no longer running").await?;
            Ok(Action::await_change())
        }
    }
}

/// Finalizer cleanup: decide recycle-vs-destroy for a bound warm workload,
/// then tear down the owned objects in order. Every step is idempotent.
async fn cleanup(sandbox: &Sandbox, ctx: &Ctx) -> CrateResult<Action> {
    let name = sandbox.name_any();
    info!(sandbox = %name, "cleaning up sandbox");

    let mut recycled = false;
    if let Some(warm_ref) = sandbox.status.as_ref().and_then(|s| s.warm_pod_ref.clone()) {
        recycled = release_warm_pod(sandbox, ctx, &warm_ref).await?;
    }

    // Service and network policies first.
    let services: Api<k8s_openapi::api::core::v1::Service> =
        Api::namespaced(ctx.client.clone(), &ctx.namespace);
    delete_ignoring_missing(&services, &resources::service_name(&name), "service").await?;

    let policies: Api<k8s_openapi::api::networking::v1::NetworkPolicy> =
        Api::namespaced(ctx.client.clone(), &ctx.namespace);
    for policy in [
        format!("sandbox-{name}-deny-all"),
        format!("sandbox-{name}-gateway"),
        format!("sandbox-{name}-egress"),
    ] {
        delete_ignoring_missing(&policies, &policy, "networkpolicy").await?;
    }

    // Then the workload, unless it went back to the pool.
    if !recycled {
        let pods: Api<k8s_openapi::api::core::v1::Pod> =
            Api::namespaced(ctx.client.clone(), &ctx.namespace);
        delete_ignoring_missing(&pods, &resources::workload_name(&name), "pod").await?;
    }

    let pvcs: Api<k8s_openapi::api::core::v1::PersistentVolumeClaim> =
        Api::namespaced(ctx.client.clone(), &ctx.namespace);
    delete_ignoring_missing(&pvcs, &resources::pvc_name(&name), "pvc").await?;

    let _ = ctx.store.update_sandbox_status(&name, "Terminated").await;
    Metrics::incr(&ctx.metrics.sandboxes_terminated);
    Ok(Action::await_change())
}

/// Returns true when the warm workload went back to its pool.
async fn release_warm_pod(sandbox: &Sandbox, ctx: &Ctx, warm_ref: &WarmPodRef) -> CrateResult<bool> {
    let warm_pods: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let Some(warm_pod) = warm_pods
        .get_opt(&warm_ref.name)
        .await
        .map_err(|e| classify_kube(e, "warmpod", &warm_ref.name))?
    else {
        // Already gone; nothing to release.
        return Ok(false);
    };

    let pools: Api<WarmPool> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let pool = pools
        .get_opt(&warm_pod.spec.pool_ref.name)
        .await
        .map_err(|e| classify_kube(e, "warmpool", &warm_pod.spec.pool_ref.name))?;

    let inputs = RecycleInputs {
        pool_exists: pool.is_some(),
        available_pods: pool
            .as_ref()
            .and_then(|p| p.status.as_ref())
            .map(|s| s.available_pods)
            .unwrap_or(0),
        min_size: pool.as_ref().map(|p| p.spec.min_size).unwrap_or(0),
        pod_age_hours: warm_pod
            .spec
            .created_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| (Utc::now() - t.with_timezone(&Utc)).num_hours()),
        tainted: sandbox.is_tainted(),
        max_age_hours: ctx.recycle_max_age_hours,
    };

    let workload_name = warm_pod
        .status
        .as_ref()
        .and_then(|s| s.pod_name.clone());

    if should_recycle(&inputs)
        && let Some(workload) = &workload_name
        && sanitize_workload(sandbox, ctx, workload).await.is_ok()
    {
        restore_pool_labels(ctx, &warm_pod, workload).await?;
        replace_status_with_retry(&warm_pods, &warm_ref.name, "warmpod", |pod: &mut WarmPod| {
            let mut status = pod.status.clone().unwrap_or_default();
            status.phase = WarmPodPhase::Ready;
            status.assigned_to = None;
            status.assigned_at = None;
            pod.status = Some(status);
        })
        .await?;

        let heartbeat = serde_json::json!({"spec": {"lastHeartbeat": Utc::now().to_rfc3339()}});
        warm_pods
            .patch(&warm_ref.name, &PatchParams::default(), &Patch::Merge(&heartbeat))
            .await
            .map_err(|e| classify_kube(e, "warmpod", &warm_ref.name))?;

        Metrics::incr(&ctx.metrics.recycles);
        info!(warmpod = %warm_ref.name, "recycled warm workload");
        return Ok(true);
    }

    delete_ignoring_missing(&warm_pods, &warm_ref.name, "warmpod").await?;
    Ok(false)
}

/// In-pod cleanup before recycling: wipe writable paths and kill leftover
/// user processes. Any failure vetoes the recycle.
async fn sanitize_workload(sandbox: &Sandbox, ctx: &Ctx, workload: &str) -> CrateResult<()> {
    let writable = sandbox
        .spec
        .filesystem
        .clone()
        .unwrap_or_default()
        .writable_paths;
    let wipes: Vec<String> = writable
        .iter()
        .map(|p| format!("rm -rf {}/* {}/.[!.]* 2>/dev/null", p.trim_end_matches('/'), p.trim_end_matches('/')))
        .collect();
    let script = format!("{}; pkill -9 -u 1000 sleep -v || true", wipes.join("; "));

    let request = ExecRequest::new(vec!["sh".to_string()], Duration::from_secs(30))
        .with_stdin(script.into_bytes());
    let outcome = ctx.gateway.exec(&ctx.namespace, workload, request).await?;
    if outcome.exit_code == crate::cluster::EXIT_CODE_TIMEOUT {
        return Err(Error::Transient("cleanup script timed out".into()));
    }
    Ok(())
}

/// Rewrite a claimed warm workload's labels so it belongs to the sandbox.
async fn rebind_warm_workload(sandbox: &Sandbox, ctx: &Ctx, workload: &str) -> CrateResult<()> {
    let name = sandbox.name_any();
    let labels = serde_json::json!({
        LABEL_COMPONENT: "sandbox",
        LABEL_SANDBOX: name,
        LABEL_POOL: serde_json::Value::Null,
    });
    crate::cluster::patch_pod_labels(ctx.client.clone(), &ctx.namespace, workload, labels).await?;

    if let Some(owner) = sandbox.controller_owner_ref(&()) {
        let pods: Api<k8s_openapi::api::core::v1::Pod> =
            Api::namespaced(ctx.client.clone(), &ctx.namespace);
        let patch = serde_json::json!({"metadata": {"ownerReferences": [owner]}});
        pods.patch(workload, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify_kube(e, "pod", workload))?;
    }
    Ok(())
}

/// Put a recycled workload back under its pool's labels and ownership.
async fn restore_pool_labels(ctx: &Ctx, warm_pod: &WarmPod, workload: &str) -> CrateResult<()> {
    let pool_name = &warm_pod.spec.pool_ref.name;
    let pools: Api<WarmPool> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let runtime = pools
        .get_opt(pool_name)
        .await
        .map_err(|e| classify_kube(e, "warmpool", pool_name))?
        .map(|p| p.spec.runtime)
        .unwrap_or_default();

    let labels = serde_json::json!({
        LABEL_COMPONENT: "warmpod",
        LABEL_POOL: pool_name,
        LABEL_SANDBOX: serde_json::Value::Null,
        crate::types::LABEL_RUNTIME: crate::validation::sanitize_runtime_label(&runtime),
    });
    crate::cluster::patch_pod_labels(ctx.client.clone(), &ctx.namespace, workload, labels).await?;

    if let Some(owner) = warm_pod.controller_owner_ref(&()) {
        let pods: Api<k8s_openapi::api::core::v1::Pod> =
            Api::namespaced(ctx.client.clone(), &ctx.namespace);
        let patch = serde_json::json!({"metadata": {"ownerReferences": [owner]}});
        pods.patch(workload, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify_kube(e, "pod", workload))?;
    }
    Ok(())
}

async fn create_fresh_workload(
    sandbox: &Sandbox,
    ctx: &Ctx,
    runtime: &crate::types::RuntimeEnvironment,
) -> CrateResult<()> {
    let name = sandbox.name_any();

    if sandbox
        .spec
        .storage
        .as_ref()
        .map(|s| s.persistent)
        .unwrap_or(false)
    {
        let pvcs: Api<k8s_openapi::api::core::v1::PersistentVolumeClaim> =
            Api::namespaced(ctx.client.clone(), &ctx.namespace);
        create_ignoring_existing(&pvcs, &resources::sandbox_pvc(sandbox, &ctx.namespace), "pvc")
            .await?;
    }

    let pods: Api<k8s_openapi::api::core::v1::Pod> =
        Api::namespaced(ctx.client.clone(), &ctx.namespace);
    create_ignoring_existing(
        &pods,
        &resources::sandbox_pod(sandbox, runtime, &ctx.namespace),
        "pod",
    )
    .await?;

    info!(sandbox = %name, "created fresh workload");
    Ok(())
}

async fn create_service_and_policies(sandbox: &Sandbox, ctx: &Ctx) -> CrateResult<()> {
    let services: Api<k8s_openapi::api::core::v1::Service> =
        Api::namespaced(ctx.client.clone(), &ctx.namespace);
    create_ignoring_existing(
        &services,
        &resources::sandbox_service(sandbox, &ctx.namespace),
        "service",
    )
    .await?;

    let policies: Api<k8s_openapi::api::networking::v1::NetworkPolicy> =
        Api::namespaced(ctx.client.clone(), &ctx.namespace);
    for policy in resources::network_policies(sandbox, &ctx.namespace, &ctx.gateway_namespace) {
        create_ignoring_existing(&policies, &policy, "networkpolicy").await?;
    }
    Ok(())
}

async fn restart_pending(ctx: &Ctx, name: &str) -> CrateResult<Action> {
    let api: Api<Sandbox> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    replace_status_with_retry(&api, name, "sandbox", |sb: &mut Sandbox| {
        let mut status = sb.status.clone().unwrap_or_default();
        status.phase = SandboxPhase::Pending;
        sb.status = Some(status);
    })
    .await?;
    Ok(Action::requeue(Duration::from_secs(1)))
}

async fn fail_terminal(ctx: &Ctx, name: &str, reason: &str, message: &str) -> CrateResult<()> {
    warn!(sandbox = %name, reason, message, "sandbox failed");
    let api: Api<Sandbox> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let condition = Condition::new("Failed", true, reason, message);
    replace_status_with_retry(&api, name, "sandbox", move |sb: &mut Sandbox| {
        let mut status = sb.status.clone().unwrap_or_default();
        status.phase = SandboxPhase::Failed;
        set_condition(&mut status.conditions, condition.clone());
        sb.status = Some(status);
    })
    .await?;
    let _ = ctx.store.update_sandbox_status(name, "Failed").await;
    Metrics::incr(&ctx.metrics.reconcile_errors);
    Ok(())
}

async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str, kind: &'static str) -> CrateResult<()>
where
    K: Clone + std::fmt::Debug + serde::de::DeserializeOwned + kube::Resource,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(e) => match classify_kube(e, kind, name) {
            Error::NotFound { .. } => Ok(()),
            other => Err(other),
        },
    }
}

async fn create_ignoring_existing<K>(api: &Api<K>, object: &K, kind: &'static str) -> CrateResult<()>
where
    K: Clone + std::fmt::Debug + serde::Serialize + serde::de::DeserializeOwned + kube::Resource,
{
    let name = object.meta().name.clone().unwrap_or_default();
    match api.create(&PostParams::default(), object).await {
        Ok(_) => Ok(()),
        Err(e) => match classify_kube(e, kind, &name) {
            Error::Conflict(_) => Ok(()),
            other => Err(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> RecycleInputs {
        RecycleInputs {
            pool_exists: true,
            available_pods: 1,
            min_size: 2,
            pod_age_hours: Some(3),
            tainted: false,
            max_age_hours: 24,
        }
    }

    #[test]
    fn test_recycles_when_all_conditions_hold() {
        assert!(should_recycle(&inputs()));
    }

    #[test]
    fn test_no_recycle_when_pool_gone() {
        let mut i = inputs();
        i.pool_exists = false;
        assert!(!should_recycle(&i));
    }

    #[test]
    fn test_no_recycle_when_pool_at_floor() {
        let mut i = inputs();
        i.available_pods = 2;
        assert!(!should_recycle(&i));
        i.available_pods = 5;
        assert!(!should_recycle(&i));
    }

    #[test]
    fn test_no_recycle_when_workload_too_old() {
        let mut i = inputs();
        i.pod_age_hours = Some(24);
        assert!(!should_recycle(&i));
        i.pod_age_hours = Some(48);
        assert!(!should_recycle(&i));
        // Unknown age is treated as too old.
        i.pod_age_hours = None;
        assert!(!should_recycle(&i));
    }

    #[test]
    fn test_no_recycle_when_tainted() {
        let mut i = inputs();
        i.tainted = true;
        assert!(!should_recycle(&i));
    }

    #[test]
    fn test_boundary_age_just_under_cap() {
        let mut i = inputs();
        i.pod_age_hours = Some(23);
        assert!(should_recycle(&i));
    }
}
