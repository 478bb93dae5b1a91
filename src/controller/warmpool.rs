//! Warm-Pool Manager: keeps each pool's ready-workload count at its target.
//!
//! Invoked whenever a WarmPool or one of its member WarmPods changes. The
//! planning step is a pure function over the observed members; the reconcile
//! applies its plan: create missing pods, evict TTL-expired ones, and scale
//! down over-provisioned pools while honoring the scale-down delay.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use super::{Ctx, ReconcileError, replace_status_with_retry, resources};
use crate::error::{Result as CrateResult, classify_kube};
use crate::metrics::Metrics;
use crate::types::{
    Condition, LABEL_POOL, ObjectRef, WarmPod, WarmPodPhase, WarmPodSpec, WarmPodStatus, WarmPool,
    WarmPoolStatus, set_condition,
};

/// Pool member counts grouped by phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounters {
    pub available: i32,
    pub assigned: i32,
    pub pending: i32,
}

/// Side effects one reconcile pass should apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolPlan {
    pub counters: PoolCounters,
    /// Number of new warm pods to create.
    pub create: usize,
    /// Names to transition to Terminating because their TTL expired.
    pub evict_expired: Vec<String>,
    /// Names to transition to Terminating to respect maxSize.
    pub scale_down: Vec<String>,
    /// Whether this pass counts as a scale event.
    pub scaled: bool,
}

/// Compute the plan for one pool from its observed members.
pub fn plan_pool(pool: &WarmPool, pods: &[WarmPod], now: DateTime<Utc>) -> PoolPlan {
    let mut counters = PoolCounters::default();
    for pod in pods {
        match pod.phase() {
            WarmPodPhase::Pending => counters.pending += 1,
            WarmPodPhase::Ready => counters.available += 1,
            WarmPodPhase::Assigned => counters.assigned += 1,
            WarmPodPhase::Terminating => {}
        }
    }

    // TTL eviction: ready pods whose heartbeat went stale, oldest first.
    let mut evict_expired = Vec::new();
    if pool.spec.ttl > 0 {
        let cutoff = now - ChronoDuration::seconds(pool.spec.ttl);
        let mut expired: Vec<&WarmPod> = pods
            .iter()
            .filter(|p| p.phase() == WarmPodPhase::Ready)
            .filter(|p| {
                parse_time(p.spec.last_heartbeat.as_deref().or(p.spec.created_at.as_deref()))
                    .map(|t| t < cutoff)
                    .unwrap_or(false)
            })
            .collect();
        sort_oldest_first(&mut expired);
        evict_expired = expired.iter().map(|p| p.name_any()).collect();
    }

    let available_after = counters.available - evict_expired.len() as i32;

    // Scale up to the floor, bounded by maxSize (0 = unlimited).
    let shortfall = (pool.spec.min_size - available_after).max(0) as usize;
    let create = if pool.spec.max_size > 0 {
        let headroom = (pool.spec.max_size - (available_after + counters.pending)).max(0) as usize;
        shortfall.min(headroom)
    } else {
        shortfall
    };

    // Autoscaling scale-down, rate limited by scaleDownDelay.
    let mut scale_down = Vec::new();
    let auto = pool.spec.auto_scaling.clone().unwrap_or_default();
    if auto.enabled && pool.spec.max_size > 0 && available_after > pool.spec.max_size {
        let last_scale = pool
            .status
            .as_ref()
            .and_then(|s| parse_time(s.last_scale_time.as_deref()));
        let delay_ok = last_scale
            .map(|t| now - t >= ChronoDuration::seconds(auto.scale_down_delay))
            .unwrap_or(true);

        if delay_ok {
            let excess = (available_after - pool.spec.max_size) as usize;
            let mut idle: Vec<&WarmPod> = pods
                .iter()
                .filter(|p| p.phase() == WarmPodPhase::Ready)
                .filter(|p| !evict_expired.contains(&p.name_any()))
                .collect();
            sort_oldest_first(&mut idle);
            scale_down = idle.iter().take(excess).map(|p| p.name_any()).collect();
        }
    }

    let scaled = create > 0 || !scale_down.is_empty();
    PoolPlan {
        counters,
        create,
        evict_expired,
        scale_down,
        scaled,
    }
}

/// Oldest creation timestamp first; ties break on the lexicographically
/// smaller name.
fn sort_oldest_first(pods: &mut [&WarmPod]) {
    pods.sort_by(|a, b| {
        let a_created = a.spec.created_at.as_deref().unwrap_or("");
        let b_created = b.spec.created_at.as_deref().unwrap_or("");
        a_created
            .cmp(b_created)
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
}

fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|r| DateTime::parse_from_rfc3339(r).ok())
        .map(|t| t.with_timezone(&Utc))
}

pub async fn run(ctx: Arc<Ctx>) -> CrateResult<()> {
    let pools: Api<WarmPool> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let pods: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &ctx.namespace);

    let stream = Controller::new(pools, WatcherConfig::default())
        .owns(pods, WatcherConfig::default())
        .with_config(
            kube::runtime::controller::Config::default().concurrency(ctx.workers),
        )
        .reconcile_all_on(super::resync_ticks(ctx.resync))
        .run(reconcile, |_obj, err, _ctx| super::error_action(err), ctx);

    super::drain_controller("warmpool", stream).await;
    Ok(())
}

async fn reconcile(
    pool: Arc<WarmPool>,
    ctx: Arc<Ctx>,
) -> std::result::Result<Action, ReconcileError> {
    let name = pool.name_any();
    let pods = list_members(&ctx, &name).await?;
    let plan = plan_pool(&pool, &pods, Utc::now());

    apply_counters(&ctx, &name, &plan).await?;

    if plan.create > 0 {
        create_members(&ctx, &pool, plan.create).await?;
        info!(pool = %name, count = plan.create, "scaling warm pool up");
    }

    for pod_name in plan.evict_expired.iter().chain(plan.scale_down.iter()) {
        terminate_member(&ctx, pod_name).await?;
    }
    if !plan.evict_expired.is_empty() {
        info!(pool = %name, evicted = plan.evict_expired.len(), "evicted expired warm pods");
    }

    Ok(Action::requeue(ctx.resync))
}

async fn list_members(ctx: &Ctx, pool_name: &str) -> CrateResult<Vec<WarmPod>> {
    let api: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let selector = format!("{LABEL_POOL}={pool_name}");
    let list = api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(|e| classify_kube(e, "warmpod", pool_name))?;
    Ok(list.items)
}

async fn apply_counters(ctx: &Ctx, pool_name: &str, plan: &PoolPlan) -> CrateResult<()> {
    let api: Api<WarmPool> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let counters = plan.counters;
    let scaled = plan.scaled;
    replace_status_with_retry(&api, pool_name, "warmpool", move |pool: &mut WarmPool| {
        let mut status = pool.status.clone().unwrap_or_default();
        status.available_pods = counters.available;
        status.assigned_pods = counters.assigned;
        status.pending_pods = counters.pending;
        if scaled {
            status.last_scale_time = Some(Utc::now().to_rfc3339());
        }
        pool.status = Some(status);
    })
    .await?;
    Ok(())
}

async fn create_members(ctx: &Ctx, pool: &WarmPool, count: usize) -> CrateResult<()> {
    let pool_name = pool.name_any();

    let Some(runtime) = ctx.gateway.get_runtime(&pool.spec.runtime).await? else {
        record_pool_condition(
            ctx,
            &pool_name,
            Condition::new(
                "RuntimeResolved",
                false,
                "RuntimeNotFound",
                &format!("no RuntimeEnvironment for {}", pool.spec.runtime),
            ),
        )
        .await?;
        warn!(pool = %pool_name, runtime = %pool.spec.runtime, "cannot grow pool, runtime unknown");
        return Ok(());
    };

    let warmpods: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let workloads: Api<k8s_openapi::api::core::v1::Pod> =
        Api::namespaced(ctx.client.clone(), &ctx.namespace);

    for _ in 0..count {
        let suffix: String = uuid::Uuid::new_v4().to_string().chars().take(8).collect();
        let member_name = format!("{pool_name}-{suffix}");
        let workload_name = format!("warmpod-{member_name}");

        let mut member = WarmPod::new(
            &member_name,
            WarmPodSpec {
                pool_ref: ObjectRef {
                    name: pool_name.clone(),
                    namespace: pool.namespace(),
                },
                created_at: Some(Utc::now().to_rfc3339()),
                last_heartbeat: None,
            },
        );
        member.metadata.labels = Some(resources::warm_pod_labels(&pool_name, &pool.spec.runtime));
        member.metadata.owner_references =
            pool.controller_owner_ref(&()).map(|r| vec![r]);

        let created = warmpods
            .create(&PostParams::default(), &member)
            .await
            .map_err(|e| classify_kube(e, "warmpod", &member_name))?;

        let workload = resources::warm_pod_workload(
            pool,
            &created,
            &workload_name,
            &ctx.namespace,
            &runtime.spec.image,
        );
        if let Err(e) = workloads.create(&PostParams::default(), &workload).await {
            warn!(pool = %pool_name, pod = %workload_name, error = %e, "failed to create warm workload");
            continue;
        }

        replace_status_with_retry(&warmpods, &member_name, "warmpod", move |pod: &mut WarmPod| {
            let mut status = pod.status.clone().unwrap_or_default();
            status.phase = WarmPodPhase::Pending;
            status.pod_name = Some(workload_name.clone());
            pod.status = Some(status);
        })
        .await?;
    }
    Ok(())
}

async fn terminate_member(ctx: &Ctx, pod_name: &str) -> CrateResult<()> {
    let api: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    replace_status_with_retry(&api, pod_name, "warmpod", |pod: &mut WarmPod| {
        let mut status = pod.status.clone().unwrap_or_default();
        status.phase = WarmPodPhase::Terminating;
        pod.status = Some(status);
    })
    .await?;
    Ok(())
}

async fn record_pool_condition(ctx: &Ctx, pool_name: &str, condition: Condition) -> CrateResult<()> {
    let api: Api<WarmPool> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    Metrics::incr(&ctx.metrics.reconcile_errors);
    replace_status_with_retry(&api, pool_name, "warmpool", move |pool: &mut WarmPool| {
        let mut status = pool.status.clone().unwrap_or_default();
        set_condition(&mut status.conditions, condition.clone());
        pool.status = Some(status);
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AutoScalingConfig, WarmPoolSpec};

    fn pool(min: i32, max: i32, ttl: i64) -> WarmPool {
        WarmPool::new(
            "pool",
            WarmPoolSpec {
                runtime: "python:3.10".to_string(),
                min_size: min,
                max_size: max,
                security_level: "standard".to_string(),
                ttl,
                resources: None,
                profile_ref: None,
                preload_packages: Vec::new(),
                preload_scripts: Vec::new(),
                auto_scaling: None,
            },
        )
    }

    fn member(name: &str, phase: WarmPodPhase, created_at: &str, heartbeat: Option<&str>) -> WarmPod {
        let mut pod = WarmPod::new(
            name,
            WarmPodSpec {
                pool_ref: ObjectRef {
                    name: "pool".to_string(),
                    namespace: None,
                },
                created_at: Some(created_at.to_string()),
                last_heartbeat: heartbeat.map(|h| h.to_string()),
            },
        );
        pod.status = Some(WarmPodStatus {
            phase,
            ..Default::default()
        });
        pod
    }

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_counts_by_phase() {
        let pods = vec![
            member("a", WarmPodPhase::Ready, "2026-01-01T00:00:00Z", None),
            member("b", WarmPodPhase::Assigned, "2026-01-01T00:00:00Z", None),
            member("c", WarmPodPhase::Pending, "2026-01-01T00:00:00Z", None),
            member("d", WarmPodPhase::Terminating, "2026-01-01T00:00:00Z", None),
        ];
        let plan = plan_pool(&pool(0, 0, 0), &pods, at("2026-01-01T01:00:00Z"));
        assert_eq!(
            plan.counters,
            PoolCounters {
                available: 1,
                assigned: 1,
                pending: 1
            }
        );
    }

    #[test]
    fn test_scales_up_to_min_size() {
        let pods = vec![member("a", WarmPodPhase::Ready, "2026-01-01T00:00:00Z", None)];
        let plan = plan_pool(&pool(3, 0, 0), &pods, at("2026-01-01T01:00:00Z"));
        assert_eq!(plan.create, 2);
        assert!(plan.scaled);
    }

    #[test]
    fn test_min_size_zero_never_creates() {
        let plan = plan_pool(&pool(0, 0, 0), &[], at("2026-01-01T01:00:00Z"));
        assert_eq!(plan.create, 0);
        assert!(!plan.scaled);
        assert!(plan.evict_expired.is_empty());
    }

    #[test]
    fn test_pending_pods_count_against_headroom() {
        let pods = vec![
            member("a", WarmPodPhase::Pending, "2026-01-01T00:00:00Z", None),
            member("b", WarmPodPhase::Pending, "2026-01-01T00:00:00Z", None),
        ];
        // min 4, max 3: headroom is 3 - (0 ready + 2 pending) = 1.
        let plan = plan_pool(&pool(4, 3, 0), &pods, at("2026-01-01T01:00:00Z"));
        assert_eq!(plan.create, 1);
    }

    #[test]
    fn test_max_size_zero_is_unlimited() {
        let plan = plan_pool(&pool(10, 0, 0), &[], at("2026-01-01T01:00:00Z"));
        assert_eq!(plan.create, 10);
    }

    #[test]
    fn test_ttl_evicts_stale_ready_pods_oldest_first() {
        let pods = vec![
            member(
                "young",
                WarmPodPhase::Ready,
                "2026-01-01T00:50:00Z",
                Some("2026-01-01T00:59:00Z"),
            ),
            member(
                "old-b",
                WarmPodPhase::Ready,
                "2026-01-01T00:00:00Z",
                Some("2026-01-01T00:10:00Z"),
            ),
            member(
                "old-a",
                WarmPodPhase::Ready,
                "2026-01-01T00:00:00Z",
                Some("2026-01-01T00:05:00Z"),
            ),
        ];
        // TTL 10 minutes; now 01:00. Heartbeats at 00:05/00:10 are stale.
        let plan = plan_pool(&pool(0, 0, 600), &pods, at("2026-01-01T01:00:00Z"));
        assert_eq!(plan.evict_expired, vec!["old-a", "old-b"]);
    }

    #[test]
    fn test_eviction_triggers_replacement_creation() {
        let pods = vec![member(
            "stale",
            WarmPodPhase::Ready,
            "2026-01-01T00:00:00Z",
            Some("2026-01-01T00:00:00Z"),
        )];
        let plan = plan_pool(&pool(1, 0, 60), &pods, at("2026-01-01T01:00:00Z"));
        assert_eq!(plan.evict_expired, vec!["stale"]);
        assert_eq!(plan.create, 1);
    }

    #[test]
    fn test_autoscale_down_over_max() {
        let mut p = pool(1, 2, 0);
        p.spec.auto_scaling = Some(AutoScalingConfig {
            enabled: true,
            target_utilization: 80,
            scale_down_delay: 300,
        });
        let pods = vec![
            member("a", WarmPodPhase::Ready, "2026-01-01T00:00:00Z", None),
            member("b", WarmPodPhase::Ready, "2026-01-01T00:01:00Z", None),
            member("c", WarmPodPhase::Ready, "2026-01-01T00:02:00Z", None),
            member("d", WarmPodPhase::Ready, "2026-01-01T00:03:00Z", None),
        ];
        let plan = plan_pool(&p, &pods, at("2026-01-01T01:00:00Z"));
        assert_eq!(plan.scale_down, vec!["a", "b"]);
        assert!(plan.scaled);
    }

    #[test]
    fn test_scale_down_honors_delay() {
        let mut p = pool(1, 2, 0);
        p.spec.auto_scaling = Some(AutoScalingConfig {
            enabled: true,
            target_utilization: 80,
            scale_down_delay: 300,
        });
        p.status = Some(WarmPoolStatus {
            last_scale_time: Some("2026-01-01T00:58:00Z".to_string()),
            ..Default::default()
        });
        let pods = vec![
            member("a", WarmPodPhase::Ready, "2026-01-01T00:00:00Z", None),
            member("b", WarmPodPhase::Ready, "2026-01-01T00:01:00Z", None),
            member("c", WarmPodPhase::Ready, "2026-01-01T00:02:00Z", None),
        ];
        // Last scale was 2 minutes ago, delay is 5 minutes: hold off.
        let plan = plan_pool(&p, &pods, at("2026-01-01T01:00:00Z"));
        assert!(plan.scale_down.is_empty());

        // After the delay elapses the same pool scales down.
        let plan = plan_pool(&p, &pods, at("2026-01-01T01:04:00Z"));
        assert_eq!(plan.scale_down, vec!["a"]);
    }

    #[test]
    fn test_autoscale_disabled_never_scales_down() {
        let pods = vec![
            member("a", WarmPodPhase::Ready, "2026-01-01T00:00:00Z", None),
            member("b", WarmPodPhase::Ready, "2026-01-01T00:01:00Z", None),
            member("c", WarmPodPhase::Ready, "2026-01-01T00:02:00Z", None),
        ];
        let plan = plan_pool(&pool(1, 2, 0), &pods, at("2026-01-01T01:00:00Z"));
        assert!(plan.scale_down.is_empty());
    }
}
