//! End-to-end lifecycle tests against a real cluster.
//!
//! These exercise the full path: CRD creation, reconciler-driven startup,
//! warm-pool claims, and recycle-on-release. They need a cluster with the
//! CRDs installed and a controller running, so they are ignored by default.
//!
//! Run with: cargo test --test cluster_e2e_test -- --ignored --nocapture
//!
//! Requirements:
//!   - KUBECONFIG pointing at a cluster with the llmsafespace CRDs applied
//!   - `llmsafespace controller` running against the same cluster
//!   - a RuntimeEnvironment for python:3.10 marked available

use std::time::Duration;

use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};

use llmsafespace::types::{Sandbox, SandboxPhase, SandboxSpec, WarmPod, WarmPool, WarmPoolSpec};

const NAMESPACE: &str = "llmsafespace";

async fn client() -> Client {
    Client::try_default()
        .await
        .expect("kube client from environment")
}

fn sandbox_spec(use_warm_pool: bool) -> SandboxSpec {
    serde_json::from_value(serde_json::json!({
        "runtime": "python:3.10",
        "timeout": 30,
        "useWarmPool": use_warm_pool,
    }))
    .expect("valid sandbox spec")
}

async fn wait_for_phase(
    api: &Api<Sandbox>,
    name: &str,
    phase: SandboxPhase,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(sandbox)) = api.get_opt(name).await
            && sandbox.phase() == phase
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    false
}

#[tokio::test]
#[ignore]
async fn test_cold_create_reaches_running() {
    let client = client().await;
    let sandboxes: Api<Sandbox> = Api::namespaced(client, NAMESPACE);

    let sandbox = Sandbox::new("e2e-cold", sandbox_spec(false));
    sandboxes
        .create(&PostParams::default(), &sandbox)
        .await
        .expect("create sandbox");

    assert!(
        wait_for_phase(&sandboxes, "e2e-cold", SandboxPhase::Running, Duration::from_secs(120))
            .await,
        "sandbox never reached Running"
    );

    let running = sandboxes.get("e2e-cold").await.expect("get sandbox");
    let status = running.status.expect("status populated");
    assert!(status.pod_name.is_some());
    assert!(status.endpoint.is_some());
    assert!(status.start_time.is_some());

    sandboxes
        .delete("e2e-cold", &DeleteParams::default())
        .await
        .expect("delete sandbox");
}

#[tokio::test]
#[ignore]
async fn test_warm_hit_binds_pool_member() {
    let client = client().await;
    let pools: Api<WarmPool> = Api::namespaced(client.clone(), NAMESPACE);
    let pods: Api<WarmPod> = Api::namespaced(client.clone(), NAMESPACE);
    let sandboxes: Api<Sandbox> = Api::namespaced(client, NAMESPACE);

    let pool = WarmPool::new(
        "e2e-pool",
        WarmPoolSpec {
            runtime: "python:3.10".to_string(),
            min_size: 1,
            max_size: 0,
            security_level: "standard".to_string(),
            ttl: 0,
            resources: None,
            profile_ref: None,
            preload_packages: Vec::new(),
            preload_scripts: Vec::new(),
            auto_scaling: None,
        },
    );
    pools
        .create(&PostParams::default(), &pool)
        .await
        .expect("create pool");

    // Wait for one Ready member.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
    let mut ready_pod = None;
    while tokio::time::Instant::now() < deadline {
        let members = pods
            .list(&kube::api::ListParams::default().labels("llmsafespace.dev/pool=e2e-pool"))
            .await
            .expect("list members");
        if let Some(member) = members.items.into_iter().find(|p| p.is_ready()) {
            ready_pod = Some(member.name_any());
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    let ready_pod = ready_pod.expect("pool never produced a ready member");

    // A warm-preferring sandbox should bind that member quickly.
    let sandbox = Sandbox::new("e2e-warm", sandbox_spec(true));
    let started = tokio::time::Instant::now();
    sandboxes
        .create(&PostParams::default(), &sandbox)
        .await
        .expect("create sandbox");

    assert!(
        wait_for_phase(&sandboxes, "e2e-warm", SandboxPhase::Running, Duration::from_secs(10))
            .await,
        "warm-bound sandbox too slow to reach Running"
    );
    assert!(started.elapsed() < Duration::from_secs(10));

    let bound = sandboxes.get("e2e-warm").await.expect("get sandbox");
    let warm_ref = bound
        .status
        .as_ref()
        .and_then(|s| s.warm_pod_ref.as_ref())
        .expect("warmPodRef set on warm hit");
    assert_eq!(warm_ref.name, ready_pod);

    let _ = sandboxes.delete("e2e-warm", &DeleteParams::default()).await;
    let _ = pools.delete("e2e-pool", &DeleteParams::default()).await;
}

#[tokio::test]
#[ignore]
async fn test_release_recycles_young_untainted_member() {
    let client = client().await;
    let pools: Api<WarmPool> = Api::namespaced(client.clone(), NAMESPACE);
    let pods: Api<WarmPod> = Api::namespaced(client.clone(), NAMESPACE);
    let sandboxes: Api<Sandbox> = Api::namespaced(client, NAMESPACE);

    let pool = WarmPool::new(
        "e2e-recycle-pool",
        WarmPoolSpec {
            runtime: "python:3.10".to_string(),
            min_size: 2,
            max_size: 0,
            security_level: "standard".to_string(),
            ttl: 0,
            resources: None,
            profile_ref: None,
            preload_packages: Vec::new(),
            preload_scripts: Vec::new(),
            auto_scaling: None,
        },
    );
    pools
        .create(&PostParams::default(), &pool)
        .await
        .expect("create pool");

    // Claim one member via a sandbox, leaving the pool below its floor.
    let sandbox = Sandbox::new("e2e-recycle", sandbox_spec(true));
    sandboxes
        .create(&PostParams::default(), &sandbox)
        .await
        .expect("create sandbox");
    assert!(
        wait_for_phase(
            &sandboxes,
            "e2e-recycle",
            SandboxPhase::Running,
            Duration::from_secs(120)
        )
        .await
    );

    let bound = sandboxes.get("e2e-recycle").await.expect("get");
    let warm_ref = bound
        .status
        .as_ref()
        .and_then(|s| s.warm_pod_ref.as_ref())
        .expect("warm hit expected")
        .clone();

    // Terminate; the young, untainted member must go back to Ready.
    sandboxes
        .delete("e2e-recycle", &DeleteParams::default())
        .await
        .expect("delete sandbox");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let mut recycled = false;
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(member)) = pods.get_opt(&warm_ref.name).await
            && member.is_ready()
        {
            recycled = true;
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert!(recycled, "released warm pod never returned to Ready");

    let _ = pools
        .delete("e2e-recycle-pool", &DeleteParams::default())
        .await;
}
