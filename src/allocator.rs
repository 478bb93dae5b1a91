//! Warm-Pod Allocator: atomic find-and-claim of a ready warm workload.
//!
//! Matching is by runtime label; a pool at the requested security level is
//! preferred, any other level is a fallback only when no exact match has
//! ready pods. The claim itself is a compare-and-swap on the WarmPod status;
//! losing the race re-lists and retries a bounded number of times, then
//! reports a miss. The allocator never waits for a pool to scale.

use std::sync::Arc;

use tracing::debug;

use crate::cluster::ClusterGateway;
use crate::error::Result;
use crate::types::{WarmPod, WarmPool};
use crate::validation::{validate_runtime, validate_security_level};

/// Claim attempts before giving up under contention.
const CLAIM_ATTEMPTS: usize = 3;

pub struct WarmPodAllocator {
    gateway: Arc<dyn ClusterGateway>,
}

impl WarmPodAllocator {
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        Self { gateway }
    }

    /// Find and claim one Ready warm pod matching the request, or report a
    /// miss with `None`.
    pub async fn allocate(
        &self,
        runtime: &str,
        security_level: &str,
        sandbox_uid: &str,
    ) -> Result<Option<WarmPod>> {
        validate_runtime(runtime)?;
        validate_security_level(security_level)?;

        for attempt in 0..CLAIM_ATTEMPTS {
            let pools = self.gateway.list_pools_for_runtime(runtime).await?;
            let (preferred, fallback) = partition_by_level(&pools, security_level);

            let mut candidates = Vec::new();
            for group in [&preferred, &fallback] {
                for pool in group {
                    let name = pool.metadata.name.clone().unwrap_or_default();
                    let mut ready = self.gateway.list_ready_warm_pods(&name).await?;
                    order_pods(&mut ready);
                    candidates.extend(ready);
                }
                // Exact-level pods win outright; fall back only when none
                // are ready.
                if !candidates.is_empty() {
                    break;
                }
            }

            let Some(pod) = candidates.into_iter().next() else {
                return Ok(None);
            };

            match self.gateway.claim_warm_pod(&pod, sandbox_uid).await? {
                Some(claimed) => return Ok(Some(claimed)),
                None => {
                    debug!(
                        attempt,
                        pod = pod.metadata.name.as_deref().unwrap_or(""),
                        "warm pod claim lost, re-listing"
                    );
                }
            }
        }

        Ok(None)
    }
}

/// Split pools into exact security-level matches and fallbacks.
fn partition_by_level<'a>(
    pools: &'a [WarmPool],
    security_level: &str,
) -> (Vec<&'a WarmPool>, Vec<&'a WarmPool>) {
    let mut preferred = Vec::new();
    let mut fallback = Vec::new();
    for pool in pools {
        if pool.spec.security_level == security_level {
            preferred.push(pool);
        } else {
            fallback.push(pool);
        }
    }
    (preferred, fallback)
}

/// Deterministic claim order: oldest creation first, then lexicographic name.
fn order_pods(pods: &mut [WarmPod]) {
    pods.sort_by(|a, b| {
        let a_created = a.spec.created_at.as_deref().unwrap_or("");
        let b_created = b.spec.created_at.as_deref().unwrap_or("");
        a_created
            .cmp(b_created)
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObjectRef, WarmPodSpec, WarmPoolSpec};

    fn pool(name: &str, level: &str) -> WarmPool {
        WarmPool::new(
            name,
            WarmPoolSpec {
                runtime: "python:3.10".to_string(),
                min_size: 1,
                max_size: 0,
                security_level: level.to_string(),
                ttl: 0,
                resources: None,
                profile_ref: None,
                preload_packages: Vec::new(),
                preload_scripts: Vec::new(),
                auto_scaling: None,
            },
        )
    }

    fn pod(name: &str, created_at: &str) -> WarmPod {
        WarmPod::new(
            name,
            WarmPodSpec {
                pool_ref: ObjectRef {
                    name: "python-pool".to_string(),
                    namespace: None,
                },
                created_at: Some(created_at.to_string()),
                last_heartbeat: None,
            },
        )
    }

    #[test]
    fn test_partition_prefers_exact_level() {
        let pools = vec![
            pool("high-pool", "high"),
            pool("std-pool", "standard"),
            pool("std-pool-2", "standard"),
        ];
        let (preferred, fallback) = partition_by_level(&pools, "standard");
        assert_eq!(preferred.len(), 2);
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].metadata.name.as_deref(), Some("high-pool"));
    }

    #[test]
    fn test_order_pods_oldest_then_name() {
        let mut pods = vec![
            pod("b", "2026-01-02T00:00:00Z"),
            pod("c", "2026-01-01T00:00:00Z"),
            pod("a", "2026-01-02T00:00:00Z"),
        ];
        order_pods(&mut pods);
        let names: Vec<_> = pods
            .iter()
            .map(|p| p.metadata.name.as_deref().unwrap())
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    mod with_fake_gateway {
        use super::*;
        use crate::testutil::FakeGateway;
        use crate::types::{WarmPodPhase, WarmPodStatus};

        fn ready(mut pod: WarmPod) -> WarmPod {
            pod.status = Some(WarmPodStatus {
                phase: WarmPodPhase::Ready,
                pod_name: Some(format!("pod-{}", pod.metadata.name.as_deref().unwrap())),
                pod_namespace: Some("llmsafespace".to_string()),
                ..Default::default()
            });
            pod
        }

        #[tokio::test]
        async fn test_allocate_miss_when_no_pools() {
            let gateway = Arc::new(FakeGateway::new());
            let allocator = WarmPodAllocator::new(gateway);
            let result = allocator
                .allocate("python:3.10", "standard", "uid-1")
                .await
                .unwrap();
            assert!(result.is_none());
        }

        #[tokio::test]
        async fn test_allocate_claims_ready_pod() {
            let gateway = Arc::new(FakeGateway::new());
            gateway.put_warm_pool(pool("python-pool", "standard"));
            gateway.put_warm_pod("python-pool", ready(pod("wp-1", "2026-01-01T00:00:00Z")));

            let allocator = WarmPodAllocator::new(gateway.clone());
            let claimed = allocator
                .allocate("python:3.10", "standard", "uid-1")
                .await
                .unwrap()
                .expect("expected a claim");

            assert_eq!(claimed.metadata.name.as_deref(), Some("wp-1"));
            assert_eq!(
                claimed.status.as_ref().unwrap().assigned_to.as_deref(),
                Some("uid-1")
            );
            assert_eq!(claimed.phase(), WarmPodPhase::Assigned);
        }

        #[tokio::test]
        async fn test_allocate_rejects_bad_inputs() {
            let gateway = Arc::new(FakeGateway::new());
            let allocator = WarmPodAllocator::new(gateway);
            assert!(allocator.allocate("", "standard", "u").await.is_err());
            assert!(
                allocator
                    .allocate("python:3.10", "lax", "u")
                    .await
                    .is_err()
            );
        }

        #[tokio::test]
        async fn test_concurrent_claims_one_winner() {
            let gateway = Arc::new(FakeGateway::new());
            gateway.put_warm_pool(pool("python-pool", "standard"));
            gateway.put_warm_pod("python-pool", ready(pod("wp-1", "2026-01-01T00:00:00Z")));

            let a = WarmPodAllocator::new(gateway.clone());
            let b = WarmPodAllocator::new(gateway.clone());
            let (ra, rb) = tokio::join!(
                a.allocate("python:3.10", "standard", "uid-a"),
                b.allocate("python:3.10", "standard", "uid-b"),
            );

            let wins = [ra.unwrap(), rb.unwrap()]
                .into_iter()
                .flatten()
                .count();
            assert_eq!(wins, 1);
        }

        #[tokio::test]
        async fn test_fallback_level_used_only_without_exact_match() {
            let gateway = Arc::new(FakeGateway::new());
            gateway.put_warm_pool(pool("high-pool", "high"));
            gateway.put_warm_pod("high-pool", ready(pod("wp-high", "2026-01-01T00:00:00Z")));

            let allocator = WarmPodAllocator::new(gateway.clone());
            let claimed = allocator
                .allocate("python:3.10", "standard", "uid-1")
                .await
                .unwrap()
                .expect("fallback pool should serve the request");
            assert_eq!(claimed.metadata.name.as_deref(), Some("wp-high"));
        }
    }
}
