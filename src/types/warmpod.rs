//! The `WarmPod` custom resource: one pre-started workload inside a pool.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Condition, ObjectRef};

/// Desired state of a warm pod. The pool reconciler creates these; the
/// warm-pod reconciler drives the underlying workload.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "llmsafespace.dev",
    version = "v1",
    kind = "WarmPod",
    plural = "warmpods",
    shortname = "wpd",
    status = "WarmPodStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WarmPodSpec {
    /// Pool this workload belongs to.
    pub pool_ref: ObjectRef,
    /// RFC 3339 timestamp the pool reconciler created this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// RFC 3339 timestamp of the last readiness heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<String>,
}

/// Phase of a warm pod. Assignment is a single-writer Ready -> Assigned
/// transition guarded by compare-and-swap on the resource version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum WarmPodPhase {
    #[default]
    Pending,
    Ready,
    Assigned,
    Terminating,
}

impl std::fmt::Display for WarmPodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WarmPodPhase::Pending => "Pending",
            WarmPodPhase::Ready => "Ready",
            WarmPodPhase::Assigned => "Assigned",
            WarmPodPhase::Terminating => "Terminating",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WarmPodStatus {
    #[serde(default)]
    pub phase: WarmPodPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_namespace: Option<String>,
    /// UID of the sandbox this pod is assigned to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    /// RFC 3339 timestamp of the claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl WarmPod {
    pub fn phase(&self) -> WarmPodPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == WarmPodPhase::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_defaults_to_pending() {
        let pod = WarmPod::new(
            "wp-1",
            WarmPodSpec {
                pool_ref: ObjectRef {
                    name: "python-pool".to_string(),
                    namespace: Some("default".to_string()),
                },
                created_at: None,
                last_heartbeat: None,
            },
        );
        assert_eq!(pod.phase(), WarmPodPhase::Pending);
        assert!(!pod.is_ready());
    }

    #[test]
    fn test_status_round_trip() {
        let status = WarmPodStatus {
            phase: WarmPodPhase::Assigned,
            pod_name: Some("warmpod-abc".to_string()),
            pod_namespace: Some("default".to_string()),
            assigned_to: Some("sandbox-uid-1".to_string()),
            assigned_at: Some("2026-01-01T00:00:00Z".to_string()),
            conditions: Vec::new(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Assigned");
        assert_eq!(json["assignedTo"], "sandbox-uid-1");

        let back: WarmPodStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back.phase, WarmPodPhase::Assigned);
    }
}
