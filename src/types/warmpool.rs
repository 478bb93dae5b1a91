//! The `WarmPool` custom resource: a declarative target count of pre-started
//! sandbox-shaped workloads at a given runtime and security level.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Condition, ObjectRef};
use crate::types::sandbox::SandboxResources;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "llmsafespace.dev",
    version = "v1",
    kind = "WarmPool",
    plural = "warmpools",
    shortname = "wp",
    status = "WarmPoolStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WarmPoolSpec {
    /// Runtime the pooled workloads are built for, e.g. `python:3.10`.
    pub runtime: String,
    /// Floor of ready workloads the pool keeps available.
    #[serde(default)]
    pub min_size: i32,
    /// Ceiling of ready workloads (0 = unlimited).
    #[serde(default)]
    pub max_size: i32,
    #[serde(default = "default_security_level")]
    pub security_level: String,
    /// Seconds a ready workload may sit idle before eviction (0 = no expiry).
    #[serde(default)]
    pub ttl: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<SandboxResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_ref: Option<ObjectRef>,
    /// Packages installed into each workload before it becomes Ready.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preload_packages: Vec<String>,
    /// Scripts run inside each workload exactly once on first readiness.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preload_scripts: Vec<PreloadScript>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_scaling: Option<AutoScalingConfig>,
}

fn default_security_level() -> String {
    "standard".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PreloadScript {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoScalingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Percentage of assigned-to-total pods the autoscaler targets.
    #[serde(default = "default_target_utilization")]
    pub target_utilization: i32,
    /// Minimum seconds between scale-down events.
    #[serde(default = "default_scale_down_delay")]
    pub scale_down_delay: i64,
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_utilization: default_target_utilization(),
            scale_down_delay: default_scale_down_delay(),
        }
    }
}

fn default_target_utilization() -> i32 {
    80
}

fn default_scale_down_delay() -> i64 {
    300
}

/// Pool counters. Invariant: available + assigned + pending = total.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WarmPoolStatus {
    #[serde(default)]
    pub available_pods: i32,
    #[serde(default)]
    pub assigned_pods: i32,
    #[serde(default)]
    pub pending_pods: i32,
    /// RFC 3339 timestamp of the last scale-up or scale-down event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_time: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl WarmPoolStatus {
    pub fn total_pods(&self) -> i32 {
        self.available_pods + self.assigned_pods + self.pending_pods
    }
}
