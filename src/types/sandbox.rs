//! The `Sandbox` custom resource: one isolated code-execution workload.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Condition, ObjectRef};

/// Desired state of a sandbox.
///
/// Created by the orchestration service; mutated only by the sandbox
/// reconciler after that. Once `status.phase` is `Terminated` the record is
/// immutable except for deletion.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "llmsafespace.dev",
    version = "v1",
    kind = "Sandbox",
    plural = "sandboxes",
    shortname = "sb",
    status = "SandboxStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSpec {
    /// Runtime identifier, e.g. `python:3.10`. Must resolve to an available
    /// RuntimeEnvironment.
    pub runtime: String,
    /// Coarse policy bundle: standard, high, or custom.
    #[serde(default = "default_security_level")]
    pub security_level: String,
    /// Execution timeout in seconds (0 = server default).
    #[serde(default = "default_timeout")]
    pub timeout: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<SandboxResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_access: Option<NetworkAccess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SandboxSecurityContext>,
    /// Optional reusable profile this sandbox is materialized from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_ref: Option<ObjectRef>,
    /// Prefer claiming a ready warm workload over a cold start.
    #[serde(default = "default_true")]
    pub use_warm_pool: bool,
}

fn default_security_level() -> String {
    "standard".to_string()
}

fn default_timeout() -> i32 {
    300
}

fn default_true() -> bool {
    true
}

/// Resource limits for the sandbox workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxResources {
    /// CPU quantity, e.g. `500m` or `2`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory quantity, e.g. `512Mi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_storage: Option<String>,
    /// Pin the workload to dedicated cores.
    #[serde(default)]
    pub cpu_pinning: bool,
}

/// Network isolation rules for a sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAccess {
    /// Egress allow-list. Declaring any rule means "public internet, listed
    /// ports only"; private ranges stay blocked.
    #[serde(default)]
    pub egress: Vec<EgressRule>,
    /// Allow ingress from the gateway (required for interactive sessions).
    #[serde(default)]
    pub ingress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressRule {
    /// Advisory domain this rule was declared for; filtering is by port.
    pub domain: String,
    #[serde(default)]
    pub ports: Vec<PortRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortRule {
    pub port: i32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemConfig {
    #[serde(default = "default_true")]
    pub read_only_root: bool,
    #[serde(default = "default_writable_paths")]
    pub writable_paths: Vec<String>,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            read_only_root: true,
            writable_paths: default_writable_paths(),
        }
    }
}

fn default_writable_paths() -> Vec<String> {
    vec!["/workspace".to_string(), "/tmp".to_string()]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default)]
    pub persistent: bool,
    /// PVC size, e.g. `1Gi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_size: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSecurityContext {
    #[serde(default = "default_uid")]
    pub run_as_user: i64,
    #[serde(default = "default_uid")]
    pub run_as_group: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp_profile: Option<String>,
}

impl Default for SandboxSecurityContext {
    fn default() -> Self {
        Self {
            run_as_user: default_uid(),
            run_as_group: default_uid(),
            seccomp_profile: None,
        }
    }
}

fn default_uid() -> i64 {
    1000
}

/// Lifecycle phase of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum SandboxPhase {
    #[default]
    Pending,
    Creating,
    Running,
    Terminating,
    Terminated,
    Failed,
}

impl std::fmt::Display for SandboxPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxPhase::Pending => "Pending",
            SandboxPhase::Creating => "Creating",
            SandboxPhase::Running => "Running",
            SandboxPhase::Terminating => "Terminating",
            SandboxPhase::Terminated => "Terminated",
            SandboxPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Reference to the warm pod a sandbox was bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WarmPodRef {
    pub name: String,
    pub namespace: String,
}

/// Observed state of a sandbox, reported by the reconciler.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    #[serde(default)]
    pub phase: SandboxPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_namespace: Option<String>,
    /// RFC 3339 timestamp of the transition to Running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    /// In-cluster DNS name of the sandbox service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm_pod_ref: Option<WarmPodRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<String>,
}

impl Sandbox {
    /// Current phase, defaulting to Pending when status is unset.
    pub fn phase(&self) -> SandboxPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Name and namespace of the bound workload, once the reconciler has
    /// recorded them.
    pub fn workload(&self) -> Option<(String, Option<String>)> {
        let status = self.status.as_ref()?;
        let name = status.pod_name.clone()?;
        Some((name, status.pod_namespace.clone()))
    }

    /// Whether a tainting condition was ever recorded on this sandbox.
    /// Tainted sandboxes are never recycled back into a warm pool.
    pub fn is_tainted(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.type_ == "Tainted" && c.is_true())
            })
            .unwrap_or(false)
    }
}
