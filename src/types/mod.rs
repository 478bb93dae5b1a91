//! Custom resource types for the `llmsafespace.dev/v1` API group.
//!
//! Five kinds: `Sandbox`, `SandboxProfile`, `RuntimeEnvironment`
//! (cluster-scoped), `WarmPool`, and `WarmPod`. All are defined with
//! kube-derive and carry a status subresource. Timestamps inside statuses are
//! RFC 3339 strings.

pub mod profile;
pub mod runtime_env;
pub mod sandbox;
pub mod warmpod;
pub mod warmpool;

pub use profile::{SandboxProfile, SandboxProfileSpec};
pub use runtime_env::{RuntimeEnvironment, RuntimeEnvironmentSpec, RuntimeEnvironmentStatus};
pub use sandbox::{
    EgressRule, NetworkAccess, PortRule, Sandbox, SandboxPhase, SandboxResources, SandboxSpec,
    SandboxStatus, WarmPodRef,
};
pub use warmpod::{WarmPod, WarmPodPhase, WarmPodSpec, WarmPodStatus};
pub use warmpool::{AutoScalingConfig, PreloadScript, WarmPool, WarmPoolSpec, WarmPoolStatus};

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carried by every object this control plane manages.
pub const LABEL_MANAGED_BY: &str = "llmsafespace.dev/managed-by";
/// Label distinguishing sandbox pods from warm pods.
pub const LABEL_COMPONENT: &str = "llmsafespace.dev/component";
/// Label binding a warm pod to its pool.
pub const LABEL_POOL: &str = "llmsafespace.dev/pool";
/// Label carrying the sanitized runtime identifier.
pub const LABEL_RUNTIME: &str = "llmsafespace.dev/runtime";
/// Label binding a pod to the sandbox that owns it.
pub const LABEL_SANDBOX: &str = "llmsafespace.dev/sandbox";

/// Value of [`LABEL_MANAGED_BY`] on everything we create.
pub const MANAGER_NAME: &str = "llmsafespace";

/// Finalizer guarding sandbox deletion until cleanup has run.
pub const SANDBOX_FINALIZER: &str = "llmsafespace.dev/cleanup";

/// Reference to a namespaced object by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A single entry in a status conditions list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" or "False", matching Kubernetes condition conventions.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            last_transition_time: Some(Utc::now().to_rfc3339()),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Insert or replace a condition by type, keeping the list deduplicated.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}

/// Look up a condition by type.
pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}
