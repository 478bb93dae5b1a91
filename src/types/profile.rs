//! The `SandboxProfile` custom resource: reusable sandbox configuration.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::types::sandbox::SandboxResources;

/// Immutable inputs to sandbox materialization, referenced by name.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "llmsafespace.dev",
    version = "v1",
    kind = "SandboxProfile",
    plural = "sandboxprofiles",
    shortname = "sbp",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxProfileSpec {
    pub language: String,
    #[serde(default = "default_security_level")]
    pub security_level: String,
    /// Path to a seccomp profile on the node, if the level requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_policies: Vec<ProfileNetworkPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_installed_packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_defaults: Option<SandboxResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem_config: Option<ProfileFilesystemConfig>,
}

fn default_security_level() -> String {
    "standard".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProfileNetworkPolicy {
    /// Template type: `egress` or `ingress`.
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProfileFilesystemConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read_only_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub writable_paths: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_defaults() {
        let spec: SandboxProfileSpec = serde_json::from_value(serde_json::json!({
            "language": "python"
        }))
        .unwrap();

        assert_eq!(spec.language, "python");
        assert_eq!(spec.security_level, "standard");
        assert!(spec.network_policies.is_empty());
        assert!(spec.filesystem_config.is_none());
    }

    #[test]
    fn test_network_policy_type_key() {
        let spec: SandboxProfileSpec = serde_json::from_value(serde_json::json!({
            "language": "python",
            "networkPolicies": [{"type": "egress", "rules": ["pypi.org:443"]}]
        }))
        .unwrap();
        assert_eq!(spec.network_policies[0].type_, "egress");
    }
}
