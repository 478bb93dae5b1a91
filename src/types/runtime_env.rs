//! The cluster-scoped `RuntimeEnvironment` custom resource: declares that a
//! container image is a valid sandbox runtime.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "llmsafespace.dev",
    version = "v1",
    kind = "RuntimeEnvironment",
    plural = "runtimeenvironments",
    shortname = "rte",
    status = "RuntimeEnvironmentStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEnvironmentSpec {
    /// Container image providing this runtime.
    pub image: String,
    /// Language identifier, e.g. `python`.
    pub language: String,
    /// Language version, e.g. `3.10`.
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_installed_packages: Vec<String>,
    /// Default package manager command, e.g. `pip`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
    /// Interpreter argv for code execution; the program text is written to
    /// its stdin. Falls back to a built-in table by language.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interpreter: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_requirements: Option<RuntimeResourceRequirements>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_memory: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEnvironmentStatus {
    #[serde(default)]
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validated: Option<String>,
}

impl RuntimeEnvironment {
    /// The `language:version` identifier sandboxes declare.
    pub fn runtime_id(&self) -> String {
        format!("{}:{}", self.spec.language, self.spec.version)
    }

    pub fn is_available(&self) -> bool {
        self.status.as_ref().map(|s| s.available).unwrap_or(false)
    }

    /// Interpreter argv for code execution. The interpreter reads the
    /// program from stdin; built-in fallback table for well-known languages.
    pub fn interpreter_command(&self) -> Vec<String> {
        if !self.spec.interpreter.is_empty() {
            return self.spec.interpreter.clone();
        }
        match self.spec.language.as_str() {
            "python" => vec!["python3".into(), "-u".into()],
            "node" => vec!["node".into()],
            "ruby" => vec!["ruby".into()],
            _ => vec!["sh".into()],
        }
    }

    /// Package-manager install argv prefix, e.g. `pip install`.
    pub fn install_command(&self) -> Vec<String> {
        if let Some(manager) = &self.spec.package_manager {
            return vec![manager.clone(), "install".into()];
        }
        match self.spec.language.as_str() {
            "python" => vec!["pip".into(), "install".into()],
            "node" => vec!["npm".into(), "install".into()],
            "ruby" => vec!["gem".into(), "install".into()],
            "go" => vec!["go".into(), "get".into()],
            _ => vec!["pip".into(), "install".into()],
        }
    }
}
