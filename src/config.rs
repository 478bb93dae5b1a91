//! Configuration parsing for llmsafespace YAML files.
//!
//! Environment variables prefixed `LLMSAFESPACE_` override the file. The
//! sensitive ones (`LLMSAFESPACE_DATABASE_PASSWORD`,
//! `LLMSAFESPACE_REDIS_PASSWORD`, `LLMSAFESPACE_AUTH_JWTSECRET`) are only
//! ever read from the environment in production deployments.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure matching the llmsafespace.yaml schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub server: ServerConfig,
    pub kubernetes: KubernetesConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub controller: ControllerConfig,
    pub execution: ExecutionConfig,
    pub warm_pools: WarmPoolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubernetesConfig {
    /// Namespace sandboxes and warm pods are created in.
    pub namespace: String,
    /// Namespace the API gateway runs in; ingress policies allow it.
    pub gateway_namespace: String,
    /// Optional kubeconfig path; in-cluster config is tried first.
    pub kubeconfig: Option<String>,
    pub context: Option<String>,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "llmsafespace".to_string(),
            gateway_namespace: "llmsafespace".to_string(),
            kubeconfig: None,
            context: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. `sqlite:///var/lib/llmsafespace/meta.db`.
    pub url: String,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://llmsafespace.db".to_string(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RedisConfig {
    /// Redis URL; empty disables the distributed session cache and falls
    /// back to the in-process map.
    pub url: Option<String>,
    pub password: Option<String>,
    pub session_ttl_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            password: None,
            session_ttl_seconds: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Concurrent reconcile workers per controller.
    pub workers: usize,
    /// Periodic resync interval in seconds.
    pub resync_seconds: u64,
    pub leader_election: LeaderElectionConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            resync_seconds: 30,
            leader_election: LeaderElectionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    pub lease_name: String,
    pub lease_namespace: String,
    pub lease_duration_seconds: i32,
    pub renew_interval_seconds: u64,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lease_name: "llmsafespace-controller".to_string(),
            lease_namespace: "llmsafespace".to_string(),
            lease_duration_seconds: 15,
            renew_interval_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionConfig {
    /// Default execution timeout when the request passes 0.
    pub default_timeout_seconds: u64,
    /// Dedicated long timeout for package installs.
    pub package_install_timeout_seconds: u64,
    /// Timeout for warm-pool preload scripts.
    pub preload_timeout_seconds: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 300,
            package_install_timeout_seconds: 300,
            preload_timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WarmPoolsConfig {
    /// Warm pods older than this are destroyed instead of recycled.
    pub recycle_max_age_hours: i64,
}

impl Default for WarmPoolsConfig {
    fn default() -> Self {
        Self {
            recycle_max_age_hours: 24,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse YAML configuration")
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LLMSAFESPACE_SERVER_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("LLMSAFESPACE_SERVER_PORT")
            && let Ok(port) = v.parse()
        {
            self.server.port = port;
        }
        if let Ok(v) = std::env::var("LLMSAFESPACE_KUBERNETES_NAMESPACE") {
            self.kubernetes.namespace = v;
        }
        if let Ok(v) = std::env::var("LLMSAFESPACE_DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("LLMSAFESPACE_DATABASE_PASSWORD") {
            self.database.password = Some(v);
        }
        if let Ok(v) = std::env::var("LLMSAFESPACE_REDIS_URL") {
            self.redis.url = Some(v);
        }
        if let Ok(v) = std::env::var("LLMSAFESPACE_REDIS_PASSWORD") {
            self.redis.password = Some(v);
        }
        if let Ok(v) = std::env::var("LLMSAFESPACE_AUTH_JWTSECRET") {
            self.auth.jwt_secret = Some(v);
        }
    }
}
