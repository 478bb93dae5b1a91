//! Orchestration service: the request-facing façade.
//!
//! Validates requests, enforces ownership and permissions, writes the
//! cluster record and the metadata row as a pair (compensating when the
//! second write fails), and fronts execution, file, and warm-pool
//! operations. HTTP specifics live in `api`; everything here is transport
//! agnostic.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::cluster::{ClusterGateway, ExecRequest};
use crate::error::{Error, Result};
use crate::execproxy::{
    ExecutionKind, ExecutionProxy, ExecutionRequest, ExecutionResult, StreamCallback,
};
use crate::files::{FileInfo, FileProxy};
use crate::metrics::Metrics;
use crate::session::SessionManager;
use crate::store::{ApiKeyRecord, SandboxMetadata, Store, WarmPoolMetadata};
use crate::types::{
    ObjectRef, Sandbox, SandboxPhase, SandboxSpec, WarmPool, WarmPoolSpec,
};
use crate::validation;

/// Authenticated caller: the resolved API key and its owner.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub key: ApiKeyRecord,
}

impl AuthContext {
    fn authorize_owned(&self, owner_id: &str, permission: &str) -> Result<()> {
        if self.user_id == owner_id || self.key.has_permission(permission) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "requires ownership or {permission:?}"
            )))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxRequest {
    pub runtime: String,
    #[serde(default)]
    pub security_level: Option<String>,
    #[serde(default)]
    pub timeout: Option<i32>,
    #[serde(default)]
    pub resources: Option<crate::types::SandboxResources>,
    #[serde(default)]
    pub network_access: Option<crate::types::NetworkAccess>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub use_warm_pool: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxView {
    pub id: String,
    pub runtime: String,
    pub security_level: String,
    pub phase: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warm_pod_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatusView {
    pub id: String,
    pub phase: String,
    pub conditions: Vec<crate::types::Condition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequestBody {
    #[serde(rename = "type")]
    pub execution_type: String,
    pub content: String,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionView {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub status: String,
    pub started_at: String,
    pub completed_at: String,
}

impl From<ExecutionResult> for ExecutionView {
    fn from(result: ExecutionResult) -> Self {
        Self {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            status: match result.status {
                crate::execproxy::ExecutionStatus::Completed => "completed".to_string(),
                crate::execproxy::ExecutionStatus::Failed => "failed".to_string(),
            },
            started_at: result.started_at.to_rfc3339(),
            completed_at: result.finished_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallPackagesRequest {
    pub packages: Vec<String>,
    #[serde(default)]
    pub manager: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWarmPoolRequest {
    pub name: String,
    pub runtime: String,
    #[serde(default)]
    pub min_size: i32,
    #[serde(default)]
    pub max_size: i32,
    #[serde(default)]
    pub security_level: Option<String>,
    #[serde(default)]
    pub ttl: Option<i64>,
    #[serde(default)]
    pub auto_scaling: Option<crate::types::AutoScalingConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWarmPoolRequest {
    #[serde(default)]
    pub min_size: Option<i32>,
    #[serde(default)]
    pub max_size: Option<i32>,
    #[serde(default)]
    pub ttl: Option<i64>,
    #[serde(default)]
    pub auto_scaling: Option<crate::types::AutoScalingConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmPoolView {
    pub name: String,
    pub runtime: String,
    pub min_size: i32,
    pub max_size: i32,
    pub security_level: String,
    pub available_pods: i32,
    pub assigned_pods: i32,
    pub pending_pods: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageView<T> {
    pub items: Vec<T>,
    pub total: i64,
}

/// Configuration knobs the service needs from the loaded config.
#[derive(Debug, Clone)]
pub struct ServiceLimits {
    pub default_timeout: Duration,
    pub package_install_timeout: Duration,
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            package_install_timeout: Duration::from_secs(300),
        }
    }
}

pub struct SandboxService {
    gateway: Arc<dyn ClusterGateway>,
    store: Store,
    pub sessions: Arc<SessionManager>,
    exec_proxy: ExecutionProxy,
    file_proxy: FileProxy,
    metrics: Arc<Metrics>,
    limits: ServiceLimits,
}

impl SandboxService {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        store: Store,
        sessions: Arc<SessionManager>,
        metrics: Arc<Metrics>,
        limits: ServiceLimits,
    ) -> Self {
        Self {
            exec_proxy: ExecutionProxy::new(gateway.clone()),
            file_proxy: FileProxy::new(gateway.clone()),
            gateway,
            store,
            sessions,
            metrics,
            limits,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ---- sandboxes ----

    pub async fn create_sandbox(
        &self,
        auth: &AuthContext,
        request: CreateSandboxRequest,
    ) -> Result<SandboxView> {
        if !auth.key.has_permission("sandbox:create") {
            return Err(Error::Forbidden("requires \"sandbox:create\"".into()));
        }
        if self.store.get_user(&auth.user_id).await?.is_none() {
            return Err(Error::Unauthorized(format!(
                "unknown owner {:?}",
                auth.user_id
            )));
        }
        validate_create_request(&request)?;

        let suffix: String = Uuid::new_v4().to_string().chars().take(8).collect();
        let name = format!("sb-{suffix}");
        self.create_sandbox_named(auth, request, name).await
    }

    /// Split out so tests can pin the generated name.
    pub(crate) async fn create_sandbox_named(
        &self,
        auth: &AuthContext,
        request: CreateSandboxRequest,
        name: String,
    ) -> Result<SandboxView> {
        let security_level = request
            .security_level
            .clone()
            .unwrap_or_else(|| "standard".to_string());
        let spec = SandboxSpec {
            runtime: request.runtime.clone(),
            security_level: security_level.clone(),
            timeout: request.timeout.unwrap_or(0).max(0),
            resources: request.resources.clone(),
            network_access: request.network_access.clone(),
            filesystem: None,
            storage: None,
            security_context: None,
            profile_ref: request.profile.clone().map(|profile| ObjectRef {
                name: profile,
                namespace: None,
            }),
            use_warm_pool: request.use_warm_pool.unwrap_or(true),
        };

        let mut sandbox = Sandbox::new(&name, spec);
        sandbox.metadata.labels = Some(crate::controller::resources::sandbox_labels(
            &name,
            &request.runtime,
        ));
        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert("llmsafespace.dev/owner".to_string(), auth.user_id.clone());
        sandbox.metadata.annotations = Some(annotations);

        let created = self.gateway.create_sandbox(sandbox).await?;

        let now = Utc::now();
        let meta = SandboxMetadata {
            id: name.clone(),
            user_id: auth.user_id.clone(),
            runtime: request.runtime.clone(),
            namespace: self.gateway.namespace().to_string(),
            name: name.clone(),
            status: SandboxPhase::Pending.to_string(),
            labels: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };

        // Cluster record and metadata row must exist as a pair. If the
        // metadata write fails, roll the cluster record back; a rollback
        // failure is a compound error the caller has to see.
        if let Err(store_err) = self.store.insert_sandbox(&meta).await {
            error!(sandbox = %name, error = %store_err, "metadata write failed, compensating");
            if let Err(cleanup_err) = self.gateway.delete_sandbox(&name).await {
                return Err(Error::Compensation {
                    operation: format!("create sandbox {name}"),
                    cause: format!(
                        "metadata write failed ({store_err}) and cluster rollback failed ({cleanup_err})"
                    ),
                });
            }
            return Err(store_err);
        }

        Metrics::incr(&self.metrics.sandboxes_created);
        info!(sandbox = %name, runtime = %request.runtime, "created sandbox");
        Ok(view_from(&created, &meta))
    }

    pub async fn get_sandbox(&self, auth: &AuthContext, id: &str) -> Result<SandboxView> {
        let meta = self
            .store
            .get_sandbox(id)
            .await?
            .ok_or_else(|| Error::not_found("sandbox", id))?;
        auth.authorize_owned(&meta.user_id, "sandbox:read")?;

        let record = self.gateway.get_sandbox(id).await?;
        match record {
            Some(sandbox) => Ok(view_from(&sandbox, &meta)),
            None => Ok(view_from_meta(&meta)),
        }
    }

    pub async fn list_sandboxes(
        &self,
        auth: &AuthContext,
        limit: i64,
        offset: i64,
    ) -> Result<PageView<SandboxView>> {
        let page = self
            .store
            .list_sandboxes_by_owner(&auth.user_id, limit.clamp(1, 100), offset.max(0))
            .await?;
        Ok(PageView {
            items: page.items.iter().map(view_from_meta).collect(),
            total: page.total,
        })
    }

    pub async fn sandbox_status(&self, auth: &AuthContext, id: &str) -> Result<SandboxStatusView> {
        let meta = self
            .store
            .get_sandbox(id)
            .await?
            .ok_or_else(|| Error::not_found("sandbox", id))?;
        auth.authorize_owned(&meta.user_id, "sandbox:read")?;

        match self.gateway.get_sandbox(id).await? {
            Some(sandbox) => Ok(SandboxStatusView {
                id: id.to_string(),
                phase: sandbox.phase().to_string(),
                conditions: sandbox
                    .status
                    .map(|s| s.conditions)
                    .unwrap_or_default(),
            }),
            None => Ok(SandboxStatusView {
                id: id.to_string(),
                phase: meta.status,
                conditions: Vec::new(),
            }),
        }
    }

    /// Terminate: ownership or `sandbox:delete`. The cluster delete drives
    /// reconciler cleanup; the metadata delete follows, and its failure is
    /// surfaced as a compound error while the cluster delete stands.
    pub async fn terminate_sandbox(&self, auth: &AuthContext, id: &str) -> Result<()> {
        let meta = self
            .store
            .get_sandbox(id)
            .await?
            .ok_or_else(|| Error::not_found("sandbox", id))?;
        auth.authorize_owned(&meta.user_id, "sandbox:delete")?;

        let cancelled = self.sessions.close_for_sandbox(id).await?;
        if cancelled > 0 {
            info!(sandbox = %id, sessions = cancelled, "closed live sessions before terminate");
        }

        self.gateway.delete_sandbox(id).await?;

        if let Err(store_err) = self.store.delete_sandbox(id).await {
            return Err(Error::Compensation {
                operation: format!("terminate sandbox {id}"),
                cause: format!("cluster delete succeeded but metadata delete failed: {store_err}"),
            });
        }

        Metrics::incr(&self.metrics.sandboxes_terminated);
        Ok(())
    }

    // ---- execution ----

    /// Fetch the sandbox and its runtime, requiring phase Running.
    async fn running_sandbox(
        &self,
        auth: &AuthContext,
        id: &str,
    ) -> Result<(Sandbox, crate::types::RuntimeEnvironment)> {
        let meta = self
            .store
            .get_sandbox(id)
            .await?
            .ok_or_else(|| Error::not_found("sandbox", id))?;
        auth.authorize_owned(&meta.user_id, "sandbox:execute")?;

        let sandbox = self
            .gateway
            .get_sandbox(id)
            .await?
            .ok_or_else(|| Error::not_found("sandbox", id))?;
        if sandbox.phase() != SandboxPhase::Running {
            return Err(Error::SandboxNotRunning(id.to_string()));
        }

        let runtime = self
            .gateway
            .get_runtime(&sandbox.spec.runtime)
            .await?
            .ok_or_else(|| Error::RuntimeNotFound(sandbox.spec.runtime.clone()))?;
        Ok((sandbox, runtime))
    }

    pub async fn execute(
        &self,
        auth: &AuthContext,
        id: &str,
        body: ExecuteRequestBody,
    ) -> Result<ExecutionView> {
        self.execute_streaming(auth, id, body, None, CancellationToken::new())
            .await
            .map(Into::into)
    }

    pub async fn execute_streaming(
        &self,
        auth: &AuthContext,
        id: &str,
        body: ExecuteRequestBody,
        callback: Option<StreamCallback>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let kind = match body.execution_type.as_str() {
            "code" => ExecutionKind::Code,
            "command" => ExecutionKind::Command,
            other => {
                return Err(Error::validation(format!(
                    "execution type {other:?} must be \"code\" or \"command\""
                )));
            }
        };
        if body.content.is_empty() {
            return Err(Error::validation("content cannot be empty"));
        }

        let (sandbox, runtime) = self.running_sandbox(auth, id).await?;
        let timeout = body
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.limits.default_timeout);

        Metrics::incr(&self.metrics.executions);
        self.exec_proxy
            .execute(
                &sandbox,
                &runtime,
                ExecutionRequest {
                    kind,
                    content: body.content,
                    timeout,
                },
                callback,
                cancel,
            )
            .await
    }

    pub async fn install_packages(
        &self,
        auth: &AuthContext,
        id: &str,
        request: InstallPackagesRequest,
    ) -> Result<ExecutionView> {
        if request.packages.is_empty() {
            return Err(Error::validation("packages cannot be empty"));
        }
        for package in &request.packages {
            validation::validate_package_name(package)?;
        }

        let (sandbox, runtime) = self.running_sandbox(auth, id).await?;
        let (pod_name, pod_namespace) = sandbox
            .workload()
            .ok_or_else(|| Error::SandboxNotRunning(id.to_string()))?;
        let namespace = pod_namespace.unwrap_or_else(|| self.gateway.namespace().to_string());

        let mut command = match &request.manager {
            Some(manager) => {
                validation::validate_package_name(manager)?;
                vec![manager.clone(), "install".to_string()]
            }
            None => runtime.install_command(),
        };
        command.extend(request.packages.iter().cloned());

        let outcome = self
            .gateway
            .exec(
                &namespace,
                &pod_name,
                ExecRequest::new(command, self.limits.package_install_timeout),
            )
            .await?;

        let status = if outcome.is_success() {
            "completed".to_string()
        } else {
            "failed".to_string()
        };
        Ok(ExecutionView {
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            status,
            started_at: outcome.started_at.to_rfc3339(),
            completed_at: outcome.finished_at.to_rfc3339(),
        })
    }

    // ---- files ----

    pub async fn list_files(
        &self,
        auth: &AuthContext,
        id: &str,
        path: &str,
    ) -> Result<Vec<FileInfo>> {
        let (sandbox, _) = self.running_sandbox(auth, id).await?;
        self.file_proxy.list(&sandbox, path).await
    }

    pub async fn download_file(
        &self,
        auth: &AuthContext,
        id: &str,
        path: &str,
    ) -> Result<Vec<u8>> {
        let (sandbox, _) = self.running_sandbox(auth, id).await?;
        self.file_proxy.read(&sandbox, path).await
    }

    pub async fn upload_file(
        &self,
        auth: &AuthContext,
        id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<FileInfo> {
        let (sandbox, _) = self.running_sandbox(auth, id).await?;
        self.file_proxy.write(&sandbox, path, content).await
    }

    pub async fn delete_file(&self, auth: &AuthContext, id: &str, path: &str) -> Result<()> {
        let (sandbox, _) = self.running_sandbox(auth, id).await?;
        self.file_proxy.delete(&sandbox, path).await
    }

    // ---- sessions ----

    pub async fn open_session(
        &self,
        auth: &AuthContext,
        sandbox_id: &str,
    ) -> Result<Arc<crate::session::SessionHandle>> {
        // Session opening requires a Running sandbox the caller may execute in.
        self.running_sandbox(auth, sandbox_id).await?;
        self.sessions.open(&auth.user_id, sandbox_id).await
    }

    // ---- warm pools ----

    pub async fn create_warm_pool(
        &self,
        auth: &AuthContext,
        request: CreateWarmPoolRequest,
    ) -> Result<WarmPoolView> {
        if !auth.key.has_permission("warmpool:create") && !auth.key.has_permission("sandbox:create")
        {
            return Err(Error::Forbidden("requires \"warmpool:create\"".into()));
        }
        validation::validate_runtime(&request.runtime)?;
        let security_level = request
            .security_level
            .clone()
            .unwrap_or_else(|| "standard".to_string());
        validation::validate_security_level(&security_level)?;
        if request.min_size < 0 {
            return Err(Error::validation("minSize cannot be negative"));
        }
        if request.max_size < 0 {
            return Err(Error::validation("maxSize cannot be negative"));
        }

        let spec = WarmPoolSpec {
            runtime: request.runtime.clone(),
            min_size: request.min_size,
            max_size: request.max_size,
            security_level,
            ttl: request.ttl.unwrap_or(0),
            resources: None,
            profile_ref: None,
            preload_packages: Vec::new(),
            preload_scripts: Vec::new(),
            auto_scaling: request.auto_scaling.clone(),
        };

        let mut pool = WarmPool::new(&request.name, spec);
        pool.metadata.labels = Some(crate::controller::resources::warm_pool_labels(
            &request.runtime,
        ));

        let created = self.gateway.create_warm_pool(pool).await?;

        let now = Utc::now();
        let meta = WarmPoolMetadata {
            id: Uuid::new_v4().to_string(),
            user_id: auth.user_id.clone(),
            name: request.name.clone(),
            namespace: self.gateway.namespace().to_string(),
            runtime: request.runtime.clone(),
            min_size: request.min_size as i64,
            max_size: request.max_size as i64,
            created_at: now,
            updated_at: now,
        };
        if let Err(store_err) = self.store.insert_warm_pool(&meta).await {
            if let Err(cleanup_err) = self.gateway.delete_warm_pool(&request.name).await {
                return Err(Error::Compensation {
                    operation: format!("create warm pool {}", request.name),
                    cause: format!(
                        "metadata write failed ({store_err}) and cluster rollback failed ({cleanup_err})"
                    ),
                });
            }
            return Err(store_err);
        }

        Ok(pool_view(&created))
    }

    pub async fn get_warm_pool(&self, auth: &AuthContext, name: &str) -> Result<WarmPoolView> {
        let meta = self
            .store
            .get_warm_pool(self.gateway.namespace(), name)
            .await?
            .ok_or_else(|| Error::not_found("warmpool", name))?;
        auth.authorize_owned(&meta.user_id, "warmpool:read")?;

        let pool = self
            .gateway
            .get_warm_pool(name)
            .await?
            .ok_or_else(|| Error::not_found("warmpool", name))?;
        Ok(pool_view(&pool))
    }

    pub async fn list_warm_pools(
        &self,
        auth: &AuthContext,
        limit: i64,
        offset: i64,
    ) -> Result<PageView<WarmPoolView>> {
        let page = self
            .store
            .list_warm_pools_by_owner(&auth.user_id, limit.clamp(1, 100), offset.max(0))
            .await?;

        let mut items = Vec::with_capacity(page.items.len());
        for meta in &page.items {
            match self.gateway.get_warm_pool(&meta.name).await? {
                Some(pool) => items.push(pool_view(&pool)),
                None => items.push(WarmPoolView {
                    name: meta.name.clone(),
                    runtime: meta.runtime.clone(),
                    min_size: meta.min_size as i32,
                    max_size: meta.max_size as i32,
                    security_level: "standard".to_string(),
                    available_pods: 0,
                    assigned_pods: 0,
                    pending_pods: 0,
                }),
            }
        }
        Ok(PageView {
            items,
            total: page.total,
        })
    }

    pub async fn update_warm_pool(
        &self,
        auth: &AuthContext,
        name: &str,
        request: UpdateWarmPoolRequest,
    ) -> Result<WarmPoolView> {
        let meta = self
            .store
            .get_warm_pool(self.gateway.namespace(), name)
            .await?
            .ok_or_else(|| Error::not_found("warmpool", name))?;
        auth.authorize_owned(&meta.user_id, "warmpool:update")?;

        let mut pool = self
            .gateway
            .get_warm_pool(name)
            .await?
            .ok_or_else(|| Error::not_found("warmpool", name))?;

        if let Some(min_size) = request.min_size {
            if min_size < 0 {
                return Err(Error::validation("minSize cannot be negative"));
            }
            pool.spec.min_size = min_size;
        }
        if let Some(max_size) = request.max_size {
            if max_size < 0 {
                return Err(Error::validation("maxSize cannot be negative"));
            }
            pool.spec.max_size = max_size;
        }
        if let Some(ttl) = request.ttl {
            pool.spec.ttl = ttl.max(0);
        }
        if let Some(auto_scaling) = request.auto_scaling {
            pool.spec.auto_scaling = Some(auto_scaling);
        }

        let updated = self.gateway.update_warm_pool(pool).await?;
        self.store
            .update_warm_pool_sizes(
                self.gateway.namespace(),
                name,
                updated.spec.min_size as i64,
                updated.spec.max_size as i64,
            )
            .await?;
        Ok(pool_view(&updated))
    }

    pub async fn delete_warm_pool(&self, auth: &AuthContext, name: &str) -> Result<()> {
        let meta = self
            .store
            .get_warm_pool(self.gateway.namespace(), name)
            .await?
            .ok_or_else(|| Error::not_found("warmpool", name))?;
        auth.authorize_owned(&meta.user_id, "warmpool:delete")?;

        self.gateway.delete_warm_pool(name).await?;
        if let Err(store_err) = self.store.delete_warm_pool(self.gateway.namespace(), name).await {
            return Err(Error::Compensation {
                operation: format!("delete warm pool {name}"),
                cause: format!("cluster delete succeeded but metadata delete failed: {store_err}"),
            });
        }
        Ok(())
    }
}

fn view_from(sandbox: &Sandbox, meta: &SandboxMetadata) -> SandboxView {
    let status = sandbox.status.as_ref();
    SandboxView {
        id: meta.id.clone(),
        runtime: sandbox.spec.runtime.clone(),
        security_level: sandbox.spec.security_level.clone(),
        phase: sandbox.phase().to_string(),
        created_at: meta.created_at.to_rfc3339(),
        endpoint: status.and_then(|s| s.endpoint.clone()),
        start_time: status.and_then(|s| s.start_time.clone()),
        warm_pod_name: status.and_then(|s| s.warm_pod_ref.as_ref().map(|r| r.name.clone())),
    }
}

fn view_from_meta(meta: &SandboxMetadata) -> SandboxView {
    SandboxView {
        id: meta.id.clone(),
        runtime: meta.runtime.clone(),
        security_level: "standard".to_string(),
        phase: meta.status.clone(),
        created_at: meta.created_at.to_rfc3339(),
        endpoint: None,
        start_time: None,
        warm_pod_name: None,
    }
}

fn pool_view(pool: &WarmPool) -> WarmPoolView {
    let status = pool.status.clone().unwrap_or_default();
    WarmPoolView {
        name: pool.metadata.name.clone().unwrap_or_default(),
        runtime: pool.spec.runtime.clone(),
        min_size: pool.spec.min_size,
        max_size: pool.spec.max_size,
        security_level: pool.spec.security_level.clone(),
        available_pods: status.available_pods,
        assigned_pods: status.assigned_pods,
        pending_pods: status.pending_pods,
    }
}

fn validate_create_request(request: &CreateSandboxRequest) -> Result<()> {
    validation::validate_runtime(&request.runtime)?;
    if let Some(level) = &request.security_level {
        validation::validate_security_level(level)?;
    }
    if let Some(timeout) = request.timeout {
        validation::validate_timeout(timeout)?;
    }
    if let Some(resources) = &request.resources {
        if let Some(cpu) = &resources.cpu {
            validation::validate_cpu(cpu)?;
        }
        if let Some(memory) = &resources.memory {
            validation::validate_memory(memory)?;
        }
        if let Some(ephemeral) = &resources.ephemeral_storage {
            validation::validate_memory(ephemeral)?;
        }
    }
    if let Some(network) = &request.network_access {
        for rule in &network.egress {
            validation::validate_domain(&rule.domain)?;
            if rule.ports.is_empty() {
                return Err(Error::validation(format!(
                    "egress rule for {:?} declares no ports",
                    rule.domain
                )));
            }
            for port in &rule.ports {
                validation::validate_port(port.port)?;
                validation::validate_protocol(&port.protocol)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SessionCache;
    use crate::testutil::FakeGateway;

    async fn service_with(gateway: Arc<FakeGateway>) -> (SandboxService, AuthContext) {
        let store = Store::in_memory().await.unwrap();
        let user = store.create_user("alice").await.unwrap();
        let key = store
            .insert_api_key(&user.id, "hash", "lsk_test", &["sandbox:create", "sandbox:delete"])
            .await
            .unwrap();
        let sessions = Arc::new(SessionManager::new(SessionCache::in_memory(
            Duration::from_secs(60),
        )));
        let service = SandboxService::new(
            gateway,
            store,
            sessions,
            Arc::new(Metrics::default()),
            ServiceLimits::default(),
        );
        let auth = AuthContext {
            user_id: user.id,
            key,
        };
        (service, auth)
    }

    fn create_request(runtime: &str) -> CreateSandboxRequest {
        CreateSandboxRequest {
            runtime: runtime.to_string(),
            security_level: None,
            timeout: Some(30),
            resources: None,
            network_access: None,
            profile: None,
            use_warm_pool: Some(false),
        }
    }

    #[tokio::test]
    async fn test_create_sandbox_writes_cluster_and_store() {
        let gateway = Arc::new(FakeGateway::new());
        let (service, auth) = service_with(gateway.clone()).await;

        let view = service
            .create_sandbox(&auth, create_request("python:3.10"))
            .await
            .unwrap();

        assert!(view.id.starts_with("sb-"));
        assert_eq!(view.runtime, "python:3.10");
        assert_eq!(view.phase, "Pending");
        assert_eq!(gateway.sandbox_count(), 1);
        assert!(
            service
                .store()
                .get_sandbox(&view.id)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_runtime() {
        let gateway = Arc::new(FakeGateway::new());
        let (service, auth) = service_with(gateway.clone()).await;

        let err = service
            .create_sandbox(&auth, create_request("python"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(gateway.sandbox_count(), 0);
    }

    #[tokio::test]
    async fn test_create_requires_permission() {
        let gateway = Arc::new(FakeGateway::new());
        let (service, _auth) = service_with(gateway.clone()).await;

        let user = service.store().create_user("limited").await.unwrap();
        let key = service
            .store()
            .insert_api_key(&user.id, "hash-2", "lsk_ltd", &["sandbox:read"])
            .await
            .unwrap();
        let limited = AuthContext {
            user_id: user.id,
            key,
        };

        let err = service
            .create_sandbox(&limited, create_request("python:3.10"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_create_cluster_failure_leaves_no_metadata() {
        let gateway = Arc::new(FakeGateway::new());
        let (service, auth) = service_with(gateway.clone()).await;
        *gateway.fail_sandbox_create.lock().unwrap() = true;

        let err = service
            .create_sandbox(&auth, create_request("python:3.10"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transient(_)));

        // Neither side exists: create is atomic.
        assert_eq!(gateway.sandbox_count(), 0);
        let page = service
            .store()
            .list_sandboxes_by_owner(&auth.user_id, 10, 0)
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn test_create_metadata_failure_compensates_cluster_record() {
        let gateway = Arc::new(FakeGateway::new());
        let (service, auth) = service_with(gateway.clone()).await;

        // Pre-seed the metadata row so the insert hits a primary-key
        // conflict after the cluster create succeeded.
        let now = Utc::now();
        service
            .store()
            .insert_sandbox(&SandboxMetadata {
                id: "sb-fixed".to_string(),
                user_id: auth.user_id.clone(),
                runtime: "python:3.10".to_string(),
                namespace: "llmsafespace".to_string(),
                name: "sb-fixed".to_string(),
                status: "Pending".to_string(),
                labels: serde_json::json!({}),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let err = service
            .create_sandbox_named(&auth, create_request("python:3.10"), "sb-fixed".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Database(_)));

        // The cluster record was rolled back.
        assert_eq!(gateway.sandbox_count(), 0);
    }

    #[tokio::test]
    async fn test_terminate_requires_ownership_or_permission() {
        let gateway = Arc::new(FakeGateway::new());
        let (service, auth) = service_with(gateway.clone()).await;

        let view = service
            .create_sandbox(&auth, create_request("python:3.10"))
            .await
            .unwrap();

        // A different user without sandbox:delete is rejected and the
        // sandbox remains.
        let other = service.store().create_user("mallory").await.unwrap();
        let other_key = service
            .store()
            .insert_api_key(&other.id, "hash-3", "lsk_mal", &["sandbox:create"])
            .await
            .unwrap();
        let other_auth = AuthContext {
            user_id: other.id,
            key: other_key,
        };
        let err = service
            .terminate_sandbox(&other_auth, &view.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        assert_eq!(gateway.sandbox_count(), 1);

        // The owner may terminate; both sides are gone afterwards.
        service.terminate_sandbox(&auth, &view.id).await.unwrap();
        assert_eq!(gateway.sandbox_count(), 0);
        assert!(
            service
                .store()
                .get_sandbox(&view.id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_execute_requires_running_phase() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.put_runtime(FakeGateway::available_python_runtime());
        let (service, auth) = service_with(gateway.clone()).await;

        let view = service
            .create_sandbox(&auth, create_request("python:3.10"))
            .await
            .unwrap();

        let err = service
            .execute(
                &auth,
                &view.id,
                ExecuteRequestBody {
                    execution_type: "code".to_string(),
                    content: "print(2+2)".to_string(),
                    timeout: Some(10),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SandboxNotRunning(_)));
    }

    #[tokio::test]
    async fn test_execute_against_running_sandbox() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.put_runtime(FakeGateway::available_python_runtime());
        gateway.set_exec_handler(Arc::new(|_cmd, stdin| {
            assert!(String::from_utf8_lossy(stdin).contains("print(2+2)"));
            (0, b"4\n".to_vec(), Vec::new())
        }));
        let (service, auth) = service_with(gateway.clone()).await;

        let view = service
            .create_sandbox(&auth, create_request("python:3.10"))
            .await
            .unwrap();

        // Simulate the reconciler having driven the sandbox to Running.
        let mut sandbox = gateway.get_sandbox(&view.id).await.unwrap().unwrap();
        sandbox.status = Some(crate::types::SandboxStatus {
            phase: SandboxPhase::Running,
            pod_name: Some("sandbox-pod".to_string()),
            pod_namespace: Some("llmsafespace".to_string()),
            ..Default::default()
        });
        gateway.put_sandbox(sandbox);

        let result = service
            .execute(
                &auth,
                &view.id,
                ExecuteRequestBody {
                    execution_type: "code".to_string(),
                    content: "print(2+2)".to_string(),
                    timeout: Some(10),
                },
            )
            .await
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "4\n");
        assert_eq!(result.stderr, "");
        assert_eq!(result.status, "completed");
    }

    #[tokio::test]
    async fn test_install_packages_rejects_shell_metacharacters() {
        let gateway = Arc::new(FakeGateway::new());
        let (service, auth) = service_with(gateway.clone()).await;

        let err = service
            .install_packages(
                &auth,
                "sb-x",
                InstallPackagesRequest {
                    packages: vec!["requests; rm -rf /".to_string()],
                    manager: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_file_round_trip_through_fake_exec() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.put_runtime(FakeGateway::available_python_runtime());

        // A tiny in-memory "filesystem": write stores base64, read replays it.
        let stored: Arc<std::sync::Mutex<Option<Vec<u8>>>> =
            Arc::new(std::sync::Mutex::new(None));
        let stored_cb = stored.clone();
        gateway.set_exec_handler(Arc::new(move |cmd, stdin| {
            let script = cmd.join(" ");
            if script.contains("base64 -d") {
                *stored_cb.lock().unwrap() = Some(stdin.to_vec());
                (0, Vec::new(), Vec::new())
            } else if script.contains("stat -c") {
                (
                    0,
                    b"regular file|11|1700000000|/workspace/data.bin\n".to_vec(),
                    Vec::new(),
                )
            } else if script.contains("base64 ") {
                let data = stored_cb.lock().unwrap().clone().unwrap_or_default();
                (0, data, Vec::new())
            } else {
                (0, Vec::new(), Vec::new())
            }
        }));

        let (service, auth) = service_with(gateway.clone()).await;
        let view = service
            .create_sandbox(&auth, create_request("python:3.10"))
            .await
            .unwrap();
        let mut sandbox = gateway.get_sandbox(&view.id).await.unwrap().unwrap();
        sandbox.status = Some(crate::types::SandboxStatus {
            phase: SandboxPhase::Running,
            pod_name: Some("sandbox-pod".to_string()),
            pod_namespace: Some("llmsafespace".to_string()),
            ..Default::default()
        });
        gateway.put_sandbox(sandbox);

        let payload = b"\x00binary\xffpayload";
        let info = service
            .upload_file(&auth, &view.id, "/workspace/data.bin", payload)
            .await
            .unwrap();
        assert_eq!(info.path, "/workspace/data.bin");

        let downloaded = service
            .download_file(&auth, &view.id, "/workspace/data.bin")
            .await
            .unwrap();
        assert_eq!(downloaded, payload);
    }

    #[tokio::test]
    async fn test_warm_pool_crud() {
        let gateway = Arc::new(FakeGateway::new());
        let (service, auth) = service_with(gateway.clone()).await;

        let view = service
            .create_warm_pool(
                &auth,
                CreateWarmPoolRequest {
                    name: "python-pool".to_string(),
                    runtime: "python:3.10".to_string(),
                    min_size: 2,
                    max_size: 10,
                    security_level: None,
                    ttl: Some(600),
                    auto_scaling: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(view.name, "python-pool");
        assert_eq!(view.min_size, 2);

        let fetched = service.get_warm_pool(&auth, "python-pool").await.unwrap();
        assert_eq!(fetched.runtime, "python:3.10");

        let updated = service
            .update_warm_pool(
                &auth,
                "python-pool",
                UpdateWarmPoolRequest {
                    min_size: Some(4),
                    max_size: None,
                    ttl: None,
                    auto_scaling: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.min_size, 4);

        let page = service.list_warm_pools(&auth, 10, 0).await.unwrap();
        assert_eq!(page.total, 1);

        service.delete_warm_pool(&auth, "python-pool").await.unwrap();
        assert!(service.get_warm_pool(&auth, "python-pool").await.is_err());
    }
}
