//! Typed gateway over the Kubernetes API.
//!
//! Everything the orchestration service needs from the cluster goes through
//! the [`ClusterGateway`] trait: CRUD on the custom resources, warm-pod
//! claiming, and the exec channel into a workload. The kube-backed
//! implementation classifies every API error into the crate's semantic
//! categories; reconcilers watch resources directly through `kube::runtime`
//! but share the same classification and client bootstrap.

pub mod exec;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config as KubeConfig, ResourceExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::KubernetesConfig;
use crate::error::{Error, Result, classify_kube};
use crate::types::{
    LABEL_POOL, LABEL_RUNTIME, RuntimeEnvironment, Sandbox, WarmPod, WarmPodPhase, WarmPodStatus,
    WarmPool,
};
use crate::validation::sanitize_runtime_label;
use exec::{EXIT_CODE_UNKNOWN, ExecChannel, exit_code_from_status};

/// Exit code reported when an exec hits its deadline.
pub const EXIT_CODE_TIMEOUT: i32 = 124;

/// A non-streaming exec invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl ExecRequest {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            stdin: None,
            timeout,
        }
    }

    pub fn with_stdin(mut self, stdin: Vec<u8>) -> Self {
        self.stdin = Some(stdin);
        self
    }
}

/// Result of a completed (or timed-out) exec invocation.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecOutcome {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Capability set the orchestration service requires from the cluster.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Namespace sandbox workloads live in.
    fn namespace(&self) -> &str;

    async fn create_sandbox(&self, sandbox: Sandbox) -> Result<Sandbox>;
    async fn get_sandbox(&self, name: &str) -> Result<Option<Sandbox>>;
    async fn delete_sandbox(&self, name: &str) -> Result<()>;

    /// Resolve a runtime identifier like `python:3.10` to its
    /// RuntimeEnvironment, if one is registered.
    async fn get_runtime(&self, runtime: &str) -> Result<Option<RuntimeEnvironment>>;

    async fn create_warm_pool(&self, pool: WarmPool) -> Result<WarmPool>;
    async fn get_warm_pool(&self, name: &str) -> Result<Option<WarmPool>>;
    async fn update_warm_pool(&self, pool: WarmPool) -> Result<WarmPool>;
    async fn delete_warm_pool(&self, name: &str) -> Result<()>;
    async fn list_warm_pools(&self) -> Result<Vec<WarmPool>>;

    /// Pools whose runtime label matches the given runtime.
    async fn list_pools_for_runtime(&self, runtime: &str) -> Result<Vec<WarmPool>>;

    /// Ready members of a pool.
    async fn list_ready_warm_pods(&self, pool_name: &str) -> Result<Vec<WarmPod>>;

    /// Atomically claim a Ready warm pod for a sandbox. Compare-and-swap on
    /// the pod's resource version; `None` means another claimer won.
    async fn claim_warm_pod(&self, pod: &WarmPod, sandbox_uid: &str) -> Result<Option<WarmPod>>;

    /// Open a streaming exec channel into a workload.
    async fn open_exec(
        &self,
        pod_namespace: &str,
        pod_name: &str,
        command: Vec<String>,
        tty: bool,
    ) -> Result<ExecChannel>;

    /// Run a command to completion, feeding stdin and collecting output.
    /// Hitting the deadline yields [`EXIT_CODE_TIMEOUT`] with partial output.
    async fn exec(
        &self,
        pod_namespace: &str,
        pod_name: &str,
        request: ExecRequest,
    ) -> Result<ExecOutcome> {
        let started_at = Utc::now();
        let mut channel = self
            .open_exec(pod_namespace, pod_name, request.command.clone(), false)
            .await?;

        if let Some(mut stdin) = channel.stdin.take() {
            if let Some(bytes) = &request.stdin {
                stdin.write_all(bytes).await?;
            }
            stdin.shutdown().await?;
        }

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut stdout = channel.stdout.take();
        let mut stderr = channel.stderr.take();
        let status = channel.status;

        let drive = async {
            let out = async {
                if let Some(reader) = stdout.as_mut() {
                    let _ = reader.read_to_end(&mut stdout_buf).await;
                }
            };
            let err = async {
                if let Some(reader) = stderr.as_mut() {
                    let _ = reader.read_to_end(&mut stderr_buf).await;
                }
            };
            let (_, _, code) = tokio::join!(out, err, status);
            code
        };

        let exit_code = match tokio::time::timeout(request.timeout, drive).await {
            Ok(code) => code,
            Err(_) => EXIT_CODE_TIMEOUT,
        };

        Ok(ExecOutcome {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout_buf).to_string(),
            stderr: String::from_utf8_lossy(&stderr_buf).to_string(),
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// Build the Kubernetes API client: in-cluster config first, then kubeconfig.
pub async fn build_client(config: &KubernetesConfig) -> Result<Client> {
    if let Ok(incluster) = KubeConfig::incluster() {
        return Client::try_from(incluster)
            .map_err(|e| Error::Transient(format!("in-cluster client: {e}")));
    }

    let kubeconfig = if let Some(path) = &config.kubeconfig {
        Kubeconfig::read_from(tilde_expand(path))
            .map_err(|e| Error::Transient(format!("read kubeconfig: {e}")))?
    } else {
        Kubeconfig::read().map_err(|e| Error::Transient(format!("read kubeconfig: {e}")))?
    };

    let mut options = KubeConfigOptions::default();
    if let Some(context) = &config.context {
        options.context = Some(context.clone());
    }

    let kube_config = KubeConfig::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| Error::Transient(format!("build kube config: {e}")))?;

    Client::try_from(kube_config).map_err(|e| Error::Transient(format!("build client: {e}")))
}

/// Expand a leading tilde to the home directory.
fn tilde_expand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_string()
}

/// Kube-backed gateway scoped to one namespace.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    namespace: String,
}

impl KubeGateway {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn sandboxes(&self) -> Api<Sandbox> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn warm_pools(&self) -> Api<WarmPool> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn warm_pods(&self) -> Api<WarmPod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn runtimes(&self) -> Api<RuntimeEnvironment> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create_sandbox(&self, sandbox: Sandbox) -> Result<Sandbox> {
        let name = sandbox.name_any();
        self.sandboxes()
            .create(&PostParams::default(), &sandbox)
            .await
            .map_err(|e| classify_kube(e, "sandbox", &name))
    }

    async fn get_sandbox(&self, name: &str) -> Result<Option<Sandbox>> {
        self.sandboxes()
            .get_opt(name)
            .await
            .map_err(|e| classify_kube(e, "sandbox", name))
    }

    async fn delete_sandbox(&self, name: &str) -> Result<()> {
        match self
            .sandboxes()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match classify_kube(e, "sandbox", name) {
                Error::NotFound { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn get_runtime(&self, runtime: &str) -> Result<Option<RuntimeEnvironment>> {
        let name = sanitize_runtime_label(runtime);
        if let Some(env) = self
            .runtimes()
            .get_opt(&name)
            .await
            .map_err(|e| classify_kube(e, "runtime", runtime))?
        {
            return Ok(Some(env));
        }

        // Naming-convention miss: fall back to a full list and match on the
        // declared language:version identifier.
        let all = self
            .runtimes()
            .list(&ListParams::default())
            .await
            .map_err(|e| classify_kube(e, "runtime", runtime))?;
        Ok(all.items.into_iter().find(|r| r.runtime_id() == runtime))
    }

    async fn create_warm_pool(&self, pool: WarmPool) -> Result<WarmPool> {
        let name = pool.name_any();
        self.warm_pools()
            .create(&PostParams::default(), &pool)
            .await
            .map_err(|e| classify_kube(e, "warmpool", &name))
    }

    async fn get_warm_pool(&self, name: &str) -> Result<Option<WarmPool>> {
        self.warm_pools()
            .get_opt(name)
            .await
            .map_err(|e| classify_kube(e, "warmpool", name))
    }

    async fn update_warm_pool(&self, pool: WarmPool) -> Result<WarmPool> {
        let name = pool.name_any();
        self.warm_pools()
            .replace(&name, &PostParams::default(), &pool)
            .await
            .map_err(|e| classify_kube(e, "warmpool", &name))
    }

    async fn delete_warm_pool(&self, name: &str) -> Result<()> {
        match self
            .warm_pools()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match classify_kube(e, "warmpool", name) {
                Error::NotFound { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn list_warm_pools(&self) -> Result<Vec<WarmPool>> {
        let pools = self
            .warm_pools()
            .list(&ListParams::default())
            .await
            .map_err(|e| classify_kube(e, "warmpool", "*"))?;
        Ok(pools.items)
    }

    async fn list_pools_for_runtime(&self, runtime: &str) -> Result<Vec<WarmPool>> {
        let selector = format!("{LABEL_RUNTIME}={}", sanitize_runtime_label(runtime));
        let selected = self
            .warm_pools()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| classify_kube(e, "warmpool", runtime))?;

        if !selected.items.is_empty() {
            return Ok(selected.items);
        }

        // Pools created out-of-band may be unlabeled; degrade to a full list
        // filtered on the declared runtime.
        let all = self.list_warm_pools().await?;
        Ok(all
            .into_iter()
            .filter(|p| p.spec.runtime == runtime)
            .collect())
    }

    async fn list_ready_warm_pods(&self, pool_name: &str) -> Result<Vec<WarmPod>> {
        let selector = format!("{LABEL_POOL}={pool_name}");
        let pods = self
            .warm_pods()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| classify_kube(e, "warmpod", pool_name))?;
        Ok(pods.items.into_iter().filter(|p| p.is_ready()).collect())
    }

    async fn claim_warm_pod(&self, pod: &WarmPod, sandbox_uid: &str) -> Result<Option<WarmPod>> {
        let name = pod.name_any();
        let mut claimed = pod.clone();
        claimed.metadata.managed_fields = None;

        let previous = claimed.status.clone().unwrap_or_default();
        claimed.status = Some(WarmPodStatus {
            phase: WarmPodPhase::Assigned,
            assigned_to: Some(sandbox_uid.to_string()),
            assigned_at: Some(Utc::now().to_rfc3339()),
            ..previous
        });

        let data = serde_json::to_vec(&claimed)?;
        match self
            .warm_pods()
            .replace_status(&name, &PostParams::default(), data)
            .await
        {
            Ok(updated) => Ok(Some(updated)),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(None),
            Err(e) => Err(classify_kube(e, "warmpod", &name)),
        }
    }

    async fn open_exec(
        &self,
        pod_namespace: &str,
        pod_name: &str,
        command: Vec<String>,
        tty: bool,
    ) -> Result<ExecChannel> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), pod_namespace);
        let command_refs: Vec<&str> = command.iter().map(|s| s.as_str()).collect();

        let params = AttachParams::default()
            .container("sandbox")
            .stdin(true)
            .stdout(true)
            .stderr(!tty)
            .tty(tty);

        let mut attached = pods
            .exec(pod_name, command_refs, &params)
            .await
            .map_err(|e| classify_kube(e, "exec", pod_name))?;

        let stdin = attached
            .stdin()
            .map(|w| Box::pin(w) as std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>);
        let stdout = attached
            .stdout()
            .map(|r| Box::pin(r) as std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>);
        let stderr = attached
            .stderr()
            .map(|r| Box::pin(r) as std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>);

        let status_future = attached.take_status();
        let status = async move {
            let code = match status_future {
                Some(fut) => fut
                    .await
                    .as_ref()
                    .map(exit_code_from_status)
                    .unwrap_or(EXIT_CODE_UNKNOWN),
                None => EXIT_CODE_UNKNOWN,
            };
            // Keep the connection alive until the remote side is done.
            let _ = attached.join().await;
            code
        }
        .boxed();

        Ok(ExecChannel {
            stdin,
            stdout,
            stderr,
            status,
        })
    }
}

/// Merge-patch a set of labels onto a pod, e.g. when rebinding a claimed
/// warm workload to its sandbox.
pub async fn patch_pod_labels(
    client: Client,
    namespace: &str,
    pod_name: &str,
    labels: serde_json::Value,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let patch = serde_json::json!({"metadata": {"labels": labels}});
    pods.patch(pod_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| classify_kube(e, "pod", pod_name))?;
    Ok(())
}
