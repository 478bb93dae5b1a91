//! Shared test helpers: an in-memory [`ClusterGateway`] with programmable
//! exec behavior and CAS-faithful warm-pod claiming.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cluster::ClusterGateway;
use crate::cluster::exec::ExecChannel;
use crate::error::{Error, Result};
use crate::types::{
    RuntimeEnvironment, Sandbox, WarmPod, WarmPodPhase, WarmPodStatus, WarmPool,
};

/// Programmable exec handler: `(argv, stdin) -> (exit_code, stdout, stderr)`.
pub type ExecHandler =
    Arc<dyn Fn(&[String], &[u8]) -> (i32, Vec<u8>, Vec<u8>) + Send + Sync>;

#[derive(Default)]
struct FakeState {
    sandboxes: HashMap<String, Sandbox>,
    pools: HashMap<String, WarmPool>,
    pods: HashMap<String, WarmPod>,
    pod_pool: HashMap<String, String>,
    runtimes: HashMap<String, RuntimeEnvironment>,
    resource_versions: HashMap<String, u64>,
}

/// In-memory gateway. Claims are compare-and-swap on a per-pod resource
/// version, so contended claim tests behave like the real API server.
pub struct FakeGateway {
    state: Mutex<FakeState>,
    exec_handler: Mutex<Option<ExecHandler>>,
    /// When true, sandbox creation fails with a transient error.
    pub fail_sandbox_create: Mutex<bool>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            exec_handler: Mutex::new(None),
            fail_sandbox_create: Mutex::new(false),
        }
    }

    pub fn set_exec_handler(&self, handler: ExecHandler) {
        *self.exec_handler.lock().unwrap() = Some(handler);
    }

    pub fn put_runtime(&self, runtime: RuntimeEnvironment) {
        let mut state = self.state.lock().unwrap();
        state
            .runtimes
            .insert(runtime.runtime_id(), runtime);
    }

    pub fn put_warm_pool(&self, pool: WarmPool) {
        let mut state = self.state.lock().unwrap();
        let name = pool.metadata.name.clone().unwrap_or_default();
        state.pools.insert(name, pool);
    }

    pub fn put_warm_pod(&self, pool_name: &str, mut pod: WarmPod) {
        let mut state = self.state.lock().unwrap();
        let name = pod.metadata.name.clone().unwrap_or_default();
        let version = state.resource_versions.entry(name.clone()).or_insert(1);
        pod.metadata.resource_version = Some(version.to_string());
        state.pod_pool.insert(name.clone(), pool_name.to_string());
        state.pods.insert(name, pod);
    }

    pub fn put_sandbox(&self, sandbox: Sandbox) {
        let mut state = self.state.lock().unwrap();
        let name = sandbox.metadata.name.clone().unwrap_or_default();
        state.sandboxes.insert(name, sandbox);
    }

    pub fn get_warm_pod(&self, name: &str) -> Option<WarmPod> {
        self.state.lock().unwrap().pods.get(name).cloned()
    }

    pub fn sandbox_count(&self) -> usize {
        self.state.lock().unwrap().sandboxes.len()
    }

    /// A python:3.10 runtime marked available.
    pub fn available_python_runtime() -> RuntimeEnvironment {
        let mut runtime = RuntimeEnvironment::new(
            "python-3.10",
            serde_json::from_value(serde_json::json!({
                "image": "llmsafespace/python:3.10",
                "language": "python",
                "version": "3.10",
            }))
            .unwrap(),
        );
        runtime.status = Some(crate::types::RuntimeEnvironmentStatus {
            available: true,
            last_validated: Some(Utc::now().to_rfc3339()),
        });
        runtime
    }
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterGateway for FakeGateway {
    fn namespace(&self) -> &str {
        "llmsafespace"
    }

    async fn create_sandbox(&self, mut sandbox: Sandbox) -> Result<Sandbox> {
        if *self.fail_sandbox_create.lock().unwrap() {
            return Err(Error::Transient("fake: sandbox create failed".into()));
        }
        let mut state = self.state.lock().unwrap();
        let name = sandbox.metadata.name.clone().unwrap_or_default();
        if state.sandboxes.contains_key(&name) {
            return Err(Error::Conflict(format!("sandbox/{name}")));
        }
        sandbox.metadata.uid = Some(format!("uid-{name}"));
        state.sandboxes.insert(name, sandbox.clone());
        Ok(sandbox)
    }

    async fn get_sandbox(&self, name: &str) -> Result<Option<Sandbox>> {
        Ok(self.state.lock().unwrap().sandboxes.get(name).cloned())
    }

    async fn delete_sandbox(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().sandboxes.remove(name);
        Ok(())
    }

    async fn get_runtime(&self, runtime: &str) -> Result<Option<RuntimeEnvironment>> {
        Ok(self.state.lock().unwrap().runtimes.get(runtime).cloned())
    }

    async fn create_warm_pool(&self, pool: WarmPool) -> Result<WarmPool> {
        let mut state = self.state.lock().unwrap();
        let name = pool.metadata.name.clone().unwrap_or_default();
        if state.pools.contains_key(&name) {
            return Err(Error::Conflict(format!("warmpool/{name}")));
        }
        state.pools.insert(name, pool.clone());
        Ok(pool)
    }

    async fn get_warm_pool(&self, name: &str) -> Result<Option<WarmPool>> {
        Ok(self.state.lock().unwrap().pools.get(name).cloned())
    }

    async fn update_warm_pool(&self, pool: WarmPool) -> Result<WarmPool> {
        let mut state = self.state.lock().unwrap();
        let name = pool.metadata.name.clone().unwrap_or_default();
        if !state.pools.contains_key(&name) {
            return Err(Error::not_found("warmpool", name));
        }
        state.pools.insert(name, pool.clone());
        Ok(pool)
    }

    async fn delete_warm_pool(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().pools.remove(name);
        Ok(())
    }

    async fn list_warm_pools(&self) -> Result<Vec<WarmPool>> {
        Ok(self.state.lock().unwrap().pools.values().cloned().collect())
    }

    async fn list_pools_for_runtime(&self, runtime: &str) -> Result<Vec<WarmPool>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pools
            .values()
            .filter(|p| p.spec.runtime == runtime)
            .cloned()
            .collect())
    }

    async fn list_ready_warm_pods(&self, pool_name: &str) -> Result<Vec<WarmPod>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .iter()
            .filter(|(name, pod)| {
                state.pod_pool.get(*name).map(|p| p.as_str()) == Some(pool_name)
                    && pod.is_ready()
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn claim_warm_pod(&self, pod: &WarmPod, sandbox_uid: &str) -> Result<Option<WarmPod>> {
        let mut state = self.state.lock().unwrap();
        let name = pod.metadata.name.clone().unwrap_or_default();

        let Some(stored) = state.pods.get(&name).cloned() else {
            return Err(Error::not_found("warmpod", name));
        };
        if stored.metadata.resource_version != pod.metadata.resource_version
            || stored.phase() != WarmPodPhase::Ready
        {
            return Ok(None);
        }

        let mut claimed = stored;
        let previous = claimed.status.clone().unwrap_or_default();
        claimed.status = Some(WarmPodStatus {
            phase: WarmPodPhase::Assigned,
            assigned_to: Some(sandbox_uid.to_string()),
            assigned_at: Some(Utc::now().to_rfc3339()),
            ..previous
        });
        let version = state.resource_versions.entry(name.clone()).or_insert(1);
        *version += 1;
        claimed.metadata.resource_version = Some(version.to_string());
        state.pods.insert(name, claimed.clone());
        Ok(Some(claimed))
    }

    async fn open_exec(
        &self,
        _pod_namespace: &str,
        _pod_name: &str,
        command: Vec<String>,
        _tty: bool,
    ) -> Result<ExecChannel> {
        let handler = self
            .exec_handler
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Arc::new(|_cmd: &[String], _stdin: &[u8]| (0, Vec::new(), Vec::new())));

        let (mut out_w, out_r) = tokio::io::duplex(64 * 1024);
        let (mut err_w, err_r) = tokio::io::duplex(64 * 1024);
        let (in_w, mut in_r) = tokio::io::duplex(64 * 1024);

        let status = async move {
            let mut stdin = Vec::new();
            let _ = in_r.read_to_end(&mut stdin).await;
            let (code, stdout, stderr) = handler(&command, &stdin);
            let _ = out_w.write_all(&stdout).await;
            let _ = err_w.write_all(&stderr).await;
            drop(out_w);
            drop(err_w);
            code
        }
        .boxed();

        Ok(ExecChannel {
            stdin: Some(Box::pin(in_w) as Pin<Box<dyn AsyncWrite + Send>>),
            stdout: Some(Box::pin(out_r)),
            stderr: Some(Box::pin(err_r)),
            status,
        })
    }
}
