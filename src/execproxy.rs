//! Execution Proxy: drives one code or command execution inside a running
//! sandbox.
//!
//! Opens an exec channel through the cluster gateway, writes the payload to
//! stdin, and pipes stdout/stderr through a line buffer. With a stream
//! callback set, every complete line is delivered as it arrives; otherwise
//! output accumulates. The proxy enforces the per-execution timeout and
//! honors a caller-provided cancel token.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::cluster::exec::ExecChannel;
use crate::cluster::{ClusterGateway, EXIT_CODE_TIMEOUT};
use crate::error::{Error, Result};
use crate::types::{RuntimeEnvironment, Sandbox};

/// Exit code reported when the caller cancels.
pub const EXIT_CODE_CANCELLED: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    Code,
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

/// One execution request against a running sandbox.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub kind: ExecutionKind,
    pub content: String,
    pub timeout: Duration,
}

/// Completed execution, successful or not.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: ExecutionStatus,
}

/// Callback invoked once per complete output line.
pub type StreamCallback = Arc<dyn Fn(StreamKind, String) + Send + Sync>;

/// Accumulates raw chunks and releases complete, newline-terminated lines.
/// Partial trailing content is held until the next push or flush.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk; returns the complete lines it closed, each including
    /// its trailing newline.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(idx) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=idx).collect();
            lines.push(line);
        }
        lines
    }

    /// Stream ended: release whatever partial content remains.
    pub fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial))
        }
    }
}

pub struct ExecutionProxy {
    gateway: Arc<dyn ClusterGateway>,
}

impl ExecutionProxy {
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        Self { gateway }
    }

    /// Run one execution. The command comes from the runtime's declared
    /// interpreter (code) or a plain shell (command); the payload is written
    /// to stdin and stdin is closed.
    pub async fn execute(
        &self,
        sandbox: &Sandbox,
        runtime: &RuntimeEnvironment,
        request: ExecutionRequest,
        callback: Option<StreamCallback>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let status = sandbox
            .status
            .as_ref()
            .ok_or_else(|| Error::SandboxNotRunning(sandbox_name(sandbox)))?;
        let pod_name = status
            .pod_name
            .clone()
            .ok_or_else(|| Error::SandboxNotRunning(sandbox_name(sandbox)))?;
        let pod_namespace = status
            .pod_namespace
            .clone()
            .unwrap_or_else(|| self.gateway.namespace().to_string());

        let command = match request.kind {
            ExecutionKind::Code => runtime.interpreter_command(),
            ExecutionKind::Command => vec!["sh".to_string()],
        };

        let channel = self
            .gateway
            .open_exec(&pod_namespace, &pod_name, command, false)
            .await?;

        drive_execution(channel, request, callback, cancel).await
    }
}

fn sandbox_name(sandbox: &Sandbox) -> String {
    sandbox
        .metadata
        .name
        .clone()
        .unwrap_or_else(|| "<unnamed>".to_string())
}

/// Drive an open channel to completion: feed stdin, pump line-buffered
/// output, race the deadline and the cancel token.
pub async fn drive_execution(
    mut channel: ExecChannel,
    request: ExecutionRequest,
    callback: Option<StreamCallback>,
    cancel: CancellationToken,
) -> Result<ExecutionResult> {
    let started_at = Utc::now();

    if let Some(mut stdin) = channel.stdin.take() {
        stdin.write_all(request.content.as_bytes()).await?;
        if !request.content.ends_with('\n') {
            stdin.write_all(b"\n").await?;
        }
        stdin.shutdown().await?;
    }

    let stdout_acc = Arc::new(StdMutex::new(String::new()));
    let stderr_acc = Arc::new(StdMutex::new(String::new()));

    let mut stdout = channel.stdout.take();
    let mut stderr = channel.stderr.take();
    let status = channel.status;

    let drive = {
        let stdout_acc = stdout_acc.clone();
        let stderr_acc = stderr_acc.clone();
        let callback = callback.clone();
        async move {
            let out = pump(stdout.as_mut(), StreamKind::Stdout, callback.clone(), stdout_acc);
            let err = pump(stderr.as_mut(), StreamKind::Stderr, callback, stderr_acc);
            let (_, _, code) = tokio::join!(out, err, status);
            code
        }
    };
    tokio::pin!(drive);

    let exit_code = tokio::select! {
        code = &mut drive => code,
        _ = cancel.cancelled() => EXIT_CODE_CANCELLED,
        _ = tokio::time::sleep(request.timeout) => EXIT_CODE_TIMEOUT,
    };

    let stdout_text = stdout_acc.lock().map(|s| s.clone()).unwrap_or_default();
    let stderr_text = stderr_acc.lock().map(|s| s.clone()).unwrap_or_default();

    Ok(ExecutionResult {
        exit_code,
        stdout: stdout_text,
        stderr: stderr_text,
        started_at,
        finished_at: Utc::now(),
        status: if exit_code == 0 {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        },
    })
}

async fn pump(
    reader: Option<&mut std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>>,
    kind: StreamKind,
    callback: Option<StreamCallback>,
    accumulator: Arc<StdMutex<String>>,
) {
    let Some(reader) = reader else { return };

    let mut buffer = LineBuffer::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]);
                for line in buffer.push(&text) {
                    deliver(&kind, &callback, &accumulator, line);
                }
            }
        }
    }
    if let Some(rest) = buffer.flush() {
        deliver(&kind, &callback, &accumulator, rest);
    }
}

fn deliver(
    kind: &StreamKind,
    callback: &Option<StreamCallback>,
    accumulator: &Arc<StdMutex<String>>,
    line: String,
) {
    if let Ok(mut acc) = accumulator.lock() {
        acc.push_str(&line);
    }
    if let Some(cb) = callback {
        cb(*kind, line);
    }
}
