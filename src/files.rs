//! File Proxy: list, read, write, and delete files inside a running sandbox.
//!
//! Everything goes through the exec channel; file bytes cross it base64
//! encoded so binary content survives the text transport. Paths are
//! validated before interpolation and always single-quoted.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::Serialize;

use crate::cluster::{ClusterGateway, ExecRequest};
use crate::error::{Error, Result};
use crate::types::Sandbox;
use crate::validation::validate_sandbox_path;

/// Timeout for individual file operations.
const FILE_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// One entry from a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    /// Epoch seconds of the last modification.
    pub modified_at: i64,
}

pub struct FileProxy {
    gateway: Arc<dyn ClusterGateway>,
}

impl FileProxy {
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        Self { gateway }
    }

    fn target(&self, sandbox: &Sandbox) -> Result<(String, String)> {
        let name = sandbox
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| "<unnamed>".to_string());
        let (pod_name, pod_namespace) = sandbox
            .workload()
            .ok_or(Error::SandboxNotRunning(name))?;
        Ok((
            pod_namespace.unwrap_or_else(|| self.gateway.namespace().to_string()),
            pod_name,
        ))
    }

    async fn run(&self, sandbox: &Sandbox, script: String, stdin: Option<Vec<u8>>) -> Result<crate::cluster::ExecOutcome> {
        let (namespace, pod) = self.target(sandbox)?;
        let mut request = ExecRequest::new(
            vec!["sh".to_string(), "-c".to_string(), script],
            FILE_OP_TIMEOUT,
        );
        if let Some(bytes) = stdin {
            request = request.with_stdin(bytes);
        }
        self.gateway.exec(&namespace, &pod, request).await
    }

    /// List the immediate entries of a directory.
    pub async fn list(&self, sandbox: &Sandbox, path: &str) -> Result<Vec<FileInfo>> {
        validate_sandbox_path(path)?;
        let script = format!(
            "find '{path}' -maxdepth 1 -mindepth 1 -exec stat -c '%F|%s|%Y|%n' {{}} +"
        );
        let outcome = self.run(sandbox, script, None).await?;
        if !outcome.is_success() && !outcome.stderr.is_empty() {
            return Err(Error::not_found("path", path));
        }

        let mut entries: Vec<FileInfo> = outcome
            .stdout
            .lines()
            .filter_map(parse_stat_line)
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Read a file's bytes.
    pub async fn read(&self, sandbox: &Sandbox, path: &str) -> Result<Vec<u8>> {
        validate_sandbox_path(path)?;
        let outcome = self.run(sandbox, format!("base64 '{path}'"), None).await?;
        if !outcome.is_success() {
            return Err(Error::not_found("file", path));
        }

        let compact: String = outcome
            .stdout
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        base64::engine::general_purpose::STANDARD
            .decode(compact)
            .map_err(|e| Error::Permanent(format!("undecodable file content for {path}: {e}")))
    }

    /// Write bytes to a file, creating parent directories. Returns the
    /// resulting entry.
    pub async fn write(&self, sandbox: &Sandbox, path: &str, content: &[u8]) -> Result<FileInfo> {
        validate_sandbox_path(path)?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);

        let mut script = String::new();
        if let Some(parent) = std::path::Path::new(path).parent() {
            let parent = parent.to_string_lossy();
            if parent != "/" && !parent.is_empty() {
                script.push_str(&format!("mkdir -p '{parent}' && "));
            }
        }
        script.push_str(&format!("base64 -d > '{path}'"));

        let outcome = self
            .run(sandbox, script, Some(encoded.into_bytes()))
            .await?;
        if !outcome.is_success() {
            return Err(Error::Permanent(format!(
                "failed to write {path}: {}",
                outcome.stderr.trim()
            )));
        }

        let stat = self
            .run(sandbox, format!("stat -c '%F|%s|%Y|%n' '{path}'"), None)
            .await?;
        parse_stat_line(stat.stdout.trim())
            .ok_or_else(|| Error::Permanent(format!("unreadable stat output for {path}")))
    }

    /// Delete a file.
    pub async fn delete(&self, sandbox: &Sandbox, path: &str) -> Result<()> {
        validate_sandbox_path(path)?;
        let check = self
            .run(sandbox, format!("test -e '{path}' && rm -f '{path}'"), None)
            .await?;
        if !check.is_success() {
            return Err(Error::not_found("file", path));
        }
        Ok(())
    }
}

/// Parse one `stat -c '%F|%s|%Y|%n'` line.
fn parse_stat_line(line: &str) -> Option<FileInfo> {
    let mut parts = line.splitn(4, '|');
    let file_type = parts.next()?;
    let size = parts.next()?.parse().ok()?;
    let modified_at = parts.next()?.parse().ok()?;
    let path = parts.next()?;
    if path.is_empty() {
        return None;
    }
    Some(FileInfo {
        path: path.to_string(),
        size,
        is_dir: file_type.contains("directory"),
        modified_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_line() {
        let info = parse_stat_line("regular file|1024|1700000000|/workspace/main.py").unwrap();
        assert_eq!(info.path, "/workspace/main.py");
        assert_eq!(info.size, 1024);
        assert!(!info.is_dir);
        assert_eq!(info.modified_at, 1_700_000_000);

        let dir = parse_stat_line("directory|4096|1700000001|/workspace/data").unwrap();
        assert!(dir.is_dir);
    }

    #[test]
    fn test_parse_stat_line_with_pipe_in_name() {
        // splitn(4) keeps everything after the third separator as the path.
        let info = parse_stat_line("regular file|10|1700000000|/tmp/a|b").unwrap();
        assert_eq!(info.path, "/tmp/a|b");
    }

    #[test]
    fn test_parse_stat_line_rejects_garbage() {
        assert!(parse_stat_line("").is_none());
        assert!(parse_stat_line("not a stat line").is_none());
        assert!(parse_stat_line("regular file|x|y|/tmp/a").is_none());
    }

    #[test]
    fn test_base64_round_trip() {
        let content = b"\x00\x01binary\xffdata\n";
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        // base64 tools wrap output; the reader strips whitespace first.
        let wrapped = format!("{}\n{}\n", &encoded[..8], &encoded[8..]);
        let compact: String = wrapped.chars().filter(|c| !c.is_whitespace()).collect();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(compact)
            .unwrap();
        assert_eq!(decoded, content);
    }
}
