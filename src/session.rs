//! Interactive sessions: one WebSocket bound to one sandbox.
//!
//! The manager owns the process-local session map; distributed visibility
//! goes through the Session Cache, which holds metadata only. Each session
//! tracks its in-flight executions by execution id so `cancel` messages and
//! session teardown can abort them individually.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{SessionCache, SessionRecord};
use crate::error::Result;

/// Message from the client over the session socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Execute {
        #[serde(default)]
        execution_id: Option<String>,
        /// `code` (default) or `command`.
        #[serde(default)]
        execution_type: Option<String>,
        content: String,
        #[serde(default)]
        timeout: Option<u64>,
    },
    Cancel {
        execution_id: String,
    },
    Ping,
    #[serde(other)]
    Unknown,
}

/// Message to the client. Every frame carries an epoch-millisecond
/// timestamp.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    ExecutionStart {
        execution_id: String,
        timestamp: i64,
    },
    Output {
        execution_id: String,
        stream: String,
        content: String,
        timestamp: i64,
    },
    ExecutionComplete {
        execution_id: String,
        exit_code: i32,
        timestamp: i64,
    },
    ExecutionCancelled {
        execution_id: String,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    Error {
        code: String,
        message: String,
        timestamp: i64,
    },
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// One live session. The writer half of the socket is serialized through a
/// per-session lock by the WebSocket handler; this handle tracks identity
/// and cancellation state.
pub struct SessionHandle {
    pub id: String,
    pub user_id: String,
    pub sandbox_id: String,
    /// Cancels everything scoped to the session when it closes.
    pub closed: CancellationToken,
    executions: Mutex<HashMap<String, CancellationToken>>,
}

impl SessionHandle {
    /// Register a new execution. `None` means the id is already running;
    /// duplicate `execute` frames with the same id are dropped, so
    /// redelivery yields exactly one run.
    pub async fn register_execution(&self, execution_id: &str) -> Option<CancellationToken> {
        let mut executions = self.executions.lock().await;
        if executions.contains_key(execution_id) {
            return None;
        }
        let token = self.closed.child_token();
        executions.insert(execution_id.to_string(), token.clone());
        Some(token)
    }

    /// Cancel one execution. Returns whether the id was live.
    pub async fn cancel_execution(&self, execution_id: &str) -> bool {
        let executions = self.executions.lock().await;
        match executions.get(execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop a finished execution's handle.
    pub async fn finish_execution(&self, execution_id: &str) {
        self.executions.lock().await.remove(execution_id);
    }

    pub async fn live_executions(&self) -> usize {
        self.executions.lock().await.len()
    }
}

/// Process-local registry of live sessions, guarded by a read-write lock.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    cache: SessionCache,
}

impl SessionManager {
    pub fn new(cache: SessionCache) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            cache,
        }
    }

    /// Open a session: generate an id, record it in the cache for
    /// distributed visibility, and register the live handle locally.
    pub async fn open(&self, user_id: &str, sandbox_id: &str) -> Result<Arc<SessionHandle>> {
        let id = Uuid::new_v4().to_string();
        let handle = Arc::new(SessionHandle {
            id: id.clone(),
            user_id: user_id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            closed: CancellationToken::new(),
            executions: Mutex::new(HashMap::new()),
        });

        self.cache
            .put(&SessionRecord {
                session_id: id.clone(),
                user_id: user_id.to_string(),
                sandbox_id: sandbox_id.to_string(),
                created_at: now_millis(),
            })
            .await?;

        self.sessions.write().await.insert(id, handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Close a session: cancel outstanding executions, drop the local
    /// handle, delete the cache entry.
    pub async fn close(&self, session_id: &str) -> Result<()> {
        let handle = self.sessions.write().await.remove(session_id);
        if let Some(handle) = handle {
            handle.closed.cancel();
        }
        self.cache.delete(session_id).await
    }

    /// Close every session bound to a sandbox; used when the sandbox is
    /// terminated so in-flight executions abort before cleanup.
    pub async fn close_for_sandbox(&self, sandbox_id: &str) -> Result<usize> {
        let ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|h| h.sandbox_id == sandbox_id)
                .map(|h| h.id.clone())
                .collect()
        };
        let count = ids.len();
        for id in ids {
            self.close(&id).await?;
        }
        Ok(count)
    }

    pub async fn live_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> SessionManager {
        SessionManager::new(SessionCache::in_memory(Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn test_open_registers_locally_and_in_cache() {
        let mgr = manager();
        let handle = mgr.open("user-1", "sbx-1").await.unwrap();
        assert_eq!(handle.user_id, "user-1");
        assert_eq!(mgr.live_count().await, 1);
        assert!(mgr.get(&handle.id).await.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_execution_id_is_deduplicated() {
        let mgr = manager();
        let handle = mgr.open("user-1", "sbx-1").await.unwrap();

        assert!(handle.register_execution("e1").await.is_some());
        assert!(handle.register_execution("e1").await.is_none());
        assert_eq!(handle.live_executions().await, 1);

        handle.finish_execution("e1").await;
        assert!(handle.register_execution("e1").await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_execution_fires_token() {
        let mgr = manager();
        let handle = mgr.open("user-1", "sbx-1").await.unwrap();
        let token = handle.register_execution("e1").await.unwrap();

        assert!(!token.is_cancelled());
        assert!(handle.cancel_execution("e1").await);
        assert!(token.is_cancelled());
        assert!(!handle.cancel_execution("missing").await);
    }

    #[tokio::test]
    async fn test_close_cancels_outstanding_executions() {
        let mgr = manager();
        let handle = mgr.open("user-1", "sbx-1").await.unwrap();
        let token = handle.register_execution("e1").await.unwrap();

        mgr.close(&handle.id).await.unwrap();
        assert!(token.is_cancelled());
        assert_eq!(mgr.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_for_sandbox_only_touches_that_sandbox() {
        let mgr = manager();
        let a = mgr.open("user-1", "sbx-a").await.unwrap();
        let _b = mgr.open("user-1", "sbx-b").await.unwrap();
        let token = a.register_execution("e1").await.unwrap();

        let closed = mgr.close_for_sandbox("sbx-a").await.unwrap();
        assert_eq!(closed, 1);
        assert!(token.is_cancelled());
        assert_eq!(mgr.live_count().await, 1);
    }

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"execute","executionId":"e1","content":"print(1)","timeout":30}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Execute {
                execution_id,
                content,
                timeout,
                ..
            } => {
                assert_eq!(execution_id.as_deref(), Some("e1"));
                assert_eq!(content, "print(1)");
                assert_eq!(timeout, Some(30));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"cancel","executionId":"e1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Cancel { .. }));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"selfdestruct"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Unknown));
    }

    #[test]
    fn test_server_message_frames() {
        let frame = serde_json::to_value(ServerMessage::Output {
            execution_id: "e1".to_string(),
            stream: "stdout".to_string(),
            content: "0\n".to_string(),
            timestamp: 1_700_000_000_000,
        })
        .unwrap();
        assert_eq!(frame["type"], "output");
        assert_eq!(frame["executionId"], "e1");
        assert_eq!(frame["stream"], "stdout");
        assert_eq!(frame["content"], "0\n");

        let frame = serde_json::to_value(ServerMessage::ExecutionComplete {
            execution_id: "e1".to_string(),
            exit_code: 0,
            timestamp: 1_700_000_000_000,
        })
        .unwrap();
        assert_eq!(frame["type"], "execution_complete");
        assert_eq!(frame["exitCode"], 0);

        let frame = serde_json::to_value(ServerMessage::Error {
            code: "unknown_message_type".to_string(),
            message: "unrecognized type".to_string(),
            timestamp: 1_700_000_000_000,
        })
        .unwrap();
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["code"], "unknown_message_type");
    }
}
