//! Session Cache: short-lived keyed storage for interactive session
//! metadata.
//!
//! Redis-backed when configured, so every API replica can see which sandbox
//! a session belongs to; falls back to an in-process map for tests and
//! single-node deployments. Entries are TTL-bounded. The live WebSocket and
//! its cancel handles never go here; they stay in process memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::RedisConfig;
use crate::error::Result;

/// Metadata for one interactive session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub sandbox_id: String,
    /// Epoch milliseconds.
    pub created_at: i64,
}

#[derive(Clone)]
enum Backend {
    Redis(ConnectionManager),
    Memory(Arc<RwLock<HashMap<String, (SessionRecord, Instant)>>>),
}

/// TTL-bounded session metadata store.
#[derive(Clone)]
pub struct SessionCache {
    backend: Backend,
    ttl: Duration,
}

impl SessionCache {
    /// Connect per config: Redis when a URL is set, in-process map otherwise.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let ttl = Duration::from_secs(config.session_ttl_seconds);
        let Some(url) = &config.url else {
            return Ok(Self::in_memory(ttl));
        };

        let mut info = redis::IntoConnectionInfo::into_connection_info(url.as_str())?;
        if let Some(password) = &config.password {
            info.redis.password = Some(password.clone());
        }
        let client = redis::Client::open(info)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            backend: Backend::Redis(manager),
            ttl,
        })
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            backend: Backend::Memory(Arc::new(RwLock::new(HashMap::new()))),
            ttl,
        }
    }

    fn key(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    pub async fn put(&self, record: &SessionRecord) -> Result<()> {
        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let payload = serde_json::to_string(record)?;
                conn.set_ex::<_, _, ()>(Self::key(&record.session_id), payload, self.ttl.as_secs())
                    .await?;
            }
            Backend::Memory(map) => {
                map.write().await.insert(
                    record.session_id.clone(),
                    (record.clone(), Instant::now() + self.ttl),
                );
            }
        }
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let payload: Option<String> = conn.get(Self::key(session_id)).await?;
                Ok(payload
                    .map(|p| serde_json::from_str(&p))
                    .transpose()?)
            }
            Backend::Memory(map) => {
                let guard = map.read().await;
                Ok(guard.get(session_id).and_then(|(record, deadline)| {
                    if Instant::now() < *deadline {
                        Some(record.clone())
                    } else {
                        None
                    }
                }))
            }
        }
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                conn.del::<_, ()>(Self::key(session_id)).await?;
            }
            Backend::Memory(map) => {
                map.write().await.remove(session_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            user_id: "user-1".to_string(),
            sandbox_id: "sbx-1".to_string(),
            created_at: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_memory_put_get_delete() {
        let cache = SessionCache::in_memory(Duration::from_secs(60));
        let rec = record("sess-1");

        cache.put(&rec).await.unwrap();
        assert_eq!(cache.get("sess-1").await.unwrap(), Some(rec));
        assert_eq!(cache.get("sess-2").await.unwrap(), None);

        cache.delete("sess-1").await.unwrap();
        assert_eq!(cache.get("sess-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_entries_expire() {
        let cache = SessionCache::in_memory(Duration::from_millis(10));
        cache.put(&record("sess-ttl")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("sess-ttl").await.unwrap(), None);
    }

    #[test]
    fn test_record_serde_camel_case() {
        let json = serde_json::to_value(record("sess-1")).unwrap();
        assert_eq!(json["sessionId"], "sess-1");
        assert_eq!(json["sandboxId"], "sbx-1");
        assert_eq!(json["createdAt"], 1_700_000_000_000i64);
    }
}
