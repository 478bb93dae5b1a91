//! Resource Store: durable metadata about sandboxes and warm pools.
//!
//! Separate from cluster state; this is the source of truth for audit and
//! owner-scoped pagination, so list endpoints never scan the cluster. Backed
//! by SQLite through sqlx with embedded forward-only migrations.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};

/// SQLite busy timeout when the store is under load.
const BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: String,
    pub user_id: String,
    pub key_prefix: String,
    pub permissions: Vec<String>,
    pub revoked: bool,
}

impl ApiKeyRecord {
    /// Permission check; `*` grants everything.
    pub fn has_permission(&self, permission: &str) -> bool {
        !self.revoked
            && self
                .permissions
                .iter()
                .any(|p| p == permission || p == "*")
    }
}

#[derive(Debug, Clone)]
pub struct SandboxMetadata {
    pub id: String,
    pub user_id: String,
    pub runtime: String,
    pub namespace: String,
    pub name: String,
    pub status: String,
    pub labels: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WarmPoolMetadata {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub namespace: String,
    pub runtime: String,
    pub min_size: i64,
    pub max_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A page of results with the true total row count.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

/// Primary entry point to the persistence layer.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Establish (or create) a connection pool at the given sqlx URL and run
    /// pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(Error::Database)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));
        Self::connect_with(options, 8).await
    }

    /// In-memory store for tests and single-shot tooling. Pinned to a single
    /// connection: each SQLite `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(Error::Database)?;
        Self::connect_with(options, 1).await
    }

    async fn connect_with(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;

        Ok(Self { pool })
    }

    // ---- users ----

    pub async fn create_user(&self, username: &str) -> Result<UserRecord> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query("INSERT INTO users (id, username, created_at) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(username)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(UserRecord {
            id,
            username: username.to_string(),
            created_at: now,
        })
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT id, username, created_at FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(UserRecord {
                id: r.get("id"),
                username: r.get("username"),
                created_at: parse_timestamp(&r, "created_at")?,
            })
        })
        .transpose()
    }

    // ---- api keys ----

    /// Persist a hashed API key. Permissions are stored space-separated.
    pub async fn insert_api_key(
        &self,
        user_id: &str,
        key_hash: &str,
        key_prefix: &str,
        permissions: &[&str],
    ) -> Result<ApiKeyRecord> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO api_keys (id, user_id, key_hash, key_prefix, permissions, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(key_hash)
        .bind(key_prefix)
        .bind(permissions.join(" "))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(ApiKeyRecord {
            id,
            user_id: user_id.to_string(),
            key_prefix: key_prefix.to_string(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            revoked: false,
        })
    }

    pub async fn find_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>> {
        let row = sqlx::query(
            "SELECT id, user_id, key_prefix, permissions, revoked FROM api_keys WHERE key_hash = ?",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ApiKeyRecord {
            id: r.get("id"),
            user_id: r.get("user_id"),
            key_prefix: r.get("key_prefix"),
            permissions: split_permissions(r.get::<String, _>("permissions").as_str()),
            revoked: r.get::<i64, _>("revoked") != 0,
        }))
    }

    pub async fn touch_api_key(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- sandbox metadata ----

    pub async fn insert_sandbox(&self, meta: &SandboxMetadata) -> Result<()> {
        sqlx::query(
            "INSERT INTO sandbox_metadata
             (id, user_id, runtime, namespace, name, status, labels, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&meta.id)
        .bind(&meta.user_id)
        .bind(&meta.runtime)
        .bind(&meta.namespace)
        .bind(&meta.name)
        .bind(&meta.status)
        .bind(meta.labels.to_string())
        .bind(meta.created_at.to_rfc3339())
        .bind(meta.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_sandbox(&self, id: &str) -> Result<Option<SandboxMetadata>> {
        let row = sqlx::query("SELECT * FROM sandbox_metadata WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_sandbox_metadata).transpose()
    }

    pub async fn delete_sandbox(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sandbox_metadata WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Cache the latest observed phase so list endpoints avoid cluster reads.
    pub async fn update_sandbox_status(&self, id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE sandbox_metadata SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Owner-scoped page, newest first. `total` is the true row count.
    pub async fn list_sandboxes_by_owner(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Page<SandboxMetadata>> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sandbox_metadata WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(
            "SELECT * FROM sandbox_metadata WHERE user_id = ?
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(map_sandbox_metadata)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page { items, total })
    }

    // ---- warm pool metadata ----

    pub async fn insert_warm_pool(&self, meta: &WarmPoolMetadata) -> Result<()> {
        sqlx::query(
            "INSERT INTO warm_pool_metadata
             (id, user_id, name, namespace, runtime, min_size, max_size, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&meta.id)
        .bind(&meta.user_id)
        .bind(&meta.name)
        .bind(&meta.namespace)
        .bind(&meta.runtime)
        .bind(meta.min_size)
        .bind(meta.max_size)
        .bind(meta.created_at.to_rfc3339())
        .bind(meta.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_warm_pool(&self, namespace: &str, name: &str) -> Result<Option<WarmPoolMetadata>> {
        let row = sqlx::query("SELECT * FROM warm_pool_metadata WHERE namespace = ? AND name = ?")
            .bind(namespace)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_warm_pool_metadata).transpose()
    }

    pub async fn update_warm_pool_sizes(
        &self,
        namespace: &str,
        name: &str,
        min_size: i64,
        max_size: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE warm_pool_metadata SET min_size = ?, max_size = ?, updated_at = ?
             WHERE namespace = ? AND name = ?",
        )
        .bind(min_size)
        .bind(max_size)
        .bind(Utc::now().to_rfc3339())
        .bind(namespace)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_warm_pool(&self, namespace: &str, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM warm_pool_metadata WHERE namespace = ? AND name = ?")
            .bind(namespace)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_warm_pools_by_owner(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Page<WarmPoolMetadata>> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM warm_pool_metadata WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(
            "SELECT * FROM warm_pool_metadata WHERE user_id = ?
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(map_warm_pool_metadata)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page { items, total })
    }
}

fn split_permissions(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(|s| s.to_string()).collect()
}

fn parse_timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.get(column);
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Database(sqlx::Error::Decode(Box::new(e))))
}

fn map_sandbox_metadata(row: SqliteRow) -> Result<SandboxMetadata> {
    let labels_raw: String = row.get("labels");
    Ok(SandboxMetadata {
        id: row.get("id"),
        user_id: row.get("user_id"),
        runtime: row.get("runtime"),
        namespace: row.get("namespace"),
        name: row.get("name"),
        status: row.get("status"),
        labels: serde_json::from_str(&labels_raw).unwrap_or(serde_json::Value::Null),
        created_at: parse_timestamp(&row, "created_at")?,
        updated_at: parse_timestamp(&row, "updated_at")?,
    })
}

fn map_warm_pool_metadata(row: SqliteRow) -> Result<WarmPoolMetadata> {
    Ok(WarmPoolMetadata {
        id: row.get("id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        namespace: row.get("namespace"),
        runtime: row.get("runtime"),
        min_size: row.get("min_size"),
        max_size: row.get("max_size"),
        created_at: parse_timestamp(&row, "created_at")?,
        updated_at: parse_timestamp(&row, "updated_at")?,
    })
}
