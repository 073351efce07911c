use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use super::{Bookmark, DurableStore, StorageBackend, StoreError, StoreTxn};
use crate::models::WorkspaceId;

const SCHEMA_SQL: [&str; 3] = [
    "CREATE SEQUENCE IF NOT EXISTS workspace_kv_version",
    r#"
        CREATE TABLE IF NOT EXISTS workspace_kv (
            workspace TEXT NOT NULL,
            key TEXT NOT NULL,
            value JSONB NOT NULL,
            version BIGINT NOT NULL,
            PRIMARY KEY (workspace, key)
        )
    "#,
    r#"
        CREATE TABLE IF NOT EXISTS workspace_alarm (
            workspace TEXT PRIMARY KEY,
            fire_at TIMESTAMPTZ NOT NULL
        )
    "#,
];

const UPSERT_SQL: &str = r#"
    INSERT INTO workspace_kv (workspace, key, value, version)
    VALUES ($1, $2, $3, nextval('workspace_kv_version'))
    ON CONFLICT (workspace, key)
    DO UPDATE SET value = EXCLUDED.value, version = EXCLUDED.version
"#;

/// Versions are BIGINT in the database. Client supplied bookmarks beyond that
/// range are newer than anything stored rather than wrapping negative.
fn version_param(bookmark: Bookmark) -> i64 {
    i64::try_from(bookmark.version()).unwrap_or(i64::MAX)
}

/// Postgres-backed storage shared by every workspace of the process.
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Connect to the database and make sure the storage tables exist
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        let backend = Self { pool };
        backend.migrate().await?;
        Ok(backend)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_SQL {
            if let Err(e) = sqlx::query(statement).execute(&self.pool).await {
                error!("Failed to prepare workspace storage schema: {}", e);
                return Err(e.into());
            }
        }
        info!("Workspace storage schema ready");
        Ok(())
    }
}

impl StorageBackend for PostgresBackend {
    fn open(&self, workspace: &WorkspaceId) -> Arc<dyn DurableStore> {
        Arc::new(PostgresStore {
            pool: self.pool.clone(),
            workspace: workspace.to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

pub struct PostgresStore {
    pool: PgPool,
    workspace: String,
}

fn rows_to_entries(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<(String, Value)>, StoreError> {
    rows.into_iter()
        .map(|row| Ok((row.try_get::<String, _>("key")?, row.try_get::<Value, _>("value")?)))
        .collect()
}

#[async_trait]
impl DurableStore for PostgresStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT value FROM workspace_kv WHERE workspace = $1 AND key = $2")
            .bind(&self.workspace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<Value, _>("value")).transpose()?)
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        sqlx::query(UPSERT_SQL)
            .bind(&self.workspace)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM workspace_kv WHERE workspace = $1 AND key = $2")
            .bind(&self.workspace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let rows = sqlx::query(
            r#"
                SELECT key, value FROM workspace_kv
                WHERE workspace = $1 AND left(key, length($2)) = $2
                ORDER BY key
            "#,
        )
        .bind(&self.workspace)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        rows_to_entries(rows)
    }

    async fn list_since(&self, prefix: &str, since: Bookmark) -> Result<Vec<(String, Value)>, StoreError> {
        let rows = sqlx::query(
            r#"
                SELECT key, value FROM workspace_kv
                WHERE workspace = $1 AND left(key, length($2)) = $2 AND version > $3
                ORDER BY key
            "#,
        )
        .bind(&self.workspace)
        .bind(prefix)
        .bind(version_param(since))
        .fetch_all(&self.pool)
        .await?;
        rows_to_entries(rows)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTxn>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTxn {
            tx,
            workspace: self.workspace.clone(),
        }))
    }

    async fn set_alarm(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
                INSERT INTO workspace_alarm (workspace, fire_at) VALUES ($1, $2)
                ON CONFLICT (workspace) DO UPDATE SET fire_at = EXCLUDED.fire_at
            "#,
        )
        .bind(&self.workspace)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_alarm(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query("SELECT fire_at FROM workspace_alarm WHERE workspace = $1")
            .bind(&self.workspace)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<DateTime<Utc>, _>("fire_at")).transpose()?)
    }

    async fn delete_alarm(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workspace_alarm WHERE workspace = $1")
            .bind(&self.workspace)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bookmark(&self) -> Result<Bookmark, StoreError> {
        // The coordinator is the only writer of its workspace, so no write of
        // this workspace can be in flight below the sequence's last value.
        let row = sqlx::query(
            "SELECT CASE WHEN is_called THEN last_value ELSE 0 END AS version FROM workspace_kv_version",
        )
        .fetch_one(&self.pool)
        .await?;
        let version: i64 = row.try_get("version")?;
        Ok(Bookmark::from_version(version.max(0) as u64))
    }
}

struct PostgresTxn {
    tx: Transaction<'static, Postgres>,
    workspace: String,
}

#[async_trait]
impl StoreTxn for PostgresTxn {
    async fn get(&mut self, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT value FROM workspace_kv WHERE workspace = $1 AND key = $2 FOR UPDATE")
            .bind(&self.workspace)
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(|r| r.try_get::<Value, _>("value")).transpose()?)
    }

    async fn put(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        sqlx::query(UPSERT_SQL)
            .bind(&self.workspace)
            .bind(key)
            .bind(value)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workspace_kv WHERE workspace = $1 AND key = $2")
            .bind(&self.workspace)
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
