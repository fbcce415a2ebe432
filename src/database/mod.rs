use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::PersistenceError;
use crate::models::ApiCallRecord;

/// Metadata key the usage snapshot lives under
pub const USAGE_STORAGE_KEY: &str = "api_usage_tracker";

/// Everything the ledger persists, written wholesale on every append
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    #[serde(default)]
    pub api_calls: Vec<ApiCallRecord>,
    pub last_saved: DateTime<Utc>,
}

/// Durable home of the usage snapshot
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet
    async fn load(&self) -> Result<Option<UsageSnapshot>, PersistenceError>;
    async fn save(&self, snapshot: &UsageSnapshot) -> Result<(), PersistenceError>;
}

/// SQLite-backed store using a single row of the `metadata` table
#[derive(Clone)]
pub struct SqliteUsageStore {
    pool: SqlitePool,
}

impl SqliteUsageStore {
    /// Open (creating if needed) the database file at `database_path`
    pub async fn connect(database_path: &str) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_schema().await?;
        info!("Usage store opened at {}", database_path);
        Ok(store)
    }

    /// Private in-memory database, gone when the store is dropped
    pub async fn in_memory() -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UsageStore for SqliteUsageStore {
    async fn load(&self) -> Result<Option<UsageSnapshot>, PersistenceError> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = ?")
            .bind(USAGE_STORAGE_KEY)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let value: String = row.get("value");
                Ok(Some(serde_json::from_str(&value)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, snapshot: &UsageSnapshot) -> Result<(), PersistenceError> {
        let value = serde_json::to_string(snapshot)?;
        sqlx::query(
            r#"
            INSERT INTO metadata (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(USAGE_STORAGE_KEY)
        .bind(value)
        .bind(snapshot.last_saved)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Process-local store for tests and throwaway sessions
#[derive(Default)]
pub struct MemoryUsageStore {
    snapshot: Mutex<Option<UsageSnapshot>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: UsageSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
        }
    }

    /// Last snapshot written, if any
    pub async fn snapshot(&self) -> Option<UsageSnapshot> {
        self.snapshot.lock().await.clone()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn load(&self) -> Result<Option<UsageSnapshot>, PersistenceError> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn save(&self, snapshot: &UsageSnapshot) -> Result<(), PersistenceError> {
        *self.snapshot.lock().await = Some(snapshot.clone());
        Ok(())
    }
}
