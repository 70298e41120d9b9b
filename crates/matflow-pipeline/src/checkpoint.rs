//! Durable resume positions keyed by (job, table)

use crate::error::StoreError;
use crate::models::{Checkpoint, Cursor};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::debug;

const CHECKPOINT_TABLE: &str = "pipeline_checkpoints";

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The stored checkpoint, if this (job, table) pair ever committed one
    async fn load(&self, job: &str, table: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Atomically replace the cursor for (job, table)
    async fn save(&self, job: &str, table: &str, cursor: &Cursor) -> Result<(), StoreError>;
}

/// Checkpoints in the `pipeline_checkpoints` table
#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, job: &str, table: &str) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT cursor, updated_at
            FROM pipeline_checkpoints
            WHERE job_name = $1 AND table_name = $2
            "#,
        )
        .bind(job)
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: Value = row.try_get("cursor")?;
        let cursor = serde_json::from_value(raw).map_err(|e| StoreError::Corrupt {
            table: CHECKPOINT_TABLE.to_string(),
            reason: format!("{job}/{table}: {e}"),
        })?;

        Ok(Some(Checkpoint {
            job_name: job.to_string(),
            table_name: table.to_string(),
            cursor,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn save(&self, job: &str, table: &str, cursor: &Cursor) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_checkpoints (job_name, table_name, cursor, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (job_name, table_name)
            DO UPDATE SET cursor = EXCLUDED.cursor, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(job)
        .bind(table)
        .bind(serde_json::to_value(cursor)?)
        .execute(&self.pool)
        .await?;

        debug!(job, table, cursor = %cursor, "checkpoint saved");
        Ok(())
    }
}

/// Process-local checkpoints; keeps every saved cursor for inspection
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<MemoryCheckpoints>,
}

#[derive(Default)]
struct MemoryCheckpoints {
    current: HashMap<(String, String), Checkpoint>,
    history: HashMap<(String, String), Vec<Cursor>>,
    corrupt: HashSet<(String, String)>,
    failing_saves: u32,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` saves fail
    pub async fn fail_saves(&self, n: u32) {
        self.inner.lock().await.failing_saves = n;
    }

    /// Make loads for (job, table) report an undecodable cursor
    pub async fn corrupt(&self, job: &str, table: &str) {
        self.inner
            .lock()
            .await
            .corrupt
            .insert((job.to_string(), table.to_string()));
    }

    /// Every cursor saved for (job, table), oldest first
    pub async fn history(&self, job: &str, table: &str) -> Vec<Cursor> {
        self.inner
            .lock()
            .await
            .history
            .get(&(job.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, job: &str, table: &str) -> Result<Option<Checkpoint>, StoreError> {
        let inner = self.inner.lock().await;
        let key = (job.to_string(), table.to_string());
        if inner.corrupt.contains(&key) {
            return Err(StoreError::Corrupt {
                table: CHECKPOINT_TABLE.to_string(),
                reason: format!("cursor for {job}/{table} cannot be decoded"),
            });
        }
        Ok(inner.current.get(&key).cloned())
    }

    async fn save(&self, job: &str, table: &str, cursor: &Cursor) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.failing_saves > 0 {
            inner.failing_saves -= 1;
            return Err(StoreError::Unavailable("injected checkpoint failure".to_string()));
        }
        let key = (job.to_string(), table.to_string());
        inner.current.insert(
            key.clone(),
            Checkpoint {
                job_name: job.to_string(),
                table_name: table.to_string(),
                cursor: cursor.clone(),
                updated_at: Utc::now(),
            },
        );
        inner.history.entry(key).or_default().push(cursor.clone());
        Ok(())
    }
}
