//! Postgres raw / canonical store (primary engine)

use super::{CanonicalStore, RawStore, TableName};
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::models::{CanonicalRecord, Cursor, Provenance, RawRecord, TaskRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Pipeline-state tables (checkpoints, failures)
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Rows per INSERT statement inside one canonical transaction
const CANONICAL_STATEMENT_ROWS: usize = 500;

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(&config.url)
        .await?;

    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Postgres pool created"
    );
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(e.into()))
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create a raw table if missing. Ids use byte ordering so keyset reads
    /// match the in-memory store.
    #[instrument(skip(self))]
    pub async fn ensure_raw_table(&self, table: &TableName) -> Result<(), StoreError> {
        let sql = format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
                id TEXT COLLATE "C" PRIMARY KEY,
                payload JSONB NOT NULL,
                source_cursor JSONB NOT NULL,
                fetched_at TIMESTAMPTZ NOT NULL
            )"#
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Expression index on the task foreign key, so joins stay index lookups
    #[instrument(skip(self))]
    pub async fn ensure_task_index(&self, table: &TableName, foreign_key: &str) -> Result<(), StoreError> {
        let key = TableName::new(foreign_key)?;
        let sql = format!(
            r#"CREATE INDEX IF NOT EXISTS "{table}_{key}_idx" ON "{table}" ((payload->>'{key}'))"#
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn ensure_canonical_table(&self, table: &TableName) -> Result<(), StoreError> {
        let sql = format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
                id TEXT COLLATE "C" PRIMARY KEY,
                structure JSONB NOT NULL,
                trajectory JSONB,
                provenance JSONB NOT NULL,
                content_hash TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }
}

/// Keep the last occurrence of each id; a single upsert statement may not
/// touch the same row twice.
pub(crate) fn dedup_by_id<'a, T, F>(records: &'a [T], id: F) -> Vec<&'a T>
where
    F: Fn(&T) -> &str,
{
    let mut last: HashMap<&str, usize> = HashMap::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        last.insert(id(record), i);
    }
    records
        .iter()
        .enumerate()
        .filter(|(i, record)| last.get(id(record)) == Some(i))
        .map(|(_, record)| record)
        .collect()
}

pub(crate) fn decode_cursor(table: &TableName, value: Value) -> Result<Cursor, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
        table: table.to_string(),
        reason: format!("bad source cursor: {e}"),
    })
}

fn raw_from_row(table: &TableName, row: &PgRow) -> Result<RawRecord, StoreError> {
    Ok(RawRecord {
        id: row.try_get("id")?,
        payload: row.try_get("payload")?,
        source_cursor: decode_cursor(table, row.try_get("source_cursor")?)?,
        fetched_at: row.try_get("fetched_at")?,
    })
}

fn canonical_from_row(table: &TableName, row: &PgRow) -> Result<CanonicalRecord, StoreError> {
    let provenance: Value = row.try_get("provenance")?;
    let trajectory: Option<Value> = row.try_get("trajectory")?;
    Ok(CanonicalRecord {
        id: row.try_get("id")?,
        structure: row.try_get("structure")?,
        trajectory: trajectory.map(serde_json::from_value).transpose()?,
        provenance: serde_json::from_value::<Provenance>(provenance).map_err(|e| {
            StoreError::Corrupt {
                table: table.to_string(),
                reason: format!("bad provenance: {e}"),
            }
        })?,
        content_hash: row.try_get("content_hash")?,
    })
}

#[async_trait]
impl RawStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert_raw(&self, table: &TableName, records: &[RawRecord]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let records = dedup_by_id(records, |r| r.id.as_str());

        let mut ids = Vec::with_capacity(records.len());
        let mut payloads = Vec::with_capacity(records.len());
        let mut cursors = Vec::with_capacity(records.len());
        let mut fetched = Vec::<DateTime<Utc>>::with_capacity(records.len());
        for record in records {
            ids.push(record.id.clone());
            payloads.push(record.payload.clone());
            cursors.push(serde_json::to_value(&record.source_cursor)?);
            fetched.push(record.fetched_at);
        }

        let sql = format!(
            r#"INSERT INTO "{table}" (id, payload, source_cursor, fetched_at)
               SELECT * FROM UNNEST($1::text[], $2::jsonb[], $3::jsonb[], $4::timestamptz[])
               ON CONFLICT (id) DO UPDATE
               SET payload = EXCLUDED.payload,
                   source_cursor = EXCLUDED.source_cursor,
                   fetched_at = EXCLUDED.fetched_at"#
        );
        let result = sqlx::query(&sql)
            .bind(ids)
            .bind(payloads)
            .bind(cursors)
            .bind(fetched)
            .execute(&self.pool)
            .await?;

        debug!(rows = result.rows_affected(), "raw upsert complete");
        Ok(result.rows_affected())
    }

    async fn read_raw(
        &self,
        table: &TableName,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, StoreError> {
        let sql = format!(
            r#"SELECT id, payload, source_cursor, fetched_at FROM "{table}"
               WHERE ($1::text IS NULL OR id > $1)
               ORDER BY id
               LIMIT $2"#
        );
        let rows = sqlx::query(&sql)
            .bind(after)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| raw_from_row(table, row)).collect()
    }

    async fn raw_id_at(&self, table: &TableName, position: u64) -> Result<Option<String>, StoreError> {
        let sql = format!(r#"SELECT id FROM "{table}" ORDER BY id OFFSET $1 LIMIT 1"#);
        let id = sqlx::query_scalar::<_, String>(&sql)
            .bind(position as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn tasks_for(
        &self,
        table: &TableName,
        foreign_key: &str,
        ids: &[String],
    ) -> Result<Vec<TaskRecord>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"SELECT id, payload, payload->>$1 AS material_id FROM "{table}"
               WHERE payload->>$1 = ANY($2)
               ORDER BY id"#
        );
        let rows = sqlx::query(&sql)
            .bind(foreign_key)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok::<_, StoreError>(TaskRecord {
                    material_id: row.try_get("material_id")?,
                    task_id: row.try_get("id")?,
                    payload: row.try_get("payload")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl CanonicalStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert_canonical(
        &self,
        table: &TableName,
        records: &[CanonicalRecord],
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let records = dedup_by_id(records, |r| r.id.as_str());
        let sql = format!(
            r#"INSERT INTO "{table}" (id, structure, trajectory, provenance, content_hash, updated_at)
               SELECT *, NOW() FROM UNNEST($1::text[], $2::jsonb[], $3::jsonb[], $4::jsonb[], $5::text[])
               ON CONFLICT (id) DO UPDATE
               SET structure = EXCLUDED.structure,
                   trajectory = EXCLUDED.trajectory,
                   provenance = EXCLUDED.provenance,
                   content_hash = EXCLUDED.content_hash,
                   updated_at = NOW()"#
        );

        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for chunk in records.chunks(CANONICAL_STATEMENT_ROWS) {
            let mut ids = Vec::with_capacity(chunk.len());
            let mut structures = Vec::with_capacity(chunk.len());
            let mut trajectories = Vec::<Option<Value>>::with_capacity(chunk.len());
            let mut provenance = Vec::with_capacity(chunk.len());
            let mut hashes = Vec::<Option<String>>::with_capacity(chunk.len());
            for record in chunk {
                ids.push(record.id.clone());
                structures.push(record.structure.clone());
                trajectories.push(
                    record
                        .trajectory
                        .as_ref()
                        .map(|states| Value::Array(states.clone())),
                );
                provenance.push(serde_json::to_value(&record.provenance)?);
                hashes.push(record.content_hash.clone());
            }

            let result = sqlx::query(&sql)
                .bind(ids)
                .bind(structures)
                .bind(trajectories)
                .bind(provenance)
                .bind(hashes)
                .execute(&mut *tx)
                .await?;
            affected += result.rows_affected();
        }
        tx.commit().await?;

        debug!(rows = affected, "canonical upsert committed");
        Ok(affected)
    }

    async fn read_canonical(
        &self,
        table: &TableName,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, StoreError> {
        let sql = format!(
            r#"SELECT id, structure, trajectory, provenance, content_hash FROM "{table}"
               WHERE ($1::text IS NULL OR id > $1)
               ORDER BY id
               LIMIT $2"#
        );
        let rows = sqlx::query(&sql)
            .bind(after)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| canonical_from_row(table, row)).collect()
    }

    async fn canonical_id_at(
        &self,
        table: &TableName,
        position: u64,
    ) -> Result<Option<String>, StoreError> {
        let sql = format!(r#"SELECT id FROM "{table}" ORDER BY id OFFSET $1 LIMIT 1"#);
        let id = sqlx::query_scalar::<_, String>(&sql)
            .bind(position as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn count_canonical(&self, table: &TableName) -> Result<u64, StoreError> {
        let sql = format!(r#"SELECT COUNT(*) FROM "{table}""#);
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }
}
