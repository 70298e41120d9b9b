//! MySQL raw / canonical store (secondary engine)
//!
//! Same contract as the Postgres store. Batches are written with multi-row
//! `INSERT ... ON DUPLICATE KEY UPDATE` built through `QueryBuilder`.

use super::postgres::{decode_cursor, dedup_by_id};
use super::{foreign_key_of, CanonicalStore, RawStore, TableName};
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::models::{CanonicalRecord, Provenance, RawRecord, TaskRecord};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::{MySql, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{QueryBuilder, Row};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Rows per statement; keeps placeholder counts well under the protocol limit
const STATEMENT_ROWS: usize = 500;

#[derive(Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect(&config.url)
            .await?;
        info!(max_connections = config.max_connections, "MySQL pool created");
        Ok(Self::new(pool))
    }

    #[instrument(skip(self))]
    pub async fn ensure_raw_table(&self, table: &TableName) -> Result<(), StoreError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS `{table}` (
                id VARCHAR(191) CHARACTER SET ascii COLLATE ascii_bin PRIMARY KEY,
                payload JSON NOT NULL,
                source_cursor JSON NOT NULL,
                fetched_at TIMESTAMP(6) NOT NULL
            )"
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn ensure_canonical_table(&self, table: &TableName) -> Result<(), StoreError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS `{table}` (
                id VARCHAR(191) CHARACTER SET ascii COLLATE ascii_bin PRIMARY KEY,
                structure JSON NOT NULL,
                trajectory JSON NULL,
                provenance JSON NOT NULL,
                content_hash CHAR(64) NULL,
                updated_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6)
            )"
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }
}

fn raw_from_row(table: &TableName, row: &MySqlRow) -> Result<RawRecord, StoreError> {
    Ok(RawRecord {
        id: row.try_get("id")?,
        payload: row.try_get("payload")?,
        source_cursor: decode_cursor(table, row.try_get("source_cursor")?)?,
        fetched_at: row.try_get("fetched_at")?,
    })
}

#[async_trait]
impl RawStore for MySqlStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert_raw(&self, table: &TableName, records: &[RawRecord]) -> Result<u64, StoreError> {
        let records = dedup_by_id(records, |r| r.id.as_str());
        let mut affected = 0;
        for chunk in records.chunks(STATEMENT_ROWS) {
            let mut cursors = Vec::with_capacity(chunk.len());
            for record in chunk {
                cursors.push(serde_json::to_value(&record.source_cursor)?);
            }

            let mut builder: QueryBuilder<MySql> = QueryBuilder::new(format!(
                "INSERT INTO `{table}` (id, payload, source_cursor, fetched_at) "
            ));
            builder.push_values(chunk.iter().zip(cursors), |mut row, (record, cursor)| {
                row.push_bind(record.id.clone())
                    .push_bind(record.payload.clone())
                    .push_bind(cursor)
                    .push_bind(record.fetched_at);
            });
            builder.push(
                " ON DUPLICATE KEY UPDATE payload = VALUES(payload), \
                 source_cursor = VALUES(source_cursor), fetched_at = VALUES(fetched_at)",
            );
            affected += builder.build().execute(&self.pool).await?.rows_affected();
        }
        debug!(rows = affected, "raw upsert complete");
        Ok(affected)
    }

    async fn read_raw(
        &self,
        table: &TableName,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, StoreError> {
        let rows = match after {
            Some(after) => {
                let sql = format!(
                    "SELECT id, payload, source_cursor, fetched_at FROM `{table}` \
                     WHERE id > ? ORDER BY id LIMIT ?"
                );
                sqlx::query(&sql)
                    .bind(after)
                    .bind(limit as u64)
                    .fetch_all(&self.pool)
                    .await?
            },
            None => {
                let sql = format!(
                    "SELECT id, payload, source_cursor, fetched_at FROM `{table}` ORDER BY id LIMIT ?"
                );
                sqlx::query(&sql)
                    .bind(limit as u64)
                    .fetch_all(&self.pool)
                    .await?
            },
        };
        rows.iter().map(|row| raw_from_row(table, row)).collect()
    }

    async fn raw_id_at(&self, table: &TableName, position: u64) -> Result<Option<String>, StoreError> {
        let sql = format!("SELECT id FROM `{table}` ORDER BY id LIMIT 1 OFFSET ?");
        Ok(sqlx::query_scalar::<_, String>(&sql)
            .bind(position)
            .fetch_optional(&self.pool)
            .await?)
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
        let mut builder: QueryBuilder<MySql> = QueryBuilder::new(format!(
            "SELECT id, payload FROM `{table}` WHERE JSON_UNQUOTE(JSON_EXTRACT(payload, "
        ));
        builder.push_bind(format!("$.{foreign_key}"));
        builder.push(")) IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(") ORDER BY id");

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: Value = row.try_get("payload")?;
            let Some(material_id) = foreign_key_of(&payload, foreign_key) else {
                continue;
            };
            tasks.push(TaskRecord {
                material_id,
                task_id: row.try_get("id")?,
                payload,
            });
        }
        Ok(tasks)
    }
}

#[async_trait]
impl CanonicalStore for MySqlStore {
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
        let records = dedup_by_id(records, |r| r.id.as_str());
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for chunk in records.chunks(STATEMENT_ROWS) {
            let mut provenance = Vec::with_capacity(chunk.len());
            for record in chunk {
                provenance.push(serde_json::to_value(&record.provenance)?);
            }

            let mut builder: QueryBuilder<MySql> = QueryBuilder::new(format!(
                "INSERT INTO `{table}` (id, structure, trajectory, provenance, content_hash) "
            ));
            builder.push_values(chunk.iter().zip(provenance), |mut row, (record, prov)| {
                row.push_bind(record.id.clone())
                    .push_bind(record.structure.clone())
                    .push_bind(record.trajectory.clone().map(Value::Array))
                    .push_bind(prov)
                    .push_bind(record.content_hash.clone());
            });
            builder.push(
                " ON DUPLICATE KEY UPDATE structure = VALUES(structure), \
                 trajectory = VALUES(trajectory), provenance = VALUES(provenance), \
                 content_hash = VALUES(content_hash), updated_at = CURRENT_TIMESTAMP(6)",
            );
            affected += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn read_canonical(
        &self,
        table: &TableName,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, StoreError> {
        let sql = format!(
            "SELECT id, structure, trajectory, provenance, content_hash FROM `{table}` \
             WHERE id > ? ORDER BY id LIMIT ?"
        );
        // Empty string sorts before every id under a binary collation
        let rows = sqlx::query(&sql)
            .bind(after.unwrap_or(""))
            .bind(limit as u64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let trajectory: Option<Value> = row.try_get("trajectory")?;
                let provenance: Value = row.try_get("provenance")?;
                Ok::<_, StoreError>(CanonicalRecord {
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
            })
            .collect()
    }

    async fn canonical_id_at(
        &self,
        table: &TableName,
        position: u64,
    ) -> Result<Option<String>, StoreError> {
        let sql = format!("SELECT id FROM `{table}` ORDER BY id LIMIT 1 OFFSET ?");
        Ok(sqlx::query_scalar::<_, String>(&sql)
            .bind(position)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn count_canonical(&self, table: &TableName) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM `{table}`");
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }
}
