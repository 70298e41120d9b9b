//! Last synced version per dataset
//!
//! Fetch records the date of the newest source modification it stored,
//! keyed by raw table. Transform records the normalizer version under
//! `{canonical table}_transform`. Rows only change after a completed run.

use crate::error::StoreError;
use crate::models::DatasetVersion;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Version key for the canonical table a transform writes
pub fn transform_dataset(dest_table: &str) -> String {
    format!("{dest_table}_transform")
}

#[async_trait]
pub trait VersionStore: Send + Sync {
    async fn current(&self, dataset: &str) -> Result<Option<DatasetVersion>, StoreError>;

    /// Replace the version of `dataset` and stamp the sync time
    async fn record(&self, dataset: &str, version: &str) -> Result<(), StoreError>;
}

/// Versions in the `pipeline_versions` table
#[derive(Clone)]
pub struct PgVersionStore {
    pool: PgPool,
}

impl PgVersionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VersionStore for PgVersionStore {
    async fn current(&self, dataset: &str) -> Result<Option<DatasetVersion>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT version, synced_at
            FROM pipeline_versions
            WHERE dataset_name = $1
            "#,
        )
        .bind(dataset)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(DatasetVersion {
            dataset_name: dataset.to_string(),
            version: row.try_get("version")?,
            synced_at: row.try_get("synced_at")?,
        }))
    }

    async fn record(&self, dataset: &str, version: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_versions (dataset_name, version, synced_at, sync_status)
            VALUES ($1, $2, NOW(), 'completed')
            ON CONFLICT (dataset_name)
            DO UPDATE SET version = EXCLUDED.version,
                          synced_at = EXCLUDED.synced_at,
                          sync_status = EXCLUDED.sync_status
            "#,
        )
        .bind(dataset)
        .bind(version)
        .execute(&self.pool)
        .await?;

        debug!(dataset, version, "dataset version recorded");
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryVersionStore {
    versions: Mutex<HashMap<String, DatasetVersion>>,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn current(&self, dataset: &str) -> Result<Option<DatasetVersion>, StoreError> {
        Ok(self.versions.lock().await.get(dataset).cloned())
    }

    async fn record(&self, dataset: &str, version: &str) -> Result<(), StoreError> {
        self.versions.lock().await.insert(
            dataset.to_string(),
            DatasetVersion {
                dataset_name: dataset.to_string(),
                version: version.to_string(),
                synced_at: Utc::now(),
            },
        );
        Ok(())
    }
}

/// Store `version` for `dataset` unless it is already current
pub(crate) async fn advance(
    store: &dyn VersionStore,
    dataset: &str,
    version: &str,
) -> Result<bool, StoreError> {
    let current = store.current(dataset).await?;
    if current.as_ref().is_some_and(|c| c.version == version) {
        return Ok(false);
    }
    store.record(dataset, version).await?;
    Ok(true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_advance_only_writes_new_versions() {
        let store = MemoryVersionStore::new();
        assert!(store.current("alexandria_raw").await.unwrap().is_none());

        assert!(advance(&store, "alexandria_raw", "2024-05-13").await.unwrap());
        let first = store.current("alexandria_raw").await.unwrap().unwrap();
        assert!(!advance(&store, "alexandria_raw", "2024-05-13").await.unwrap());
        assert_eq!(store.current("alexandria_raw").await.unwrap().unwrap().synced_at, first.synced_at);

        assert!(advance(&store, "alexandria_raw", "2024-06-01").await.unwrap());
        assert_eq!(store.current("alexandria_raw").await.unwrap().unwrap().version, "2024-06-01");
        assert!(store.current(&transform_dataset("alexandria")).await.unwrap().is_none());
    }
}
