//! Append-only sinks for permanently failed units
//!
//! The pipeline only ever appends here. Entries exist for people and re-drive
//! tooling; nothing in the pipeline reads them back.

use crate::error::StoreError;
use crate::models::FailureEntry;
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

#[async_trait]
pub trait FailureLog: Send + Sync {
    async fn append(&self, entry: &FailureEntry) -> Result<(), StoreError>;
}

/// Rows in the `pipeline_failures` table
#[derive(Clone)]
pub struct PgFailureLog {
    pool: PgPool,
}

impl PgFailureLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FailureLog for PgFailureLog {
    async fn append(&self, entry: &FailureEntry) -> Result<(), StoreError> {
        let cursor = entry.cursor.as_ref().map(serde_json::to_value).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO pipeline_failures
                (job_name, table_name, url_or_id, cursor, attempt_count, last_error, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&entry.job_name)
        .bind(&entry.table_name)
        .bind(&entry.url_or_id)
        .bind(cursor)
        .bind(entry.attempt_count as i32)
        .bind(&entry.last_error)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;

        warn!(
            job = %entry.job_name,
            table = %entry.table_name,
            unit = %entry.url_or_id,
            attempts = entry.attempt_count,
            error = %entry.last_error,
            "unit failed permanently"
        );
        Ok(())
    }
}

/// One JSON object per line, synced to disk after every entry
pub struct JsonlFailureLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlFailureLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FailureLog for JsonlFailureLog {
    async fn append(&self, entry: &FailureEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_data().await?;

        warn!(
            job = %entry.job_name,
            unit = %entry.url_or_id,
            attempts = entry.attempt_count,
            error = %entry.last_error,
            "unit failed permanently"
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryFailureLog {
    entries: Mutex<Vec<FailureEntry>>,
}

impl MemoryFailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<FailureEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl FailureLog for MemoryFailureLog {
    async fn append(&self, entry: &FailureEntry) -> Result<(), StoreError> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::Cursor;

    #[tokio::test]
    async fn test_jsonl_log_appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures").join("fetch.jsonl");

        let log = JsonlFailureLog::open(&path).await.unwrap();
        log.append(&FailureEntry::new("alexandria", "raw", "page-3", 4, "503").at(Cursor::Offset(30)))
            .await
            .unwrap();
        drop(log);

        let log = JsonlFailureLog::open(&path).await.unwrap();
        log.append(&FailureEntry::new("alexandria", "raw", "agm42", 1, "missing id"))
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let entries: Vec<FailureEntry> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].cursor, Some(Cursor::Offset(30)));
        assert_eq!(entries[0].attempt_count, 4);
        assert_eq!(entries[1].url_or_id, "agm42");
    }

    #[tokio::test]
    async fn test_entry_is_on_disk_when_append_returns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transform.jsonl");
        let log = JsonlFailureLog::open(&path).await.unwrap();

        log.append(&FailureEntry::new("mp", "canonical", "mp-7", 1, "skipped: no task data"))
            .await
            .unwrap();

        // Read through a separate handle while the log stays open
        let content = std::fs::read_to_string(log.path()).unwrap();
        let entry: FailureEntry = serde_json::from_str(content.trim_end()).unwrap();
        assert_eq!(entry.url_or_id, "mp-7");
        assert!(content.ends_with('\n'));
    }
}
