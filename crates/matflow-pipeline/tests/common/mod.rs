//! Shared helpers for matflow-pipeline integration tests
//!
//! - [`CatalogSource`]: deterministic offset source with scriptable failures
//! - [`Stores`]: in-memory raw / canonical store, checkpoints and failure log
//! - [`TestPostgres`]: Postgres container with migrations applied (Docker)

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use matflow_pipeline::checkpoint::MemoryCheckpointStore;
use matflow_pipeline::failure_log::MemoryFailureLog;
use matflow_pipeline::source::{FetchedPage, PagePlan, PageSpec, SourceConnector};
use matflow_pipeline::store::postgres::run_migrations;
use matflow_pipeline::store::{MemoryStore, TableName};
use matflow_pipeline::{Cursor, JobConfig, RawRecord, SourceError};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Mutex;
use tracing::info;

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,matflow_pipeline=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// OPTIMADE attributes of a rock-salt cell
pub fn rock_salt(a: f64, cation: &str, anion: &str) -> Value {
    json!({
        "lattice_vectors": [[a, 0.0, 0.0], [0.0, a, 0.0], [0.0, 0.0, a]],
        "species_at_sites": [cation, anion],
        "cartesian_site_positions": [[0.0, 0.0, 0.0], [a / 2.0, a / 2.0, a / 2.0]],
        "chemical_formula_reduced": format!("{anion}{cation}"),
        "_alexandria_energy": -a,
    })
}

/// Record `i` of a [`CatalogSource`]; depends on nothing but `i`
pub fn catalog_item(i: i64) -> Value {
    json!({
        "id": format!("agm{i:05}"),
        "type": "structures",
        "attributes": rock_salt(4.0 + i as f64 / 100.0, "Na", "Cl"),
    })
}

/// Offset-paged source over `total` deterministic items
pub struct CatalogSource {
    total: i64,
    limit: i64,
    /// Per-offset scripted errors, consumed front to back
    failures: Mutex<HashMap<i64, Vec<SourceError>>>,
    always_failing: Option<SourceError>,
    pub calls: AtomicU32,
}

impl CatalogSource {
    pub fn new(total: i64, limit: i64) -> Self {
        Self {
            total,
            limit,
            failures: Mutex::new(HashMap::new()),
            always_failing: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Every page fails with `error`
    pub fn broken(total: i64, limit: i64, error: SourceError) -> Self {
        Self {
            always_failing: Some(error),
            ..Self::new(total, limit)
        }
    }

    pub async fn fail_at(&self, offset: i64, errors: Vec<SourceError>) {
        self.failures.lock().await.insert(offset, errors);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceConnector for CatalogSource {
    fn name(&self) -> &str {
        "catalog"
    }

    async fn open(&self, start: &Cursor) -> Result<PagePlan, SourceError> {
        let next = start
            .as_offset()
            .ok_or_else(|| SourceError::Fatal(format!("unexpected cursor {start}")))?;
        Ok(PagePlan::Offsets {
            next,
            limit: self.limit,
        })
    }

    async fn fetch_page(&self, page: &PageSpec) -> Result<FetchedPage, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.always_failing {
            return Err(error.clone());
        }
        let offset = page
            .start
            .as_offset()
            .ok_or_else(|| SourceError::Fatal("token cursor".to_string()))?;
        if let Some(errors) = self.failures.lock().await.get_mut(&offset) {
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }
        let end = (offset + self.limit).min(self.total).max(offset);
        let records = (offset..end)
            .map(|i| {
                let item = catalog_item(i);
                let id = item["id"].as_str().unwrap_or_default().to_string();
                RawRecord::new(id, item, page.start.clone())
            })
            .collect();
        Ok(FetchedPage {
            records,
            rejects: Vec::new(),
            next: Cursor::Offset(end),
            last: end - offset < self.limit,
        })
    }
}

pub struct Stores {
    pub store: Arc<MemoryStore>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub failures: Arc<MemoryFailureLog>,
}

impl Stores {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            failures: Arc::new(MemoryFailureLog::new()),
        }
    }

    /// Raw rows without `fetched_at`, which differs from run to run
    pub async fn raw_snapshot(&self, table: &str) -> Vec<(String, Value, Cursor)> {
        self.store
            .raw_rows(&table_name(table))
            .await
            .into_iter()
            .map(|r| (r.id, r.payload, r.source_cursor))
            .collect()
    }

    pub async fn canonical_ids(&self, table: &str) -> Vec<String> {
        self.store
            .canonical_rows(&table_name(table))
            .await
            .into_iter()
            .map(|r| r.id)
            .collect()
    }
}

pub fn table_name(name: &str) -> TableName {
    TableName::new(name).unwrap_or_else(|e| panic!("bad table name {name}: {e}"))
}

/// Job settings with short retry delays
pub fn job(name: &str) -> JobConfig {
    JobConfig {
        job_name: name.to_string(),
        table_name: "raw".to_string(),
        dest_table_name: "canonical".to_string(),
        num_workers: 3,
        max_retries: 2,
        retry_delay: Duration::from_millis(20),
        limit: 10,
        ..JobConfig::default()
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");
        info!(url = %url, "PostgreSQL container started");

        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        run_migrations(&pool).await?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }
}
