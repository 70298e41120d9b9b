//! Adapter wiring for one stage run

use crate::cli::{Engine, SourceKind, Target};
use anyhow::{bail, Context, Result};
use matflow_pipeline::checkpoint::{CheckpointStore, PgCheckpointStore};
use matflow_pipeline::failure_log::{FailureLog, JsonlFailureLog, PgFailureLog};
use matflow_pipeline::source;
use matflow_pipeline::storage::ObjectStorage;
use matflow_pipeline::store::mysql::MySqlStore;
use matflow_pipeline::store::postgres::{create_pool, run_migrations, PgStore};
use matflow_pipeline::store::{CanonicalStore, RawStore, TableName};
use matflow_pipeline::versions::{PgVersionStore, VersionStore};
use matflow_pipeline::{
    normalizer_for, AppConfig, ExportPipeline, ExportSplit, FetchPool, JobReport, LocalDirUploader, S3Uploader,
    TransformMode, TransformPool, Uploader,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Table engine behind the raw / canonical traits
enum Tables {
    Postgres(Arc<PgStore>),
    MySql(Arc<MySqlStore>),
}

impl Tables {
    fn raw(&self) -> Arc<dyn RawStore> {
        match self {
            Tables::Postgres(store) => store.clone(),
            Tables::MySql(store) => store.clone(),
        }
    }

    fn canonical(&self) -> Arc<dyn CanonicalStore> {
        match self {
            Tables::Postgres(store) => store.clone(),
            Tables::MySql(store) => store.clone(),
        }
    }

    async fn ensure_raw(&self, table: &TableName) -> Result<()> {
        match self {
            Tables::Postgres(store) => store.ensure_raw_table(table).await?,
            Tables::MySql(store) => store.ensure_raw_table(table).await?,
        }
        Ok(())
    }

    async fn ensure_canonical(&self, table: &TableName) -> Result<()> {
        match self {
            Tables::Postgres(store) => store.ensure_canonical_table(table).await?,
            Tables::MySql(store) => store.ensure_canonical_table(table).await?,
        }
        Ok(())
    }
}

/// Connections shared by every stage
pub struct Runtime {
    config: AppConfig,
    tables: Tables,
    checkpoints: Arc<dyn CheckpointStore>,
    failures: Arc<dyn FailureLog>,
    versions: Arc<dyn VersionStore>,
    cancel: CancellationToken,
}

impl Runtime {
    /// Connect to the state database, apply migrations and pick the table engine.
    pub async fn connect(config: AppConfig, engine: Engine, cancel: CancellationToken) -> Result<Self> {
        let pool = create_pool(&config.database)
            .await
            .context("Failed to connect to the state database")?;
        run_migrations(&pool).await.context("Failed to run migrations")?;

        let tables = match engine {
            Engine::Postgres => Tables::Postgres(Arc::new(PgStore::new(pool.clone()))),
            Engine::Mysql => {
                let mysql = config
                    .mysql
                    .as_ref()
                    .context("--engine mysql needs MATFLOW_MYSQL_URL")?;
                Tables::MySql(Arc::new(MySqlStore::connect(mysql).await?))
            },
        };

        let failures: Arc<dyn FailureLog> = match &config.failure_log_path {
            Some(path) => {
                info!(path = %path.display(), "appending failures to file");
                Arc::new(JsonlFailureLog::open(path).await?)
            },
            None => Arc::new(PgFailureLog::new(pool.clone())),
        };

        Ok(Self {
            checkpoints: Arc::new(PgCheckpointStore::new(pool.clone())),
            versions: Arc::new(PgVersionStore::new(pool)),
            config,
            tables,
            failures,
            cancel,
        })
    }

    pub async fn fetch(&self, kind: SourceKind, name: &str) -> Result<JobReport> {
        let job = &self.config.job;
        let settings = &self.config.sources;
        let source_config = match kind {
            SourceKind::Api => settings.paginated_api(name, job.limit)?,
            SourceKind::Bucket => settings.bucket_listing(name, &self.config.storage)?,
            SourceKind::Archive => settings.bulk_archive(name, job.limit)?,
        };
        let connector = source::connect(&source_config)
            .await
            .with_context(|| format!("Failed to set up source '{name}'"))?;

        self.tables.ensure_raw(&table(&job.table_name, "--table")?).await?;

        let report = FetchPool::new(
            connector,
            self.tables.raw(),
            self.checkpoints.clone(),
            self.failures.clone(),
            job.clone(),
        )
        .with_versions(self.versions.clone())
        .with_cancellation(self.cancel.clone())
        .run()
        .await?;
        Ok(report)
    }

    pub async fn transform(&self, mode: TransformMode, name: &str) -> Result<JobReport> {
        let job = &self.config.job;
        self.tables
            .ensure_canonical(&table(&job.dest_table_name, "--dest-table")?)
            .await?;
        if let (Tables::Postgres(store), Some(tasks)) = (&self.tables, &job.task_table_name) {
            store
                .ensure_task_index(&table(tasks, "--task-table")?, &job.task_foreign_key)
                .await?;
        }

        let report = TransformPool::new(
            self.tables.raw(),
            self.tables.canonical(),
            self.checkpoints.clone(),
            self.failures.clone(),
            normalizer_for(name, mode),
            job.clone(),
        )
        .with_versions(self.versions.clone())
        .with_cancellation(self.cancel.clone())
        .run()
        .await?;
        Ok(report)
    }

    pub async fn export(
        &self,
        target: Target,
        destination: &str,
        split: Option<&str>,
        output_dir: &Path,
        prefix: &str,
    ) -> Result<JobReport> {
        let split = split.map(ExportSplit::named).transpose()?;
        let uploader: Arc<dyn Uploader> = match target {
            Target::Local => Arc::new(LocalDirUploader::new(output_dir)),
            Target::S3 => {
                if self.config.storage.bucket.is_empty() {
                    bail!("--target s3 needs MATFLOW_S3_BUCKET");
                }
                let storage = ObjectStorage::new(&self.config.storage).await?;
                Arc::new(S3Uploader::new(storage, prefix))
            },
        };

        let mut pipeline = ExportPipeline::new(
            self.tables.canonical(),
            self.checkpoints.clone(),
            self.failures.clone(),
            uploader,
            self.config.job.clone(),
            destination,
        )
        .with_cancellation(self.cancel.clone());
        if let Some(split) = split {
            pipeline = pipeline.with_split(split);
        }
        let report = pipeline.run().await?;
        Ok(report)
    }
}

fn table(name: &str, flag: &str) -> Result<TableName> {
    if name.is_empty() {
        bail!("no table given; pass {flag} or set it in the environment");
    }
    Ok(TableName::new(name)?)
}
