//! Configuration management
//!
//! [`AppConfig::load`] is the only place that reads the process environment.
//! Every stage receives an explicit [`JobConfig`] and never looks at ambient
//! state on its own.

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Job Defaults
// ============================================================================

pub const DEFAULT_NUM_WORKERS: usize = 2;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 2;
pub const DEFAULT_LOG_EVERY: u64 = 1000;
/// Records requested per API page
pub const DEFAULT_PAGE_LIMIT: i64 = 10;
pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// Rows per read while paging through a raw table
pub const DEFAULT_DB_FETCH_BATCH_SIZE: usize = 100;
pub const DEFAULT_CHUNK_SIZE: usize = 1000;
/// JSON field linking task rows to their material
pub const DEFAULT_TASK_FOREIGN_KEY: &str = "material_id";
pub const DEFAULT_ID_FIELD: &str = "material_id";

// ============================================================================
// Database / Storage Defaults
// ============================================================================

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/matflow";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_S3_REGION: &str = "us-east-1";
pub const DEFAULT_DOWNLOAD_DIR: &str = "./data/downloads";

/// Per-job parameters shared by all three stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_name: String,
    pub num_workers: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub batch_size: usize,
    pub db_fetch_batch_size: usize,
    pub log_every: u64,
    /// Explicit start position; overrides the stored checkpoint
    pub offset: Option<i64>,
    /// Page size requested from paginated sources
    pub limit: i64,
    pub table_name: String,
    pub dest_table_name: String,
    pub task_table_name: Option<String>,
    pub task_foreign_key: String,
    pub chunk_size: usize,
    pub max_rows: Option<u64>,
    /// Run every unit on the calling task, one at a time
    pub debug: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_name: "matflow".to_string(),
            num_workers: DEFAULT_NUM_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            batch_size: DEFAULT_BATCH_SIZE,
            db_fetch_batch_size: DEFAULT_DB_FETCH_BATCH_SIZE,
            log_every: DEFAULT_LOG_EVERY,
            offset: None,
            limit: DEFAULT_PAGE_LIMIT,
            table_name: String::new(),
            dest_table_name: String::new(),
            task_table_name: None,
            task_foreign_key: DEFAULT_TASK_FOREIGN_KEY.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_rows: None,
            debug: false,
        }
    }
}

impl JobConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay)
    }

    /// Worker count after applying debug mode
    pub fn workers(&self) -> usize {
        if self.debug {
            1
        } else {
            self.num_workers.max(1)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_name.trim().is_empty() {
            return Err(ConfigError::Missing("job_name"));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::invalid("num_workers", "must be at least 1"));
        }
        if self.limit <= 0 {
            return Err(ConfigError::invalid("limit", "must be positive"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be positive"));
        }
        if self.db_fetch_batch_size == 0 {
            return Err(ConfigError::invalid("db_fetch_batch_size", "must be positive"));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::invalid("chunk_size", "must be positive"));
        }
        if self.log_every == 0 {
            return Err(ConfigError::invalid("log_every", "must be positive"));
        }
        if matches!(self.offset, Some(offset) if offset < 0) {
            return Err(ConfigError::invalid("offset", "must not be negative"));
        }
        Ok(())
    }
}

/// Connection settings for one relational engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
        }
    }

    fn validate(&self, key: &'static str) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Missing(key));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::invalid(key, "max_connections must be greater than 0"));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::invalid(
                key,
                format!(
                    "min_connections ({}) cannot exceed max_connections ({})",
                    self.min_connections, self.max_connections
                ),
            ));
        }
        Ok(())
    }
}

/// S3-compatible object storage settings.
///
/// Without an access key the client signs nothing, which is what public
/// open-data buckets expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl StorageConfig {
    pub fn public(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            region: region.into(),
            bucket: bucket.into(),
            access_key: None,
            secret_key: None,
            path_style: false,
        }
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: DEFAULT_S3_REGION.to_string(),
            bucket: bucket.into(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
        }
    }
}

/// Connector variant selected at job configuration time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    PaginatedApi {
        name: String,
        base_url: String,
        limit: i64,
    },
    BucketListing {
        name: String,
        /// `storage.bucket` is the bucket to list
        storage: StorageConfig,
        bucket_prefix: String,
        id_field: String,
    },
    BulkArchive {
        name: String,
        archive_url: String,
        download_dir: PathBuf,
        limit: i64,
        id_field: String,
    },
}

impl SourceConfig {
    pub fn name(&self) -> &str {
        match self {
            SourceConfig::PaginatedApi { name, .. }
            | SourceConfig::BucketListing { name, .. }
            | SourceConfig::BulkArchive { name, .. } => name,
        }
    }
}

/// Source settings as found in the environment, before a variant is chosen
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    pub base_url: Option<String>,
    pub bucket_name: Option<String>,
    pub bucket_prefix: Option<String>,
    pub archive_url: Option<String>,
    pub download_dir: PathBuf,
    pub id_field: String,
}

impl SourceSettings {
    pub fn paginated_api(&self, name: &str, limit: i64) -> Result<SourceConfig, ConfigError> {
        Ok(SourceConfig::PaginatedApi {
            name: name.to_string(),
            base_url: self.base_url.clone().ok_or(ConfigError::Missing("MATFLOW_API_BASE_URL"))?,
            limit,
        })
    }

    pub fn bucket_listing(
        &self,
        name: &str,
        storage: &StorageConfig,
    ) -> Result<SourceConfig, ConfigError> {
        let bucket = self
            .bucket_name
            .clone()
            .ok_or(ConfigError::Missing("MATFLOW_BUCKET_NAME"))?;
        Ok(SourceConfig::BucketListing {
            name: name.to_string(),
            storage: StorageConfig {
                bucket,
                ..storage.clone()
            },
            bucket_prefix: self.bucket_prefix.clone().unwrap_or_default(),
            id_field: self.id_field.clone(),
        })
    }

    pub fn bulk_archive(&self, name: &str, limit: i64) -> Result<SourceConfig, ConfigError> {
        Ok(SourceConfig::BulkArchive {
            name: name.to_string(),
            archive_url: self
                .archive_url
                .clone()
                .ok_or(ConfigError::Missing("MATFLOW_ARCHIVE_URL"))?,
            download_dir: self.download_dir.clone(),
            limit,
            id_field: self.id_field.clone(),
        })
    }
}

/// Everything a `matflow` process needs, loaded once at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    /// Secondary engine for sources kept in MySQL
    pub mysql: Option<DatabaseConfig>,
    /// Export / bucket credentials; `bucket` is the export bucket
    pub storage: StorageConfig,
    pub sources: SourceSettings,
    pub job: JobConfig,
    /// Append failures to this NDJSON file instead of the database
    pub failure_log_path: Option<PathBuf>,
}

impl AppConfig {
    /// Load `.env`, then read `MATFLOW_*` variables over the defaults
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `load` passes the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = JobConfig::default();

        let database = DatabaseConfig {
            url: env
                .string("MATFLOW_DATABASE_URL")
                .or_else(|| env.string("DATABASE_URL"))
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            max_connections: env
                .parse("MATFLOW_DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
            min_connections: env
                .parse("MATFLOW_DATABASE_MIN_CONNECTIONS")?
                .unwrap_or(DEFAULT_DATABASE_MIN_CONNECTIONS),
            connect_timeout_secs: env
                .parse("MATFLOW_DATABASE_CONNECT_TIMEOUT")?
                .unwrap_or(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
            idle_timeout_secs: env
                .parse("MATFLOW_DATABASE_IDLE_TIMEOUT")?
                .unwrap_or(DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
        };

        let mysql = env.string("MATFLOW_MYSQL_URL").map(DatabaseConfig::new);

        let storage = StorageConfig {
            endpoint: env.string("MATFLOW_S3_ENDPOINT"),
            region: env
                .string("MATFLOW_S3_REGION")
                .unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
            bucket: env.string("MATFLOW_S3_BUCKET").unwrap_or_default(),
            access_key: env
                .string("MATFLOW_S3_ACCESS_KEY")
                .or_else(|| env.string("AWS_ACCESS_KEY_ID")),
            secret_key: env
                .string("MATFLOW_S3_SECRET_KEY")
                .or_else(|| env.string("AWS_SECRET_ACCESS_KEY")),
            path_style: env.parse("MATFLOW_S3_PATH_STYLE")?.unwrap_or(false),
        };

        let sources = SourceSettings {
            base_url: env.string("MATFLOW_API_BASE_URL"),
            bucket_name: env.string("MATFLOW_BUCKET_NAME"),
            bucket_prefix: env.string("MATFLOW_BUCKET_PREFIX"),
            archive_url: env.string("MATFLOW_ARCHIVE_URL"),
            download_dir: env
                .string("MATFLOW_DOWNLOAD_DIR")
                .unwrap_or_else(|| DEFAULT_DOWNLOAD_DIR.to_string())
                .into(),
            id_field: env
                .string("MATFLOW_ID_FIELD")
                .unwrap_or_else(|| DEFAULT_ID_FIELD.to_string()),
        };

        let job = JobConfig {
            job_name: env.string("MATFLOW_JOB_NAME").unwrap_or(defaults.job_name),
            num_workers: env.parse("MATFLOW_NUM_WORKERS")?.unwrap_or(defaults.num_workers),
            max_retries: env.parse("MATFLOW_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            retry_delay: env
                .parse::<u64>("MATFLOW_RETRY_DELAY")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_delay),
            batch_size: env.parse("MATFLOW_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            db_fetch_batch_size: env
                .parse("MATFLOW_DB_FETCH_BATCH_SIZE")?
                .unwrap_or(defaults.db_fetch_batch_size),
            log_every: env.parse("MATFLOW_LOG_EVERY")?.unwrap_or(defaults.log_every),
            offset: env.parse("MATFLOW_OFFSET")?,
            limit: env.parse("MATFLOW_PAGE_LIMIT")?.unwrap_or(defaults.limit),
            table_name: env.string("MATFLOW_TABLE_NAME").unwrap_or_default(),
            dest_table_name: env.string("MATFLOW_DEST_TABLE_NAME").unwrap_or_default(),
            task_table_name: env.string("MATFLOW_TASK_TABLE_NAME"),
            task_foreign_key: env
                .string("MATFLOW_TASK_FOREIGN_KEY")
                .unwrap_or(defaults.task_foreign_key),
            chunk_size: env.parse("MATFLOW_CHUNK_SIZE")?.unwrap_or(defaults.chunk_size),
            max_rows: env.parse("MATFLOW_MAX_ROWS")?,
            debug: env.parse("MATFLOW_DEBUG")?.unwrap_or(false),
        };

        let config = Self {
            database,
            mysql,
            storage,
            sources,
            job,
            failure_log_path: env.string("MATFLOW_FAILURE_LOG").map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate("MATFLOW_DATABASE_URL")?;
        if let Some(mysql) = &self.mysql {
            mysql.validate("MATFLOW_MYSQL_URL")?;
        }
        self.job.validate()
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        self.string(key)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|e| ConfigError::invalid(key, format!("'{raw}': {e}")))
            })
            .transpose()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.job.max_retries, 3);
        assert_eq!(config.job.num_workers, 2);
        assert_eq!(config.job.retry_delay, Duration::from_secs(2));
        assert_eq!(config.job.log_every, 1000);
        assert_eq!(config.job.limit, 10);
        assert_eq!(config.job.batch_size, 1000);
        assert_eq!(config.job.db_fetch_batch_size, 100);
        assert_eq!(config.job.chunk_size, 1000);
        assert_eq!(config.database.url, DEFAULT_DATABASE_URL);
        assert!(config.mysql.is_none());
        assert!(config.storage.access_key.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("MATFLOW_NUM_WORKERS", "8"),
            ("MATFLOW_RETRY_DELAY", "5"),
            ("MATFLOW_TABLE_NAME", "alexandria_raw"),
            ("MATFLOW_TASK_TABLE_NAME", "mp_tasks"),
            ("MATFLOW_OFFSET", "200"),
            ("MATFLOW_MYSQL_URL", "mysql://root@localhost/oqmd"),
            ("AWS_ACCESS_KEY_ID", "key"),
        ]))
        .unwrap();
        assert_eq!(config.job.num_workers, 8);
        assert_eq!(config.job.retry_delay, Duration::from_secs(5));
        assert_eq!(config.job.table_name, "alexandria_raw");
        assert_eq!(config.job.task_table_name.as_deref(), Some("mp_tasks"));
        assert_eq!(config.job.offset, Some(200));
        assert_eq!(config.mysql.unwrap().url, "mysql://root@localhost/oqmd");
        assert_eq!(config.storage.access_key.as_deref(), Some("key"));
    }

    #[test]
    fn test_unparsable_value_names_the_key() {
        let err = AppConfig::from_lookup(lookup(&[("MATFLOW_NUM_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MATFLOW_NUM_WORKERS", .. }));
    }

    #[test]
    fn test_validation() {
        let zero_workers = AppConfig::from_lookup(lookup(&[("MATFLOW_NUM_WORKERS", "0")]));
        assert!(zero_workers.is_err());

        let negative = AppConfig::from_lookup(lookup(&[("MATFLOW_OFFSET", "-1")]));
        assert!(negative.is_err());

        let mut job = JobConfig::default();
        job.debug = true;
        job.num_workers = 6;
        assert_eq!(job.workers(), 1);
    }

    #[test]
    fn test_source_settings_require_their_options() {
        let settings = SourceSettings::default();
        assert_eq!(
            settings.paginated_api("alexandria", 10).unwrap_err(),
            ConfigError::Missing("MATFLOW_API_BASE_URL")
        );

        let settings = SourceSettings {
            bucket_name: Some("materialsproject-build".to_string()),
            bucket_prefix: Some("collections/2025-02-10/materials".to_string()),
            id_field: "material_id".to_string(),
            ..SourceSettings::default()
        };
        let storage = StorageConfig::public("exports", "us-east-1");
        match settings.bucket_listing("mp", &storage).unwrap() {
            SourceConfig::BucketListing { storage, bucket_prefix, .. } => {
                assert_eq!(storage.bucket, "materialsproject-build");
                assert_eq!(bucket_prefix, "collections/2025-02-10/materials");
            },
            other => panic!("unexpected source {other:?}"),
        }
    }
}
