//! Matflow pipeline core
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Resumable fetch, transform and export of materials records.
//!
//! ```text
//! SourceConnector -> FetchPool -> RawStore -> TransformPool -> CanonicalStore -> ExportPipeline -> Uploader
//! ```
//!
//! Every stage claims units of work (pages, batches, chunks) in order, runs
//! them on a bounded worker pool and advances a per-(job, table) checkpoint
//! over the contiguous prefix of durably written units. Units that keep
//! failing are written to the [`failure_log`] and skipped; only the
//! conditions in [`error::PipelineError`] abort a job.
//!
//! # Example
//!
//! ```no_run
//! use matflow_pipeline::checkpoint::MemoryCheckpointStore;
//! use matflow_pipeline::failure_log::MemoryFailureLog;
//! use matflow_pipeline::source::PaginatedApiSource;
//! use matflow_pipeline::store::MemoryStore;
//! use matflow_pipeline::{FetchPool, JobConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let source = PaginatedApiSource::new(
//!     "alexandria",
//!     "https://alexandria.icams.rub.de/pbe/v1/structures",
//!     100,
//! )?;
//! let config = JobConfig {
//!     job_name: "alexandria".to_string(),
//!     table_name: "alexandria_raw".to_string(),
//!     limit: 100,
//!     ..JobConfig::default()
//! };
//! let report = FetchPool::new(
//!     Arc::new(source),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryCheckpointStore::new()),
//!     Arc::new(MemoryFailureLog::new()),
//!     config,
//! )
//! .run()
//! .await?;
//! println!("{} records written", report.records_written);
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod commit;
pub mod config;
pub mod error;
pub mod export;
pub mod failure_log;
pub mod fetch;
pub mod models;
pub mod retry;
pub mod source;
pub mod storage;
pub mod store;
pub mod transform;
pub mod versions;

pub use config::{AppConfig, JobConfig, SourceConfig};
pub use error::{PipelineError, SourceError, StoreError, UploadError};
pub use export::{ExportPipeline, ExportSplit, LocalDirUploader, S3Uploader, Uploader};
pub use fetch::FetchPool;
pub use models::{CanonicalRecord, Cursor, JobReport, RawRecord, Stage};
pub use retry::RetryPolicy;
pub use transform::{normalizer_for, TransformMode, TransformPool};
