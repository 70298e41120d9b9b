//! Transform stage: raw rows to canonical records
//!
//! One reader walks the raw table in id order with bounded reads and cuts the
//! rows into batches. Batches go to a worker pool that joins each row with
//! its task rows, normalizes it and upserts the results into the canonical
//! table in one transaction. A row the normalizer rejects is logged and the
//! rest of its batch carries on.
//!
//! The checkpoint is the id of the last row of the newest contiguous
//! persisted batch, keyed by (job, destination table). A run that was not
//! cancelled records the normalizer version as the dataset version of
//! `{destination table}_transform`.

pub mod join;
pub mod normalize;
pub mod optimade;
pub mod trajectory;

pub use join::{join_tasks, left_join, JoinedRow};
pub use normalize::{NormalizeError, Normalizer, Outcome, TransformMode};
pub use optimade::OptimadeNormalizer;
pub use trajectory::TrajectoryNormalizer;

use crate::checkpoint::CheckpointStore;
use crate::commit::{resume_point, CheckpointCommitter};
use crate::config::JobConfig;
use crate::error::{ConfigError, PipelineError};
use crate::failure_log::FailureLog;
use crate::models::{CanonicalRecord, Cursor, FailureEntry, JobReport, RawRecord, Stage};
use crate::retry::RetryPolicy;
use crate::store::{CanonicalStore, RawStore, TableName};
use crate::versions::{self, transform_dataset, VersionStore};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Shared by every batch of a run
struct BatchContext {
    raw: Arc<dyn RawStore>,
    canonical: Arc<dyn CanonicalStore>,
    normalizer: Arc<dyn Normalizer>,
    dest: TableName,
    task_table: Option<TableName>,
    foreign_key: String,
    retry: RetryPolicy,
}

/// A batch-wide step that exhausted its retries
struct BatchFailure {
    step: &'static str,
    ids: Vec<String>,
    attempts: u32,
    error: String,
}

struct BatchResult {
    index: u64,
    last_id: String,
    written: u64,
    /// (record id, reason) for rows the normalizer passed over
    skipped: Vec<(String, String)>,
    /// (record id, reason) for rows the normalizer refused
    rejected: Vec<(String, String)>,
    failed: Option<BatchFailure>,
}

impl BatchResult {
    fn new(index: u64, last_id: String) -> Self {
        Self {
            index,
            last_id,
            written: 0,
            skipped: Vec::new(),
            rejected: Vec::new(),
            failed: None,
        }
    }
}

/// Join, normalize and persist one batch
async fn process_batch(ctx: Arc<BatchContext>, index: u64, rows: Vec<RawRecord>) -> BatchResult {
    let last_id = rows.last().map(|r| r.id.clone()).unwrap_or_default();
    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    let mut result = BatchResult::new(index, last_id);

    let what = format!("join batch {index}");
    let joined = match ctx
        .retry
        .run(&what, |_| {
            join_tasks(
                ctx.raw.as_ref(),
                ctx.task_table.as_ref(),
                &ctx.foreign_key,
                rows.clone(),
            )
        })
        .await
    {
        Ok(joined) => joined,
        Err(exhausted) => {
            result.failed = Some(BatchFailure {
                step: "join",
                ids,
                attempts: exhausted.attempts,
                error: exhausted.error.to_string(),
            });
            return result;
        },
    };

    let normalizer = ctx.normalizer.clone();
    let normalized = tokio::task::spawn_blocking(move || {
        joined
            .into_iter()
            .map(|row| {
                let outcome = normalizer.normalize(&row.raw, &row.tasks);
                (row.raw.id, outcome)
            })
            .collect::<Vec<_>>()
    })
    .await;
    let normalized = match normalized {
        Ok(normalized) => normalized,
        Err(e) => {
            result.failed = Some(BatchFailure {
                step: "normalize",
                ids,
                attempts: 1,
                error: e.to_string(),
            });
            return result;
        },
    };

    let mut records: Vec<CanonicalRecord> = Vec::with_capacity(normalized.len());
    for (id, outcome) in normalized {
        match outcome {
            Ok(Outcome::Record(record)) => records.push(record),
            Ok(Outcome::Skip(reason)) => result.skipped.push((id, reason)),
            Err(e) => result.rejected.push((id, e.to_string())),
        }
    }
    if records.is_empty() {
        return result;
    }

    let what = format!("upsert batch {index} into {}", ctx.dest);
    match ctx
        .retry
        .run(&what, |_| ctx.canonical.upsert_canonical(&ctx.dest, &records))
        .await
    {
        Ok(_) => result.written = records.len() as u64,
        Err(exhausted) => {
            result.failed = Some(BatchFailure {
                step: "upsert",
                ids: records.into_iter().map(|r| r.id).collect(),
                attempts: exhausted.attempts,
                error: exhausted.error.to_string(),
            });
        },
    }
    result
}

/// Sequential keyset reader over the raw table
struct BatchReader {
    raw: Arc<dyn RawStore>,
    table: TableName,
    after: Option<String>,
    read_size: usize,
    batch_size: usize,
    retry: RetryPolicy,
    done: bool,
}

impl BatchReader {
    /// Next batch of up to `batch_size` rows, `None` at the end of the table
    async fn next_batch(&mut self) -> Result<Option<Vec<RawRecord>>, PipelineError> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while !self.done && batch.len() < self.batch_size {
            let limit = self.read_size.min(self.batch_size - batch.len());
            let what = format!("read {}", self.table);
            let after = self.after.clone();
            let rows = self
                .retry
                .run(&what, |_| self.raw.read_raw(&self.table, after.as_deref(), limit))
                .await
                .map_err(|e| PipelineError::StoreUnavailable(e.error))?;

            if rows.len() < limit {
                self.done = true;
            }
            if let Some(last) = rows.last() {
                self.after = Some(last.id.clone());
            }
            batch.extend(rows);
        }
        Ok((!batch.is_empty()).then_some(batch))
    }
}

struct TransformRun {
    report: JobReport,
    committer: CheckpointCommitter,
    fatal: Option<PipelineError>,
    next_progress: u64,
}

pub struct TransformPool {
    raw: Arc<dyn RawStore>,
    canonical: Arc<dyn CanonicalStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    failures: Arc<dyn FailureLog>,
    normalizer: Arc<dyn Normalizer>,
    versions: Option<Arc<dyn VersionStore>>,
    config: JobConfig,
    cancel: CancellationToken,
}

impl TransformPool {
    pub fn new(
        raw: Arc<dyn RawStore>,
        canonical: Arc<dyn CanonicalStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        failures: Arc<dyn FailureLog>,
        normalizer: Arc<dyn Normalizer>,
        config: JobConfig,
    ) -> Self {
        Self {
            raw,
            canonical,
            checkpoints,
            failures,
            normalizer,
            versions: None,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_versions(mut self, versions: Arc<dyn VersionStore>) -> Self {
        self.versions = Some(versions);
        self
    }

    async fn record_version(&self, report: &mut JobReport) -> Result<(), PipelineError> {
        let Some(store) = &self.versions else {
            return Ok(());
        };
        if report.cancelled {
            return Ok(());
        }
        let dataset = transform_dataset(&report.table_name);
        let version = self.normalizer.version();
        if versions::advance(store.as_ref(), &dataset, version)
            .await
            .map_err(PipelineError::Version)?
        {
            info!(dataset = %dataset, version, "transform version updated");
        }
        report.version = Some(version.to_string());
        Ok(())
    }

    /// Where reading starts: an explicit offset wins over the checkpoint.
    /// Offsets are row positions in id order.
    async fn start_after(&self, table: &TableName, dest: &TableName) -> Result<Start, PipelineError> {
        let offset = match self.config.offset {
            Some(offset) => Some(offset),
            None => match resume_point(self.checkpoints.as_ref(), &self.config.job_name, dest.as_str()).await? {
                Some(Cursor::Token(id)) => return Ok(Start::After(Some(id))),
                Some(Cursor::Offset(offset)) => Some(offset),
                None => None,
            },
        };
        match offset {
            None | Some(0) => Ok(Start::After(None)),
            Some(n) => {
                let position = u64::try_from(n - 1)
                    .map_err(|_| ConfigError::invalid("offset", "must not be negative"))?;
                match self
                    .raw
                    .raw_id_at(table, position)
                    .await
                    .map_err(PipelineError::StoreUnavailable)?
                {
                    Some(id) => Ok(Start::After(Some(id))),
                    None => Ok(Start::PastEnd),
                }
            },
        }
    }

    #[instrument(skip(self), fields(job = %self.config.job_name, normalizer = %self.normalizer.source()))]
    pub async fn run(&self) -> Result<JobReport, PipelineError> {
        self.config.validate()?;
        let table = TableName::new(&self.config.table_name)
            .map_err(|e| ConfigError::invalid("table_name", e.to_string()))?;
        let dest = TableName::new(&self.config.dest_table_name)
            .map_err(|e| ConfigError::invalid("dest_table_name", e.to_string()))?;
        let task_table = self
            .config
            .task_table_name
            .as_deref()
            .map(TableName::new)
            .transpose()
            .map_err(|e| ConfigError::invalid("task_table_name", e.to_string()))?;

        self.raw.ping().await.map_err(PipelineError::StoreUnavailable)?;
        self.canonical.ping().await.map_err(PipelineError::StoreUnavailable)?;

        let job = self.config.job_name.as_str();
        let mut run = TransformRun {
            report: JobReport::new(Stage::Transform, job, dest.as_str()),
            committer: CheckpointCommitter::new(job, dest.as_str(), self.checkpoints.clone()),
            fatal: None,
            next_progress: self.config.log_every,
        };

        let after = match self.start_after(&table, &dest).await? {
            Start::After(after) => after,
            Start::PastEnd => {
                info!(offset = ?self.config.offset, "start offset is past the end of {table}");
                return Ok(run.report);
            },
        };
        info!(
            source_table = %table,
            dest_table = %dest,
            task_table = ?task_table.as_ref().map(TableName::as_str),
            after = ?after,
            workers = self.config.workers(),
            "transform started"
        );

        let retry = self.config.retry_policy();
        let mut reader = BatchReader {
            raw: self.raw.clone(),
            table,
            after,
            read_size: self.config.db_fetch_batch_size,
            batch_size: self.config.batch_size,
            retry,
            done: false,
        };
        let ctx = Arc::new(BatchContext {
            raw: self.raw.clone(),
            canonical: self.canonical.clone(),
            normalizer: self.normalizer.clone(),
            dest,
            task_table,
            foreign_key: self.config.task_foreign_key.clone(),
            retry,
        });

        self.dispatch(&mut reader, ctx, &mut run).await?;

        run.report.last_cursor = run.committer.committed().cloned();
        if let Some(err) = run.fatal {
            return Err(err);
        }
        self.record_version(&mut run.report).await?;
        info!(
            batches = run.report.units_completed,
            failed_batches = run.report.units_failed,
            written = run.report.records_written,
            failed = run.report.records_failed,
            skipped = run.report.records_skipped,
            cancelled = run.report.cancelled,
            "transform finished"
        );
        Ok(run.report)
    }

    async fn dispatch(
        &self,
        reader: &mut BatchReader,
        ctx: Arc<BatchContext>,
        run: &mut TransformRun,
    ) -> Result<(), PipelineError> {
        let workers = self.config.workers();
        let mut in_flight: JoinSet<BatchResult> = JoinSet::new();
        let mut ready: VecDeque<BatchResult> = VecDeque::new();
        let mut next_index = 0u64;
        let mut exhausted = false;

        loop {
            while !exhausted
                && run.fatal.is_none()
                && !run.report.cancelled
                && in_flight.len() + ready.len() < workers
            {
                if self.cancel.is_cancelled() {
                    warn!("cancellation requested, draining in-flight batches");
                    run.report.cancelled = true;
                    break;
                }
                let rows = match reader.next_batch().await {
                    Ok(Some(rows)) => rows,
                    Ok(None) => {
                        exhausted = true;
                        break;
                    },
                    Err(err) => {
                        run.fatal = Some(err);
                        break;
                    },
                };
                let work = process_batch(ctx.clone(), next_index, rows);
                next_index += 1;
                if self.config.debug {
                    ready.push_back(work.await);
                } else {
                    in_flight.spawn(work);
                }
            }

            let result = match ready.pop_front() {
                Some(result) => result,
                None => match in_flight.join_next().await {
                    Some(joined) => joined.map_err(|e| PipelineError::Worker(e.to_string()))?,
                    None => break,
                },
            };
            if let Err(err) = self.settle(result, run).await {
                if run.fatal.is_none() {
                    run.fatal = Some(err);
                }
            }
        }
        Ok(())
    }

    async fn settle(&self, result: BatchResult, run: &mut TransformRun) -> Result<(), PipelineError> {
        let job = self.config.job_name.as_str();
        let table = run.report.table_name.clone();

        for (id, reason) in &result.rejected {
            let entry = FailureEntry::new(job, &table, id, 1, reason).at(Cursor::Token(id.clone()));
            self.failures
                .append(&entry)
                .await
                .map_err(PipelineError::FailureLog)?;
        }
        for (id, reason) in &result.skipped {
            warn!(record_id = %id, reason = %reason, "record skipped by normalizer");
            let entry = FailureEntry::new(job, &table, id, 1, format!("skipped: {reason}"))
                .at(Cursor::Token(id.clone()));
            self.failures
                .append(&entry)
                .await
                .map_err(PipelineError::FailureLog)?;
        }
        run.report.records_failed += result.rejected.len() as u64;
        run.report.records_skipped += result.skipped.len() as u64;
        run.report.records_written += result.written;

        match &result.failed {
            Some(failure) => {
                warn!(
                    batch = result.index,
                    step = failure.step,
                    records = failure.ids.len(),
                    error = %failure.error,
                    "batch failed after retries"
                );
                for id in &failure.ids {
                    let entry = FailureEntry::new(
                        job,
                        &table,
                        id,
                        failure.attempts,
                        format!("{}: {}", failure.step, failure.error),
                    )
                    .at(Cursor::Token(id.clone()));
                    self.failures
                        .append(&entry)
                        .await
                        .map_err(PipelineError::FailureLog)?;
                }
                run.report.records_failed += failure.ids.len() as u64;
                run.report.units_failed += 1;
            },
            None => run.report.units_completed += 1,
        }

        run.committer
            .complete(result.index, Some(Cursor::Token(result.last_id)))
            .await?;

        if run.report.records_written >= run.next_progress {
            info!(
                written = run.report.records_written,
                batches = run.report.units_completed,
                cursor = ?run.committer.committed(),
                "transform progress"
            );
            while run.next_progress <= run.report.records_written {
                run.next_progress += self.config.log_every;
            }
        }
        Ok(())
    }
}

enum Start {
    After(Option<String>),
    PastEnd,
}

/// Normalizer for a source and mode
pub fn normalizer_for(source: &str, mode: TransformMode) -> Arc<dyn Normalizer> {
    match (mode, source) {
        (TransformMode::Trajectory, _) => Arc::new(TrajectoryNormalizer::new(source)),
        (TransformMode::Structure, "alexandria") => Arc::new(OptimadeNormalizer::alexandria()),
        (TransformMode::Structure, _) => Arc::new(OptimadeNormalizer::new(source)),
    }
}
