//! Export stage: canonical rows to uploaded shards
//!
//! The canonical table is cut into contiguous id-ordered chunks of
//! `chunk_size` rows. Chunk `k` always holds rows `k * chunk_size ..` in id
//! order, so a re-run over the same table reproduces the same shard
//! boundaries. Shards upload concurrently, each with its own retries; a chunk
//! that fails for good is logged and does not hold back the others, but the
//! run reports failure and the checkpoint stops in front of it.
//!
//! Progress is checkpointed as the index of the next chunk to export, under
//! job `export:{destination}`. With an [`ExportSplit`] only matching rows are
//! chunked, and the destination becomes `{destination}/{split}`.

pub mod split;
pub mod uploader;

pub use split::ExportSplit;
pub use uploader::{shard_name, LocalDirUploader, S3Uploader, Shard, Uploader};

use crate::checkpoint::CheckpointStore;
use crate::commit::{resume_point, CheckpointCommitter};
use crate::config::JobConfig;
use crate::error::{ConfigError, PipelineError};
use crate::failure_log::FailureLog;
use crate::models::{CanonicalRecord, Cursor, FailureEntry, JobReport, Stage};
use crate::retry::RetryPolicy;
use crate::store::{CanonicalStore, TableName};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Checkpoint job name for exports to `destination`
pub fn export_job_name(destination: &str) -> String {
    format!("export:{destination}")
}

struct UploadContext {
    uploader: Arc<dyn Uploader>,
    destination: String,
    retry: RetryPolicy,
}

struct ChunkResult {
    index: u64,
    rows: usize,
    first_id: String,
    last_id: String,
    sha256: Option<String>,
    attempts: u32,
    error: Option<String>,
}

async fn upload_chunk(ctx: Arc<UploadContext>, index: u64, records: Vec<CanonicalRecord>) -> ChunkResult {
    let mut result = ChunkResult {
        index,
        rows: records.len(),
        first_id: records.first().map(|r| r.id.clone()).unwrap_or_default(),
        last_id: records.last().map(|r| r.id.clone()).unwrap_or_default(),
        sha256: None,
        attempts: 1,
        error: None,
    };

    let shard = match Shard::encode(index, &records) {
        Ok(shard) => shard,
        Err(e) => {
            result.error = Some(e.to_string());
            return result;
        },
    };

    let what = format!("upload chunk {index} to {}", ctx.destination);
    match ctx
        .retry
        .run(&what, |_| ctx.uploader.upload(&ctx.destination, index, &shard))
        .await
    {
        Ok(()) => result.sha256 = Some(shard.sha256),
        Err(exhausted) => {
            result.attempts = exhausted.attempts;
            result.error = Some(exhausted.error.to_string());
        },
    }
    result
}

/// Sequential keyset reader that cuts the canonical table into chunks
struct ChunkReader {
    canonical: Arc<dyn CanonicalStore>,
    table: TableName,
    after: Option<String>,
    read_size: usize,
    chunk_size: usize,
    /// Rows still allowed under `max_rows`
    remaining: Option<u64>,
    retry: RetryPolicy,
    split: Option<ExportSplit>,
    done: bool,
}

impl ChunkReader {
    /// Next `limit` rows after the cursor, before filtering
    async fn read(&mut self, limit: usize) -> Result<Vec<CanonicalRecord>, PipelineError> {
        let what = format!("read {}", self.table);
        let after = self.after.clone();
        let rows = self
            .retry
            .run(&what, |_| self.canonical.read_canonical(&self.table, after.as_deref(), limit))
            .await
            .map_err(|e| PipelineError::StoreUnavailable(e.error))?;
        if rows.len() < limit {
            self.done = true;
        }
        if let Some(last) = rows.last() {
            self.after = Some(last.id.clone());
        }
        Ok(rows)
    }

    fn keep(&self, record: &CanonicalRecord) -> bool {
        self.split.as_ref().is_none_or(|split| split.matches(record))
    }

    /// Step over `count` matching rows; false when the table ends first
    async fn skip(&mut self, count: u64) -> Result<bool, PipelineError> {
        let mut skipped = 0u64;
        while !self.done && skipped < count {
            let wanted = usize::try_from(count - skipped).unwrap_or(usize::MAX);
            let rows = self.read(self.read_size.min(wanted)).await?;
            skipped += rows.iter().filter(|r| self.keep(r)).count() as u64;
        }
        Ok(skipped == count)
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<CanonicalRecord>>, PipelineError> {
        let target = match self.remaining {
            Some(remaining) => self.chunk_size.min(usize::try_from(remaining).unwrap_or(usize::MAX)),
            None => self.chunk_size,
        };
        let mut chunk = Vec::with_capacity(target);
        while !self.done && chunk.len() < target {
            // Never read past the rows this chunk can still take
            let rows = self.read(self.read_size.min(target - chunk.len())).await?;
            let kept: Vec<CanonicalRecord> = rows.into_iter().filter(|r| self.keep(r)).collect();
            chunk.extend(kept);
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(chunk.len() as u64);
            if *remaining == 0 {
                self.done = true;
            }
        }
        Ok((!chunk.is_empty()).then_some(chunk))
    }
}

struct ExportRun {
    report: JobReport,
    committer: CheckpointCommitter,
    first_chunk: u64,
    fatal: Option<PipelineError>,
}

pub struct ExportPipeline {
    canonical: Arc<dyn CanonicalStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    failures: Arc<dyn FailureLog>,
    uploader: Arc<dyn Uploader>,
    config: JobConfig,
    destination: String,
    split: Option<ExportSplit>,
    cancel: CancellationToken,
}

impl ExportPipeline {
    pub fn new(
        canonical: Arc<dyn CanonicalStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        failures: Arc<dyn FailureLog>,
        uploader: Arc<dyn Uploader>,
        config: JobConfig,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            canonical,
            checkpoints,
            failures,
            uploader,
            config,
            destination: destination.into(),
            split: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Export only `split`, under its own destination and checkpoint
    pub fn with_split(mut self, split: ExportSplit) -> Self {
        self.destination = split.destination(&self.destination);
        self.split = Some(split);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// First chunk to export. An explicit offset is a row position and is
    /// rounded down to its chunk so boundaries never move.
    async fn first_chunk(&self, job: &str, table: &TableName) -> Result<u64, PipelineError> {
        let chunk_size = self.config.chunk_size as u64;
        if let Some(offset) = self.config.offset {
            let offset = u64::try_from(offset)
                .map_err(|_| ConfigError::invalid("offset", "must not be negative"))?;
            if offset % chunk_size != 0 {
                warn!(offset, chunk_size, "offset is not chunk aligned, starting at its chunk");
            }
            return Ok(offset / chunk_size);
        }
        match resume_point(self.checkpoints.as_ref(), job, table.as_str()).await? {
            None => Ok(0),
            Some(Cursor::Offset(next)) => u64::try_from(next).map_err(|_| PipelineError::CorruptCheckpoint {
                job: job.to_string(),
                table: table.to_string(),
                reason: format!("negative chunk index {next}"),
            }),
            Some(Cursor::Token(token)) => Err(PipelineError::CorruptCheckpoint {
                job: job.to_string(),
                table: table.to_string(),
                reason: format!("expected a chunk index, found token '{token}'"),
            }),
        }
    }

    #[instrument(skip(self), fields(destination = %self.destination))]
    pub async fn run(&self) -> Result<JobReport, PipelineError> {
        self.config.validate()?;
        if self.destination.trim().is_empty() {
            return Err(ConfigError::Missing("destination").into());
        }
        let table = TableName::new(&self.config.dest_table_name)
            .map_err(|e| ConfigError::invalid("dest_table_name", e.to_string()))?;
        self.canonical.ping().await.map_err(PipelineError::StoreUnavailable)?;

        let job = export_job_name(&self.destination);
        let first_chunk = self.first_chunk(&job, &table).await?;
        let mut run = ExportRun {
            report: JobReport::new(Stage::Export, &job, table.as_str()),
            committer: CheckpointCommitter::new(&job, table.as_str(), self.checkpoints.clone()),
            first_chunk,
            fatal: None,
        };

        let chunk_size = self.config.chunk_size as u64;
        let skipped_rows = first_chunk.saturating_mul(chunk_size);
        let remaining = self.config.max_rows.map(|cap| cap.saturating_sub(skipped_rows));
        if remaining == Some(0) {
            info!(first_chunk, max_rows = ?self.config.max_rows, "nothing left to export");
            return Ok(run.report);
        }

        let retry = self.config.retry_policy();
        let mut reader = ChunkReader {
            canonical: self.canonical.clone(),
            table: table.clone(),
            after: None,
            read_size: self.config.db_fetch_batch_size,
            chunk_size: self.config.chunk_size,
            remaining,
            retry,
            split: self.split.clone(),
            done: false,
        };

        if skipped_rows > 0 {
            let reached = match &self.split {
                // Positions count matching rows only, so walk up to the chunk
                Some(_) => reader.skip(skipped_rows).await?,
                None => {
                    reader.after = self
                        .canonical
                        .canonical_id_at(&table, skipped_rows - 1)
                        .await
                        .map_err(PipelineError::StoreUnavailable)?;
                    reader.after.is_some()
                },
            };
            if !reached {
                info!(first_chunk, "start chunk is past the end of {table}");
                return Ok(run.report);
            }
        }

        info!(
            table = %table,
            split = ?self.split.as_ref().map(ExportSplit::name),
            first_chunk,
            chunk_size,
            max_rows = ?self.config.max_rows,
            workers = self.config.workers(),
            target = %self.uploader.locate(&self.destination, first_chunk),
            "export started"
        );
        let ctx = Arc::new(UploadContext {
            uploader: self.uploader.clone(),
            destination: self.destination.clone(),
            retry,
        });

        self.dispatch(&mut reader, ctx, &mut run).await?;

        run.report.last_cursor = run.committer.committed().cloned();
        if let Some(err) = run.fatal {
            return Err(err);
        }
        if run.report.succeeded() {
            info!(
                chunks = run.report.units_completed,
                rows = run.report.records_written,
                cancelled = run.report.cancelled,
                "export finished"
            );
        } else {
            warn!(
                chunks = run.report.units_completed,
                failed_chunks = run.report.units_failed,
                rows = run.report.records_written,
                cursor = ?run.report.last_cursor,
                "export finished with failed chunks"
            );
        }
        Ok(run.report)
    }

    async fn dispatch(
        &self,
        reader: &mut ChunkReader,
        ctx: Arc<UploadContext>,
        run: &mut ExportRun,
    ) -> Result<(), PipelineError> {
        let workers = self.config.workers();
        let mut in_flight: JoinSet<ChunkResult> = JoinSet::new();
        let mut ready: VecDeque<ChunkResult> = VecDeque::new();
        let mut next_index = run.first_chunk;
        let mut exhausted = false;

        loop {
            while !exhausted
                && run.fatal.is_none()
                && !run.report.cancelled
                && in_flight.len() + ready.len() < workers
            {
                if self.cancel.is_cancelled() {
                    warn!("cancellation requested, draining in-flight uploads");
                    run.report.cancelled = true;
                    break;
                }
                let records = match reader.next_chunk().await {
                    Ok(Some(records)) => records,
                    Ok(None) => {
                        exhausted = true;
                        break;
                    },
                    Err(err) => {
                        run.fatal = Some(err);
                        break;
                    },
                };
                let work = upload_chunk(ctx.clone(), next_index, records);
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

    async fn settle(&self, result: ChunkResult, run: &mut ExportRun) -> Result<(), PipelineError> {
        if let Some(error) = &result.error {
            warn!(
                chunk_index = result.index,
                rows = result.rows,
                first_id = %result.first_id,
                last_id = %result.last_id,
                attempt = result.attempts,
                error = %error,
                "chunk failed after retries"
            );
            let entry = FailureEntry::new(
                &run.report.job_name,
                &run.report.table_name,
                self.uploader.locate(&self.destination, result.index),
                result.attempts,
                error,
            )
            .at(Cursor::Offset(result.index as i64));
            self.failures
                .append(&entry)
                .await
                .map_err(PipelineError::FailureLog)?;
            run.report.units_failed += 1;
            run.report.records_failed += result.rows as u64;
            // Never completed: the checkpoint stays in front of this chunk
            return Ok(());
        }

        info!(
            chunk_index = result.index,
            rows = result.rows,
            first_id = %result.first_id,
            last_id = %result.last_id,
            sha256 = ?result.sha256,
            "chunk uploaded"
        );
        run.report.units_completed += 1;
        run.report.records_written += result.rows as u64;
        run.committer
            .complete(
                result.index - run.first_chunk,
                Some(Cursor::Offset(result.index as i64 + 1)),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::error::UploadError;
    use crate::failure_log::MemoryFailureLog;
    use crate::models::Provenance;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Keeps shards in memory; chunks can be scripted to fail
    #[derive(Default)]
    struct RecordingUploader {
        shards: Mutex<BTreeMap<u64, Shard>>,
        transient: Mutex<HashMap<u64, u32>>,
        rejected: Mutex<HashSet<u64>>,
        calls: Mutex<Vec<u64>>,
        /// Token cancelled while this chunk uploads
        cancel_on: Mutex<Option<(u64, CancellationToken)>>,
    }

    impl RecordingUploader {
        async fn fail_transiently(&self, index: u64, times: u32) {
            self.transient.lock().await.insert(index, times);
        }

        async fn reject(&self, index: u64) {
            self.rejected.lock().await.insert(index);
        }

        async fn cancel_on(&self, index: u64, token: CancellationToken) {
            *self.cancel_on.lock().await = Some((index, token));
        }

        async fn boundaries(&self) -> Vec<(u64, String, String, usize)> {
            self.shards
                .lock()
                .await
                .values()
                .map(|s| (s.index, s.first_id.clone(), s.last_id.clone(), s.rows))
                .collect()
        }
    }

    #[async_trait]
    impl Uploader for RecordingUploader {
        fn locate(&self, destination: &str, chunk_index: u64) -> String {
            format!("memory://{}", shard_name(destination, chunk_index))
        }

        async fn upload(&self, _destination: &str, chunk_index: u64, shard: &Shard) -> Result<(), UploadError> {
            self.calls.lock().await.push(chunk_index);
            if let Some((at, token)) = self.cancel_on.lock().await.as_ref() {
                if *at == chunk_index {
                    token.cancel();
                }
            }
            if self.rejected.lock().await.contains(&chunk_index) {
                return Err(UploadError::Rejected("quota exceeded".to_string()));
            }
            if let Some(left) = self.transient.lock().await.get_mut(&chunk_index) {
                if *left > 0 {
                    *left -= 1;
                    return Err(UploadError::Transient("503 from hub".to_string()));
                }
            }
            self.shards.lock().await.insert(chunk_index, shard.clone());
            Ok(())
        }
    }

    fn record(i: usize) -> CanonicalRecord {
        let id = format!("id-{i:03}");
        CanonicalRecord {
            id: id.clone(),
            structure: json!({"nsites": i}),
            trajectory: None,
            provenance: Provenance {
                source: "alexandria".to_string(),
                source_id: id,
                transform_version: "1".to_string(),
            },
            content_hash: None,
        }
    }

    /// Every third row is scan, every fifth incompatible
    fn split_record(i: usize) -> CanonicalRecord {
        let functional = if i % 3 == 0 { "scan" } else { "pbe" };
        CanonicalRecord {
            structure: json!({"nsites": i, "functional": functional, "cross_compatibility": i % 5 != 0}),
            ..record(i)
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        checkpoints: Arc<MemoryCheckpointStore>,
        failures: Arc<MemoryFailureLog>,
    }

    impl Harness {
        async fn with_rows(n: usize) -> Self {
            Self::with_records((0..n).rev().map(record).collect()).await
        }

        async fn with_records(records: Vec<CanonicalRecord>) -> Self {
            let store = Arc::new(MemoryStore::new());
            // Inserted out of order; chunks follow id order regardless
            store
                .upsert_canonical(&TableName::new("canonical").unwrap(), &records)
                .await
                .unwrap();
            Self {
                store,
                checkpoints: Arc::new(MemoryCheckpointStore::new()),
                failures: Arc::new(MemoryFailureLog::new()),
            }
        }

        fn pipeline(&self, uploader: Arc<RecordingUploader>, config: JobConfig) -> ExportPipeline {
            ExportPipeline::new(
                self.store.clone(),
                self.checkpoints.clone(),
                self.failures.clone(),
                uploader,
                config,
                "lematbulk",
            )
        }
    }

    fn config() -> JobConfig {
        JobConfig {
            job_name: "alexandria".to_string(),
            dest_table_name: "canonical".to_string(),
            chunk_size: 10,
            db_fetch_batch_size: 4,
            num_workers: 3,
            retry_delay: Duration::from_millis(5),
            ..JobConfig::default()
        }
    }

    fn ids(first: usize, last: usize) -> (String, String) {
        (format!("id-{first:03}"), format!("id-{last:03}"))
    }

    #[tokio::test]
    async fn test_chunks_follow_id_order() {
        let harness = Harness::with_rows(25).await;
        let uploader = Arc::new(RecordingUploader::default());

        let report = harness.pipeline(uploader.clone(), config()).run().await.unwrap();

        assert!(report.succeeded());
        assert_eq!(report.units_completed, 3);
        assert_eq!(report.records_written, 25);
        assert_eq!(report.job_name, "export:lematbulk");
        assert_eq!(report.last_cursor, Some(Cursor::Offset(3)));

        let expected: Vec<(u64, String, String, usize)> = [(0, 0, 9, 10), (1, 10, 19, 10), (2, 20, 24, 5)]
            .into_iter()
            .map(|(index, first, last, rows)| {
                let (first, last) = ids(first, last);
                (index, first, last, rows)
            })
            .collect();
        assert_eq!(uploader.boundaries().await, expected);
    }

    #[tokio::test]
    async fn test_reexport_reproduces_identical_shards() {
        let harness = Harness::with_rows(23).await;
        let first = Arc::new(RecordingUploader::default());
        let second = Arc::new(RecordingUploader::default());

        harness.pipeline(first.clone(), config()).run().await.unwrap();
        let again = JobConfig {
            offset: Some(0),
            num_workers: 1,
            ..config()
        };
        harness.pipeline(second.clone(), again).run().await.unwrap();

        assert_eq!(*first.shards.lock().await, *second.shards.lock().await);
    }

    #[tokio::test]
    async fn test_failed_chunk_does_not_block_the_rest() {
        let harness = Harness::with_rows(30).await;
        let uploader = Arc::new(RecordingUploader::default());
        uploader.reject(1).await;

        let report = harness.pipeline(uploader.clone(), config()).run().await.unwrap();

        assert!(!report.succeeded());
        assert_eq!(report.units_failed, 1);
        assert_eq!(report.units_completed, 2);
        assert_eq!(report.records_failed, 10);
        assert_eq!(report.last_cursor, Some(Cursor::Offset(1)));
        let uploaded: Vec<u64> = uploader.shards.lock().await.keys().copied().collect();
        assert_eq!(uploaded, vec![0, 2]);

        let entries = harness.failures.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cursor, Some(Cursor::Offset(1)));
        assert_eq!(entries[0].attempt_count, 1);
        assert_eq!(entries[0].url_or_id, "memory://lematbulk/chunk_000001.jsonl");

        // Resume picks up at the failed chunk with the same boundaries
        let fixed = Arc::new(RecordingUploader::default());
        let report = harness.pipeline(fixed.clone(), config()).run().await.unwrap();
        assert!(report.succeeded());
        let mut calls = fixed.calls.lock().await.clone();
        calls.sort_unstable();
        assert_eq!(calls, vec![1, 2]);
        let (first, last) = ids(10, 19);
        assert_eq!(fixed.boundaries().await[0], (1, first, last, 10));
        assert_eq!(report.last_cursor, Some(Cursor::Offset(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_upload_errors_are_retried() {
        let harness = Harness::with_rows(10).await;
        let uploader = Arc::new(RecordingUploader::default());
        uploader.fail_transiently(0, 2).await;

        let report = harness.pipeline(uploader.clone(), config()).run().await.unwrap();

        assert!(report.succeeded());
        assert_eq!(*uploader.calls.lock().await, vec![0, 0, 0]);

        let exhausted = Harness::with_rows(10).await;
        let flaky = Arc::new(RecordingUploader::default());
        flaky.fail_transiently(0, 10).await;
        let report = exhausted.pipeline(flaky, config()).run().await.unwrap();
        assert_eq!(report.units_failed, 1);
        assert_eq!(exhausted.failures.entries().await[0].attempt_count, 4);
    }

    #[tokio::test]
    async fn test_max_rows_and_offset() {
        let harness = Harness::with_rows(40).await;
        let uploader = Arc::new(RecordingUploader::default());
        let capped = JobConfig {
            offset: Some(12),
            max_rows: Some(25),
            debug: true,
            ..config()
        };

        let report = harness.pipeline(uploader.clone(), capped).run().await.unwrap();

        let (a_first, a_last) = ids(10, 19);
        let (b_first, b_last) = ids(20, 24);
        assert_eq!(
            uploader.boundaries().await,
            vec![(1, a_first, a_last, 10), (2, b_first, b_last, 5)]
        );
        assert_eq!(report.records_written, 15);
        assert_eq!(report.last_cursor, Some(Cursor::Offset(3)));
    }

    #[tokio::test]
    async fn test_nothing_to_export_past_the_end() {
        let harness = Harness::with_rows(10).await;
        let uploader = Arc::new(RecordingUploader::default());
        let past = JobConfig {
            offset: Some(20),
            ..config()
        };

        let report = harness.pipeline(uploader.clone(), past).run().await.unwrap();

        assert!(report.succeeded());
        assert_eq!(report.units_completed, 0);
        assert!(uploader.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_split_exports_matching_rows_under_its_own_destination() {
        let harness = Harness::with_records((0..30).rev().map(split_record).collect()).await;
        let small_chunks = JobConfig {
            chunk_size: 5,
            ..config()
        };
        let pbe = ExportSplit::named("compatible_pbe").unwrap();

        let full = Arc::new(RecordingUploader::default());
        let report = harness
            .pipeline(full.clone(), small_chunks.clone())
            .with_split(pbe)
            .run()
            .await
            .unwrap();

        assert!(report.succeeded());
        assert_eq!(report.job_name, "export:lematbulk/compatible_pbe");
        assert_eq!(report.records_written, 16);
        let expected: Vec<(u64, String, String, usize)> =
            [(0, 1, 8, 5), (1, 11, 17, 5), (2, 19, 28, 5), (3, 29, 29, 1)]
                .into_iter()
                .map(|(index, first, last, rows)| {
                    let (first, last) = ids(first, last);
                    (index, first, last, rows)
                })
                .collect();
        assert_eq!(full.boundaries().await, expected);
        for shard in full.shards.lock().await.values() {
            let body = String::from_utf8(shard.body.to_vec()).unwrap();
            assert!(!body.contains("\"scan\""));
        }
        assert_eq!(
            harness
                .checkpoints
                .load("export:lematbulk/compatible_pbe", "canonical")
                .await
                .unwrap()
                .unwrap()
                .cursor,
            Cursor::Offset(4)
        );

        // The other splits keep their own checkpoints
        let rest = Arc::new(RecordingUploader::default());
        let report = harness
            .pipeline(rest.clone(), small_chunks)
            .with_split(ExportSplit::named("non_compatible").unwrap())
            .run()
            .await
            .unwrap();
        assert_eq!(report.records_written, 6);
        assert_eq!(report.last_cursor, Some(Cursor::Offset(2)));
        assert_eq!(
            rest.locate("lematbulk/non_compatible", 0),
            "memory://lematbulk/non_compatible/chunk_000000.jsonl"
        );
    }

    #[tokio::test]
    async fn test_split_resume_keeps_chunk_boundaries() {
        let harness = Harness::with_records((0..30).rev().map(split_record).collect()).await;
        let small_chunks = JobConfig {
            chunk_size: 5,
            ..config()
        };
        let pbe = ExportSplit::named("compatible_pbe").unwrap();

        let reference = Arc::new(RecordingUploader::default());
        let fresh = Harness::with_records((0..30).rev().map(split_record).collect()).await;
        fresh
            .pipeline(reference.clone(), small_chunks.clone())
            .with_split(pbe.clone())
            .run()
            .await
            .unwrap();

        let flaky = Arc::new(RecordingUploader::default());
        flaky.reject(1).await;
        let report = harness
            .pipeline(flaky, small_chunks.clone())
            .with_split(pbe.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(report.last_cursor, Some(Cursor::Offset(1)));

        let resumed = Arc::new(RecordingUploader::default());
        let report = harness
            .pipeline(resumed.clone(), small_chunks)
            .with_split(pbe)
            .run()
            .await
            .unwrap();
        assert!(report.succeeded());
        assert_eq!(report.last_cursor, Some(Cursor::Offset(4)));
        let tail: Vec<(u64, String, String, usize)> = reference
            .boundaries()
            .await
            .into_iter()
            .filter(|(index, ..)| *index >= 1)
            .collect();
        assert_eq!(resumed.boundaries().await, tail);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_checkpoints_uploaded_chunks_only() {
        let harness = Harness::with_rows(50).await;
        let uploader = Arc::new(RecordingUploader::default());
        let token = CancellationToken::new();
        uploader.cancel_on(2, token.clone()).await;
        let inline = JobConfig {
            debug: true,
            ..config()
        };

        let report = harness
            .pipeline(uploader.clone(), inline)
            .with_cancellation(token)
            .run()
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.units_completed, 3);
        assert_eq!(report.records_written, 30);
        let uploaded: Vec<u64> = uploader.shards.lock().await.keys().copied().collect();
        assert_eq!(uploaded, vec![0, 1, 2]);
        assert_eq!(report.last_cursor, Some(Cursor::Offset(3)));
        assert_eq!(
            harness.checkpoints.history("export:lematbulk", "canonical").await.last(),
            Some(&Cursor::Offset(3))
        );

        // Resuming uploads the rest with the same boundaries
        let rest = Arc::new(RecordingUploader::default());
        let report = harness.pipeline(rest.clone(), config()).run().await.unwrap();
        assert!(report.succeeded());
        let (first, last) = ids(30, 39);
        assert_eq!(rest.boundaries().await[0], (3, first, last, 10));
        assert_eq!(report.last_cursor, Some(Cursor::Offset(5)));
    }

    #[tokio::test]
    async fn test_token_checkpoint_is_corrupt() {
        let harness = Harness::with_rows(10).await;
        harness
            .checkpoints
            .save("export:lematbulk", "canonical", &Cursor::Token("id-004".to_string()))
            .await
            .unwrap();

        let err = harness
            .pipeline(Arc::new(RecordingUploader::default()), config())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::CorruptCheckpoint { .. }));
    }
}
