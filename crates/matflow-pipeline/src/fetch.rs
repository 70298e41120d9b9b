//! Fetch stage: source pages into the raw store
//!
//! A single dispatcher claims pages from the connector in cursor order and
//! hands them to at most `num_workers` concurrent tasks. Each task fetches
//! its page and upserts the records, retrying transient failures. The
//! dispatcher settles results as they arrive: rejects and exhausted pages go
//! to the failure log, and the checkpoint advances over the contiguous
//! prefix of settled pages.
//!
//! A run that was not cancelled records the date of the newest source
//! `last_modified` it stored as the raw table's dataset version.
//!
//! A page that fails permanently is logged and skipped, so the job keeps
//! going. Fatal source errors, an unreachable store, a corrupt checkpoint or
//! a failing checkpoint/failure-log write stop the job.

use crate::checkpoint::CheckpointStore;
use crate::commit::{resume_point, CheckpointCommitter};
use crate::config::JobConfig;
use crate::error::{ConfigError, PipelineError, SourceError, StoreError};
use crate::failure_log::FailureLog;
use crate::models::{Cursor, FailureEntry, JobReport, Stage};
use crate::retry::{Exhausted, RetryPolicy};
use crate::source::{PagePlan, PageSpec, Reject, SourceConnector};
use crate::store::{RawStore, TableName};
use crate::versions::{self, VersionStore};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A page whose records are durably in the raw store
struct StoredPage {
    written: u64,
    rejects: Vec<Reject>,
    next: Cursor,
    last: bool,
    newest: Option<DateTime<Utc>>,
    modified: Option<DateTime<Utc>>,
}

enum PageFailure {
    Fetch(Exhausted<SourceError>),
    Store(Exhausted<StoreError>),
}

impl PageFailure {
    fn attempts(&self) -> u32 {
        match self {
            PageFailure::Fetch(e) => e.attempts,
            PageFailure::Store(e) => e.attempts,
        }
    }

    fn message(&self) -> String {
        match self {
            PageFailure::Fetch(e) => e.error.to_string(),
            PageFailure::Store(e) => e.error.to_string(),
        }
    }
}

struct PageResult {
    page: PageSpec,
    outcome: Result<StoredPage, PageFailure>,
}

/// Fetch one page and store its records
async fn process_page(
    connector: Arc<dyn SourceConnector>,
    raw: Arc<dyn RawStore>,
    table: TableName,
    retry: RetryPolicy,
    page: PageSpec,
) -> PageResult {
    let what = format!("fetch {}", connector.locate(&page));
    let fetched = match retry.run(&what, |_| connector.fetch_page(&page)).await {
        Ok(fetched) => fetched,
        Err(exhausted) => {
            return PageResult {
                page,
                outcome: Err(PageFailure::Fetch(exhausted)),
            }
        },
    };

    let newest = fetched.records.iter().map(|r| r.fetched_at).max();
    let modified = fetched.records.iter().filter_map(|r| r.last_modified()).max();
    let outcome = if fetched.records.is_empty() {
        Ok(0)
    } else {
        let what = format!("upsert page {} into {table}", page.index);
        retry
            .run(&what, |_| raw.upsert_raw(&table, &fetched.records))
            .await
            .map(|_| fetched.records.len() as u64)
    };

    let outcome = match outcome {
        Ok(written) => Ok(StoredPage {
            written,
            rejects: fetched.rejects,
            next: fetched.next,
            last: fetched.last,
            newest,
            modified,
        }),
        Err(exhausted) => Err(PageFailure::Store(exhausted)),
    };
    PageResult { page, outcome }
}

/// Consecutive exhausted pages after which an open-ended plan counts as
/// finished; such a source never reports its own end
const OPEN_ENDED_FAILURE_LIMIT: u32 = 3;

/// Dispatcher state for one run
struct FetchRun {
    report: JobReport,
    committer: CheckpointCommitter,
    /// Lowest index of a page that reported the end of data
    last_index: Option<u64>,
    open_ended: bool,
    failed_in_a_row: u32,
    fatal: Option<PipelineError>,
    next_progress: u64,
}

pub struct FetchPool {
    connector: Arc<dyn SourceConnector>,
    raw: Arc<dyn RawStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    failures: Arc<dyn FailureLog>,
    versions: Option<Arc<dyn VersionStore>>,
    config: JobConfig,
    cancel: CancellationToken,
}

impl FetchPool {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        raw: Arc<dyn RawStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        failures: Arc<dyn FailureLog>,
        config: JobConfig,
    ) -> Self {
        Self {
            connector,
            raw,
            checkpoints,
            failures,
            versions: None,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Record the raw table's dataset version after each completed run
    pub fn with_versions(mut self, versions: Arc<dyn VersionStore>) -> Self {
        self.versions = Some(versions);
        self
    }

    /// Stop claiming pages once `token` is cancelled; in-flight pages finish
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[instrument(skip(self), fields(job = %self.config.job_name, source = %self.connector.name()))]
    pub async fn run(&self) -> Result<JobReport, PipelineError> {
        self.config.validate()?;
        let table = TableName::new(&self.config.table_name)
            .map_err(|e| ConfigError::invalid("table_name", e.to_string()))?;
        let job = self.config.job_name.as_str();

        self.raw.ping().await.map_err(PipelineError::StoreUnavailable)?;

        let start = match self.config.offset {
            Some(offset) => {
                info!(offset, "starting from explicit offset");
                Cursor::Offset(offset)
            },
            None => resume_point(self.checkpoints.as_ref(), job, table.as_str())
                .await?
                .unwrap_or_else(Cursor::start),
        };

        let mut plan = self
            .connector
            .open(&start)
            .await
            .map_err(|error| PipelineError::SourceOpen {
                name: self.connector.name().to_string(),
                error,
            })?;

        info!(start = %start, workers = self.config.workers(), "fetch started");

        let mut run = FetchRun {
            report: JobReport::new(Stage::Fetch, job, table.as_str()),
            committer: CheckpointCommitter::new(job, table.as_str(), self.checkpoints.clone()),
            last_index: None,
            open_ended: matches!(plan, PagePlan::Offsets { .. }),
            failed_in_a_row: 0,
            fatal: None,
            next_progress: self.config.log_every,
        };

        self.dispatch(&mut plan, &table, &mut run).await?;

        run.report.last_cursor = run.committer.committed().cloned();
        if let Some(err) = run.fatal {
            return Err(err);
        }
        self.record_version(&mut run.report).await?;

        info!(
            pages = run.report.units_completed,
            failed_pages = run.report.units_failed,
            records = run.report.records_written,
            rejected = run.report.records_failed,
            cursor = ?run.report.last_cursor,
            cancelled = run.report.cancelled,
            "fetch finished"
        );
        Ok(run.report)
    }

    async fn dispatch(
        &self,
        plan: &mut PagePlan,
        table: &TableName,
        run: &mut FetchRun,
    ) -> Result<(), PipelineError> {
        let workers = self.config.workers();
        let retry = self.config.retry_policy();
        let mut in_flight: JoinSet<PageResult> = JoinSet::new();
        let mut ready: VecDeque<PageResult> = VecDeque::new();
        let mut next_index = 0u64;
        let mut exhausted = false;

        loop {
            while !exhausted
                && run.fatal.is_none()
                && run.last_index.is_none()
                && !run.report.cancelled
                && in_flight.len() + ready.len() < workers
            {
                if self.cancel.is_cancelled() {
                    warn!("cancellation requested, draining in-flight pages");
                    run.report.cancelled = true;
                    break;
                }
                let Some(page) = plan.next_page(next_index) else {
                    exhausted = true;
                    break;
                };
                next_index += 1;

                let work = process_page(
                    self.connector.clone(),
                    self.raw.clone(),
                    table.clone(),
                    retry,
                    page,
                );
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
                // Stop claiming and let the remaining pages land first
                if run.fatal.is_none() {
                    run.fatal = Some(err);
                }
            }
        }
        Ok(())
    }

    async fn record_version(&self, report: &mut JobReport) -> Result<(), PipelineError> {
        let (Some(store), Some(modified)) = (&self.versions, report.newest_modified) else {
            return Ok(());
        };
        if report.cancelled {
            return Ok(());
        }
        let version = modified.format("%Y-%m-%d").to_string();
        if versions::advance(store.as_ref(), &report.table_name, &version)
            .await
            .map_err(PipelineError::Version)?
        {
            info!(dataset = %report.table_name, version = %version, "dataset version updated");
        }
        report.version = Some(version);
        Ok(())
    }

    async fn settle(&self, result: PageResult, run: &mut FetchRun) -> Result<(), PipelineError> {
        let PageResult { page, outcome } = result;
        let job = self.config.job_name.as_str();
        let table = run.report.table_name.clone();

        let end = match outcome {
            Ok(stored) => {
                for reject in &stored.rejects {
                    let entry = FailureEntry::new(job, &table, &reject.locator, 1, &reject.reason)
                        .at(page.start.clone());
                    self.failures
                        .append(&entry)
                        .await
                        .map_err(PipelineError::FailureLog)?;
                }

                run.failed_in_a_row = 0;
                run.report.units_completed += 1;
                run.report.records_written += stored.written;
                run.report.records_failed += stored.rejects.len() as u64;
                if stored.newest > run.report.newest_fetched_at {
                    run.report.newest_fetched_at = stored.newest;
                }
                if stored.modified > run.report.newest_modified {
                    run.report.newest_modified = stored.modified;
                }
                if stored.last {
                    let last = run.last_index.map_or(page.index, |l| l.min(page.index));
                    run.last_index = Some(last);
                    run.committer.discard_after(last);
                }
                debug!(page = page.index, records = stored.written, next = %stored.next, "page stored");
                stored.next
            },
            Err(PageFailure::Fetch(exhausted)) if exhausted.error.is_fatal() => {
                return Err(PipelineError::Source {
                    name: self.connector.name().to_string(),
                    error: exhausted.error,
                });
            },
            Err(failure) => {
                let entry = FailureEntry::new(
                    job,
                    &table,
                    self.connector.locate(&page),
                    failure.attempts(),
                    failure.message(),
                )
                .at(page.start.clone());
                self.failures
                    .append(&entry)
                    .await
                    .map_err(PipelineError::FailureLog)?;
                run.report.units_failed += 1;
                run.failed_in_a_row += 1;
                if run.open_ended && run.failed_in_a_row >= OPEN_ENDED_FAILURE_LIMIT {
                    warn!(
                        page = page.index,
                        failed_pages = run.failed_in_a_row,
                        "source keeps failing, treating this page as the end of data"
                    );
                    let last = run.last_index.map_or(page.index, |l| l.min(page.index));
                    run.last_index = Some(last);
                    run.committer.discard_after(last);
                }
                page.end.clone()
            },
        };

        // Pages claimed past the end of data must not drag the cursor along
        let end = match run.last_index {
            Some(last) if page.index > last => None,
            _ => Some(end),
        };
        run.committer.complete(page.index, end).await?;

        if run.report.records_written >= run.next_progress {
            info!(
                records = run.report.records_written,
                pages = run.report.units_completed,
                cursor = ?run.committer.committed(),
                "fetch progress"
            );
            while run.next_progress <= run.report.records_written {
                run.next_progress += self.config.log_every;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::failure_log::MemoryFailureLog;
    use crate::models::RawRecord;
    use crate::source::FetchedPage;
    use crate::store::memory::MemoryStore;
    use crate::versions::MemoryVersionStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Offset source over `total` items with scripted per-offset failures
    struct ScriptedSource {
        total: i64,
        limit: i64,
        failures: Mutex<HashMap<i64, Vec<SourceError>>>,
        /// Token cancelled while the page at this offset is being fetched
        cancel_at: Mutex<Option<(i64, CancellationToken)>>,
    }

    impl ScriptedSource {
        fn new(total: i64, limit: i64) -> Self {
            Self {
                total,
                limit,
                failures: Mutex::new(HashMap::new()),
                cancel_at: Mutex::new(None),
            }
        }

        async fn fail_at(&self, offset: i64, errors: Vec<SourceError>) {
            self.failures.lock().await.insert(offset, errors);
        }

        async fn cancel_at(&self, offset: i64, token: CancellationToken) {
            *self.cancel_at.lock().await = Some((offset, token));
        }
    }

    #[async_trait]
    impl SourceConnector for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn open(&self, start: &Cursor) -> Result<PagePlan, SourceError> {
            Ok(PagePlan::Offsets {
                next: start.as_offset().unwrap(),
                limit: self.limit,
            })
        }

        async fn fetch_page(&self, page: &PageSpec) -> Result<FetchedPage, SourceError> {
            let offset = page.start.as_offset().unwrap();
            if let Some((at, token)) = self.cancel_at.lock().await.as_ref() {
                if *at == offset {
                    token.cancel();
                }
            }
            if let Some(errors) = self.failures.lock().await.get_mut(&offset) {
                if !errors.is_empty() {
                    return Err(errors.remove(0));
                }
            }
            let end = (offset + self.limit).min(self.total).max(offset);
            let records = (offset..end)
                .map(|i| {
                    let modified = format!("2024-05-{:02}T08:00:00Z", i % 28 + 1);
                    RawRecord::new(
                        format!("m{i:04}"),
                        json!({"id": i, "last_modified": modified}),
                        page.start.clone(),
                    )
                })
                .collect::<Vec<_>>();
            Ok(FetchedPage {
                next: Cursor::Offset(end),
                last: end - offset < self.limit,
                records,
                rejects: Vec::new(),
            })
        }
    }

    fn config(workers: usize) -> JobConfig {
        JobConfig {
            job_name: "scripted".to_string(),
            table_name: "raw".to_string(),
            num_workers: workers,
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
            limit: 10,
            ..JobConfig::default()
        }
    }

    struct Harness {
        source: Arc<ScriptedSource>,
        store: Arc<MemoryStore>,
        checkpoints: Arc<MemoryCheckpointStore>,
        failures: Arc<MemoryFailureLog>,
    }

    impl Harness {
        fn new(total: i64) -> Self {
            Self {
                source: Arc::new(ScriptedSource::new(total, 10)),
                store: Arc::new(MemoryStore::new()),
                checkpoints: Arc::new(MemoryCheckpointStore::new()),
                failures: Arc::new(MemoryFailureLog::new()),
            }
        }

        fn pool(&self, config: JobConfig) -> FetchPool {
            FetchPool::new(
                self.source.clone(),
                self.store.clone(),
                self.checkpoints.clone(),
                self.failures.clone(),
                config,
            )
        }

        async fn raw_count(&self) -> usize {
            self.store.raw_rows(&TableName::new("raw").unwrap()).await.len()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_everything_and_commits_end() {
        let h = Harness::new(45);
        let report = h.pool(config(3)).run().await.unwrap();

        assert_eq!(report.records_written, 45);
        assert_eq!(h.raw_count().await, 45);
        assert_eq!(report.last_cursor, Some(Cursor::Offset(45)));
        assert!(report.newest_fetched_at.is_some());
        let history = h.checkpoints.history("scripted", "raw").await;
        assert!(history.windows(2).all(|w| w[0].as_offset() < w[1].as_offset()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let h = Harness::new(30);
        h.source
            .fail_at(10, vec![SourceError::Transient("503".into()), SourceError::Transient("503".into())])
            .await;

        let report = h.pool(config(2)).run().await.unwrap();
        assert_eq!(report.units_failed, 0);
        assert_eq!(h.raw_count().await, 30);
        assert!(h.failures.entries().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_page_is_logged_and_skipped() {
        let h = Harness::new(30);
        h.source
            .fail_at(10, vec![SourceError::Transient("503".into()); 3])
            .await;

        let report = h.pool(config(2)).run().await.unwrap();
        assert_eq!(report.units_failed, 1);
        assert_eq!(h.raw_count().await, 20);
        assert_eq!(report.last_cursor, Some(Cursor::Offset(30)));

        let entries = h.failures.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempt_count, 3);
        assert_eq!(entries[0].cursor, Some(Cursor::Offset(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_source_error_aborts() {
        let h = Harness::new(50);
        h.source
            .fail_at(20, vec![SourceError::Fatal("401".into())])
            .await;

        let err = h.pool(config(1)).run().await.unwrap_err();
        assert!(matches!(err, PipelineError::Source { .. }));
        assert_eq!(
            h.checkpoints.load("scripted", "raw").await.unwrap().unwrap().cursor,
            Cursor::Offset(20)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_from_checkpoint_and_explicit_offset_wins() {
        let h = Harness::new(40);
        h.checkpoints.save("scripted", "raw", &Cursor::Offset(30)).await.unwrap();

        let report = h.pool(config(2)).run().await.unwrap();
        assert_eq!(report.records_written, 10);

        let mut explicit = config(2);
        explicit.offset = Some(0);
        let report = h.pool(explicit).run().await.unwrap();
        assert_eq!(report.records_written, 40);
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_aborts_before_fetching() {
        let h = Harness::new(10);
        h.checkpoints.corrupt("scripted", "raw").await;

        let err = h.pool(config(1)).run().await.unwrap_err();
        assert!(matches!(err, PipelineError::CorruptCheckpoint { .. }));
        assert_eq!(h.raw_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debug_mode_runs_inline() {
        let h = Harness::new(25);
        let mut debug = config(8);
        debug.debug = true;

        let report = h.pool(debug).run().await.unwrap();
        assert_eq!(report.records_written, 25);
        assert_eq!(
            h.checkpoints.history("scripted", "raw").await,
            vec![Cursor::Offset(10), Cursor::Offset(20), Cursor::Offset(25)]
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start_claims_nothing() {
        let h = Harness::new(25);
        let token = CancellationToken::new();
        token.cancel();

        let report = h.pool(config(2)).with_cancellation(token).run().await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.records_written, 0);
        assert_eq!(report.last_cursor, None);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_keeps_checkpoint_on_stored_pages() {
        let h = Harness::new(100);
        let token = CancellationToken::new();
        h.source.cancel_at(30, token.clone()).await;
        let mut inline = config(4);
        inline.debug = true;

        let report = h.pool(inline).with_cancellation(token).run().await.unwrap();

        // The page in hand when the token fired still lands; nothing after it is claimed
        assert!(report.cancelled);
        assert_eq!(report.units_completed, 4);
        assert_eq!(report.records_written, 40);
        assert_eq!(h.raw_count().await, 40);
        assert_eq!(report.last_cursor, Some(Cursor::Offset(40)));
        assert_eq!(
            h.checkpoints.history("scripted", "raw").await.last(),
            Some(&Cursor::Offset(40))
        );

        // The next run carries on from the checkpoint
        let rest = h.pool(config(4)).run().await.unwrap();
        assert!(!rest.cancelled);
        assert_eq!(rest.records_written, 60);
        assert_eq!(h.raw_count().await, 100);
    }

    #[tokio::test]
    async fn test_cancel_with_pages_in_flight_drains_them() {
        let h = Harness::new(100);
        let token = CancellationToken::new();
        h.source.cancel_at(30, token.clone()).await;

        let report = h.pool(config(3)).with_cancellation(token).run().await.unwrap();

        assert!(report.cancelled);
        let stored = h.raw_count().await as i64;
        assert!(stored < 100);
        let Some(Cursor::Offset(checkpoint)) = report.last_cursor else {
            panic!("expected an offset checkpoint");
        };
        // Every claimed page drained, so the checkpoint sits exactly on the stored rows
        assert!(checkpoint >= 40);
        assert_eq!(checkpoint, stored);
        assert_eq!(report.records_written as i64, stored);
    }

    #[tokio::test]
    async fn test_completed_run_records_newest_modification_date() {
        let h = Harness::new(25);
        let versions = Arc::new(MemoryVersionStore::new());

        let report = h.pool(config(3)).with_versions(versions.clone()).run().await.unwrap();

        assert_eq!(report.version.as_deref(), Some("2024-05-25"));
        assert_eq!(
            report.newest_modified.map(|d| d.to_rfc3339()),
            Some("2024-05-25T08:00:00+00:00".to_string())
        );
        let stored = versions.current("raw").await.unwrap().unwrap();
        assert_eq!(stored.version, "2024-05-25");

        // A run that stores nothing new leaves the version alone
        let again = h.pool(config(3)).with_versions(versions.clone()).run().await.unwrap();
        assert_eq!(again.records_written, 0);
        assert_eq!(again.version, None);
        assert_eq!(versions.current("raw").await.unwrap().unwrap(), stored);
    }

    #[tokio::test]
    async fn test_cancelled_run_records_no_version() {
        let h = Harness::new(100);
        let versions = Arc::new(MemoryVersionStore::new());
        let token = CancellationToken::new();
        h.source.cancel_at(10, token.clone()).await;
        let mut inline = config(2);
        inline.debug = true;

        let report = h
            .pool(inline)
            .with_versions(versions.clone())
            .with_cancellation(token)
            .run()
            .await
            .unwrap();

        assert!(report.cancelled);
        assert!(report.newest_modified.is_some());
        assert_eq!(report.version, None);
        assert!(versions.current("raw").await.unwrap().is_none());
    }
}
