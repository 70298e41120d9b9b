//! Source connectors
//!
//! A connector turns a start cursor into a lazy, restartable sequence of
//! pages. Each page carries the raw records it produced plus the cursor to
//! resume from once the page is durably stored. Three variants exist:
//!
//! - [`PaginatedApiSource`]: OPTIMADE-style `page_limit` / `page_offset` APIs
//! - [`BucketListingSource`]: gzipped JSON Lines objects under a bucket prefix
//! - [`BulkArchiveSource`]: one large downloadable JSON Lines dump
//!
//! Resuming from any cursor yields the same records as an uninterrupted run
//! from that point.

pub mod archive;
pub mod bucket;
pub mod paginated;

pub use archive::BulkArchiveSource;
pub use bucket::BucketListingSource;
pub use paginated::PaginatedApiSource;

use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::models::{Cursor, RawRecord};
use crate::storage::ObjectStorage;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;

/// One claimable unit of source work
#[derive(Debug, Clone, PartialEq)]
pub struct PageSpec {
    /// Claim order; checkpoints advance in this order
    pub index: u64,
    pub start: Cursor,
    /// Cursor to resume from when the page fails permanently
    pub end: Cursor,
    /// Connector-private position, e.g. a byte offset into an archive
    pub seek: Option<u64>,
}

/// Item the connector could not turn into a record
#[derive(Debug, Clone, PartialEq)]
pub struct Reject {
    pub locator: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    pub records: Vec<RawRecord>,
    pub rejects: Vec<Reject>,
    /// Where the next run should start once this page is stored
    pub next: Cursor,
    /// No data exists past this page
    pub last: bool,
}

/// Lazy page sequence produced by [`SourceConnector::open`]
#[derive(Debug, Clone, PartialEq)]
pub enum PagePlan {
    /// Open-ended integer offsets; ends when a page reports `last`
    Offsets { next: i64, limit: i64 },
    /// Pages known up front
    Listed(VecDeque<PageSpec>),
}

impl PagePlan {
    /// Claim the next page, numbering it `index`
    pub fn next_page(&mut self, index: u64) -> Option<PageSpec> {
        match self {
            PagePlan::Offsets { next, limit } => {
                let start = *next;
                *next += *limit;
                Some(PageSpec {
                    index,
                    start: Cursor::Offset(start),
                    end: Cursor::Offset(start + *limit),
                    seek: None,
                })
            },
            PagePlan::Listed(pages) => pages.pop_front().map(|mut page| {
                page.index = index;
                page
            }),
        }
    }
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn name(&self) -> &str;

    /// Plan pages starting at `start`. Failing here is fatal for the job.
    async fn open(&self, start: &Cursor) -> Result<PagePlan, SourceError>;

    async fn fetch_page(&self, page: &PageSpec) -> Result<FetchedPage, SourceError>;

    /// Human-usable address of a page for the failure log
    fn locate(&self, page: &PageSpec) -> String {
        format!("{}@{}", self.name(), page.start)
    }
}

/// Build the connector for a configured source variant
pub async fn connect(config: &SourceConfig) -> Result<Arc<dyn SourceConnector>, SourceError> {
    let connector: Arc<dyn SourceConnector> = match config {
        SourceConfig::PaginatedApi {
            name,
            base_url,
            limit,
        } => Arc::new(PaginatedApiSource::new(name, base_url, *limit)?),
        SourceConfig::BucketListing {
            name,
            storage,
            bucket_prefix,
            id_field,
        } => {
            let storage = ObjectStorage::new(storage).await?;
            Arc::new(BucketListingSource::new(name, storage, bucket_prefix, id_field))
        },
        SourceConfig::BulkArchive {
            name,
            archive_url,
            download_dir,
            limit,
            id_field,
        } => Arc::new(BulkArchiveSource::new(
            name,
            archive_url,
            download_dir,
            *limit,
            id_field,
        )?),
    };
    Ok(connector)
}

/// The connector's output as a flat `(record, resume cursor)` sequence.
///
/// Pages are fetched one at a time; rejects are dropped. Handy for tooling
/// and for checking that a resumed sequence matches a full one.
pub fn record_stream(
    connector: Arc<dyn SourceConnector>,
    start: Cursor,
) -> BoxStream<'static, Result<(RawRecord, Cursor), SourceError>> {
    enum State {
        Unopened(Cursor),
        Open(PagePlan, u64),
        Done,
    }

    let pages = stream::unfold(State::Unopened(start), move |state| {
        let connector = connector.clone();
        async move {
            let (mut plan, index) = match state {
                State::Done => return None,
                State::Open(plan, index) => (plan, index),
                State::Unopened(start) => match connector.open(&start).await {
                    Ok(plan) => (plan, 0),
                    Err(e) => return Some((Err(e), State::Done)),
                },
            };
            let page = plan.next_page(index)?;
            match connector.fetch_page(&page).await {
                Ok(fetched) => {
                    let next = if fetched.last {
                        State::Done
                    } else {
                        State::Open(plan, index + 1)
                    };
                    Some((Ok(fetched), next))
                },
                Err(e) => Some((Err(e), State::Done)),
            }
        }
    });

    pages
        .flat_map(|page| match page {
            Ok(fetched) => {
                let next = fetched.next.clone();
                stream::iter(fetched.records.into_iter().map(move |r| Ok((r, next.clone()))))
                    .boxed()
            },
            Err(e) => stream::iter(vec![Err(e)]).boxed(),
        })
        .boxed()
}

/// Id of a JSON item, accepting string and integer ids
pub(crate) fn id_of(item: &serde_json::Value, field: &str) -> Option<String> {
    match item.get(field)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
