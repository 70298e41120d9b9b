//! Gzipped JSON Lines objects listed under a bucket prefix
//!
//! Each data object is one page. Keys are processed in lexicographic order and
//! the resume cursor is the last fully stored key.

use super::{FetchedPage, PagePlan, PageSpec, Reject, SourceConnector};
use crate::error::SourceError;
use crate::models::{Cursor, RawRecord};
use crate::storage::ObjectStorage;
use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use tracing::{debug, info, instrument};

const DATA_SUFFIX: &str = ".jsonl.gz";
const MANIFEST_MARKER: &str = "manifest";

pub struct BucketListingSource {
    name: String,
    storage: ObjectStorage,
    prefix: String,
    id_field: String,
}

impl BucketListingSource {
    pub fn new(name: &str, storage: ObjectStorage, prefix: &str, id_field: &str) -> Self {
        Self {
            name: name.to_string(),
            storage,
            prefix: prefix.to_string(),
            id_field: id_field.to_string(),
        }
    }
}

/// Whether a listed key holds records
pub(crate) fn is_data_key(key: &str) -> bool {
    key.ends_with(DATA_SUFFIX) && !key.contains(MANIFEST_MARKER)
}

/// One page per data key at or after `start`.
///
/// `Token(k)` resumes after key `k`; `Offset(n)` skips the first `n` data keys.
pub(crate) fn plan_keys(mut keys: Vec<String>, start: &Cursor) -> VecDeque<PageSpec> {
    keys.retain(|key| is_data_key(key));
    keys.sort();
    keys.dedup();

    let remaining: Vec<String> = match start {
        Cursor::Token(after) => keys.into_iter().filter(|k| k > after).collect(),
        Cursor::Offset(skip) => keys.into_iter().skip((*skip).max(0) as usize).collect(),
    };

    let mut previous = start.clone();
    remaining
        .into_iter()
        .enumerate()
        .map(|(index, key)| {
            let end = Cursor::Token(key);
            PageSpec {
                index: index as u64,
                start: std::mem::replace(&mut previous, end.clone()),
                end,
                seek: None,
            }
        })
        .collect()
}

/// Decode a gzipped JSON Lines object into records and rejects
pub(crate) fn parse_object(
    key: &str,
    data: &[u8],
    id_field: &str,
    cursor: &Cursor,
) -> Result<(Vec<RawRecord>, Vec<Reject>), SourceError> {
    let reader = BufReader::new(MultiGzDecoder::new(data));
    let mut records = Vec::new();
    let mut rejects = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| SourceError::Permanent(format!("{key}: corrupt object: {e}")))?;
        if line.trim().is_empty() {
            continue;
        }
        let locator = format!("{key}:{}", line_no + 1);
        match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(item) => match super::id_of(&item, id_field) {
                Some(id) => records.push(RawRecord::new(id, item, cursor.clone())),
                None => rejects.push(Reject {
                    locator,
                    reason: format!("missing '{id_field}'"),
                }),
            },
            Err(e) => rejects.push(Reject {
                locator,
                reason: format!("invalid JSON: {e}"),
            }),
        }
    }
    Ok((records, rejects))
}

#[async_trait]
impl SourceConnector for BucketListingSource {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(source = %self.name, prefix = %self.prefix))]
    async fn open(&self, start: &Cursor) -> Result<PagePlan, SourceError> {
        let keys = self
            .storage
            .list(&self.prefix, start.as_token())
            .await
            .map_err(|e| SourceError::Fatal(e.to_string()))?;
        let listed = keys.len();
        let pages = plan_keys(keys, start);
        info!(listed, pages = pages.len(), "bucket listing planned");
        Ok(PagePlan::Listed(pages))
    }

    #[instrument(skip(self, page), fields(source = %self.name, key = %page.end))]
    async fn fetch_page(&self, page: &PageSpec) -> Result<FetchedPage, SourceError> {
        let key = page
            .end
            .as_token()
            .ok_or_else(|| SourceError::Permanent(format!("page {} has no object key", page.index)))?
            .to_string();

        let data = self.storage.get(&key).await?;

        let id_field = self.id_field.clone();
        let cursor = page.end.clone();
        let key_for_parse = key.clone();
        let (records, rejects) = tokio::task::spawn_blocking(move || {
            parse_object(&key_for_parse, &data, &id_field, &cursor)
        })
        .await
        .map_err(|e| SourceError::Permanent(format!("{key}: decoder task failed: {e}")))??;

        debug!(records = records.len(), rejects = rejects.len(), "object decoded");
        Ok(FetchedPage {
            records,
            rejects,
            next: page.end.clone(),
            last: false,
        })
    }

    fn locate(&self, page: &PageSpec) -> String {
        match page.end.as_token() {
            Some(key) => format!("s3://{}/{key}", self.storage.bucket()),
            None => format!("{}@{}", self.name, page.start),
        }
    }
}
