//! Single downloadable JSON Lines dump
//!
//! The archive is fetched once into the download directory, decompressed if
//! it is gzipped, then indexed so that every page can seek straight to its
//! first entry. Entries are the non-blank lines of the file; the cursor is
//! the entry offset.

use super::{FetchedPage, PagePlan, PageSpec, Reject, SourceConnector};
use crate::error::SourceError;
use crate::models::{Cursor, RawRecord};
use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use futures::StreamExt;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

pub struct BulkArchiveSource {
    name: String,
    archive_url: String,
    download_dir: PathBuf,
    limit: i64,
    id_field: String,
    client: reqwest::Client,
    local: OnceCell<PathBuf>,
}

impl BulkArchiveSource {
    pub fn new(
        name: &str,
        archive_url: &str,
        download_dir: &Path,
        limit: i64,
        id_field: &str,
    ) -> Result<Self, SourceError> {
        if limit <= 0 {
            return Err(SourceError::Fatal(format!("page limit must be positive, got {limit}")));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("matflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Fatal(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            archive_url: archive_url.to_string(),
            download_dir: download_dir.to_path_buf(),
            limit,
            id_field: id_field.to_string(),
            client,
            local: OnceCell::new(),
        })
    }

    /// Local, uncompressed copy of the archive; downloaded on first use
    async fn local_path(&self) -> Result<&PathBuf, SourceError> {
        self.local.get_or_try_init(|| self.prepare()).await
    }

    async fn prepare(&self) -> Result<PathBuf, SourceError> {
        tokio::fs::create_dir_all(&self.download_dir).await?;

        let fetched = match local_source(&self.archive_url) {
            Some(path) => {
                if !path.exists() {
                    return Err(SourceError::Fatal(format!("archive {} not found", path.display())));
                }
                path
            },
            None => self.download().await?,
        };

        if fetched.extension().is_some_and(|ext| ext == "gz") {
            let target = self.download_dir.join(file_stem(&fetched));
            if !target.exists() {
                let from = fetched.clone();
                let to = target.clone();
                tokio::task::spawn_blocking(move || gunzip_file(&from, &to))
                    .await
                    .map_err(|e| SourceError::Fatal(format!("decompression task failed: {e}")))??;
                info!(archive = %target.display(), "archive decompressed");
            }
            return Ok(target);
        }
        Ok(fetched)
    }

    #[instrument(skip(self), fields(source = %self.name, url = %self.archive_url))]
    async fn download(&self) -> Result<PathBuf, SourceError> {
        let file_name = self
            .archive_url
            .rsplit('/')
            .next()
            .map(|s| s.split('?').next().unwrap_or(s))
            .filter(|s| !s.is_empty())
            .unwrap_or("archive.jsonl");
        let target = self.download_dir.join(file_name);
        if target.exists() {
            info!(path = %target.display(), "reusing downloaded archive");
            return Ok(target);
        }

        let response = self.client.get(&self.archive_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::from_status(status, &self.archive_url));
        }

        let partial = target.with_extension("part");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut bytes = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, &target).await?;

        info!(bytes, path = %target.display(), "archive downloaded");
        Ok(target)
    }
}

/// Local path for `file://` URLs and plain filesystem paths
fn local_source(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return None;
    }
    Some(PathBuf::from(url))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive.jsonl".to_string())
}

fn gunzip_file(from: &Path, to: &Path) -> Result<(), SourceError> {
    let partial = to.with_extension("part");
    let mut decoder = MultiGzDecoder::new(BufReader::new(File::open(from)?));
    let mut out = File::create(&partial)?;
    io::copy(&mut decoder, &mut out)
        .map_err(|e| SourceError::Fatal(format!("{}: corrupt archive: {e}", from.display())))?;
    out.sync_all()?;
    std::fs::rename(&partial, to)?;
    Ok(())
}

/// Byte offsets of every page boundary from entry `first` onwards
pub(crate) fn index_pages(path: &Path, first: i64, limit: i64) -> Result<VecDeque<PageSpec>, SourceError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = String::new();
    let mut position = 0u64;
    let mut entry = 0i64;
    let mut starts: Vec<(i64, u64)> = Vec::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        if !line.trim().is_empty() {
            if entry >= first && (entry - first) % limit == 0 {
                starts.push((entry, position));
            }
            entry += 1;
        }
        position += read as u64;
    }

    let total = entry;
    Ok(starts
        .into_iter()
        .enumerate()
        .map(|(index, (start, seek))| PageSpec {
            index: index as u64,
            start: Cursor::Offset(start),
            end: Cursor::Offset((start + limit).min(total)),
            seek: Some(seek),
        })
        .collect())
}

/// Read up to `count` entries starting at byte `seek`
pub(crate) fn read_entries(
    path: &Path,
    seek: u64,
    count: i64,
    id_field: &str,
    cursor: &Cursor,
) -> Result<(Vec<RawRecord>, Vec<Reject>), SourceError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(seek))?;
    let reader = BufReader::new(file);

    let base = cursor.as_offset().unwrap_or_default();
    let mut records = Vec::new();
    let mut rejects = Vec::new();
    let mut seen = 0i64;

    for line in reader.lines() {
        if seen >= count {
            break;
        }
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let locator = format!("{}#{}", path.display(), base + seen);
        seen += 1;
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
impl SourceConnector for BulkArchiveSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, start: &Cursor) -> Result<PagePlan, SourceError> {
        let first = start.as_offset().ok_or_else(|| {
            SourceError::Fatal(format!("{} resumes from entry offsets, got {start}", self.name))
        })?;
        let path = self.local_path().await?.clone();
        let limit = self.limit;
        let pages = tokio::task::spawn_blocking(move || index_pages(&path, first, limit))
            .await
            .map_err(|e| SourceError::Fatal(format!("indexing task failed: {e}")))??;
        info!(source = %self.name, first, pages = pages.len(), "archive indexed");
        Ok(PagePlan::Listed(pages))
    }

    async fn fetch_page(&self, page: &PageSpec) -> Result<FetchedPage, SourceError> {
        let path = self.local_path().await?.clone();
        let seek = page
            .seek
            .ok_or_else(|| SourceError::Permanent(format!("page {} has no byte offset", page.index)))?;
        let count = match (page.start.as_offset(), page.end.as_offset()) {
            (Some(start), Some(end)) => end - start,
            _ => self.limit,
        };
        let id_field = self.id_field.clone();
        let cursor = page.start.clone();
        let (records, rejects) =
            tokio::task::spawn_blocking(move || read_entries(&path, seek, count, &id_field, &cursor))
                .await
                .map_err(|e| SourceError::Permanent(format!("reader task failed: {e}")))??;

        debug!(source = %self.name, start = %page.start, records = records.len(), "archive page read");
        Ok(FetchedPage {
            records,
            rejects,
            next: page.end.clone(),
            last: false,
        })
    }

    fn locate(&self, page: &PageSpec) -> String {
        format!("{}#{}", self.archive_url, page.start)
    }
}
