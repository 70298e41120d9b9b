//! Shard encoding and upload targets

use crate::error::UploadError;
use crate::models::CanonicalRecord;
use crate::storage::ObjectStorage;
use async_trait::async_trait;
use matflow_common::fingerprint::sha256_hex;
use std::path::{Path, PathBuf};
use tracing::debug;

const SHARD_CONTENT_TYPE: &str = "application/x-ndjson";

/// Object name of chunk `index` under `destination`
pub fn shard_name(destination: &str, index: u64) -> String {
    format!("{}/chunk_{index:06}.jsonl", destination.trim_end_matches('/'))
}

/// One serialized chunk: JSON Lines, one canonical record per line
#[derive(Debug, Clone, PartialEq)]
pub struct Shard {
    pub index: u64,
    pub first_id: String,
    pub last_id: String,
    pub rows: usize,
    pub body: Vec<u8>,
    pub sha256: String,
}

impl Shard {
    pub fn encode(index: u64, records: &[CanonicalRecord]) -> Result<Self, UploadError> {
        let mut body = Vec::new();
        for record in records {
            serde_json::to_writer(&mut body, record)?;
            body.push(b'\n');
        }
        Ok(Self {
            index,
            first_id: records.first().map(|r| r.id.clone()).unwrap_or_default(),
            last_id: records.last().map(|r| r.id.clone()).unwrap_or_default(),
            rows: records.len(),
            sha256: sha256_hex(&body),
            body,
        })
    }
}

/// Remote hub seam: receives one shard per call
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Where shards end up, for logs and failure entries
    fn locate(&self, destination: &str, chunk_index: u64) -> String;

    async fn upload(&self, destination: &str, chunk_index: u64, shard: &Shard) -> Result<(), UploadError>;
}

/// Shards as objects in an S3-compatible bucket
pub struct S3Uploader {
    storage: ObjectStorage,
    prefix: String,
}

impl S3Uploader {
    pub fn new(storage: ObjectStorage, prefix: &str) -> Self {
        Self {
            storage,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn key(&self, destination: &str, chunk_index: u64) -> String {
        let name = shard_name(destination, chunk_index);
        if self.prefix.is_empty() {
            name
        } else {
            format!("{}/{name}", self.prefix)
        }
    }
}

#[async_trait]
impl Uploader for S3Uploader {
    fn locate(&self, destination: &str, chunk_index: u64) -> String {
        format!("s3://{}/{}", self.storage.bucket(), self.key(destination, chunk_index))
    }

    async fn upload(&self, destination: &str, chunk_index: u64, shard: &Shard) -> Result<(), UploadError> {
        let key = self.key(destination, chunk_index);
        self.storage
            .put(&key, shard.body.clone(), SHARD_CONTENT_TYPE)
            .await?;
        debug!(key = %key, sha256 = %shard.sha256, "shard uploaded");
        Ok(())
    }
}

/// Shards as files under a local directory
pub struct LocalDirUploader {
    root: PathBuf,
}

impl LocalDirUploader {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn path_of(&self, destination: &str, chunk_index: u64) -> PathBuf {
        self.root.join(shard_name(destination, chunk_index))
    }
}

#[async_trait]
impl Uploader for LocalDirUploader {
    fn locate(&self, destination: &str, chunk_index: u64) -> String {
        self.path_of(destination, chunk_index).display().to_string()
    }

    async fn upload(&self, destination: &str, chunk_index: u64, shard: &Shard) -> Result<(), UploadError> {
        let path = self.path_of(destination, chunk_index);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Readers never see a half-written shard
        let partial = path.with_extension("jsonl.part");
        tokio::fs::write(&partial, &shard.body).await?;
        tokio::fs::rename(&partial, &path).await?;
        debug!(path = %path.display(), rows = shard.rows, "shard written");
        Ok(())
    }
}
