//! S3-compatible object storage client used by the bucket connector and the
//! S3 shard uploader

use crate::config::StorageConfig;
use crate::error::StorageError;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Region, primitives::ByteStream, Client};
use tracing::{debug, info, instrument};

#[derive(Clone)]
pub struct ObjectStorage {
    client: Client,
    bucket: String,
}

impl ObjectStorage {
    pub async fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        if config.bucket.is_empty() {
            return Err(StorageError::Permanent("no bucket configured".to_string()));
        }

        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials = Credentials::new(access_key, secret_key, None, None, "matflow");
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
            },
            _ => {
                // Public buckets: unsigned requests
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .no_credentials()
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        }
        .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());
        info!(bucket = %config.bucket, "object storage client initialized");

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Every key under `prefix` that sorts after `start_after`, in key order
    #[instrument(skip(self))]
    pub async fn list(&self, prefix: &str, start_after: Option<&str>) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            } else if let Some(after) = start_after {
                request = request.start_after(after);
            }

            let response = request
                .send()
                .await
                .map_err(|e| StorageError::from_sdk(e, "list objects"))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                },
                _ => break,
            }
        }

        debug!(count = keys.len(), "listed objects");
        Ok(keys)
    }

    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::from_sdk(e, key))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Transient(format!("{key}: {e}")))?
            .into_bytes()
            .to_vec();

        debug!(bytes = data.len(), "downloaded object");
        Ok(data)
    }

    #[instrument(skip(self, data), fields(bytes = data.len()))]
    pub async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::from_sdk(e, key))?;

        debug!(bucket = %self.bucket, "uploaded object");
        Ok(())
    }
}
