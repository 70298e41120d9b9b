//! Error types for the pipeline
//!
//! Every seam has its own error enum. Errors that a retry may cure report
//! `is_transient() == true`; the retry combinator only retries those. A job
//! aborts only through [`PipelineError`], whose variants are all fatal.

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use thiserror::Error;

/// Implemented by errors the retry combinator understands
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

// ============================================================================
// Source errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Timeouts, rate limits, 5xx responses, dropped connections
    #[error("transient source error: {0}")]
    Transient(String),

    /// Malformed page or record, 4xx responses
    #[error("permanent source error: {0}")]
    Permanent(String),

    /// Credentials rejected, source unreachable at open
    #[error("fatal source error: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Fatal(_))
    }

    /// Classify an HTTP status returned by a source
    pub fn from_status(status: reqwest::StatusCode, url: &str) -> Self {
        let message = format!("{url} returned {status}");
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            SourceError::Transient(message)
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            SourceError::Fatal(message)
        } else {
            SourceError::Permanent(message)
        }
    }
}

impl Retryable for SourceError {
    fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            let url = err.url().map(|u| u.to_string()).unwrap_or_default();
            return SourceError::from_status(status, &url);
        }
        if err.is_decode() || err.is_builder() {
            SourceError::Permanent(err.to_string())
        } else {
            SourceError::Transient(err.to_string())
        }
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        SourceError::Transient(err.to_string())
    }
}

impl From<StorageError> for SourceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Transient(msg) => SourceError::Transient(msg),
            StorageError::Permanent(msg) => SourceError::Permanent(msg),
            StorageError::Denied(msg) => SourceError::Fatal(msg),
        }
    }
}

// ============================================================================
// Object storage errors
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("transient object storage error: {0}")]
    Transient(String),

    #[error("object storage error: {0}")]
    Permanent(String),

    #[error("object storage access denied: {0}")]
    Denied(String),
}

impl StorageError {
    /// Classify an S3 SDK failure by transport outcome and HTTP status
    pub fn from_sdk<E>(err: SdkError<E, HttpResponse>, context: &str) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let message = format!("{context}: {}", DisplayErrorContext(&err));
        match &err {
            SdkError::ServiceError(service) => match service.raw().status().as_u16() {
                401 | 403 => StorageError::Denied(message),
                429 | 500..=599 => StorageError::Transient(message),
                _ => StorageError::Permanent(message),
            },
            SdkError::ConstructionFailure(_) => StorageError::Permanent(message),
            _ => StorageError::Transient(message),
        }
    }
}

impl Retryable for StorageError {
    fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

// ============================================================================
// Relational store errors
// ============================================================================

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid table name '{0}'")]
    InvalidTable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be decoded, e.g. a checkpoint cursor
    #[error("corrupt value in {table}: {reason}")]
    Corrupt { table: String, reason: String },

    /// Temporary unavailability reported by a non-SQL backend
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// SQLSTATE codes worth retrying: serialization failure, deadlock, lock timeout
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "57P01"];

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(err) => match err {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => db
                    .code()
                    .map(|code| TRANSIENT_SQLSTATES.contains(&code.as_ref()))
                    .unwrap_or(false),
                _ => false,
            },
            StoreError::Io(_) | StoreError::Unavailable(_) => true,
            StoreError::InvalidTable(_) | StoreError::Serialization(_) | StoreError::Corrupt { .. } => {
                false
            },
        }
    }
}

// ============================================================================
// Upload errors
// ============================================================================

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("transient upload error: {0}")]
    Transient(String),

    #[error("upload rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shard serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Retryable for UploadError {
    fn is_transient(&self) -> bool {
        matches!(self, UploadError::Transient(_) | UploadError::Io(_))
    }
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Transient(msg) => UploadError::Transient(msg),
            StorageError::Permanent(msg) | StorageError::Denied(msg) => UploadError::Rejected(msg),
        }
    }
}

// ============================================================================
// Configuration errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

impl ConfigError {
    pub fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            message: message.into(),
        }
    }
}

// ============================================================================
// Job-level fatal errors
// ============================================================================

/// Conditions under which no further progress is safely possible
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot open source '{name}': {error}")]
    SourceOpen { name: String, error: SourceError },

    #[error("source '{name}' failed fatally: {error}")]
    Source { name: String, error: SourceError },

    #[error("store unavailable: {0}")]
    StoreUnavailable(StoreError),

    #[error("corrupt checkpoint for {job}/{table}: {reason}")]
    CorruptCheckpoint {
        job: String,
        table: String,
        reason: String,
    },

    #[error("checkpoint write failed: {0}")]
    Checkpoint(StoreError),

    #[error("failure log write failed: {0}")]
    FailureLog(StoreError),

    #[error("dataset version write failed: {0}")]
    Version(StoreError),

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl PipelineError {
    /// Map a checkpoint read failure at job start
    pub fn from_checkpoint_load(job: &str, table: &str, err: StoreError) -> Self {
        match err {
            StoreError::Corrupt { reason, .. } => PipelineError::CorruptCheckpoint {
                job: job.to_string(),
                table: table.to_string(),
                reason,
            },
            StoreError::Serialization(e) => PipelineError::CorruptCheckpoint {
                job: job.to_string(),
                table: table.to_string(),
                reason: e.to_string(),
            },
            other => PipelineError::StoreUnavailable(other),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_classification() {
        let url = "https://alexandria.icams.rub.de/pbe/v1/structures";
        assert!(SourceError::from_status(StatusCode::SERVICE_UNAVAILABLE, url).is_transient());
        assert!(SourceError::from_status(StatusCode::TOO_MANY_REQUESTS, url).is_transient());
        assert!(SourceError::from_status(StatusCode::FORBIDDEN, url).is_fatal());
        assert_eq!(
            SourceError::from_status(StatusCode::NOT_FOUND, url),
            SourceError::Permanent(format!("{url} returned 404 Not Found"))
        );
    }

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(StoreError::Unavailable("maintenance".to_string()).is_transient());
        assert!(!StoreError::InvalidTable("a;b".to_string()).is_transient());
    }

    #[test]
    fn test_corrupt_checkpoint_mapping() {
        let err = PipelineError::from_checkpoint_load(
            "alexandria",
            "raw",
            StoreError::Corrupt {
                table: "pipeline_checkpoints".to_string(),
                reason: "unknown cursor kind".to_string(),
            },
        );
        assert!(matches!(err, PipelineError::CorruptCheckpoint { .. }));

        let err = PipelineError::from_checkpoint_load(
            "alexandria",
            "raw",
            StoreError::Database(sqlx::Error::PoolTimedOut),
        );
        assert!(matches!(err, PipelineError::StoreUnavailable(_)));
    }
}
