//! Error types shared across matflow crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, MatflowError>;

#[derive(Error, Debug)]
pub enum MatflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("Invalid logging setting: {0}")]
    Logging(String),
}
