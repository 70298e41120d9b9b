//! Matflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging setup and content fingerprinting for the
//! matflow workspace.
//!
//! - **Error Handling**: [`MatflowError`] and the [`Result`] alias
//! - **Logging**: [`logging::LogConfig`] and [`logging::init_logging`]
//! - **Fingerprints**: SHA-256 digests of files and JSON payloads
//!
//! # Example
//!
//! ```no_run
//! use matflow_common::fingerprint::json_fingerprint;
//!
//! let hash = json_fingerprint(&serde_json::json!({"formula": "NaCl"})).unwrap();
//! assert_eq!(hash.len(), 64);
//! ```

pub mod error;
pub mod fingerprint;
pub mod logging;

pub use error::{MatflowError, Result};
