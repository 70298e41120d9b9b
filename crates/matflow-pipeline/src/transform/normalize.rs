//! Normalization seam between raw payloads and canonical records

use crate::models::{CanonicalRecord, RawRecord, TaskRecord};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Result of normalizing one joined row
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Record(CanonicalRecord),
    /// Nothing to emit for this row; not an error
    Skip(String),
}

/// Input the normalizer refuses; the row is logged and the batch goes on
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("missing field '{0}'")]
    MissingField(String),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
}

impl NormalizeError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        NormalizeError::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Pure, deterministic mapping from a raw row and its tasks to a canonical row.
///
/// Implementations must not perform I/O: the transform pool runs them on
/// blocking threads and relies on re-runs producing identical output.
pub trait Normalizer: Send + Sync {
    /// Source name recorded in provenance
    fn source(&self) -> &str;

    /// Recorded in provenance; bump when the output shape changes
    fn version(&self) -> &str;

    fn normalize(&self, raw: &RawRecord, tasks: &[TaskRecord]) -> Result<Outcome, NormalizeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransformMode {
    #[default]
    Structure,
    Trajectory,
}

impl FromStr for TransformMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "structure" | "structures" => Ok(TransformMode::Structure),
            "trajectory" | "trajectories" => Ok(TransformMode::Trajectory),
            other => Err(format!("unknown transform mode '{other}'")),
        }
    }
}

impl fmt::Display for TransformMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformMode::Structure => write!(f, "structure"),
            TransformMode::Trajectory => write!(f, "trajectory"),
        }
    }
}
