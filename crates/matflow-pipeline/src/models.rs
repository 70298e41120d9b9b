//! Records, cursors and bookkeeping types that flow between pipeline stages

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Position in a source sequence or a table.
///
/// Paginated APIs and archives move by integer offsets, bucket listings and
/// id-ordered table scans move by opaque tokens (object keys, record ids).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cursor {
    Offset(i64),
    Token(String),
}

impl Cursor {
    pub fn start() -> Self {
        Cursor::Offset(0)
    }

    pub fn as_offset(&self) -> Option<i64> {
        match self {
            Cursor::Offset(offset) => Some(*offset),
            Cursor::Token(_) => None,
        }
    }

    pub fn as_token(&self) -> Option<&str> {
        match self {
            Cursor::Token(token) => Some(token),
            Cursor::Offset(_) => None,
        }
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor::start()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Offset(offset) => write!(f, "offset:{offset}"),
            Cursor::Token(token) => write!(f, "token:{token}"),
        }
    }
}

/// Unmodified source payload keyed by its natural id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    pub payload: Value,
    /// Page or offset the record was retrieved from
    pub source_cursor: Cursor,
    pub fetched_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn new(id: impl Into<String>, payload: Value, source_cursor: Cursor) -> Self {
        Self {
            id: id.into(),
            payload,
            source_cursor,
            fetched_at: Utc::now(),
        }
    }

    /// Source-side modification time, from `last_modified` at the top level
    /// or under OPTIMADE `attributes`
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        let value = self
            .payload
            .get("last_modified")
            .or_else(|| self.payload.get("attributes")?.get("last_modified"))?
            .as_str()?;
        parse_timestamp(value)
    }
}

/// RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS` taken as UTC, or a bare date
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Some(at.with_timezone(&Utc));
    }
    if let Ok(at) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(at.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|at| at.and_utc())
}

/// Row of a secondary raw table that references a primary record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Foreign key into the primary table
    pub material_id: String,
    /// Natural id of the task row itself
    pub task_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub source_id: String,
    pub transform_version: String,
}

/// Normalized, source-agnostic output row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: String,
    pub structure: Value,
    /// Ordered intermediate states, present only in trajectory mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trajectory: Option<Vec<Value>>,
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// Last completed cursor for a (job, table) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_name: String,
    pub table_name: String,
    pub cursor: Cursor,
    pub updated_at: DateTime<Utc>,
}

/// Version a dataset was last synced to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetVersion {
    /// Raw table name, or `{canonical table}_transform`
    pub dataset_name: String,
    pub version: String,
    pub synced_at: DateTime<Utc>,
}

/// One permanently failed unit: a page, a record or an export chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub job_name: String,
    pub table_name: String,
    pub url_or_id: String,
    pub cursor: Option<Cursor>,
    pub attempt_count: u32,
    pub last_error: String,
    pub timestamp: DateTime<Utc>,
}

impl FailureEntry {
    pub fn new(
        job_name: &str,
        table_name: &str,
        url_or_id: impl Into<String>,
        attempt_count: u32,
        last_error: impl fmt::Display,
    ) -> Self {
        Self {
            job_name: job_name.to_string(),
            table_name: table_name.to_string(),
            url_or_id: url_or_id.into(),
            cursor: None,
            attempt_count,
            last_error: last_error.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn at(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Transform,
    Export,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Fetch => write!(f, "fetch"),
            Stage::Transform => write!(f, "transform"),
            Stage::Export => write!(f, "export"),
        }
    }
}

/// Outcome of a job that ran to completion or was cancelled.
///
/// Fatal conditions never produce a report; they surface as
/// [`crate::error::PipelineError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub stage: Stage,
    pub job_name: String,
    pub table_name: String,
    /// Pages, batches or chunks that were settled
    pub units_completed: u64,
    /// Pages, batches or chunks that exhausted their retries
    pub units_failed: u64,
    pub records_written: u64,
    pub records_failed: u64,
    pub records_skipped: u64,
    /// Last cursor durably committed to the checkpoint store
    pub last_cursor: Option<Cursor>,
    /// Newest `fetched_at` among the records written by a fetch job
    pub newest_fetched_at: Option<DateTime<Utc>>,
    /// Newest source `last_modified` among the records written by a fetch job
    pub newest_modified: Option<DateTime<Utc>>,
    /// Dataset version recorded when the run finished
    pub version: Option<String>,
    pub cancelled: bool,
}

impl JobReport {
    pub fn new(stage: Stage, job_name: &str, table_name: &str) -> Self {
        Self {
            stage,
            job_name: job_name.to_string(),
            table_name: table_name.to_string(),
            units_completed: 0,
            units_failed: 0,
            records_written: 0,
            records_failed: 0,
            records_skipped: 0,
            last_cursor: None,
            newest_fetched_at: None,
            newest_modified: None,
            version: None,
            cancelled: false,
        }
    }

    /// Fetch and transform succeed despite per-unit failures; an export fails
    /// when any chunk could not be uploaded.
    pub fn succeeded(&self) -> bool {
        match self.stage {
            Stage::Fetch | Stage::Transform => true,
            Stage::Export => self.units_failed == 0,
        }
    }
}
