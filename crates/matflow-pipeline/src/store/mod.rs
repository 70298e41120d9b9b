//! Raw and canonical record stores
//!
//! The pipeline touches a relational store only through upsert-by-id,
//! id-ordered range reads and transactional batch writes. Postgres is the
//! primary engine, MySQL the secondary one; [`MemoryStore`] backs tests and
//! dry runs.

pub mod memory;
pub mod mysql;
pub mod postgres;

pub use memory::MemoryStore;
pub use mysql::MySqlStore;
pub use postgres::PgStore;

use crate::error::StoreError;
use crate::models::{CanonicalRecord, RawRecord, TaskRecord};
use async_trait::async_trait;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// A table identifier that is safe to splice into SQL
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName(String);

// The pattern is a literal, so compilation cannot fail
#[allow(clippy::unwrap_used)]
fn table_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap())
}

impl TableName {
    pub fn new(name: impl Into<String>) -> Result<Self, StoreError> {
        let name = name.into();
        if table_pattern().is_match(&name) {
            Ok(Self(name))
        } else {
            Err(StoreError::InvalidTable(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store written by the fetch stage and read by the transform stage
#[async_trait]
pub trait RawStore: Send + Sync {
    /// Check the store is reachable
    async fn ping(&self) -> Result<(), StoreError>;

    /// Insert or overwrite records by id; returns the number of rows touched
    async fn upsert_raw(&self, table: &TableName, records: &[RawRecord]) -> Result<u64, StoreError>;

    /// Up to `limit` records with id greater than `after`, in id order
    async fn read_raw(
        &self,
        table: &TableName,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, StoreError>;

    /// Id at 0-based `position` in id order, if the table is that long
    async fn raw_id_at(&self, table: &TableName, position: u64) -> Result<Option<String>, StoreError>;

    /// Task rows whose `foreign_key` payload field matches one of `ids`,
    /// ordered by task id
    async fn tasks_for(
        &self,
        table: &TableName,
        foreign_key: &str,
        ids: &[String],
    ) -> Result<Vec<TaskRecord>, StoreError>;
}

/// Store written by the transform stage and read by the export stage
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Upsert all records in one transaction
    async fn upsert_canonical(
        &self,
        table: &TableName,
        records: &[CanonicalRecord],
    ) -> Result<u64, StoreError>;

    async fn read_canonical(
        &self,
        table: &TableName,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, StoreError>;

    async fn canonical_id_at(
        &self,
        table: &TableName,
        position: u64,
    ) -> Result<Option<String>, StoreError>;

    async fn count_canonical(&self, table: &TableName) -> Result<u64, StoreError>;
}

/// Pull the foreign key out of a task payload, accepting strings and numbers
pub(crate) fn foreign_key_of(payload: &serde_json::Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_names() {
        assert!(TableName::new("alexandria_raw").is_ok());
        assert!(TableName::new("_tmp2").is_ok());
        assert!(TableName::new("2fast").is_err());
        assert!(TableName::new("raw; DROP TABLE x").is_err());
        assert!(TableName::new("").is_err());
        assert!(TableName::new("a".repeat(64)).is_err());
    }

    #[test]
    fn test_foreign_key_extraction() {
        assert_eq!(
            foreign_key_of(&json!({"material_id": "mp-1"}), "material_id").as_deref(),
            Some("mp-1")
        );
        assert_eq!(
            foreign_key_of(&json!({"entry_id": 42}), "entry_id").as_deref(),
            Some("42")
        );
        assert_eq!(foreign_key_of(&json!({"other": 1}), "material_id"), None);
    }
}
