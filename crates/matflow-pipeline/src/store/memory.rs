//! In-memory raw and canonical store
//!
//! Tables are `BTreeMap`s keyed by id, so id-ordered reads come for free.
//! Write failures can be injected to exercise retry paths.

use super::{foreign_key_of, CanonicalStore, RawStore, TableName};
use crate::error::StoreError;
use crate::models::{CanonicalRecord, RawRecord, TaskRecord};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    raw: RwLock<HashMap<String, BTreeMap<String, RawRecord>>>,
    canonical: RwLock<HashMap<String, BTreeMap<String, CanonicalRecord>>>,
    failing_raw_writes: AtomicU32,
    failing_canonical_writes: AtomicU32,
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` raw upserts fail with a transient error
    pub fn fail_raw_writes(&self, n: u32) {
        self.failing_raw_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` canonical upserts fail with a transient error
    pub fn fail_canonical_writes(&self, n: u32) {
        self.failing_canonical_writes.store(n, Ordering::SeqCst);
    }

    pub async fn raw_rows(&self, table: &TableName) -> Vec<RawRecord> {
        self.raw
            .read()
            .await
            .get(table.as_str())
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn canonical_rows(&self, table: &TableName) -> Vec<CanonicalRecord> {
        self.canonical
            .read()
            .await
            .get(table.as_str())
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RawStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_raw(&self, table: &TableName, records: &[RawRecord]) -> Result<u64, StoreError> {
        if take_failure(&self.failing_raw_writes) {
            return Err(StoreError::Unavailable("injected raw write failure".to_string()));
        }
        let mut tables = self.raw.write().await;
        let rows = tables.entry(table.as_str().to_string()).or_default();
        for record in records {
            rows.insert(record.id.clone(), record.clone());
        }
        Ok(records.len() as u64)
    }

    async fn read_raw(
        &self,
        table: &TableName,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, StoreError> {
        let tables = self.raw.read().await;
        let Some(rows) = tables.get(table.as_str()) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter(|r| after.map_or(true, |a| r.id.as_str() > a))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn raw_id_at(&self, table: &TableName, position: u64) -> Result<Option<String>, StoreError> {
        let tables = self.raw.read().await;
        Ok(tables
            .get(table.as_str())
            .and_then(|rows| rows.keys().nth(position as usize).cloned()))
    }

    async fn tasks_for(
        &self,
        table: &TableName,
        foreign_key: &str,
        ids: &[String],
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let tables = self.raw.read().await;
        let Some(rows) = tables.get(table.as_str()) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter_map(|row| {
                let material_id = foreign_key_of(&row.payload, foreign_key)?;
                wanted.contains(material_id.as_str()).then(|| TaskRecord {
                    material_id,
                    task_id: row.id.clone(),
                    payload: row.payload.clone(),
                })
            })
            .collect())
    }
}

#[async_trait]
impl CanonicalStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_canonical(
        &self,
        table: &TableName,
        records: &[CanonicalRecord],
    ) -> Result<u64, StoreError> {
        if take_failure(&self.failing_canonical_writes) {
            return Err(StoreError::Unavailable(
                "injected canonical write failure".to_string(),
            ));
        }
        // One write lock for the whole batch keeps it all-or-nothing
        let mut tables = self.canonical.write().await;
        let rows = tables.entry(table.as_str().to_string()).or_default();
        for record in records {
            rows.insert(record.id.clone(), record.clone());
        }
        Ok(records.len() as u64)
    }

    async fn read_canonical(
        &self,
        table: &TableName,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, StoreError> {
        let tables = self.canonical.read().await;
        let Some(rows) = tables.get(table.as_str()) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter(|r| after.map_or(true, |a| r.id.as_str() > a))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn canonical_id_at(
        &self,
        table: &TableName,
        position: u64,
    ) -> Result<Option<String>, StoreError> {
        let tables = self.canonical.read().await;
        Ok(tables
            .get(table.as_str())
            .and_then(|rows| rows.keys().nth(position as usize).cloned()))
    }

    async fn count_canonical(&self, table: &TableName) -> Result<u64, StoreError> {
        let tables = self.canonical.read().await;
        Ok(tables.get(table.as_str()).map_or(0, |rows| rows.len() as u64))
    }
}
