//! Ordered checkpoint advancement
//!
//! Units (pages, batches, chunks) are numbered in cursor order as they are
//! claimed and may finish in any order. The checkpoint only moves over the
//! longest contiguous run of finished units, so a resumed job never skips a
//! unit that was still in flight.

use crate::checkpoint::CheckpointStore;
use crate::error::PipelineError;
use crate::models::Cursor;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Tracks finished units and yields the end marker of the contiguous prefix
#[derive(Debug)]
pub struct OrderedCommitter<T> {
    next: u64,
    pending: BTreeMap<u64, Option<T>>,
}

impl<T> OrderedCommitter<T> {
    pub fn new(first: u64) -> Self {
        Self {
            next: first,
            pending: BTreeMap::new(),
        }
    }

    /// Mark unit `index` finished. `end` is `None` for units that must not
    /// move the checkpoint themselves (e.g. pages past the end of data).
    ///
    /// Returns the newest end marker the prefix advanced over, if any.
    pub fn complete(&mut self, index: u64, end: Option<T>) -> Option<T> {
        if index < self.next {
            return None;
        }
        self.pending.insert(index, end);

        let mut advanced = None;
        while let Some(end) = self.pending.remove(&self.next) {
            self.next += 1;
            if end.is_some() {
                advanced = end;
            }
        }
        advanced
    }

    /// Strip the end markers of finished units after `index`; they can no
    /// longer move the checkpoint
    pub fn discard_after(&mut self, index: u64) {
        for (_, end) in self.pending.range_mut(index.saturating_add(1)..) {
            *end = None;
        }
    }

    /// Index of the first unit not yet covered by the prefix
    pub fn next_index(&self) -> u64 {
        self.next
    }

    /// Finished units waiting on an earlier one
    pub fn waiting(&self) -> usize {
        self.pending.len()
    }
}

/// Cursor a job should resume from: the stored checkpoint, if any.
///
/// A checkpoint that cannot be decoded aborts the job rather than silently
/// restarting from the beginning.
pub async fn resume_point(
    store: &dyn CheckpointStore,
    job: &str,
    table: &str,
) -> Result<Option<Cursor>, PipelineError> {
    match store.load(job, table).await {
        Ok(Some(checkpoint)) => {
            debug!(job, table, cursor = %checkpoint.cursor, "resuming from checkpoint");
            Ok(Some(checkpoint.cursor))
        },
        Ok(None) => Ok(None),
        Err(err) => Err(PipelineError::from_checkpoint_load(job, table, err)),
    }
}

/// Single post-unit commit step: ordering plus the durable checkpoint write
pub struct CheckpointCommitter {
    job: String,
    table: String,
    store: Arc<dyn CheckpointStore>,
    order: OrderedCommitter<Cursor>,
    committed: Option<Cursor>,
}

impl CheckpointCommitter {
    pub fn new(job: &str, table: &str, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            job: job.to_string(),
            table: table.to_string(),
            store,
            order: OrderedCommitter::new(0),
            committed: None,
        }
    }

    /// Record unit `index` as durably written and persist the checkpoint if
    /// the contiguous prefix moved.
    pub async fn complete(
        &mut self,
        index: u64,
        end: Option<Cursor>,
    ) -> Result<Option<Cursor>, PipelineError> {
        let Some(cursor) = self.order.complete(index, end) else {
            return Ok(None);
        };
        self.store
            .save(&self.job, &self.table, &cursor)
            .await
            .map_err(PipelineError::Checkpoint)?;
        debug!(
            job = %self.job,
            table = %self.table,
            cursor = %cursor,
            waiting = self.order.waiting(),
            "checkpoint advanced"
        );
        self.committed = Some(cursor.clone());
        Ok(Some(cursor))
    }

    /// See [`OrderedCommitter::discard_after`]
    pub fn discard_after(&mut self, index: u64) {
        self.order.discard_after(index);
    }

    /// Last cursor written by this committer
    pub fn committed(&self) -> Option<&Cursor> {
        self.committed.as_ref()
    }
}
