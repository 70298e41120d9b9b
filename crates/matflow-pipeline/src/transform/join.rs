//! Left join of primary raw rows with their task rows

use crate::error::StoreError;
use crate::models::{RawRecord, TaskRecord};
use crate::store::{RawStore, TableName};
use std::collections::HashMap;

/// A primary row and every task that references it, possibly none
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRow {
    pub raw: RawRecord,
    pub tasks: Vec<TaskRecord>,
}

/// Attach tasks to rows by foreign key.
///
/// Every row appears exactly once in the output, in input order. Tasks keep
/// their relative order; tasks that reference no row are dropped.
pub fn left_join(rows: Vec<RawRecord>, tasks: Vec<TaskRecord>) -> Vec<JoinedRow> {
    let mut by_material: HashMap<String, Vec<TaskRecord>> = HashMap::new();
    for task in tasks {
        by_material.entry(task.material_id.clone()).or_default().push(task);
    }
    rows.into_iter()
        .map(|raw| {
            let tasks = by_material.remove(&raw.id).unwrap_or_default();
            JoinedRow { raw, tasks }
        })
        .collect()
}

/// Look up the tasks for `rows` and join them; without a task table every
/// row gets an empty task list
pub async fn join_tasks(
    store: &dyn RawStore,
    task_table: Option<&TableName>,
    foreign_key: &str,
    rows: Vec<RawRecord>,
) -> Result<Vec<JoinedRow>, StoreError> {
    let Some(task_table) = task_table else {
        return Ok(left_join(rows, Vec::new()));
    };
    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    let tasks = store.tasks_for(task_table, foreign_key, &ids).await?;
    Ok(left_join(rows, tasks))
}
