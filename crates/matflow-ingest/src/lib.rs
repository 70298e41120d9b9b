//! Matflow Ingest
//!
//! The `matflow` command: parses flags into a [`matflow_pipeline::JobConfig`],
//! connects the stores and runs one pipeline stage.
//!
//! ```text
//! matflow fetch --source api --name alexandria --table alexandria_raw
//! matflow transform --name alexandria --table alexandria_raw --dest-table structures
//! matflow export --target s3 --destination lematbulk --dest-table structures
//! ```

pub mod cli;
pub mod stages;
