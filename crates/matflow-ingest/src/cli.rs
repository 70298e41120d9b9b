//! Command line surface
//!
//! Every flag maps onto one [`JobConfig`] field; anything left unset keeps
//! the value loaded from the environment.

use clap::{Args, Parser, Subcommand, ValueEnum};
use matflow_pipeline::{JobConfig, TransformMode};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "matflow")]
#[command(author, version, about = "Fetch, normalize and export materials records")]
pub struct Cli {
    /// Run every unit inline, one at a time
    #[arg(long, global = true)]
    pub debug: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Keep raw and canonical tables in this engine
    #[arg(long, value_enum, global = true, default_value_t = Engine::Postgres)]
    pub engine: Engine,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Copy a remote source into a raw table
    Fetch {
        /// Connector variant
        #[arg(long, value_enum)]
        source: SourceKind,

        /// Dataset name, e.g. alexandria or mp; also the default job name
        #[arg(long)]
        name: String,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Normalize a raw table into a canonical table
    Transform {
        /// Output shape
        #[arg(long, default_value_t = TransformMode::Structure)]
        mode: TransformMode,

        /// Dataset the raw rows came from; selects the normalizer
        #[arg(long)]
        name: String,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Write a canonical table out as JSON Lines shards
    Export {
        #[arg(long, value_enum)]
        target: Target,

        /// Dataset name the shards are filed under
        #[arg(long)]
        destination: String,

        /// Root directory for `--target local`
        #[arg(long, default_value = "./data/export")]
        output_dir: PathBuf,

        /// Key prefix inside the export bucket for `--target s3`
        #[arg(long, default_value = "")]
        prefix: String,

        /// Export one subset, e.g. compatible_pbe or non_compatible
        #[arg(long)]
        split: Option<String>,

        #[command(flatten)]
        job: JobArgs,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Offset-paginated OPTIMADE API
    Api,
    /// Gzipped JSON Lines objects in an S3 bucket
    Bucket,
    /// Single downloadable JSON Lines dump
    Archive,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    S3,
    Local,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Engine {
    Postgres,
    Mysql,
}

/// Per-job overrides shared by every stage
#[derive(Args, Debug, Default, Clone)]
pub struct JobArgs {
    /// Checkpoint key; defaults to the dataset name
    #[arg(long)]
    pub job_name: Option<String>,

    #[arg(long)]
    pub workers: Option<usize>,

    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Seconds between retry attempts
    #[arg(long)]
    pub retry_delay: Option<u64>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub db_fetch_batch_size: Option<usize>,

    #[arg(long)]
    pub log_every: Option<u64>,

    /// Start here instead of at the stored checkpoint
    #[arg(long)]
    pub offset: Option<i64>,

    /// Records per source page
    #[arg(long)]
    pub limit: Option<i64>,

    /// Raw table (fetch, transform)
    #[arg(long)]
    pub table: Option<String>,

    /// Canonical table (transform, export)
    #[arg(long)]
    pub dest_table: Option<String>,

    /// Secondary raw table joined onto each row
    #[arg(long)]
    pub task_table: Option<String>,

    #[arg(long)]
    pub task_foreign_key: Option<String>,

    #[arg(long)]
    pub chunk_size: Option<usize>,

    #[arg(long)]
    pub max_rows: Option<u64>,
}

impl JobArgs {
    /// Layer the flags that were given over `config`
    pub fn apply(self, config: &mut JobConfig, dataset: &str) {
        match self.job_name {
            Some(name) => config.job_name = name,
            None => config.job_name = dataset.to_string(),
        }
        if let Some(workers) = self.workers {
            config.num_workers = workers;
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if let Some(secs) = self.retry_delay {
            config.retry_delay = Duration::from_secs(secs);
        }
        if let Some(size) = self.batch_size {
            config.batch_size = size;
        }
        if let Some(size) = self.db_fetch_batch_size {
            config.db_fetch_batch_size = size;
        }
        if let Some(every) = self.log_every {
            config.log_every = every;
        }
        if self.offset.is_some() {
            config.offset = self.offset;
        }
        if let Some(limit) = self.limit {
            config.limit = limit;
        }
        if let Some(table) = self.table {
            config.table_name = table;
        }
        if let Some(table) = self.dest_table {
            config.dest_table_name = table;
        }
        if self.task_table.is_some() {
            config.task_table_name = self.task_table;
        }
        if let Some(key) = self.task_foreign_key {
            config.task_foreign_key = key;
        }
        if let Some(size) = self.chunk_size {
            config.chunk_size = size;
        }
        if self.max_rows.is_some() {
            config.max_rows = self.max_rows;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_flags() {
        let cli = Cli::try_parse_from([
            "matflow", "--debug", "fetch", "--source", "api", "--name", "alexandria", "--table",
            "alexandria_raw", "--limit", "100", "--offset", "2500",
        ])
        .unwrap();
        assert!(cli.debug);
        assert_eq!(cli.engine, Engine::Postgres);

        let Command::Fetch { source, name, job } = cli.command else {
            panic!("expected fetch");
        };
        assert_eq!(source, SourceKind::Api);

        let mut config = JobConfig::default();
        job.apply(&mut config, &name);
        assert_eq!(config.job_name, "alexandria");
        assert_eq!(config.table_name, "alexandria_raw");
        assert_eq!(config.limit, 100);
        assert_eq!(config.offset, Some(2500));
        assert_eq!(config.max_retries, JobConfig::default().max_retries);
    }

    #[test]
    fn test_transform_mode_and_overrides() {
        let cli = Cli::try_parse_from([
            "matflow", "transform", "--mode", "trajectory", "--name", "mp", "--table", "mp_materials",
            "--task-table", "mp_tasks", "--dest-table", "mp_trajectories", "--job-name", "mp-traj",
            "--engine", "mysql", "--retry-delay", "5",
        ])
        .unwrap();
        assert_eq!(cli.engine, Engine::Mysql);

        let Command::Transform { mode, name, job } = cli.command else {
            panic!("expected transform");
        };
        assert_eq!(mode, TransformMode::Trajectory);

        let mut config = JobConfig::default();
        job.apply(&mut config, &name);
        assert_eq!(config.job_name, "mp-traj");
        assert_eq!(config.task_table_name.as_deref(), Some("mp_tasks"));
        assert_eq!(config.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_export_requires_a_target() {
        assert!(Cli::try_parse_from(["matflow", "export", "--destination", "lematbulk"]).is_err());

        let cli = Cli::try_parse_from([
            "matflow", "export", "--target", "local", "--destination", "lematbulk", "--chunk-size",
            "500", "--max-rows", "2000",
        ])
        .unwrap();
        let Command::Export {
            target,
            output_dir,
            job,
            ..
        } = cli.command
        else {
            panic!("expected export");
        };
        assert_eq!(target, Target::Local);
        assert_eq!(output_dir, PathBuf::from("./data/export"));
        assert_eq!(job.chunk_size, Some(500));
        assert_eq!(job.max_rows, Some(2000));
    }

    #[test]
    fn test_export_split() {
        let cli = Cli::try_parse_from([
            "matflow", "export", "--target", "s3", "--destination", "lematbulk", "--split",
            "compatible_pbesol",
        ])
        .unwrap();
        let Command::Export { split, .. } = cli.command else {
            panic!("expected export");
        };
        assert_eq!(split.as_deref(), Some("compatible_pbesol"));
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        assert!(Cli::try_parse_from(["matflow", "fetch", "--source", "ftp", "--name", "x"]).is_err());
    }
}
