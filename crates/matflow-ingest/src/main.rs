//! matflow - resumable materials data pipeline

use anyhow::Result;
use clap::Parser;
use matflow_common::logging::{init_logging, LogConfig, LogLevel};
use matflow_ingest::cli::{Cli, Command};
use matflow_ingest::stages::Runtime;
use matflow_pipeline::{AppConfig, JobReport};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Environment settings win, --verbose only raises the level
    let mut log_config = LogConfig::from_env()?;
    if cli.verbose {
        log_config = log_config.with_level(LogLevel::Debug);
    }
    let _guard = init_logging(&log_config)?;

    let mut config = AppConfig::load()?;
    config.job.debug |= cli.debug;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight work");
                cancel.cancel();
            }
        }
    });

    let report = match cli.command {
        Command::Fetch { source, name, job } => {
            job.apply(&mut config.job, &name);
            let runtime = Runtime::connect(config, cli.engine, cancel).await?;
            runtime.fetch(source, &name).await
        },
        Command::Transform { mode, name, job } => {
            job.apply(&mut config.job, &name);
            let runtime = Runtime::connect(config, cli.engine, cancel).await?;
            runtime.transform(mode, &name).await
        },
        Command::Export {
            target,
            destination,
            output_dir,
            prefix,
            split,
            job,
        } => {
            job.apply(&mut config.job, &destination);
            let runtime = Runtime::connect(config, cli.engine, cancel).await?;
            runtime
                .export(target, &destination, split.as_deref(), &output_dir, &prefix)
                .await
        },
    };

    match report {
        Ok(report) => Ok(summarize(&report)),
        Err(err) => {
            error!(error = %format!("{err:#}"), "job aborted");
            Err(err)
        },
    }
}

fn summarize(report: &JobReport) -> ExitCode {
    info!(
        stage = ?report.stage,
        job = %report.job_name,
        table = %report.table_name,
        units = report.units_completed,
        failed_units = report.units_failed,
        written = report.records_written,
        failed = report.records_failed,
        skipped = report.records_skipped,
        cursor = ?report.last_cursor,
        version = ?report.version,
        cancelled = report.cancelled,
        "job finished"
    );
    if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        error!(failed_chunks = report.units_failed, "export incomplete");
        ExitCode::FAILURE
    }
}
