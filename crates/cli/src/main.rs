//! marketflow: job-control CLI for the market-data pipeline.
//!
//! Commands:
//! - `run <stage>`: one worker invocation (claim, execute, finalize)
//! - `sweep`: reclaim jobs whose lease expired
//! - `enqueue`: create a job in `READY`
//! - `reset <job>`: return a failed job to its stage's precondition
//! - `status` / `audit <job>`: inspect the control store
//! - `migrate`: create the control store and warehouse staging schemas
//!
//! Exit codes of `run`: 0 advanced or nothing to do, 1 job moved to its error
//! status, 2 invocation aborted. Every other command exits 0 or 2.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use marketflow_core::{JobId, JobStatus, Stage};
use marketflow_infra::AppConfig;
use marketflow_observability::LogFormat;

/// Exit code for an aborted invocation.
const EXIT_ABORTED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "marketflow", about = "Job control for the market-data pipeline")]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log format (json or pretty). Overrides the config file.
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one invocation of a stage worker.
    Run {
        /// crawl, stage_load, transform, warehouse_load or aggregate.
        stage: Stage,
    },
    /// Move jobs with an expired lease to their stage's error status.
    Sweep,
    /// Create a new job in READY.
    Enqueue {
        /// First day of the data window (YYYY-MM-DD).
        #[arg(long)]
        start: NaiveDate,

        /// Last day of the data window (YYYY-MM-DD). Defaults to --start.
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Directory for the stage files.
        #[arg(long)]
        output: PathBuf,

        /// Ticker symbols, comma separated.
        #[arg(long, required = true, value_delimiter = ',')]
        symbols: Vec<String>,
    },
    /// Return a job in an error status to its stage's precondition.
    Reset { job_id: JobId },
    /// List jobs, oldest first.
    Status {
        /// Only jobs in this status.
        #[arg(long)]
        status: Option<JobStatus>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print the audit log of a job.
    Audit { job_id: JobId },
    /// Create the control store tables.
    Migrate,
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    config.apply_env(std::env::vars())?;
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    config.validate()?;
    Ok(config)
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            marketflow_observability::init(cli.log_format.unwrap_or_default());
            tracing::error!(error = %format!("{err:#}"), "invalid configuration");
            eprintln!("error: {err:#}");
            return ExitCode::from(EXIT_ABORTED);
        }
    };
    marketflow_observability::init(config.log.format);

    let result = runtime().and_then(|rt| rt.block_on(commands::dispatch(cli.command, &config)));
    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "invocation aborted");
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_ABORTED)
        }
    }
}
