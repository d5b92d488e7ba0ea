//! Shardmill worker
//!
//! Runs one stamp-driven annotation pass over a sharded corpus. Any number of
//! machines may run it at once against the same store; they coordinate only
//! through the store's conditional create.
//!
//! # Usage
//!
//! ```bash
//! # List the work units and write the work list
//! shardmill --config shardmill.toml list
//!
//! # Show what would be processed, without processing it
//! shardmill --config shardmill.toml plan --collection A
//!
//! # Process everything pending with 8 workers, newest sub-units first
//! shardmill --config shardmill.toml run --workers 8 --ordering recency
//!
//! # Forget local state for a collection
//! shardmill --config shardmill.toml clean --collection A
//! ```
//!
//! Exit status is 0 when every item was published or skipped, 2 when at least
//! one item or group failed, and 1 on a fatal error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardmill_core::config::{OrderingPolicy, PipelineConfig};
use shardmill_core::{Pipeline, PipelineReport, SyncSummary};

/// Exit status when some items or groups failed.
const EXIT_PARTIAL_FAILURE: u8 = 2;

/// Exit status on a fatal error.
const EXIT_FATAL: u8 = 1;

/// Shardmill corpus annotation worker
#[derive(Parser, Debug)]
#[command(name = "shardmill")]
#[command(about = "Distributed, idempotent annotation of a sharded corpus")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enumerate work units and write the ordered work list
    List(WorkArgs),
    /// Mirror remote state into local stamps
    Sync(WorkArgs),
    /// Enumerate and sync, then print the candidates without processing them
    Plan(WorkArgs),
    /// Enumerate, sync, and process every candidate
    Run(WorkArgs),
    /// Remove local stamps and scratch directories
    Clean {
        /// Collection to clean (repeatable)
        #[arg(long, required = true)]
        collection: Vec<String>,
    },
}

/// Overrides for the scheduler section of the configuration.
#[derive(Args, Debug, Default)]
struct WorkArgs {
    /// Width of the worker pool
    #[arg(long)]
    workers: Option<usize>,

    /// Work list ordering (random, recency)
    #[arg(long, value_parser = parse_ordering)]
    ordering: Option<OrderingPolicy>,

    /// Seed for reproducible random ordering
    #[arg(long)]
    seed: Option<u64>,

    /// Maximum number of items to process
    #[arg(long)]
    limit: Option<usize>,

    /// Restrict to a collection (repeatable)
    #[arg(long)]
    collection: Vec<String>,
}

impl WorkArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(workers) = self.workers {
            config.scheduler.workers = workers;
        }
        if let Some(ordering) = self.ordering {
            config.scheduler.ordering = ordering;
        }
        if let Some(seed) = self.seed {
            config.scheduler.seed = Some(seed);
        }
        if let Some(limit) = self.limit {
            config.scheduler.limit = Some(limit);
        }
        if !self.collection.is_empty() {
            config.scheduler.collections = self.collection.clone();
        }
    }
}

fn parse_ordering(value: &str) -> Result<OrderingPolicy, String> {
    value.parse().map_err(|e: shardmill_core::ShardmillError| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match execute(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_PARTIAL_FAILURE),
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

/// Runs the selected command. Returns whether everything succeeded.
async fn execute(cli: Cli) -> shardmill_core::Result<bool> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    }
    .with_env_overrides();

    if let Command::List(args) | Command::Sync(args) | Command::Plan(args) | Command::Run(args) =
        &cli.command
    {
        args.apply(&mut config);
    }
    if let Command::Clean { collection } = &cli.command {
        config.scheduler.collections = collection.clone();
    }

    let pipeline = Pipeline::from_config(config).await?;

    match cli.command {
        Command::List(_) => {
            for key in pipeline.enumerate().await? {
                println!("{}", key.to_worklist_line());
            }
            Ok(true)
        }
        Command::Sync(_) => {
            let collections = pipeline.collections().await?;
            let summary = pipeline.sync(&collections).await;
            print_sync(&summary);
            Ok(summary.failed.is_empty())
        }
        Command::Plan(_) => {
            let keys = pipeline.enumerate().await?;
            let collections = pipeline.collections().await?;
            let summary = pipeline.sync(&collections).await;
            print_sync(&summary);
            for item in pipeline.plan(&keys).await? {
                println!("{}", item.key.to_worklist_line());
            }
            Ok(summary.failed.is_empty())
        }
        Command::Run(_) => {
            let report = pipeline.run().await?;
            print_report(&report);
            Ok(report.is_success())
        }
        Command::Clean { collection } => {
            for name in &collection {
                pipeline.clean(name).await?;
            }
            Ok(true)
        }
    }
}

fn print_sync(summary: &SyncSummary) {
    eprintln!(
        "synced {} group(s), fetched {} object(s)",
        summary.synced.len(),
        summary.fetched
    );
    for (collection, reason) in &summary.failed {
        eprintln!("  blocked {collection}: {reason}");
    }
}

fn print_report(report: &PipelineReport) {
    print_sync(&report.sync);
    println!(
        "work units: {}, candidates: {}, published: {}, skipped: {}, failed: {}",
        report.work_units,
        report.candidates,
        report.batch.published,
        report.batch.skipped,
        report.batch.failed.len()
    );
    for (key, reason) in &report.batch.failed {
        println!("  failed {key}: {reason}");
    }
}
