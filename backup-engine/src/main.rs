//! Backup Engine - Main entry point
//!
//! Runs one operation against a destination and prints its result as JSON.

use anyhow::{bail, Result};
use backup_engine::controller::operations::RetentionRule;
use backup_engine::controller::DEFAULT_TEST_SAMPLES;
use backup_engine::daemon::shutdown::{ShutdownCoordinator, ShutdownSignal};
use backup_engine::executor::RestoreSelection;
use backup_engine::registry::ModuleRegistry;
use backup_engine::utils::units::parse_point_in_time;
use backup_engine::{utils, Config, Operation, OperationController};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Destination URL (overrides config)
    #[arg(short, long, value_name = "URL")]
    destination: Option<String>,

    /// Engine option as key=value, may be repeated
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    options: Vec<String>,

    /// Delete for real instead of reporting (delete, repair)
    #[arg(long)]
    force: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up one or more source paths
    Backup {
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Force a full backup
        #[arg(long)]
        full: bool,
    },
    /// Restore into a target directory
    Restore {
        target: PathBuf,

        /// Point in time: date, RFC 3339 timestamp or age such as 3d
        #[arg(short, long)]
        time: Option<String>,

        /// Replace target files that differ
        #[arg(long)]
        overwrite: bool,
    },
    /// Remove old backup chains
    Delete {
        /// Keep the newest N full backups
        #[arg(long, value_name = "N", conflicts_with = "older_than", required_unless_present = "older_than")]
        keep_last: Option<usize>,

        /// Remove chains older than a date or age such as 6m
        #[arg(long, value_name = "WHEN")]
        older_than: Option<String>,
    },
    /// List backup chains and untrusted leftovers
    List,
    /// Remove volumes no manifest vouches for
    Repair,
    /// Store the newest state as a new full backup
    Compact,
    /// Download and verify the newest backups
    Test {
        #[arg(long, default_value_t = DEFAULT_TEST_SAMPLES)]
        samples: usize,
    },
}

fn parse_option(pair: &str) -> Result<(String, String)> {
    match pair.split_once('=') {
        Some((key, value)) => Ok((key.trim().to_string(), value.to_string())),
        // A bare key is a boolean switch
        None if !pair.trim().is_empty() => Ok((pair.trim().to_string(), String::new())),
        None => bail!("empty option"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let mut raw = config.raw_options();
    for pair in &args.options {
        let (key, value) = parse_option(pair)?;
        raw.insert(key, value);
    }
    if args.force {
        raw.insert("force".into(), "true".into());
    }

    let operation = match args.command {
        Command::Backup { sources, full } => {
            if full {
                raw.insert("full".into(), "true".into());
            }
            Operation::Backup { sources }
        }
        Command::Restore {
            target,
            time,
            overwrite,
        } => {
            if overwrite {
                raw.insert("overwrite".into(), "true".into());
            }
            let selection = match time {
                Some(t) => RestoreSelection::At(parse_point_in_time(&t, chrono::Utc::now())?),
                None => RestoreSelection::Latest,
            };
            Operation::Restore { selection, target }
        }
        Command::Delete { keep_last, older_than } => match (keep_last, older_than) {
            (Some(n), _) => Operation::Delete(RetentionRule::KeepLastFull(n)),
            (None, Some(when)) => Operation::Delete(RetentionRule::OlderThan(when)),
            (None, None) => bail!("delete needs --keep-last or --older-than"),
        },
        Command::List => Operation::List,
        Command::Repair => Operation::Repair,
        Command::Compact => Operation::Compact,
        Command::Test { samples } => Operation::Test { samples },
    };

    let Some(url) = args.destination.or(config.destination.url) else {
        bail!("no destination given (use --destination or destination.url in the config file)");
    };

    tracing::info!("Starting backup-engine v{} against {}", env!("CARGO_PKG_VERSION"), url);

    let registry = Arc::new(ModuleRegistry::builtin());
    let destination = registry.open_destination(&url).await?;
    let controller = OperationController::new(destination, registry, raw);

    let shutdown = ShutdownCoordinator::new();
    let mut signals = shutdown.subscribe();
    let ticket = controller.submit(operation).await;
    let task_id = ticket.id.clone();

    let signal_controller = controller.clone();
    let signal_handle = tokio::spawn(async move {
        while let Ok(signal) = signals.recv().await {
            match signal {
                ShutdownSignal::Stop => signal_controller.stop(&task_id).await,
                ShutdownSignal::Abort => signal_controller.abort(&task_id).await,
            };
        }
    });

    let watcher = tokio::spawn(async move { shutdown.watch_signals().await });
    let result = ticket.wait().await;
    watcher.abort();
    signal_handle.abort();

    let output = result?;
    for warning in output.warnings().iter() {
        eprintln!("warning: {warning}");
    }
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
