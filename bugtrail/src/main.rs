//! bugtrail: track static-analyzer findings across analysis runs.
//!
//! Entry point for the `bugtrail` binary. Loads the configuration, sets up
//! logging, and dispatches to one of three commands:
//!
//! - `store` hashes a batch and reconciles it into a Run.
//! - `hash` prints the identity hashes of a batch without storing anything.
//! - `status` prints the per-status counts and storage history of a Run.
//!
//! # Startup sequence
//!
//! 1. Load config from XDG config. Soft failure, so it happens before logging.
//! 2. Install the `tracing` subscriber at the configured level.
//! 3. For `store` only: register the SIGTERM/SIGINT cancel flag, then open
//!    the database. An interrupted store rolls back as a whole.

mod config;
mod revision;
mod signal;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use bugtrail_core::batch::Batch;
use bugtrail_core::pool::hash_batch;
use bugtrail_core::{db, DetectionStatus, HashType, LockPolicy, Store, StoreOptions};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "bugtrail")]
#[command(about = "Identity hashing and detection-status tracking for analyzer findings")]
#[command(version)]
struct Cli {
    /// SQLite database file (overrides `database` in the config)
    #[arg(long, global = true, env = "BUGTRAIL_DB")]
    db: Option<PathBuf>,

    /// Config file to read instead of the XDG default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hash a batch and store it into a run
    Store {
        /// Name of the run to store into; created on first use
        #[arg(long)]
        run: String,

        /// Batch JSON written by an analyzer output parser
        #[arg(long)]
        input: PathBuf,

        /// Version tag for the run history entry
        #[arg(long)]
        tag: Option<String>,

        /// Analysed source tree; its git HEAD becomes the tag when --tag is absent
        #[arg(long)]
        source_root: Option<PathBuf>,

        #[arg(long)]
        hash_type: Option<String>,

        #[arg(long)]
        workers: Option<usize>,

        /// Fail instead of waiting when the run is already being stored
        #[arg(long)]
        reject_if_busy: bool,
    },

    /// Print the hashes of a batch without storing it
    Hash {
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        hash_type: Option<String>,

        #[arg(long)]
        workers: Option<usize>,
    },

    /// Print detection-status counts and storage history of a run
    Status {
        #[arg(long)]
        run: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => config::load_from(path),
        None => config::load(),
    };

    let level = Level::from_str(&config.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.database));

    match cli.command {
        Commands::Store {
            run,
            input,
            tag,
            source_root,
            hash_type,
            workers,
            reject_if_busy,
        } => {
            let mut options = store_options(&config, hash_type.as_deref(), workers)?;
            if reject_if_busy {
                options.lock_policy = LockPolicy::Reject;
            }
            let tag = tag.or_else(|| source_root.as_deref().and_then(revision::head_revision));
            run_store(&db_path, &run, &input, tag, options).await
        }
        Commands::Hash {
            input,
            hash_type,
            workers,
        } => {
            let options = store_options(&config, hash_type.as_deref(), workers)?;
            run_hash(&input, options).await
        }
        Commands::Status { run } => run_status(&db_path, &run).await,
    }
}

/// Merges config values and command-line overrides.
fn store_options(
    config: &Config,
    hash_type: Option<&str>,
    workers: Option<usize>,
) -> Result<StoreOptions> {
    let defaults = StoreOptions::default();
    let hash_type: HashType = hash_type.unwrap_or(config.hash_type.as_str()).parse()?;
    Ok(StoreOptions {
        hash_type,
        workers: workers.or(config.hash_workers).unwrap_or(defaults.workers),
        lock_policy: config.lock_policy,
    })
}

fn read_batch(input: &Path) -> Result<Batch> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("reading batch {}", input.display()))?;
    Batch::from_json(&text).with_context(|| format!("parsing batch {}", input.display()))
}

fn db_path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("database path {} is not valid UTF-8", path.display()))
}

async fn run_store(
    db_path: &Path,
    run: &str,
    input: &Path,
    tag: Option<String>,
    options: StoreOptions,
) -> Result<()> {
    let batch = read_batch(input)?;
    let cancel = signal::register_shutdown().context("registering signal handlers")?;

    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Store::open(db_path_str(db_path)?, options)
        .await?
        .with_cancel_flag(cancel);

    let summary = store
        .store_batch(run, batch, tag)
        .await
        .with_context(|| format!("storing into run {run}"))?;

    let stats = &summary.stats;
    println!("run {} ({})", summary.run.name, summary.run.id);
    println!("history entry {}", summary.history_id);
    println!(
        "received {}  out of scope {}  duplicates {}  collapsed paths {}  degraded {}",
        stats.received, stats.out_of_scope, stats.duplicates, stats.collapsed_paths, stats.degraded
    );
    for status in DetectionStatus::ALL {
        let count = stats.count(status);
        if count > 0 {
            println!("{:>12} {}", status, count);
        }
    }
    info!(run = %summary.run.name, "store finished");
    Ok(())
}

async fn run_hash(input: &Path, options: StoreOptions) -> Result<()> {
    let batch = read_batch(input)?;
    let StoreOptions {
        hash_type, workers, ..
    } = options;

    let hashed = tokio::task::spawn_blocking(move || {
        let never = AtomicBool::new(false);
        hash_batch(batch.reports, hash_type, workers, &never)
    })
    .await??;

    for report in &hashed {
        let diag = &report.diagnostic;
        println!(
            "{}  {}  {}:{}  {}",
            report.report_hash,
            report.path_hash,
            report.file_path(),
            diag.location.line,
            diag.checker_name
        );
    }
    Ok(())
}

async fn run_status(db_path: &Path, run: &str) -> Result<()> {
    let conn = db::open_db(db_path_str(db_path)?).await?;
    let Some(found) = db::find_run(&conn, run).await? else {
        anyhow::bail!("no run named {run} in {}", db_path.display());
    };

    let counts = db::status_counts(&conn, &found.id).await?;
    println!("run {} ({})", found.name, found.id);
    for status in DetectionStatus::ALL {
        println!(
            "{:>12} {}",
            status,
            counts.get(&status).copied().unwrap_or(0)
        );
    }

    let history = db::list_run_history(&conn, &found.id).await?;
    println!("{} storage event(s)", history.len());
    for entry in history {
        println!(
            "  {}  {}  {}",
            entry.time,
            entry.version_tag.as_deref().unwrap_or("-"),
            entry.analyzer_commands.join(" ; ")
        );
    }
    Ok(())
}
