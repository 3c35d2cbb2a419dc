//! Warden CLI - run and inspect the durable job queue
//!
//! # Usage
//!
//! ```bash
//! # Run workers and the maintenance heartbeat until Ctrl+C
//! warden run --workers 4
//!
//! # Enqueue a job; the reference is derived from the arguments if omitted
//! warden enqueue Event-v1 '{"appraisal": 42}'
//!
//! # Inspect the queue
//! warden list --status failed
//! warden show 0b6f1c1e-5b7e-4a43-9a57-1f0f4f4f6a01
//! warden stats
//!
//! # Collect finished jobs older than a week
//! warden gc --retention-days 7
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::sync::Arc;

use warden_persist::{connect, SqliteConfig, SqliteJobStore};

mod commands;

use commands::{enqueue, gc, list, run, stats};

/// Warden - durable background jobs
///
/// At-least-once job execution on top of a SQLite store.
#[derive(Parser)]
#[command(
    name = "warden",
    version,
    about = "Warden CLI - durable background job queue",
    long_about = "Warden runs background jobs stored in SQLite.\n\n\
                  Jobs are deduplicated by (type, reference), claimed under\n\
                  a time-limited lease and retried with exponential backoff."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// SQLite database URL
    #[arg(
        long,
        env = "WARDEN_DATABASE_URL",
        default_value = "sqlite:warden.db?mode=rwc",
        global = true
    )]
    database: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run workers until interrupted
    #[command(name = "run")]
    Run(run::RunArgs),

    /// Enqueue a job
    #[command(name = "enqueue")]
    Enqueue(enqueue::EnqueueArgs),

    /// List jobs
    #[command(name = "list")]
    List(list::ListArgs),

    /// Show a single job
    #[command(name = "show")]
    Show(list::ShowArgs),

    /// Job counts per type and state
    #[command(name = "stats")]
    Stats(stats::StatsArgs),

    /// Delete old finished jobs and clear expired locks
    #[command(name = "gc")]
    Gc(gc::GcArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let store = open_store(&cli.database).await?;

    match cli.command {
        Commands::Run(args) => run::run(store, args).await,
        Commands::Enqueue(args) => enqueue::run(store, args).await,
        Commands::List(args) => list::run(store, args).await,
        Commands::Show(args) => list::show(store, args).await,
        Commands::Stats(args) => stats::run(store, args).await,
        Commands::Gc(args) => gc::run(store, args).await,
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

async fn open_store(url: &str) -> Result<Arc<SqliteJobStore>> {
    let config = SqliteConfig {
        url: url.to_string(),
        ..SqliteConfig::from_env()
    };
    let pool = connect(&config)
        .await
        .with_context(|| format!("Failed to open database {}", url))?;
    Ok(Arc::new(SqliteJobStore::new(pool)))
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

/// Print an info message
pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".blue().bold(), msg);
}
