//! Gc command - one-off garbage collection
//!
//! Usage:
//! ```bash
//! warden gc --retention-days 7
//! ```

use anyhow::Result;
use chrono::Utc;
use clap::Args;
use std::sync::Arc;
use std::time::Duration;

use warden_persist::SqliteJobStore;
use warden_queue::GarbageCollector;

/// Arguments for the gc command
#[derive(Args)]
pub struct GcArgs {
    /// Days finished jobs are kept
    #[arg(long, default_value_t = 30)]
    retention_days: u64,
}

/// Run the gc command
pub async fn run(store: Arc<SqliteJobStore>, args: GcArgs) -> Result<()> {
    let collector = GarbageCollector::new(Duration::from_secs(
        args.retention_days.saturating_mul(24 * 60 * 60),
    ));
    let report = collector.collect(store.as_ref(), Utc::now()).await?;

    crate::print_success(&format!(
        "Deleted {} finished job(s), released {} expired lock(s)",
        report.deleted, report.released
    ));
    Ok(())
}
