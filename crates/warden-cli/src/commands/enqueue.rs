//! Enqueue command - insert a job
//!
//! Usage:
//! ```bash
//! warden enqueue Event-v1 '{"appraisal": 42}' --reference appraisal/42
//! warden enqueue Event-v1 '{"appraisal": 42}' --delay-secs 60
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;

use warden_persist::SqliteJobStore;
use warden_queue::{content_reference, JobStore, NewJob, QueueError};

/// Arguments for the enqueue command
#[derive(Args)]
pub struct EnqueueArgs {
    /// Job type, e.g. `Event-v1`
    job_type: String,

    /// JSON arguments for the job
    #[arg(default_value = "null")]
    args: String,

    /// Idempotency reference; derived from the arguments when omitted
    #[arg(long)]
    reference: Option<String>,

    /// Seconds before the job becomes eligible
    #[arg(long, default_value_t = 0)]
    delay_secs: u64,
}

/// Run the enqueue command
pub async fn run(store: Arc<SqliteJobStore>, args: EnqueueArgs) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(&args.args)
        .with_context(|| format!("Invalid JSON: {}", args.args))?;

    let reference = match args.reference {
        Some(reference) => reference,
        None => content_reference("cli", 1, &value)?,
    };

    let now = Utc::now();
    let delay = chrono::Duration::from_std(Duration::from_secs(args.delay_secs))
        .context("Delay out of range")?;
    let job = NewJob::new(&args.job_type, &reference, value, now + delay);

    match store.enqueue(job, now).await {
        Ok(row) => {
            crate::print_success(&format!("Enqueued job {}", row.id.to_string().green()));
            println!("  {} {}", "Reference:".dimmed(), row.reference);
            println!("  {} {}", "Runs at:".dimmed(), row.next_run_at);
            Ok(())
        }
        Err(QueueError::Duplicate { .. }) => {
            let existing = store.by_reference(&args.job_type, &reference).await?;
            crate::print_warning(&format!(
                "Job already exists: {} ({:?})",
                existing.id,
                existing.status()
            ));
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
