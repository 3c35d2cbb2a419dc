//! List and show commands - inspect job rows
//!
//! Usage:
//! ```bash
//! warden list --status failed --type Event-v1
//! warden show <id>
//! warden show --type Event-v1 --reference appraisal/42
//! ```

use anyhow::{bail, Result};
use clap::{Args, ValueEnum};
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use std::sync::Arc;
use uuid::Uuid;

use warden_persist::SqliteJobStore;
use warden_queue::{JobFilter, JobRow, JobStatus, JobStore, OrderBy};

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Queued,
    Running,
    Done,
    Failed,
}

impl From<StatusArg> for JobStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Queued => JobStatus::Queued,
            StatusArg::Running => JobStatus::Running,
            StatusArg::Done => JobStatus::Done,
            StatusArg::Failed => JobStatus::Failed,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OrderArg {
    Id,
    ScheduledAt,
    LockedAt,
    NextRunAt,
    FinishedAt,
    Reference,
}

impl From<OrderArg> for OrderBy {
    fn from(order: OrderArg) -> Self {
        match order {
            OrderArg::Id => OrderBy::Id,
            OrderArg::ScheduledAt => OrderBy::ScheduledAt,
            OrderArg::LockedAt => OrderBy::LockedAt,
            OrderArg::NextRunAt => OrderBy::NextRunAt,
            OrderArg::FinishedAt => OrderBy::FinishedAt,
            OrderArg::Reference => OrderBy::Reference,
        }
    }
}

/// Arguments for the list command
#[derive(Args)]
pub struct ListArgs {
    /// Only jobs of these types
    #[arg(long = "type")]
    types: Vec<String>,

    /// Only jobs with these references
    #[arg(long = "reference")]
    references: Vec<String>,

    #[arg(long, value_enum)]
    status: Option<StatusArg>,

    /// Column to order by, newest first
    #[arg(long, value_enum, default_value = "id")]
    order_by: OrderArg,

    #[arg(long, default_value_t = 100)]
    limit: usize,

    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

/// Arguments for the show command
#[derive(Args)]
pub struct ShowArgs {
    /// Job ID
    #[arg(conflicts_with_all = ["job_type", "reference"])]
    id: Option<Uuid>,

    /// Job type, together with --reference
    #[arg(long = "type", requires = "reference")]
    job_type: Option<String>,

    #[arg(long, requires = "job_type")]
    reference: Option<String>,
}

/// Run the list command
pub async fn run(store: Arc<SqliteJobStore>, args: ListArgs) -> Result<()> {
    let filter = JobFilter {
        types: args.types,
        references: args.references,
        status: args.status.map(Into::into),
        order_by: args.order_by.into(),
        limit: args.limit,
    };
    let rows = store.list(&filter).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        crate::print_info("No jobs found");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Type").fg(Color::Cyan),
            Cell::new("Reference").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Errors").fg(Color::Cyan),
            Cell::new("Next run").fg(Color::Cyan),
            Cell::new("Locked by").fg(Color::Cyan),
        ]);

    for row in &rows {
        table.add_row(vec![
            Cell::new(row.id),
            Cell::new(&row.job_type).fg(Color::Green),
            Cell::new(&row.reference),
            status_cell(row.status()),
            Cell::new(row.error_count),
            Cell::new(row.next_run_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(row.locked_by.as_deref().unwrap_or("-")),
        ]);
    }

    println!("{table}");
    println!("{} job(s)", rows.len());
    Ok(())
}

/// Run the show command
pub async fn show(store: Arc<SqliteJobStore>, args: ShowArgs) -> Result<()> {
    let row = match (args.id, args.job_type, args.reference) {
        (Some(id), _, _) => store.by_id(id).await?,
        (None, Some(job_type), Some(reference)) => {
            store.by_reference(&job_type, &reference).await?
        }
        _ => bail!("Pass a job ID or --type with --reference"),
    };

    print_row(&row)
}

fn print_row(row: &JobRow) -> Result<()> {
    println!("{} {}", "Job".bold(), row.id.to_string().cyan());
    println!("  {} {}", "Type:".dimmed(), row.job_type.green());
    println!("  {} {}", "Reference:".dimmed(), row.reference);
    println!("  {} {:?}", "Status:".dimmed(), row.status());
    println!("  {} {}", "Errors:".dimmed(), row.error_count);
    println!("  {} {}", "Scheduled:".dimmed(), row.scheduled_at);
    println!("  {} {}", "Next run:".dimmed(), row.next_run_at);
    if let Some(last) = row.last_run_at {
        println!("  {} {}", "Last run:".dimmed(), last);
    }
    if let (Some(by), Some(until)) = (&row.locked_by, row.locked_until) {
        println!("  {} {} until {}", "Locked:".dimmed(), by, until);
    }
    if let Some(finished) = row.finished_at {
        println!("  {} {}", "Finished:".dimmed(), finished);
    }
    println!("  {}", "Arguments:".dimmed());
    println!("{}", serde_json::to_string_pretty(&row.args)?);
    Ok(())
}

fn status_cell(status: JobStatus) -> Cell {
    let color = match status {
        JobStatus::Queued => Color::White,
        JobStatus::Running => Color::Yellow,
        JobStatus::Done => Color::Green,
        JobStatus::Failed => Color::Red,
    };
    Cell::new(status.as_state()).fg(color)
}
