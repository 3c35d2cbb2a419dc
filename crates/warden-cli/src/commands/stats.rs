//! Stats command - job counts per type and state

use anyhow::Result;
use clap::Args;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use std::sync::Arc;

use warden_persist::SqliteJobStore;
use warden_queue::JobStore;

/// Arguments for the stats command
#[derive(Args)]
pub struct StatsArgs {
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

/// Run the stats command
pub async fn run(store: Arc<SqliteJobStore>, args: StatsArgs) -> Result<()> {
    let stats = store.stats().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Type").fg(Color::Cyan),
            Cell::new("State").fg(Color::Cyan),
            Cell::new("Count").fg(Color::Cyan),
        ]);

    for stat in &stats {
        table.add_row(vec![
            Cell::new(&stat.job_type).fg(Color::Green),
            Cell::new(&stat.state),
            Cell::new(stat.count),
        ]);
    }

    println!("{table}");
    Ok(())
}
