use crate::output::{opt_id, print_json, Table};
use anyhow::Result;
use clap::Subcommand;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand definition
// ---------------------------------------------------------------------------

#[derive(Subcommand, Debug)]
pub enum QueueSubcommand {
    /// Queue depth, per-priority counts and staging size
    Stats,
    /// Show queued events, most urgent first
    Peek {
        /// Number of events to show
        #[arg(short, long, default_value_t = 20)]
        n: usize,
    },
}

pub fn run(config_path: &Path, subcmd: QueueSubcommand, json: bool) -> Result<()> {
    let (_rt, pipeline) = super::open_pipeline(config_path)?;
    match subcmd {
        QueueSubcommand::Stats => {
            let stats = pipeline.queue.stats()?;
            if json {
                return print_json(&stats);
            }
            Table::new(&["DEPTH", "CRITICAL", "HIGH", "NORMAL", "STAGING"])
                .row([
                    stats.depth.to_string(),
                    stats.critical.to_string(),
                    stats.high.to_string(),
                    stats.normal.to_string(),
                    stats.staging.to_string(),
                ])
                .print();
        }
        QueueSubcommand::Peek { n } => {
            let events = pipeline.queue.peek(n)?;
            if json {
                return print_json(&events);
            }
            if events.is_empty() {
                println!("Queue is empty.");
                return Ok(());
            }
            let mut table =
                Table::new(&["LOG ID", "PRIORITY", "ACTION", "ACTOR", "REGION", "CREATED"]);
            for e in &events {
                table.row([
                    e.log_id.clone(),
                    e.priority.to_string(),
                    e.action_type.clone(),
                    opt_id(e.actor_id),
                    opt_id(e.region_id),
                    e.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                ]);
            }
            table.print();
        }
    }
    Ok(())
}
