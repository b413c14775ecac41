use crate::output::{print_json, Table};
use anyhow::Result;
use clap::Subcommand;
use std::collections::BTreeMap;
use std::path::Path;
use tally_core::ScoreKey;

#[derive(Subcommand, Debug)]
pub enum ScoreSubcommand {
    /// Show cached and merged score totals for an actor
    Show {
        /// Actor id
        actor: u64,
    },
}

pub fn run(config_path: &Path, subcmd: ScoreSubcommand, json: bool) -> Result<()> {
    match subcmd {
        ScoreSubcommand::Show { actor } => show(config_path, actor, json),
    }
}

fn show(config_path: &Path, actor: u64, json: bool) -> Result<()> {
    let (_rt, pipeline) = super::open_pipeline(config_path)?;
    let cached = pipeline.scores.read_all(actor)?;
    let merged: BTreeMap<u64, i64> = pipeline
        .ledger
        .totals(actor)?
        .into_iter()
        .map(|c| (c.region_id, c.value))
        .collect();

    let mut rows = Vec::with_capacity(cached.len());
    for counter in &cached {
        let dirty = pipeline
            .scores
            .is_dirty(ScoreKey::new(counter.actor_id, counter.region_id))?;
        rows.push(serde_json::json!({
            "region_id": counter.region_id,
            "cached": counter.value,
            "merged": merged.get(&counter.region_id),
            "dirty": dirty,
        }));
    }

    if json {
        return print_json(&serde_json::json!({ "actor_id": actor, "regions": rows }));
    }
    if rows.is_empty() {
        println!("No scores for actor {actor}.");
        return Ok(());
    }
    let mut table = Table::new(&["REGION", "CACHED", "MERGED", "DIRTY"]);
    for r in &rows {
        table.row([
            r["region_id"].to_string(),
            r["cached"].to_string(),
            r["merged"]
                .as_i64()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string()),
            if r["dirty"].as_bool() == Some(true) { "yes" } else { "no" }.to_string(),
        ]);
    }
    table.print();
    Ok(())
}
