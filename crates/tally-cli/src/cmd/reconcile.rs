use crate::output::print_json;
use anyhow::Result;
use std::path::Path;

pub fn run(config_path: &Path, json: bool) -> Result<()> {
    let (_rt, pipeline) = super::open_pipeline(config_path)?;
    let report = pipeline.reconcile.run_once()?;

    if json {
        print_json(&report)?;
        return Ok(());
    }
    println!(
        "Merged {} counters ({} failed, {} changed during merge)",
        report.merged, report.failed, report.superseded
    );
    Ok(())
}
