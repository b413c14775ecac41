use crate::output::print_json;
use anyhow::Result;
use std::path::Path;

pub fn run(config_path: &Path, json: bool) -> Result<()> {
    let (_rt, pipeline) = super::open_pipeline(config_path)?;
    let report = pipeline.flush.run_once()?;

    if json {
        print_json(&report)?;
        return Ok(());
    }
    println!(
        "Flushed {} of {} drained events ({} requeued, {} recovered, {} expired)",
        report.persisted, report.drained, report.requeued, report.recovered, report.expired
    );
    Ok(())
}
