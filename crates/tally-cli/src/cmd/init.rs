use crate::output::print_json;
use anyhow::Result;
use std::path::Path;
use tally_core::Config;

pub fn run(config_path: &Path, force: bool, json: bool) -> Result<()> {
    let created = if config_path.exists() && !force {
        false
    } else {
        Config::default().save_to(config_path)?;
        true
    };

    // Creates the store files on first run.
    drop(super::open_pipeline(config_path)?);

    if json {
        print_json(&serde_json::json!({
            "config": config_path.display().to_string(),
            "created": created,
        }))?;
    } else if created {
        println!("Initialized tally at {}", config_path.display());
    } else {
        println!("Already initialized: {}", config_path.display());
    }
    Ok(())
}
