use crate::output::print_json;
use anyhow::{bail, Result};
use clap::Subcommand;
use std::path::Path;
use tally_core::config::{Config, WarnLevel};

#[derive(Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Print the effective config, defaults included
    Show,
    /// Check the config for errors and suspicious values
    Validate,
}

pub fn run(config_path: &Path, subcmd: ConfigSubcommand, json: bool) -> Result<()> {
    let config = Config::load_from(config_path)?;
    match subcmd {
        ConfigSubcommand::Show => {
            if json {
                print_json(&config)?;
            } else {
                print!("{}", serde_yaml::to_string(&config)?);
            }
        }
        ConfigSubcommand::Validate => {
            let warnings = config.validate();
            if json {
                print_json(&warnings)?;
            } else if warnings.is_empty() {
                println!("Config OK: {}", config_path.display());
            } else {
                for w in &warnings {
                    let level = match w.level {
                        WarnLevel::Warning => "warning",
                        WarnLevel::Error => "error",
                    };
                    println!("{level}: {}", w.message);
                }
            }
            if warnings.iter().any(|w| w.level == WarnLevel::Error) {
                bail!("config has errors");
            }
        }
    }
    Ok(())
}
