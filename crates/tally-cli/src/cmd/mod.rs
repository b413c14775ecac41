pub mod config;
pub mod flush;
pub mod init;
pub mod queue;
pub mod reconcile;
pub mod score;
pub mod serve;

use anyhow::{Context, Result};
use std::path::Path;
use tally_core::Pipeline;
use tokio::runtime::{Builder, Handle, Runtime};

/// Open every store named by the config at `config_path`, together with the
/// runtime its capture writes are spawned on. Keep the runtime alive for as
/// long as the pipeline is in use.
pub(crate) fn open_pipeline(config_path: &Path) -> Result<(Runtime, Pipeline)> {
    let rt = Builder::new_current_thread().enable_all().build()?;
    let pipeline = open_pipeline_on(config_path, rt.handle().clone())?;
    Ok((rt, pipeline))
}

pub(crate) fn open_pipeline_on(config_path: &Path, runtime: Handle) -> Result<Pipeline> {
    Pipeline::open_config(config_path, runtime)
        .with_context(|| format!("opening pipeline from {}", config_path.display()))
}
