use std::path::{Path, PathBuf};

use tally_core::paths;

/// Resolve the project root.
///
/// Priority:
/// 1. `--root` flag / `TALLY_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.tally/`
/// 3. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut dir = cwd.clone();
    loop {
        if dir.join(paths::TALLY_DIR).is_dir() {
            return dir;
        }
        match dir.parent() {
            Some(p) => dir = p.to_path_buf(),
            None => break,
        }
    }
    cwd
}

/// The config file to use: `--config` when given, else `.tally/config.yaml`
/// under the root.
pub fn resolve_config(root: &Path, explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(p) => p.to_path_buf(),
        None => paths::config_path(root),
    }
}
