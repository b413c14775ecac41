use std::path::{Path, PathBuf};

pub const TALLY_DIR: &str = ".tally";
pub const CONFIG_FILE: &str = ".tally/config.yaml";

pub const QUEUE_DB: &str = "queue.redb";
pub const SCORE_DB: &str = "scores.redb";
pub const LEDGER_DB: &str = "ledger.sqlite";

pub fn tally_dir(root: &Path) -> PathBuf {
    root.join(TALLY_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// Resolve `path` against `base` unless it is already absolute.
pub fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
