use crate::error::{Result, TallyError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_path")]
    pub path: PathBuf,
    /// Lifetime of an event that does not carry its own TTL.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Staged ids older than this are assumed orphaned by a crashed flush.
    #[serde(default = "default_staging_timeout_secs")]
    pub staging_timeout_secs: u64,
}

fn default_queue_path() -> PathBuf {
    PathBuf::from(paths::QUEUE_DB)
}

fn default_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_staging_timeout_secs() -> u64 {
    300
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: default_queue_path(),
            default_ttl_secs: default_ttl_secs(),
            staging_timeout_secs: default_staging_timeout_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreConfig {
    #[serde(default = "default_score_path")]
    pub path: PathBuf,
}

fn default_score_path() -> PathBuf {
    PathBuf::from(paths::SCORE_DB)
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            path: default_score_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(paths::LEDGER_DB)
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedulers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushConfig {
    #[serde(default = "default_flush_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_flush_interval_secs() -> u64 {
    60
}

fn default_batch_size() -> usize {
    1000
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_flush_interval_secs(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Upper bound on concurrent background store writes.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_max_in_flight() -> usize {
    16
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    7780
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub score: ScoreConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub flush: FlushConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load `.tally/config.yaml` under `root`.
    pub fn load(root: &Path) -> Result<Self> {
        Self::load_from(&paths::config_path(root))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TallyError::NotInitialized);
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        self.save_to(&paths::config_path(root))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.queue.default_ttl_secs)
    }

    pub fn staging_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.staging_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush.interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_secs)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };
        if self.flush.interval_secs == 0 {
            error("flush.interval_secs must be greater than 0".into());
        }
        if self.reconcile.interval_secs == 0 {
            error("reconcile.interval_secs must be greater than 0".into());
        }
        if self.flush.batch_size == 0 {
            error("flush.batch_size must be greater than 0".into());
        }
        if self.queue.default_ttl_secs == 0 {
            error("queue.default_ttl_secs must be greater than 0".into());
        }

        let stores = [
            ("queue", &self.queue.path),
            ("score", &self.score.path),
            ("ledger", &self.ledger.path),
        ];
        for (i, (a, pa)) in stores.iter().enumerate() {
            for (b, pb) in &stores[i + 1..] {
                if pa == pb {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: format!("{a}.path and {b}.path both point at '{}'", pa.display()),
                    });
                }
            }
        }

        // A flush that recovers staged ids sooner than one flush period can
        // requeue ids that a slow run still owns.
        if self.queue.staging_timeout_secs < self.flush.interval_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "queue.staging_timeout_secs={} is shorter than flush.interval_secs={}",
                    self.queue.staging_timeout_secs, self.flush.interval_secs
                ),
            });
        }

        if self.dispatch.max_in_flight == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "dispatch.max_in_flight=0 is treated as 1".into(),
            });
        }

        warnings
    }

    /// Fail on the first error-level warning.
    pub fn ensure_valid(&self) -> Result<()> {
        match self
            .validate()
            .into_iter()
            .find(|w| w.level == WarnLevel::Error)
        {
            Some(w) => Err(TallyError::InvalidConfig(w.message)),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
