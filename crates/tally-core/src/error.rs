use thiserror::Error;

#[derive(Debug, Error)]
pub enum TallyError {
    #[error("config not found: run 'tally init'")]
    NotInitialized,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("queue store error: {0}")]
    QueueStore(String),

    #[error("score cache error: {0}")]
    ScoreCache(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("undecodable payload for {log_id}: {reason}")]
    Decode { log_id: String, reason: String },

    #[error("invalid priority: {0}")]
    InvalidPriority(String),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("event not found: {0}")]
    EventNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TallyError {
    pub(crate) fn queue(e: impl std::fmt::Display) -> Self {
        Self::QueueStore(e.to_string())
    }

    pub(crate) fn score(e: impl std::fmt::Display) -> Self {
        Self::ScoreCache(e.to_string())
    }

    pub(crate) fn ledger(e: impl std::fmt::Display) -> Self {
        Self::Ledger(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TallyError>;
