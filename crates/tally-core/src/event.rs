//! The `ActivityEvent` record produced by capture and carried through the
//! queue into the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::score::ScoreKey;
use crate::types::{EventStatus, Priority};

/// Action type used when the caller supplies an empty one.
pub const UNKNOWN_ACTION: &str = "UNKNOWN";

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

/// Request-origin metadata, snapshotted once per captured operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

// ---------------------------------------------------------------------------
// ActivityEvent
// ---------------------------------------------------------------------------

/// One captured business operation.
///
/// `log_id`, `action_type` and `created_at` are always set; every other field
/// may be absent or defaulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub log_id: String,
    #[serde(default)]
    pub actor_id: Option<u64>,
    #[serde(default)]
    pub region_id: Option<u64>,
    pub action_type: String,
    #[serde(default)]
    pub target_ref: Option<u64>,
    #[serde(default)]
    pub parent_ref: Option<u64>,
    #[serde(default)]
    pub action_value: Option<String>,
    #[serde(default)]
    pub score_delta: i64,
    #[serde(default)]
    pub meta: serde_json::Value,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: EventStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl ActivityEvent {
    /// Create a successful, unscored event with a fresh `log_id`.
    pub fn new(action_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            log_id: Uuid::new_v4().to_string(),
            actor_id: None,
            region_id: None,
            action_type: normalize_action_type(action_type.into()),
            target_ref: None,
            parent_ref: None,
            action_value: None,
            score_delta: 0,
            meta: serde_json::Value::Null,
            origin: Origin::default(),
            priority: Priority::Normal,
            status: EventStatus::Success,
            error: None,
            created_at: now,
            updated_at: now,
            duration_ms: 0,
            ttl_secs: None,
        }
    }

    pub fn with_actor(mut self, actor_id: u64) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn with_region(mut self, region_id: u64) -> Self {
        self.region_id = Some(region_id);
        self
    }

    pub fn with_score_delta(mut self, delta: i64) -> Self {
        self.score_delta = delta;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Time this event may wait in the queue before it expires.
    pub fn ttl(&self, default: Duration) -> Duration {
        self.ttl_secs.map(Duration::from_secs).unwrap_or(default)
    }

    /// The score-cache counter this event moves, if any.
    ///
    /// Only events with a non-zero delta and both an actor and a region are
    /// scored; anonymous activity is recorded but never counted.
    pub fn score_key(&self) -> Option<ScoreKey> {
        if self.score_delta == 0 {
            return None;
        }
        match (self.actor_id, self.region_id) {
            (Some(actor), Some(region)) => Some(ScoreKey::new(actor, region)),
            _ => None,
        }
    }
}

pub(crate) fn normalize_action_type(action_type: String) -> String {
    if action_type.trim().is_empty() {
        UNKNOWN_ACTION.to_string()
    } else {
        action_type
    }
}
