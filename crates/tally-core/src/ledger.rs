//! Durable ledger backed by SQLite.
//!
//! Two tables:
//! - `activity_log`: one row per flushed event, keyed by `log_id`. Inserts are
//!   `INSERT OR IGNORE`, so re-flushing an id after a crash between ledger
//!   commit and queue ack leaves exactly one row.
//! - `activity_score`: one row per (actor, region) holding the absolute total
//!   last merged from the score cache, stamped with the cache generation it
//!   was read at. A write carrying an older generation than the stored row is
//!   dropped, so an overlapping merge can never roll a total back.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::{Result, TallyError};
use crate::event::{ActivityEvent, Origin};
use crate::score::{ScoreCounter, ScoreKey};

/// Sink for flushed events.
pub trait EventLedger: Send + Sync {
    /// Persist one event. Must be idempotent on `log_id`.
    fn append(&self, event: &ActivityEvent) -> Result<()>;
}

/// Sink for reconciled score totals.
pub trait ScoreLedger: Send + Sync {
    /// Replace the stored total for `key` with `total`, unless the stored row
    /// was written from a newer cache generation.
    fn upsert_total(&self, key: ScoreKey, total: i64, generation: u64) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SqliteLedger
// ---------------------------------------------------------------------------

pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(TallyError::ledger)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(TallyError::ledger)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        Self::init_schema(&conn).map_err(TallyError::ledger)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS activity_log (
                log_id       TEXT PRIMARY KEY,
                actor_id     INTEGER,
                region_id    INTEGER,
                action_type  TEXT NOT NULL,
                target_ref   INTEGER,
                parent_ref   INTEGER,
                action_value TEXT,
                score_delta  INTEGER NOT NULL DEFAULT 0,
                meta         TEXT NOT NULL,
                ip           TEXT,
                agent        TEXT,
                platform     TEXT,
                locale       TEXT,
                priority     TEXT NOT NULL,
                status       TEXT NOT NULL,
                error        TEXT,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL,
                duration_ms  INTEGER NOT NULL DEFAULT 0,
                ttl_secs     INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_activity_log_actor ON activity_log(actor_id);
            CREATE TABLE IF NOT EXISTS activity_score (
                actor_id   INTEGER NOT NULL,
                region_id  INTEGER NOT NULL,
                total      INTEGER NOT NULL,
                generation INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (actor_id, region_id)
            );",
        )
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TallyError::Ledger("connection lock poisoned".to_string()))
    }

    /// Fetch one ledger row back as an event.
    pub fn get(&self, log_id: &str) -> Result<Option<ActivityEvent>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT log_id, actor_id, region_id, action_type, target_ref, parent_ref,
                        action_value, score_delta, meta, ip, agent, platform, locale,
                        priority, status, error, created_at, updated_at, duration_ms, ttl_secs
                 FROM activity_log WHERE log_id = ?1",
                params![log_id],
                RawRow::from_row,
            )
            .optional()
            .map_err(TallyError::ledger)?;
        row.map(RawRow::into_event).transpose()
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.lock()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM activity_log", [], |row| row.get(0))
            .map_err(TallyError::ledger)?;
        Ok(n as u64)
    }

    /// Stored total for one counter, `None` if never merged.
    pub fn total(&self, key: ScoreKey) -> Result<Option<i64>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT total FROM activity_score WHERE actor_id = ?1 AND region_id = ?2",
            params![key.actor_id as i64, key.region_id as i64],
            |row| row.get(0),
        )
        .optional()
        .map_err(TallyError::ledger)
    }

    pub fn totals(&self, actor_id: u64) -> Result<Vec<ScoreCounter>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT region_id, total FROM activity_score
                 WHERE actor_id = ?1 ORDER BY region_id",
            )
            .map_err(TallyError::ledger)?;
        let rows = stmt
            .query_map(params![actor_id as i64], |row| {
                Ok(ScoreCounter {
                    actor_id,
                    region_id: row.get::<_, i64>(0)? as u64,
                    value: row.get(1)?,
                })
            })
            .map_err(TallyError::ledger)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(TallyError::ledger)
    }
}

impl EventLedger for SqliteLedger {
    fn append(&self, event: &ActivityEvent) -> Result<()> {
        let meta = serde_json::to_string(&event.meta)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO activity_log (
                log_id, actor_id, region_id, action_type, target_ref, parent_ref,
                action_value, score_delta, meta, ip, agent, platform, locale,
                priority, status, error, created_at, updated_at, duration_ms, ttl_secs
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                       ?16, ?17, ?18, ?19, ?20)",
            params![
                event.log_id,
                event.actor_id.map(|v| v as i64),
                event.region_id.map(|v| v as i64),
                event.action_type,
                event.target_ref.map(|v| v as i64),
                event.parent_ref.map(|v| v as i64),
                event.action_value,
                event.score_delta,
                meta,
                event.origin.ip,
                event.origin.agent,
                event.origin.platform,
                event.origin.locale,
                event.priority.as_str(),
                event.status.as_str(),
                event.error,
                format_time(event.created_at),
                format_time(event.updated_at),
                event.duration_ms as i64,
                event.ttl_secs.map(|v| v as i64),
            ],
        )
        .map_err(TallyError::ledger)?;
        Ok(())
    }
}

impl ScoreLedger for SqliteLedger {
    fn upsert_total(&self, key: ScoreKey, total: i64, generation: u64) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "INSERT INTO activity_score (actor_id, region_id, total, generation, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(actor_id, region_id)
                 DO UPDATE SET total = excluded.total,
                               generation = excluded.generation,
                               updated_at = excluded.updated_at
                 WHERE excluded.generation >= activity_score.generation",
                params![
                    key.actor_id as i64,
                    key.region_id as i64,
                    total,
                    generation as i64,
                    format_time(Utc::now())
                ],
            )
            .map_err(TallyError::ledger)?;
        if changed == 0 {
            debug!(key = %key, generation, "stale score merge ignored");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn format_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TallyError::Ledger(format!("bad timestamp '{s}': {e}")))
}

/// Column values as stored, before enum and timestamp parsing.
struct RawRow {
    log_id: String,
    actor_id: Option<i64>,
    region_id: Option<i64>,
    action_type: String,
    target_ref: Option<i64>,
    parent_ref: Option<i64>,
    action_value: Option<String>,
    score_delta: i64,
    meta: String,
    ip: Option<String>,
    agent: Option<String>,
    platform: Option<String>,
    locale: Option<String>,
    priority: String,
    status: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    duration_ms: i64,
    ttl_secs: Option<i64>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            log_id: row.get(0)?,
            actor_id: row.get(1)?,
            region_id: row.get(2)?,
            action_type: row.get(3)?,
            target_ref: row.get(4)?,
            parent_ref: row.get(5)?,
            action_value: row.get(6)?,
            score_delta: row.get(7)?,
            meta: row.get(8)?,
            ip: row.get(9)?,
            agent: row.get(10)?,
            platform: row.get(11)?,
            locale: row.get(12)?,
            priority: row.get(13)?,
            status: row.get(14)?,
            error: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
            duration_ms: row.get(18)?,
            ttl_secs: row.get(19)?,
        })
    }

    fn into_event(self) -> Result<ActivityEvent> {
        Ok(ActivityEvent {
            log_id: self.log_id,
            actor_id: self.actor_id.map(|v| v as u64),
            region_id: self.region_id.map(|v| v as u64),
            action_type: self.action_type,
            target_ref: self.target_ref.map(|v| v as u64),
            parent_ref: self.parent_ref.map(|v| v as u64),
            action_value: self.action_value,
            score_delta: self.score_delta,
            meta: serde_json::from_str(&self.meta)?,
            origin: Origin {
                ip: self.ip,
                agent: self.agent,
                platform: self.platform,
                locale: self.locale,
            },
            priority: self.priority.parse()?,
            status: self.status.parse()?,
            error: self.error,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            duration_ms: self.duration_ms as u64,
            ttl_secs: self.ttl_secs.map(|v| v as u64),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
