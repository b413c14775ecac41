//! Durable event queue using redb.
//!
//! # Table design
//!
//! ```text
//! PAYLOADS           log_id            -> encoded event bytes
//! EXPIRY             log_id            -> expires_at_ms
//! FIFO               seq: i64          -> log_id        arrival order
//! INDEX_<priority>   [ts_ms BE | id]   -> ()            priority visibility
//! MEMBERS_<priority> log_id            -> ts_ms         reverse lookup
//! STAGING            log_id            -> staged_at_ms  drained, not yet acked
//! ```
//!
//! `put` performs three independent write transactions (payload, FIFO,
//! priority index) with no atomicity across them. The FIFO is the only source
//! of truth for flush eligibility; the priority indices are advisory.
//!
//! `drain` pops FIFO ids and moves them into `STAGING` in a single write
//! transaction. redb serializes write transactions, so concurrent drains never
//! claim the same id. Staged ids leave only through `ack` (ledger committed)
//! or `requeue` (ledger failed), which puts them back at the FIFO head.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use redb::{
    Database, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction,
};
use serde::Serialize;

use crate::codec::{self, DecoderChain};
use crate::error::{Result, TallyError};
use crate::event::ActivityEvent;
use crate::types::Priority;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const PAYLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("queue_payloads");
const EXPIRY: TableDefinition<&str, u64> = TableDefinition::new("queue_expiry");
const FIFO: TableDefinition<i64, &str> = TableDefinition::new("queue_fifo");
const STAGING: TableDefinition<&str, u64> = TableDefinition::new("queue_staging");

const INDEX_NORMAL: TableDefinition<&[u8], ()> = TableDefinition::new("queue_index_normal");
const INDEX_HIGH: TableDefinition<&[u8], ()> = TableDefinition::new("queue_index_high");
const INDEX_CRITICAL: TableDefinition<&[u8], ()> = TableDefinition::new("queue_index_critical");

const MEMBERS_NORMAL: TableDefinition<&str, u64> = TableDefinition::new("queue_members_normal");
const MEMBERS_HIGH: TableDefinition<&str, u64> = TableDefinition::new("queue_members_high");
const MEMBERS_CRITICAL: TableDefinition<&str, u64> =
    TableDefinition::new("queue_members_critical");

fn index_table(p: Priority) -> TableDefinition<'static, &'static [u8], ()> {
    match p {
        Priority::Normal => INDEX_NORMAL,
        Priority::High => INDEX_HIGH,
        Priority::Critical => INDEX_CRITICAL,
    }
}

fn members_table(p: Priority) -> TableDefinition<'static, &'static str, u64> {
    match p {
        Priority::Normal => MEMBERS_NORMAL,
        Priority::High => MEMBERS_HIGH,
        Priority::Critical => MEMBERS_CRITICAL,
    }
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

/// Index key: `[ts_ms big-endian (8 bytes) | log_id utf-8]`, so byte order is
/// time order with ties broken by id.
fn index_key(ts_ms: u64, log_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + log_id.len());
    key.extend_from_slice(&ts_ms.to_be_bytes());
    key.extend_from_slice(log_id.as_bytes());
    key
}

fn id_from_index_key(key: &[u8]) -> Option<&str> {
    std::str::from_utf8(key.get(8..)?).ok()
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

// ---------------------------------------------------------------------------
// QueueStats
// ---------------------------------------------------------------------------

/// Advisory queue counters; never used for correctness decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub depth: u64,
    pub normal: u64,
    pub high: u64,
    pub critical: u64,
    pub staging: u64,
}

// ---------------------------------------------------------------------------
// QueueStore
// ---------------------------------------------------------------------------

pub struct QueueStore {
    db: Database,
    default_ttl: Duration,
    decoders: DecoderChain,
}

impl QueueStore {
    /// Open or create the queue database at `path`.
    pub fn open(path: &Path, default_ttl: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(TallyError::queue)?;
        let wt = db.begin_write().map_err(TallyError::queue)?;
        wt.open_table(PAYLOADS).map_err(TallyError::queue)?;
        wt.open_table(EXPIRY).map_err(TallyError::queue)?;
        wt.open_table(FIFO).map_err(TallyError::queue)?;
        wt.open_table(STAGING).map_err(TallyError::queue)?;
        for &p in Priority::by_urgency() {
            wt.open_table(index_table(p)).map_err(TallyError::queue)?;
            wt.open_table(members_table(p)).map_err(TallyError::queue)?;
        }
        wt.commit().map_err(TallyError::queue)?;
        Ok(Self {
            db,
            default_ttl,
            decoders: DecoderChain::default(),
        })
    }

    pub fn with_decoders(mut self, decoders: DecoderChain) -> Self {
        self.decoders = decoders;
        self
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Enqueue an event: payload, FIFO tail, priority index.
    ///
    /// Each step commits on its own. A failure part-way leaves the earlier
    /// steps in place.
    pub fn put(&self, event: &ActivityEvent) -> Result<()> {
        let bytes = codec::encode(event)?;
        let ttl_ms = event.ttl(self.default_ttl).as_millis() as u64;
        let now = now_ms();
        self.write_payload(&event.log_id, &bytes, now.saturating_add(ttl_ms))?;
        self.push_fifo(&event.log_id)?;
        self.add_to_index(&event.log_id, event.priority, now)?;
        Ok(())
    }

    pub(crate) fn write_payload(&self, log_id: &str, bytes: &[u8], expires_at_ms: u64) -> Result<()> {
        let wt = self.db.begin_write().map_err(TallyError::queue)?;
        {
            let mut payloads = wt.open_table(PAYLOADS).map_err(TallyError::queue)?;
            payloads.insert(log_id, bytes).map_err(TallyError::queue)?;
            let mut expiry = wt.open_table(EXPIRY).map_err(TallyError::queue)?;
            expiry
                .insert(log_id, expires_at_ms)
                .map_err(TallyError::queue)?;
        }
        wt.commit().map_err(TallyError::queue)
    }

    pub(crate) fn push_fifo(&self, log_id: &str) -> Result<()> {
        let wt = self.db.begin_write().map_err(TallyError::queue)?;
        {
            let mut fifo = wt.open_table(FIFO).map_err(TallyError::queue)?;
            let next = fifo
                .last()
                .map_err(TallyError::queue)?
                .map(|(k, _)| k.value() + 1)
                .unwrap_or(0);
            fifo.insert(next, log_id).map_err(TallyError::queue)?;
        }
        wt.commit().map_err(TallyError::queue)
    }

    pub(crate) fn add_to_index(&self, log_id: &str, priority: Priority, ts_ms: u64) -> Result<()> {
        let wt = self.db.begin_write().map_err(TallyError::queue)?;
        {
            let mut index = wt
                .open_table(index_table(priority))
                .map_err(TallyError::queue)?;
            index
                .insert(index_key(ts_ms, log_id).as_slice(), ())
                .map_err(TallyError::queue)?;
            let mut members = wt
                .open_table(members_table(priority))
                .map_err(TallyError::queue)?;
            members.insert(log_id, ts_ms).map_err(TallyError::queue)?;
        }
        wt.commit().map_err(TallyError::queue)
    }

    // -----------------------------------------------------------------------
    // Drain / ack / requeue
    // -----------------------------------------------------------------------

    /// Pop up to `n` ids from the FIFO head, oldest first, and stage the ones
    /// whose payload resolves.
    ///
    /// Ids whose payload is missing, expired, or undecodable are dropped and
    /// never retried.
    pub fn drain(&self, n: usize) -> Result<Vec<ActivityEvent>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let now = now_ms();
        let wt = self.db.begin_write().map_err(TallyError::queue)?;
        let mut drained = Vec::new();
        let mut unresolved = Vec::new();
        {
            let mut fifo = wt.open_table(FIFO).map_err(TallyError::queue)?;
            let payloads = wt.open_table(PAYLOADS).map_err(TallyError::queue)?;
            let expiry = wt.open_table(EXPIRY).map_err(TallyError::queue)?;
            let mut staging = wt.open_table(STAGING).map_err(TallyError::queue)?;

            for _ in 0..n {
                let Some(log_id) = fifo
                    .pop_first()
                    .map_err(TallyError::queue)?
                    .map(|(_, v)| v.value().to_string())
                else {
                    break;
                };

                let expires_at = expiry
                    .get(log_id.as_str())
                    .map_err(TallyError::queue)?
                    .map(|g| g.value());
                if expires_at.is_some_and(|t| t <= now) {
                    tracing::debug!(log_id = %log_id, "skipping expired queue entry");
                    unresolved.push(log_id);
                    continue;
                }

                let bytes = payloads
                    .get(log_id.as_str())
                    .map_err(TallyError::queue)?
                    .map(|g| g.value().to_vec());
                let Some(bytes) = bytes else {
                    tracing::debug!(log_id = %log_id, "skipping queue entry without payload");
                    unresolved.push(log_id);
                    continue;
                };

                match self.decoders.decode(&log_id, &bytes) {
                    Ok(event) => {
                        staging
                            .insert(log_id.as_str(), now)
                            .map_err(TallyError::queue)?;
                        drained.push(event);
                    }
                    Err(e) => {
                        tracing::warn!(log_id = %log_id, error = %e, "dropping undecodable queue entry");
                        unresolved.push(log_id);
                    }
                }
            }
        }
        for log_id in &unresolved {
            forget(&wt, log_id)?;
        }
        wt.commit().map_err(TallyError::queue)?;
        Ok(drained)
    }

    /// Delete acknowledged ids: payload, expiry, staging and index entries.
    pub fn ack(&self, log_ids: &[String]) -> Result<()> {
        if log_ids.is_empty() {
            return Ok(());
        }
        let wt = self.db.begin_write().map_err(TallyError::queue)?;
        for log_id in log_ids {
            forget(&wt, log_id)?;
        }
        wt.commit().map_err(TallyError::queue)
    }

    /// Put staged ids back at the FIFO head, preserving their relative order.
    ///
    /// Ids no longer staged (already acked or requeued) are ignored. Returns
    /// the number requeued.
    pub fn requeue(&self, log_ids: &[String]) -> Result<usize> {
        if log_ids.is_empty() {
            return Ok(0);
        }
        let wt = self.db.begin_write().map_err(TallyError::queue)?;
        let mut count = 0;
        {
            let mut fifo = wt.open_table(FIFO).map_err(TallyError::queue)?;
            let mut staging = wt.open_table(STAGING).map_err(TallyError::queue)?;
            let mut head = fifo
                .first()
                .map_err(TallyError::queue)?
                .map(|(k, _)| k.value())
                .unwrap_or(0);
            for log_id in log_ids.iter().rev() {
                let was_staged = staging
                    .remove(log_id.as_str())
                    .map_err(TallyError::queue)?
                    .is_some();
                if !was_staged {
                    continue;
                }
                head -= 1;
                fifo.insert(head, log_id.as_str())
                    .map_err(TallyError::queue)?;
                count += 1;
            }
        }
        wt.commit().map_err(TallyError::queue)?;
        Ok(count)
    }

    /// Requeue ids staged for longer than `max_age`, oldest first.
    ///
    /// These belong to flush runs that died between drain and ack.
    pub fn recover_staged(&self, max_age: Duration) -> Result<usize> {
        let cutoff = now_ms().saturating_sub(max_age.as_millis() as u64);
        let mut stale = {
            let rt = self.db.begin_read().map_err(TallyError::queue)?;
            let staging = rt.open_table(STAGING).map_err(TallyError::queue)?;
            let mut stale = Vec::new();
            for entry in staging.iter().map_err(TallyError::queue)? {
                let (k, v) = entry.map_err(TallyError::queue)?;
                if v.value() <= cutoff {
                    stale.push((v.value(), k.value().to_string()));
                }
            }
            stale
        };
        stale.sort();
        let ids: Vec<String> = stale.into_iter().map(|(_, id)| id).collect();
        let n = self.requeue(&ids)?;
        if n > 0 {
            tracing::info!(count = n, "requeued stale staged entries");
        }
        Ok(n)
    }

    /// Delete an id's payload and remove it from every priority index.
    /// Idempotent; does not touch the FIFO.
    pub fn remove(&self, log_id: &str) -> Result<()> {
        let wt = self.db.begin_write().map_err(TallyError::queue)?;
        forget(&wt, log_id)?;
        wt.commit().map_err(TallyError::queue)
    }

    /// Delete payloads whose TTL elapsed. FIFO ids left behind are skipped
    /// at drain. Staged entries are left for their flush run.
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = now_ms();
        let wt = self.db.begin_write().map_err(TallyError::queue)?;
        let expired = {
            let expiry = wt.open_table(EXPIRY).map_err(TallyError::queue)?;
            let staging = wt.open_table(STAGING).map_err(TallyError::queue)?;
            let mut expired = Vec::new();
            for entry in expiry.iter().map_err(TallyError::queue)? {
                let (k, v) = entry.map_err(TallyError::queue)?;
                let log_id = k.value();
                if v.value() <= now
                    && staging.get(log_id).map_err(TallyError::queue)?.is_none()
                {
                    expired.push(log_id.to_string());
                }
            }
            expired
        };
        for log_id in &expired {
            forget(&wt, log_id)?;
        }
        wt.commit().map_err(TallyError::queue)?;
        Ok(expired.len())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Load and decode one payload. Expired or missing payloads are `None`.
    pub fn lookup(&self, log_id: &str) -> Result<Option<ActivityEvent>> {
        let rt = self.db.begin_read().map_err(TallyError::queue)?;
        let expiry = rt.open_table(EXPIRY).map_err(TallyError::queue)?;
        let expired = expiry
            .get(log_id)
            .map_err(TallyError::queue)?
            .is_some_and(|g| g.value() <= now_ms());
        if expired {
            return Ok(None);
        }
        let payloads = rt.open_table(PAYLOADS).map_err(TallyError::queue)?;
        let bytes = payloads
            .get(log_id)
            .map_err(TallyError::queue)?
            .map(|g| g.value().to_vec());
        match bytes {
            Some(bytes) => self.decoders.decode(log_id, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Number of ids waiting in the FIFO.
    pub fn size(&self) -> Result<u64> {
        let rt = self.db.begin_read().map_err(TallyError::queue)?;
        let fifo = rt.open_table(FIFO).map_err(TallyError::queue)?;
        fifo.len().map_err(TallyError::queue)
    }

    pub fn count(&self, priority: Priority) -> Result<u64> {
        let rt = self.db.begin_read().map_err(TallyError::queue)?;
        let index = rt
            .open_table(index_table(priority))
            .map_err(TallyError::queue)?;
        index.len().map_err(TallyError::queue)
    }

    pub fn staging_len(&self) -> Result<u64> {
        let rt = self.db.begin_read().map_err(TallyError::queue)?;
        let staging = rt.open_table(STAGING).map_err(TallyError::queue)?;
        staging.len().map_err(TallyError::queue)
    }

    /// Whether `log_id` has been drained and awaits ack or requeue.
    pub fn is_staged(&self, log_id: &str) -> Result<bool> {
        let rt = self.db.begin_read().map_err(TallyError::queue)?;
        let staging = rt.open_table(STAGING).map_err(TallyError::queue)?;
        Ok(staging.get(log_id).map_err(TallyError::queue)?.is_some())
    }

    pub fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            depth: self.size()?,
            normal: self.count(Priority::Normal)?,
            high: self.count(Priority::High)?,
            critical: self.count(Priority::Critical)?,
            staging: self.staging_len()?,
        })
    }

    /// Up to `n` queued events by priority: critical first, then high, then
    /// normal, oldest first within each. Entries that no longer resolve are
    /// skipped.
    pub fn peek(&self, n: usize) -> Result<Vec<ActivityEvent>> {
        let mut ids = Vec::new();
        {
            let rt = self.db.begin_read().map_err(TallyError::queue)?;
            'outer: for &p in Priority::by_urgency() {
                let index = rt.open_table(index_table(p)).map_err(TallyError::queue)?;
                for entry in index.iter().map_err(TallyError::queue)? {
                    if ids.len() >= n {
                        break 'outer;
                    }
                    let (k, _) = entry.map_err(TallyError::queue)?;
                    if let Some(id) = id_from_index_key(k.value()) {
                        ids.push(id.to_string());
                    }
                }
            }
        }
        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            match self.lookup(&id) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => tracing::debug!(log_id = %id, error = %e, "peek skipped entry"),
            }
        }
        Ok(events)
    }

    /// Ids currently in the FIFO, head first.
    pub fn fifo_ids(&self) -> Result<Vec<String>> {
        let rt = self.db.begin_read().map_err(TallyError::queue)?;
        let fifo = rt.open_table(FIFO).map_err(TallyError::queue)?;
        let mut ids = Vec::new();
        for entry in fifo.iter().map_err(TallyError::queue)? {
            let (_, v) = entry.map_err(TallyError::queue)?;
            ids.push(v.value().to_string());
        }
        Ok(ids)
    }
}

/// Remove every non-FIFO trace of `log_id` inside `wt`. The caller must not
/// hold any queue table open.
fn forget(wt: &WriteTransaction, log_id: &str) -> Result<()> {
    {
        let mut payloads = wt.open_table(PAYLOADS).map_err(TallyError::queue)?;
        payloads.remove(log_id).map_err(TallyError::queue)?;
        let mut expiry = wt.open_table(EXPIRY).map_err(TallyError::queue)?;
        expiry.remove(log_id).map_err(TallyError::queue)?;
        let mut staging = wt.open_table(STAGING).map_err(TallyError::queue)?;
        staging.remove(log_id).map_err(TallyError::queue)?;
    }
    for &p in Priority::by_urgency() {
        let mut members = wt.open_table(members_table(p)).map_err(TallyError::queue)?;
        let ts = members
            .remove(log_id)
            .map_err(TallyError::queue)?
            .map(|g| g.value());
        if let Some(ts) = ts {
            let mut index = wt.open_table(index_table(p)).map_err(TallyError::queue)?;
            index
                .remove(index_key(ts, log_id).as_slice())
                .map_err(TallyError::queue)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
