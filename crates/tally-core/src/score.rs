//! Per-(actor, region) score counters using redb.
//!
//! # Table design
//!
//! ```text
//! COUNTERS  (actor_id, region_id) -> i64   running total, never deleted
//! DIRTY     (actor_id, region_id) -> u64   generation of the last update
//! META      "generation"          -> u64   global, strictly increasing
//! ```
//!
//! Every `update` bumps the global generation and stamps it on the dirty
//! marker in the same write transaction. Reconciliation clears a marker only
//! if its generation is unchanged since the value was read, so an update that
//! lands mid-merge keeps the key dirty for the next run. Generations never
//! repeat, which rules out clearing a marker set after an earlier clear.

use std::fmt;
use std::path::Path;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TallyError};

const COUNTERS: TableDefinition<(u64, u64), i64> = TableDefinition::new("score_counters");
const DIRTY: TableDefinition<(u64, u64), u64> = TableDefinition::new("score_dirty");
const META: TableDefinition<&str, u64> = TableDefinition::new("score_meta");

const GENERATION: &str = "generation";

// ---------------------------------------------------------------------------
// ScoreKey
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScoreKey {
    pub actor_id: u64,
    pub region_id: u64,
}

impl ScoreKey {
    pub fn new(actor_id: u64, region_id: u64) -> Self {
        Self {
            actor_id,
            region_id,
        }
    }

    fn as_tuple(self) -> (u64, u64) {
        (self.actor_id, self.region_id)
    }
}

impl fmt::Display for ScoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.actor_id, self.region_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreCounter {
    pub actor_id: u64,
    pub region_id: u64,
    pub value: i64,
}

/// A counter that changed since the last reconciliation, as read in one
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyCounter {
    pub key: ScoreKey,
    pub value: i64,
    pub generation: u64,
}

// ---------------------------------------------------------------------------
// ScoreCache
// ---------------------------------------------------------------------------

pub struct ScoreCache {
    db: Database,
}

impl ScoreCache {
    /// Open or create the cache database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(TallyError::score)?;
        let wt = db.begin_write().map_err(TallyError::score)?;
        wt.open_table(COUNTERS).map_err(TallyError::score)?;
        wt.open_table(DIRTY).map_err(TallyError::score)?;
        wt.open_table(META).map_err(TallyError::score)?;
        wt.commit().map_err(TallyError::score)?;
        Ok(Self { db })
    }

    /// Add `delta` to the counter and mark it dirty. Returns the new value.
    pub fn update(&self, key: ScoreKey, delta: i64) -> Result<i64> {
        let wt = self.db.begin_write().map_err(TallyError::score)?;
        let value = {
            let mut counters = wt.open_table(COUNTERS).map_err(TallyError::score)?;
            let current = counters
                .get(key.as_tuple())
                .map_err(TallyError::score)?
                .map(|g| g.value())
                .unwrap_or(0);
            let value = current.saturating_add(delta);
            counters
                .insert(key.as_tuple(), value)
                .map_err(TallyError::score)?;

            let mut meta = wt.open_table(META).map_err(TallyError::score)?;
            let generation = meta
                .get(GENERATION)
                .map_err(TallyError::score)?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;
            meta.insert(GENERATION, generation)
                .map_err(TallyError::score)?;

            let mut dirty = wt.open_table(DIRTY).map_err(TallyError::score)?;
            dirty
                .insert(key.as_tuple(), generation)
                .map_err(TallyError::score)?;
            value
        };
        wt.commit().map_err(TallyError::score)?;
        Ok(value)
    }

    /// Current value of one counter; 0 if it was never touched.
    pub fn read(&self, key: ScoreKey) -> Result<i64> {
        let rt = self.db.begin_read().map_err(TallyError::score)?;
        let counters = rt.open_table(COUNTERS).map_err(TallyError::score)?;
        let value = counters
            .get(key.as_tuple())
            .map_err(TallyError::score)?
            .map(|g| g.value())
            .unwrap_or(0);
        Ok(value)
    }

    /// All counters for `actor_id`, ordered by region.
    pub fn read_all(&self, actor_id: u64) -> Result<Vec<ScoreCounter>> {
        let rt = self.db.begin_read().map_err(TallyError::score)?;
        let counters = rt.open_table(COUNTERS).map_err(TallyError::score)?;
        let mut result = Vec::new();
        for entry in counters
            .range((actor_id, 0)..=(actor_id, u64::MAX))
            .map_err(TallyError::score)?
        {
            let (k, v) = entry.map_err(TallyError::score)?;
            let (actor_id, region_id) = k.value();
            result.push(ScoreCounter {
                actor_id,
                region_id,
                value: v.value(),
            });
        }
        Ok(result)
    }

    /// Snapshot of every dirty counter with its current value.
    pub fn dirty(&self) -> Result<Vec<DirtyCounter>> {
        let rt = self.db.begin_read().map_err(TallyError::score)?;
        let dirty = rt.open_table(DIRTY).map_err(TallyError::score)?;
        let counters = rt.open_table(COUNTERS).map_err(TallyError::score)?;
        let mut result = Vec::new();
        for entry in dirty.iter().map_err(TallyError::score)? {
            let (k, generation) = entry.map_err(TallyError::score)?;
            let (actor_id, region_id) = k.value();
            let value = counters
                .get((actor_id, region_id))
                .map_err(TallyError::score)?
                .map(|g| g.value())
                .unwrap_or(0);
            result.push(DirtyCounter {
                key: ScoreKey::new(actor_id, region_id),
                value,
                generation: generation.value(),
            });
        }
        Ok(result)
    }

    /// Clear the dirty marker for `key` if it still carries `generation`.
    ///
    /// Returns `false` when a newer update re-marked the key; the marker is
    /// then left in place.
    pub fn clear_dirty(&self, key: ScoreKey, generation: u64) -> Result<bool> {
        let wt = self.db.begin_write().map_err(TallyError::score)?;
        let cleared = {
            let mut dirty = wt.open_table(DIRTY).map_err(TallyError::score)?;
            let current = dirty
                .get(key.as_tuple())
                .map_err(TallyError::score)?
                .map(|g| g.value());
            if current == Some(generation) {
                dirty.remove(key.as_tuple()).map_err(TallyError::score)?;
                true
            } else {
                false
            }
        };
        wt.commit().map_err(TallyError::score)?;
        Ok(cleared)
    }

    pub fn is_dirty(&self, key: ScoreKey) -> Result<bool> {
        let rt = self.db.begin_read().map_err(TallyError::score)?;
        let dirty = rt.open_table(DIRTY).map_err(TallyError::score)?;
        Ok(dirty
            .get(key.as_tuple())
            .map_err(TallyError::score)?
            .is_some())
    }

    pub fn dirty_len(&self) -> Result<u64> {
        let rt = self.db.begin_read().map_err(TallyError::score)?;
        let dirty = rt.open_table(DIRTY).map_err(TallyError::score)?;
        dirty.len().map_err(TallyError::score)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, ScoreCache) {
        let dir = TempDir::new().unwrap();
        let cache = ScoreCache::open(&dir.path().join("scores.redb")).unwrap();
        (dir, cache)
    }

    #[test]
    fn untouched_counter_reads_zero() {
        let (_dir, cache) = open_tmp();
        assert_eq!(cache.read(ScoreKey::new(1, 1)).unwrap(), 0);
        assert!(cache.read_all(1).unwrap().is_empty());
        assert_eq!(cache.dirty_len().unwrap(), 0);
    }

    #[test]
    fn update_adds_and_marks_dirty() {
        let (_dir, cache) = open_tmp();
        let key = ScoreKey::new(7, 3);
        assert_eq!(cache.update(key, 10).unwrap(), 10);
        assert_eq!(cache.update(key, 5).unwrap(), 15);
        assert_eq!(cache.read(key).unwrap(), 15);
        assert!(cache.is_dirty(key).unwrap());
    }

    #[test]
    fn opposite_deltas_restore_value_and_dirty_once() {
        let (_dir, cache) = open_tmp();
        let key = ScoreKey::new(7, 3);
        cache.update(key, 4).unwrap();
        let dirty = cache.dirty().unwrap();
        cache.clear_dirty(key, dirty[0].generation).unwrap();

        cache.update(key, 9).unwrap();
        cache.update(key, -9).unwrap();

        assert_eq!(cache.read(key).unwrap(), 4);
        let dirty = cache.dirty().unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].key, key);
    }

    #[test]
    fn read_all_scans_only_one_actor() {
        let (_dir, cache) = open_tmp();
        cache.update(ScoreKey::new(7, 3), 10).unwrap();
        cache.update(ScoreKey::new(7, 1), -2).unwrap();
        cache.update(ScoreKey::new(8, 3), 99).unwrap();

        let all = cache.read_all(7).unwrap();
        assert_eq!(
            all,
            vec![
                ScoreCounter {
                    actor_id: 7,
                    region_id: 1,
                    value: -2
                },
                ScoreCounter {
                    actor_id: 7,
                    region_id: 3,
                    value: 10
                },
            ]
        );
    }

    #[test]
    fn clear_dirty_is_compare_and_clear() {
        let (_dir, cache) = open_tmp();
        let key = ScoreKey::new(1, 2);
        cache.update(key, 1).unwrap();
        let stale = cache.dirty().unwrap()[0].generation;
        cache.update(key, 1).unwrap();

        assert!(!cache.clear_dirty(key, stale).unwrap());
        assert!(cache.is_dirty(key).unwrap());

        let fresh = cache.dirty().unwrap()[0].generation;
        assert!(fresh > stale);
        assert!(cache.clear_dirty(key, fresh).unwrap());
        assert!(!cache.is_dirty(key).unwrap());
        assert_eq!(cache.read(key).unwrap(), 2, "counter survives clearing");
    }

    #[test]
    fn generations_never_repeat_after_clear() {
        let (_dir, cache) = open_tmp();
        let key = ScoreKey::new(1, 1);
        cache.update(key, 1).unwrap();
        let first = cache.dirty().unwrap()[0].generation;
        cache.clear_dirty(key, first).unwrap();
        cache.update(key, 1).unwrap();
        let second = cache.dirty().unwrap()[0].generation;
        assert_ne!(first, second);
        assert!(!cache.clear_dirty(key, first).unwrap());
    }

    #[test]
    fn counters_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scores.redb");
        {
            let cache = ScoreCache::open(&path).unwrap();
            cache.update(ScoreKey::new(2, 2), 6).unwrap();
        }
        let cache = ScoreCache::open(&path).unwrap();
        assert_eq!(cache.read(ScoreKey::new(2, 2)).unwrap(), 6);
        assert!(cache.is_dirty(ScoreKey::new(2, 2)).unwrap());
    }
}
