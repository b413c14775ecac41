//! Score reconciliation: copy dirty cache counters into the score ledger.
//!
//! The ledger holds absolute totals. Each merge replaces the stored total with
//! the counter's current cache value, so repeating a run changes nothing. A
//! dirty marker is cleared only if no update re-stamped it after the value was
//! read; otherwise the key stays dirty and the newer value goes out next run.
//! Every write carries the generation the value was read at, and the ledger
//! drops writes older than what it holds, so overlapping runs (the periodic
//! loop and a manual trigger) cannot leave a stale total behind.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TallyError};
use crate::ledger::ScoreLedger;
use crate::schedule::run_periodic;
use crate::score::ScoreCache;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Counters written to the ledger.
    pub merged: usize,
    /// Counters whose ledger write failed; their markers stay set.
    pub failed: usize,
    /// Merged counters updated again mid-run; left dirty for the next run.
    pub superseded: usize,
}

pub struct ReconcileScheduler {
    cache: Arc<ScoreCache>,
    ledger: Arc<dyn ScoreLedger>,
}

impl ReconcileScheduler {
    pub fn new(cache: Arc<ScoreCache>, ledger: Arc<dyn ScoreLedger>) -> Self {
        Self { cache, ledger }
    }

    pub fn run_once(&self) -> Result<ReconcileReport> {
        let dirty = self.cache.dirty()?;
        let mut report = ReconcileReport::default();

        for counter in dirty {
            let merged = self
                .ledger
                .upsert_total(counter.key, counter.value, counter.generation);
            if let Err(e) = merged {
                warn!(key = %counter.key, error = %e, "score merge failed; keeping dirty");
                report.failed += 1;
                continue;
            }
            report.merged += 1;
            match self.cache.clear_dirty(counter.key, counter.generation) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(key = %counter.key, "counter changed during merge; stays dirty");
                    report.superseded += 1;
                }
                Err(e) => {
                    warn!(key = %counter.key, error = %e, "clearing dirty marker failed");
                }
            }
        }

        if report.merged > 0 || report.failed > 0 {
            info!(
                merged = report.merged,
                failed = report.failed,
                superseded = report.superseded,
                "reconciliation complete"
            );
        }
        Ok(report)
    }

    pub async fn trigger(self: &Arc<Self>) -> Result<ReconcileReport> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.run_once())
            .await
            .map_err(|e| TallyError::ScoreCache(format!("reconcile task failed: {e}")))?
    }

    pub fn spawn(self: &Arc<Self>, interval: Duration, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            run_periodic("reconcile", interval, shutdown, || {
                let this = this.clone();
                async move {
                    if let Err(e) = this.trigger().await {
                        error!(error = %e, "reconciliation run failed");
                    }
                }
            })
            .await
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
