//! Batch flush: move queued events into the durable event ledger.
//!
//! One run recovers staged ids orphaned by a crashed run, sweeps expired
//! payloads, drains up to `batch_size` ids, appends each event to the ledger,
//! acks what persisted and requeues what did not. Overlapping runs are safe:
//! `drain` is destructive, so no id is handed to two runs.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{Result, TallyError};
use crate::ledger::EventLedger;
use crate::queue::QueueStore;
use crate::schedule::run_periodic;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Stale staged ids put back before draining.
    pub recovered: usize,
    /// Payloads deleted because their TTL elapsed.
    pub expired: usize,
    pub drained: usize,
    pub persisted: usize,
    pub requeued: usize,
}

pub struct FlushScheduler {
    queue: Arc<QueueStore>,
    ledger: Arc<dyn EventLedger>,
    batch_size: usize,
    staging_timeout: Duration,
}

impl FlushScheduler {
    pub fn new(
        queue: Arc<QueueStore>,
        ledger: Arc<dyn EventLedger>,
        batch_size: usize,
        staging_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            ledger,
            batch_size,
            staging_timeout,
        }
    }

    /// Run one flush synchronously.
    pub fn run_once(&self) -> Result<FlushReport> {
        let recovered = self.queue.recover_staged(self.staging_timeout)?;
        let expired = self.queue.sweep_expired()?;
        let events = self.queue.drain(self.batch_size)?;

        let mut persisted = Vec::with_capacity(events.len());
        let mut failed = Vec::new();
        for event in &events {
            match self.ledger.append(event) {
                Ok(()) => persisted.push(event.log_id.clone()),
                Err(e) => {
                    warn!(log_id = %event.log_id, error = %e, "ledger append failed; requeueing");
                    failed.push(event.log_id.clone());
                }
            }
        }

        // Ledger rows are idempotent on log_id, so ids left staged by a
        // failed ack are safe to flush again after recovery.
        if let Err(e) = self.queue.ack(&persisted) {
            warn!(count = persisted.len(), error = %e, "ack failed; ids stay staged until recovery");
        }
        let requeued = match self.queue.requeue(&failed) {
            Ok(n) => n,
            Err(e) => {
                warn!(count = failed.len(), error = %e, "requeue failed; ids stay staged until recovery");
                0
            }
        };

        let report = FlushReport {
            recovered,
            expired,
            drained: events.len(),
            persisted: persisted.len(),
            requeued,
        };
        if report.drained > 0 || report.recovered > 0 || report.expired > 0 {
            info!(
                drained = report.drained,
                persisted = report.persisted,
                requeued = report.requeued,
                recovered = report.recovered,
                expired = report.expired,
                "flush complete"
            );
        }
        Ok(report)
    }

    /// Run one flush on the blocking pool.
    pub async fn trigger(self: &Arc<Self>) -> Result<FlushReport> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.run_once())
            .await
            .map_err(|e| TallyError::QueueStore(format!("flush task failed: {e}")))?
    }

    /// Flush every `interval` until `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, interval: Duration, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            run_periodic("flush", interval, shutdown, || {
                let this = this.clone();
                async move {
                    if let Err(e) = this.trigger().await {
                        error!(error = %e, "flush run failed");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ActivityEvent;
    use crate::ledger::SqliteLedger;
    use crate::types::Priority;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Fails every append while `down` is set, then delegates.
    struct FlakyLedger {
        inner: SqliteLedger,
        down: AtomicBool,
    }

    impl EventLedger for FlakyLedger {
        fn append(&self, event: &ActivityEvent) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(TallyError::Ledger("connection refused".into()));
            }
            self.inner.append(event)
        }
    }

    fn open_queue() -> (TempDir, Arc<QueueStore>) {
        let dir = TempDir::new().unwrap();
        let queue = QueueStore::open(&dir.path().join("queue.redb"), Duration::from_secs(60)).unwrap();
        (dir, Arc::new(queue))
    }

    #[test]
    fn flush_persists_and_clears_queue() {
        let (_dir, queue) = open_queue();
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let event = ActivityEvent::new("answer.accept")
            .with_actor(7)
            .with_region(3)
            .with_score_delta(10)
            .with_priority(Priority::High);
        queue.put(&event).unwrap();

        let flush = FlushScheduler::new(queue.clone(), ledger.clone(), 100, Duration::from_secs(300));
        let report = flush.run_once().unwrap();

        assert_eq!(report.drained, 1);
        assert_eq!(report.persisted, 1);
        assert_eq!(report.requeued, 0);
        assert_eq!(ledger.get(&event.log_id).unwrap(), Some(event.clone()));
        assert_eq!(queue.size().unwrap(), 0);
        assert_eq!(queue.staging_len().unwrap(), 0);
        assert_eq!(queue.count(Priority::High).unwrap(), 0);
        assert!(queue.lookup(&event.log_id).unwrap().is_none());
    }

    #[test]
    fn batch_size_bounds_one_run() {
        let (_dir, queue) = open_queue();
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        for _ in 0..5 {
            queue.put(&ActivityEvent::new("view")).unwrap();
        }
        let flush = FlushScheduler::new(queue.clone(), ledger.clone(), 2, Duration::from_secs(300));
        assert_eq!(flush.run_once().unwrap().persisted, 2);
        assert_eq!(queue.size().unwrap(), 3);
        assert_eq!(ledger.count().unwrap(), 2);
    }

    #[test]
    fn failing_ledger_requeues_then_recovers() {
        let (_dir, queue) = open_queue();
        let ledger = Arc::new(FlakyLedger {
            inner: SqliteLedger::open_in_memory().unwrap(),
            down: AtomicBool::new(true),
        });
        let first = ActivityEvent::new("a");
        let second = ActivityEvent::new("b");
        queue.put(&first).unwrap();
        queue.put(&second).unwrap();

        let flush = FlushScheduler::new(queue.clone(), ledger.clone(), 10, Duration::from_secs(300));
        let report = flush.run_once().unwrap();
        assert_eq!(report.drained, 2);
        assert_eq!(report.persisted, 0);
        assert_eq!(report.requeued, 2);
        assert_eq!(
            queue.fifo_ids().unwrap(),
            vec![first.log_id.clone(), second.log_id.clone()]
        );

        ledger.down.store(false, Ordering::SeqCst);
        let report = flush.run_once().unwrap();
        assert_eq!(report.persisted, 2);
        assert_eq!(ledger.inner.count().unwrap(), 2);
        assert_eq!(queue.size().unwrap(), 0);
    }

    #[test]
    fn crashed_run_is_recovered_without_duplicates() {
        let (_dir, queue) = open_queue();
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let event = ActivityEvent::new("a");
        queue.put(&event).unwrap();

        // A run that committed to the ledger but died before ack.
        let staged = queue.drain(10).unwrap();
        ledger.append(&staged[0]).unwrap();

        let flush = FlushScheduler::new(queue.clone(), ledger.clone(), 10, Duration::ZERO);
        let report = flush.run_once().unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.persisted, 1);
        assert_eq!(ledger.count().unwrap(), 1);
        assert_eq!(queue.staging_len().unwrap(), 0);
    }

    #[test]
    fn empty_queue_is_a_no_op() {
        let (_dir, queue) = open_queue();
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let flush = FlushScheduler::new(queue, ledger, 10, Duration::from_secs(300));
        assert_eq!(flush.run_once().unwrap(), FlushReport::default());
    }

    #[tokio::test]
    async fn trigger_runs_on_blocking_pool() {
        let (_dir, queue) = open_queue();
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        queue.put(&ActivityEvent::new("a")).unwrap();
        let flush = Arc::new(FlushScheduler::new(queue, ledger.clone(), 10, Duration::from_secs(300)));
        assert_eq!(flush.trigger().await.unwrap().persisted, 1);
        assert_eq!(ledger.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn spawned_loop_flushes_and_stops() {
        let (_dir, queue) = open_queue();
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        queue.put(&ActivityEvent::new("a")).unwrap();
        let flush = Arc::new(FlushScheduler::new(queue.clone(), ledger.clone(), 10, Duration::from_secs(300)));

        let (tx, rx) = watch::channel(false);
        let handle = flush.spawn(Duration::from_millis(20), rx);
        for _ in 0..100 {
            if ledger.count().unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ledger.count().unwrap(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
