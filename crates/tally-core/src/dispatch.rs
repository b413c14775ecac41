//! Fire-and-forget hand-off of captured events to the stores.
//!
//! `dispatch` returns before any I/O happens. The queue write and the score
//! update run on a task spawned onto the runtime handle the dispatcher was
//! built with, throttled by a semaphore so at most `max_in_flight` blocking
//! store calls run at once. Callers need not be inside that runtime. Failures
//! are logged and the event is dropped: no retry and no signal back to the
//! caller.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

use crate::error::Result;
use crate::event::ActivityEvent;
use crate::queue::QueueStore;
use crate::score::ScoreCache;

/// Durable destination for dispatched events.
pub trait EventSink: Send + Sync {
    fn put(&self, event: &ActivityEvent) -> Result<()>;
}

impl EventSink for QueueStore {
    fn put(&self, event: &ActivityEvent) -> Result<()> {
        QueueStore::put(self, event)
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    runtime: Handle,
    sink: Arc<dyn EventSink>,
    scores: Arc<ScoreCache>,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        runtime: Handle,
        sink: Arc<dyn EventSink>,
        scores: Arc<ScoreCache>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            runtime,
            sink,
            scores,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Queue `event` for writing and return immediately.
    pub fn dispatch(&self, event: ActivityEvent) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let this = self.clone();
        self.runtime.spawn(async move {
            match this.permits.clone().acquire_owned().await {
                Ok(_permit) => {
                    let sink = this.sink.clone();
                    let scores = this.scores.clone();
                    let log_id = event.log_id.clone();
                    let joined = this
                        .runtime
                        .spawn_blocking(move || write_event(sink.as_ref(), &scores, &event))
                        .await;
                    if let Err(e) = joined {
                        warn!(log_id = %log_id, error = %e, "activity write task failed");
                    }
                }
                Err(_) => warn!(log_id = %event.log_id, "dispatcher closed; dropping activity event"),
            }
            if this.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                this.idle.notify_waiters();
            }
        });
    }

    /// Number of dispatched events whose writes have not finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Resolve once every dispatched write has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Queue write and score update are independent; one failing does not skip
/// the other.
fn write_event(sink: &dyn EventSink, scores: &ScoreCache, event: &ActivityEvent) {
    match sink.put(event) {
        Ok(()) => debug!(log_id = %event.log_id, action = %event.action_type, "activity queued"),
        Err(e) => warn!(log_id = %event.log_id, error = %e, "dropping activity event: queue write failed"),
    }
    if let Some(key) = event.score_key() {
        if let Err(e) = scores.update(key, event.score_delta) {
            warn!(log_id = %event.log_id, key = %key, error = %e, "score update failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TallyError;
    use crate::score::ScoreKey;
    use crate::types::Priority;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup(max_in_flight: usize) -> (TempDir, Arc<QueueStore>, Arc<ScoreCache>, Dispatcher) {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(
            QueueStore::open(&dir.path().join("queue.redb"), Duration::from_secs(60)).unwrap(),
        );
        let scores = Arc::new(ScoreCache::open(&dir.path().join("scores.redb")).unwrap());
        let dispatcher =
            Dispatcher::new(Handle::current(), queue.clone(), scores.clone(), max_in_flight);
        (dir, queue, scores, dispatcher)
    }

    #[tokio::test]
    async fn dispatch_writes_queue_and_score() {
        let (_dir, queue, scores, dispatcher) = setup(4);
        let event = ActivityEvent::new("answer.accept")
            .with_actor(7)
            .with_region(3)
            .with_score_delta(10)
            .with_priority(Priority::High);
        let log_id = event.log_id.clone();

        dispatcher.dispatch(event);
        dispatcher.wait_idle().await;

        assert_eq!(queue.fifo_ids().unwrap(), vec![log_id]);
        assert_eq!(queue.count(Priority::High).unwrap(), 1);
        assert_eq!(scores.read(ScoreKey::new(7, 3)).unwrap(), 10);
    }

    #[tokio::test]
    async fn unscored_event_leaves_cache_untouched() {
        let (_dir, queue, scores, dispatcher) = setup(1);
        dispatcher.dispatch(ActivityEvent::new("view").with_score_delta(3));
        dispatcher.wait_idle().await;
        assert_eq!(queue.size().unwrap(), 1);
        assert_eq!(scores.dirty_len().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_concurrent_dispatches_all_land() {
        let (_dir, queue, scores, dispatcher) = setup(3);
        for _ in 0..50 {
            dispatcher.dispatch(
                ActivityEvent::new("vote")
                    .with_actor(1)
                    .with_region(1)
                    .with_score_delta(2),
            );
        }
        dispatcher.wait_idle().await;
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(queue.size().unwrap(), 50);
        assert_eq!(scores.read(ScoreKey::new(1, 1)).unwrap(), 100);
    }

    #[test]
    fn dispatch_from_plain_thread_lands_on_owned_runtime() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (_dir, queue, scores, dispatcher) = {
            let _guard = rt.enter();
            setup(1)
        };

        let caller = dispatcher.clone();
        std::thread::spawn(move || {
            caller.dispatch(
                ActivityEvent::new("vote")
                    .with_actor(2)
                    .with_region(1)
                    .with_score_delta(1),
            );
        })
        .join()
        .unwrap();

        rt.block_on(dispatcher.wait_idle());
        assert_eq!(queue.size().unwrap(), 1);
        assert_eq!(scores.read(ScoreKey::new(2, 1)).unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_queue_write_still_updates_score() {
        struct BrokenSink;

        impl EventSink for BrokenSink {
            fn put(&self, _event: &ActivityEvent) -> Result<()> {
                Err(TallyError::QueueStore("disk full".into()))
            }
        }

        let dir = TempDir::new().unwrap();
        let scores = Arc::new(ScoreCache::open(&dir.path().join("scores.redb")).unwrap());
        let dispatcher =
            Dispatcher::new(Handle::current(), Arc::new(BrokenSink), scores.clone(), 2);

        dispatcher.dispatch(
            ActivityEvent::new("vote")
                .with_actor(9)
                .with_region(4)
                .with_score_delta(3),
        );
        tokio::time::timeout(Duration::from_secs(5), dispatcher.wait_idle())
            .await
            .unwrap();

        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(scores.read(ScoreKey::new(9, 4)).unwrap(), 3);
        assert!(scores.is_dirty(ScoreKey::new(9, 4)).unwrap());
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_nothing_dispatched() {
        let (_dir, _queue, _scores, dispatcher) = setup(1);
        tokio::time::timeout(Duration::from_secs(1), dispatcher.wait_idle())
            .await
            .unwrap();
    }
}
