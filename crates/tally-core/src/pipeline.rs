//! Owns every store handle and wires capture, dispatch and the schedulers.

use std::path::Path;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::capture::Capture;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::flush::FlushScheduler;
use crate::ledger::SqliteLedger;
use crate::paths;
use crate::queue::QueueStore;
use crate::reconcile::ReconcileScheduler;
use crate::score::ScoreCache;

pub struct Pipeline {
    pub config: Config,
    pub queue: Arc<QueueStore>,
    pub scores: Arc<ScoreCache>,
    pub ledger: Arc<SqliteLedger>,
    pub dispatcher: Dispatcher,
    pub flush: Arc<FlushScheduler>,
    pub reconcile: Arc<ReconcileScheduler>,
}

impl Pipeline {
    /// Open every store. Relative store paths resolve against `base_dir`,
    /// normally the directory holding the config file. Captured events are
    /// written on `runtime`, which must outlive the pipeline for writes to land.
    pub fn open(config: &Config, base_dir: &Path, runtime: Handle) -> Result<Self> {
        config.ensure_valid()?;

        let queue = Arc::new(QueueStore::open(
            &paths::resolve(base_dir, &config.queue.path),
            config.default_ttl(),
        )?);
        let scores = Arc::new(ScoreCache::open(&paths::resolve(
            base_dir,
            &config.score.path,
        ))?);
        let ledger = Arc::new(SqliteLedger::open(&paths::resolve(
            base_dir,
            &config.ledger.path,
        ))?);

        let dispatcher = Dispatcher::new(
            runtime,
            queue.clone(),
            scores.clone(),
            config.dispatch.max_in_flight,
        );
        let flush = Arc::new(FlushScheduler::new(
            queue.clone(),
            ledger.clone(),
            config.flush.batch_size,
            config.staging_timeout(),
        ));
        let reconcile = Arc::new(ReconcileScheduler::new(scores.clone(), ledger.clone()));

        info!(base_dir = %base_dir.display(), "pipeline opened");
        Ok(Self {
            config: config.clone(),
            queue,
            scores,
            ledger,
            dispatcher,
            flush,
            reconcile,
        })
    }

    /// Open the pipeline configured at `config_path`.
    pub fn open_config(config_path: &Path, runtime: Handle) -> Result<Self> {
        let config = Config::load_from(config_path)?;
        let base_dir = config_path.parent().unwrap_or(Path::new("."));
        Self::open(&config, base_dir, runtime)
    }

    pub fn capture(&self) -> Capture {
        Capture::new(self.dispatcher.clone())
    }

    /// Spawn the flush and reconciliation loops.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.flush.spawn(self.config.flush_interval(), shutdown.clone()),
            self.reconcile.spawn(self.config.reconcile_interval(), shutdown),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ActionSpec, RequestContext};
    use crate::score::ScoreKey;
    use crate::types::Priority;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, Pipeline) {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::open(&Config::default(), dir.path(), Handle::current()).unwrap();
        (dir, pipeline)
    }

    #[tokio::test]
    async fn stores_land_under_base_dir() {
        let (dir, _pipeline) = open_tmp();
        assert!(dir.path().join("queue.redb").exists());
        assert!(dir.path().join("scores.redb").exists());
        assert!(dir.path().join("ledger.sqlite").exists());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.flush.batch_size = 0;
        assert!(Pipeline::open(&cfg, dir.path(), Handle::current()).is_err());
    }

    #[tokio::test]
    async fn scored_high_priority_action_end_to_end() {
        let (_dir, pipeline) = open_tmp();
        let capture = pipeline.capture();
        let spec = ActionSpec::new("AnswerService::accept", "answer.accept")
            .score_delta(10)
            .priority(Priority::High);
        let request = RequestContext::new()
            .with_param("userId", 7)
            .with_param("regionId", 3);
        let key = ScoreKey::new(7, 3);
        let before = pipeline.ledger.total(key).unwrap().unwrap_or(0);

        capture
            .record(&spec, &request, || Ok::<_, String>(()))
            .unwrap();
        pipeline.dispatcher.wait_idle().await;

        let cached = pipeline.scores.read_all(7).unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].region_id, 3);
        assert_eq!(cached[0].value, 10);

        pipeline.reconcile.trigger().await.unwrap();
        assert_eq!(pipeline.ledger.total(key).unwrap(), Some(before + 10));
        assert!(!pipeline.scores.is_dirty(key).unwrap());

        let log_id = pipeline.queue.fifo_ids().unwrap().remove(0);
        let queued = pipeline.queue.lookup(&log_id).unwrap().unwrap();
        let report = pipeline.flush.trigger().await.unwrap();
        assert_eq!(report.persisted, 1);
        assert_eq!(pipeline.ledger.get(&log_id).unwrap(), Some(queued));
        assert_eq!(pipeline.queue.size().unwrap(), 0);
        assert_eq!(pipeline.queue.count(Priority::High).unwrap(), 0);
        assert!(pipeline.queue.lookup(&log_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn anonymous_action_reaches_ledger() {
        let (_dir, pipeline) = open_tmp();
        let out = pipeline
            .capture()
            .record(&ActionSpec::new("op", "page.view"), &RequestContext::new(), || {
                Ok::<_, String>(None::<serde_json::Value>)
            });
        assert_eq!(out, Ok(None));
        pipeline.dispatcher.wait_idle().await;

        pipeline.flush.trigger().await.unwrap();
        assert_eq!(pipeline.ledger.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn start_then_shutdown() {
        let (_dir, pipeline) = open_tmp();
        let (tx, rx) = watch::channel(false);
        let handles = pipeline.start(rx);
        tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }
    }
}
