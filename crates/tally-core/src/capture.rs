//! Capture: wrap an operation, observe its outcome, emit an `ActivityEvent`.
//!
//! ```rust,ignore
//! let spec = ActionSpec::new("AnswerService::accept", "answer.accept")
//!     .score_delta(10)
//!     .priority(Priority::High);
//! let request = RequestContext::new().with_param("userId", 7);
//! let answer = capture.record(&spec, &request, || service.accept(id))?;
//! ```
//!
//! The wrapped operation's return value and error pass through untouched.
//! Everything the pipeline does around it is best-effort: identifier
//! extraction runs behind `catch_unwind`, and dispatch never blocks or fails
//! the caller.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::dispatch::Dispatcher;
use crate::event::{ActivityEvent, Origin};
use crate::types::{EventStatus, Priority};

// ---------------------------------------------------------------------------
// ActionSpec
// ---------------------------------------------------------------------------

/// Static metadata attached to one instrumented operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSpec {
    /// Identity of the wrapped operation, e.g. `"AnswerService::accept"`.
    pub operation: String,
    pub action_type: String,
    pub score_delta: i64,
    pub priority: Priority,
    pub description: Option<String>,
    /// Emit an event when the operation fails.
    pub log_on_failure: bool,
}

impl ActionSpec {
    pub fn new(operation: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            action_type: action_type.into(),
            score_delta: 0,
            priority: Priority::Normal,
            description: None,
            log_on_failure: true,
        }
    }

    pub fn score_delta(mut self, delta: i64) -> Self {
        self.score_delta = delta;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn log_on_failure(mut self, enabled: bool) -> Self {
        self.log_on_failure = enabled;
        self
    }
}

// ---------------------------------------------------------------------------
// RequestContext
// ---------------------------------------------------------------------------

/// Origin metadata and named inputs of the request driving an operation.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub origin: Origin,
    pub params: BTreeMap<String, Value>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// A positive integer parameter; accepts numbers and numeric strings.
    pub fn param_id(&self, name: &str) -> Option<u64> {
        self.params.get(name).and_then(value_id)
    }
}

fn value_id(v: &Value) -> Option<u64> {
    let id = match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    (id != 0).then_some(id)
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Identifiers an operation result can declare about itself.
///
/// Every method defaults to `None`; implement only the ones the type knows.
pub trait CaptureSubject {
    fn actor_id(&self) -> Option<u64> {
        None
    }

    fn region_id(&self) -> Option<u64> {
        None
    }

    fn target_ref(&self) -> Option<u64> {
        None
    }

    fn parent_ref(&self) -> Option<u64> {
        None
    }

    fn action_value(&self) -> Option<String> {
        None
    }

    /// Compact description of the result stored under `meta.result`.
    fn summary(&self) -> Option<Value> {
        None
    }
}

impl CaptureSubject for () {}

impl CaptureSubject for Value {
    fn actor_id(&self) -> Option<u64> {
        self.get("userId").and_then(value_id)
    }

    fn region_id(&self) -> Option<u64> {
        self.get("regionId").and_then(value_id)
    }

    fn target_ref(&self) -> Option<u64> {
        self.get("targetId").and_then(value_id)
    }

    fn parent_ref(&self) -> Option<u64> {
        self.get("parentId").and_then(value_id)
    }

    fn summary(&self) -> Option<Value> {
        Some(self.clone())
    }
}

impl<T: CaptureSubject> CaptureSubject for Option<T> {
    fn actor_id(&self) -> Option<u64> {
        self.as_ref().and_then(T::actor_id)
    }

    fn region_id(&self) -> Option<u64> {
        self.as_ref().and_then(T::region_id)
    }

    fn target_ref(&self) -> Option<u64> {
        self.as_ref().and_then(T::target_ref)
    }

    fn parent_ref(&self) -> Option<u64> {
        self.as_ref().and_then(T::parent_ref)
    }

    fn action_value(&self) -> Option<String> {
        self.as_ref().and_then(T::action_value)
    }

    fn summary(&self) -> Option<Value> {
        self.as_ref().and_then(T::summary)
    }
}

/// Ambient identity (session, auth context) consulted last when resolving
/// the actor.
pub trait IdentitySource: Send + Sync {
    fn current_actor(&self) -> Option<u64>;
}

/// No ambient identity.
pub struct Anonymous;

impl IdentitySource for Anonymous {
    fn current_actor(&self) -> Option<u64> {
        None
    }
}

impl<F> IdentitySource for F
where
    F: Fn() -> Option<u64> + Send + Sync,
{
    fn current_actor(&self) -> Option<u64> {
        self()
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Capture {
    dispatcher: Dispatcher,
    identity: Arc<dyn IdentitySource>,
}

#[derive(Default)]
struct Extracted {
    actor_id: Option<u64>,
    region_id: Option<u64>,
    target_ref: Option<u64>,
    parent_ref: Option<u64>,
    action_value: Option<String>,
    summary: Option<Value>,
}

impl Capture {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            identity: Arc::new(Anonymous),
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentitySource>) -> Self {
        self.identity = identity;
        self
    }

    /// Run `op` and record it. Returns exactly what `op` returned.
    pub fn record<T, E, F>(&self, spec: &ActionSpec, request: &RequestContext, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        T: CaptureSubject,
        E: fmt::Display,
    {
        let origin = request.origin.clone();
        let created_at = Utc::now();
        let started = Instant::now();
        let outcome = op();
        if let Some(event) =
            self.build_event(spec, request, origin, &outcome, created_at, started.elapsed())
        {
            self.dispatcher.dispatch(event);
        }
        outcome
    }

    /// Async form of [`Capture::record`].
    pub async fn record_async<T, E, Fut>(
        &self,
        spec: &ActionSpec,
        request: &RequestContext,
        op: Fut,
    ) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        T: CaptureSubject,
        E: fmt::Display,
    {
        let origin = request.origin.clone();
        let created_at = Utc::now();
        let started = Instant::now();
        let outcome = op.await;
        if let Some(event) =
            self.build_event(spec, request, origin, &outcome, created_at, started.elapsed())
        {
            self.dispatcher.dispatch(event);
        }
        outcome
    }

    /// Build the event for one outcome, or `None` when failures are not
    /// logged for this action.
    fn build_event<T, E>(
        &self,
        spec: &ActionSpec,
        request: &RequestContext,
        origin: Origin,
        outcome: &Result<T, E>,
        created_at: DateTime<Utc>,
        elapsed: Duration,
    ) -> Option<ActivityEvent>
    where
        T: CaptureSubject,
        E: fmt::Display,
    {
        if outcome.is_err() && !spec.log_on_failure {
            return None;
        }

        let mut event = ActivityEvent::new(spec.action_type.clone()).with_priority(spec.priority);
        event.created_at = created_at;
        event.updated_at = Utc::now();
        event.duration_ms = elapsed.as_millis() as u64;
        event.origin = origin;

        match outcome {
            Ok(_) => {
                event.status = EventStatus::Success;
                event.score_delta = spec.score_delta;
            }
            Err(e) => {
                event.status = EventStatus::Failure;
                event.error = Some(e.to_string());
            }
        }

        let extracted = catch_unwind(AssertUnwindSafe(|| {
            self.extract(request, outcome.as_ref().ok())
        }))
        .unwrap_or_else(|_| {
            warn!(
                operation = %spec.operation,
                log_id = %event.log_id,
                "identifier extraction panicked; recording defaults"
            );
            Extracted::default()
        });

        event.actor_id = extracted.actor_id;
        event.region_id = extracted.region_id;
        event.target_ref = extracted.target_ref;
        event.parent_ref = extracted.parent_ref;
        event.action_value = extracted.action_value;

        let mut meta = serde_json::Map::new();
        meta.insert("operation".into(), Value::String(spec.operation.clone()));
        if let Some(description) = &spec.description {
            meta.insert("description".into(), Value::String(description.clone()));
        }
        if !request.params.is_empty() {
            let args = request.params.clone().into_iter().collect();
            meta.insert("args".into(), Value::Object(args));
        }
        if let Some(summary) = extracted.summary {
            meta.insert("result".into(), summary);
        }
        event.meta = Value::Object(meta);

        Some(event)
    }

    /// Actor precedence: result → `userId` parameter → ambient identity.
    fn extract<T: CaptureSubject>(&self, request: &RequestContext, result: Option<&T>) -> Extracted {
        let actor_id = result
            .and_then(T::actor_id)
            .or_else(|| request.param_id("userId"))
            .or_else(|| self.identity.current_actor());
        Extracted {
            actor_id,
            region_id: result
                .and_then(T::region_id)
                .or_else(|| request.param_id("regionId")),
            target_ref: result
                .and_then(T::target_ref)
                .or_else(|| request.param_id("targetId")),
            parent_ref: result
                .and_then(T::parent_ref)
                .or_else(|| request.param_id("parentId")),
            action_value: result.and_then(T::action_value),
            summary: result.and_then(T::summary),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueStore;
    use crate::score::{ScoreCache, ScoreKey};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        queue: Arc<QueueStore>,
        scores: Arc<ScoreCache>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(
            QueueStore::open(&dir.path().join("queue.redb"), Duration::from_secs(60)).unwrap(),
        );
        let scores = Arc::new(ScoreCache::open(&dir.path().join("scores.redb")).unwrap());
        let dispatcher =
            Dispatcher::new(tokio::runtime::Handle::current(), queue.clone(), scores.clone(), 2);
        Fixture {
            _dir: dir,
            queue,
            scores,
            dispatcher,
        }
    }

    struct Answer {
        author: u64,
        region: u64,
        id: u64,
    }

    impl CaptureSubject for Answer {
        fn actor_id(&self) -> Option<u64> {
            Some(self.author)
        }

        fn region_id(&self) -> Option<u64> {
            Some(self.region)
        }

        fn target_ref(&self) -> Option<u64> {
            Some(self.id)
        }
    }

    struct Exploding;

    impl CaptureSubject for Exploding {
        fn actor_id(&self) -> Option<u64> {
            panic!("broken accessor")
        }
    }

    async fn only_event(f: &Fixture) -> ActivityEvent {
        f.dispatcher.wait_idle().await;
        let mut events = f.queue.drain(10).unwrap();
        assert_eq!(events.len(), 1);
        events.remove(0)
    }

    #[tokio::test]
    async fn success_records_result_identifiers_and_score() {
        let f = fixture();
        let capture = Capture::new(f.dispatcher.clone());
        let spec = ActionSpec::new("AnswerService::accept", "answer.accept")
            .score_delta(10)
            .priority(Priority::High)
            .description("accept an answer");
        let request = RequestContext::new()
            .with_origin(Origin {
                ip: Some("10.1.1.1".into()),
                ..Origin::default()
            })
            .with_param("userId", 99)
            .with_param("answerId", 5);

        let result: Result<Answer, String> = capture.record(&spec, &request, || {
            Ok(Answer {
                author: 7,
                region: 3,
                id: 5,
            })
        });
        assert_eq!(result.unwrap().id, 5);

        let event = only_event(&f).await;
        assert_eq!(event.actor_id, Some(7), "result beats request parameter");
        assert_eq!(event.region_id, Some(3));
        assert_eq!(event.target_ref, Some(5));
        assert_eq!(event.score_delta, 10);
        assert_eq!(event.priority, Priority::High);
        assert_eq!(event.status, EventStatus::Success);
        assert_eq!(event.origin.ip.as_deref(), Some("10.1.1.1"));
        assert_eq!(event.meta["operation"], "AnswerService::accept");
        assert_eq!(event.meta["description"], "accept an answer");
        assert_eq!(event.meta["args"]["answerId"], 5);
        assert_eq!(f.scores.read(ScoreKey::new(7, 3)).unwrap(), 10);
    }

    #[tokio::test]
    async fn actor_falls_back_to_param_then_identity() {
        let f = fixture();
        let capture =
            Capture::new(f.dispatcher.clone()).with_identity(Arc::new(|| Some(42u64)));
        let spec = ActionSpec::new("op", "x");

        let with_param = RequestContext::new().with_param("userId", "8");
        capture
            .record(&spec, &with_param, || Ok::<_, String>(()))
            .unwrap();
        assert_eq!(only_event(&f).await.actor_id, Some(8));

        capture
            .record(&spec, &RequestContext::new(), || Ok::<_, String>(()))
            .unwrap();
        assert_eq!(only_event(&f).await.actor_id, Some(42));
    }

    #[tokio::test]
    async fn no_identity_anywhere_records_anonymous() {
        let f = fixture();
        let capture = Capture::new(f.dispatcher.clone());
        let spec = ActionSpec::new("op", "page.view").score_delta(1);
        let out = capture.record(&spec, &RequestContext::new(), || {
            Ok::<_, String>(serde_json::json!(17))
        });
        assert_eq!(out, Ok(serde_json::json!(17)));

        let event = only_event(&f).await;
        assert!(event.actor_id.is_none());
        assert_eq!(f.scores.dirty_len().unwrap(), 0);
    }

    #[tokio::test]
    async fn failure_is_recorded_and_error_passes_through() {
        let f = fixture();
        let capture = Capture::new(f.dispatcher.clone());
        let spec = ActionSpec::new("op", "post.delete").score_delta(-5);
        let request = RequestContext::new()
            .with_param("userId", 7)
            .with_param("regionId", 3);

        let out: Result<(), String> = capture.record(&spec, &request, || Err("forbidden".into()));
        assert_eq!(out, Err("forbidden".to_string()));

        let event = only_event(&f).await;
        assert_eq!(event.status, EventStatus::Failure);
        assert_eq!(event.error.as_deref(), Some("forbidden"));
        assert_eq!(event.score_delta, 0, "failed actions do not score");
        assert_eq!(f.scores.read(ScoreKey::new(7, 3)).unwrap(), 0);
    }

    #[tokio::test]
    async fn failure_without_logging_emits_nothing() {
        let f = fixture();
        let capture = Capture::new(f.dispatcher.clone());
        let spec = ActionSpec::new("op", "x").log_on_failure(false);
        let out: Result<(), String> =
            capture.record(&spec, &RequestContext::new(), || Err("nope".into()));
        assert_eq!(out, Err("nope".to_string()));
        f.dispatcher.wait_idle().await;
        assert_eq!(f.queue.size().unwrap(), 0);
    }

    #[tokio::test]
    async fn panicking_capability_does_not_change_outcome() {
        let f = fixture();
        let capture = Capture::new(f.dispatcher.clone());
        let spec = ActionSpec::new("op", "x");
        let out = capture.record(&spec, &RequestContext::new(), || {
            Ok::<_, String>(Exploding)
        });
        assert!(out.is_ok());

        let event = only_event(&f).await;
        assert!(event.actor_id.is_none());
        assert_eq!(event.action_type, "x");
    }

    #[tokio::test]
    async fn record_async_times_the_future() {
        let f = fixture();
        let capture = Capture::new(f.dispatcher.clone());
        let spec = ActionSpec::new("op", "slow");
        let out = capture
            .record_async(&spec, &RequestContext::new(), async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, String>(serde_json::json!({ "userId": 4, "regionId": 2 }))
            })
            .await
            .unwrap();
        assert_eq!(out["userId"], 4);

        let event = only_event(&f).await;
        assert!(event.duration_ms >= 20);
        assert_eq!(event.actor_id, Some(4));
        assert_eq!(event.region_id, Some(2));
        assert_eq!(event.meta["result"]["userId"], 4);
    }

    #[test]
    fn zero_and_garbage_ids_are_absent() {
        let request = RequestContext::new()
            .with_param("userId", 0)
            .with_param("regionId", "abc");
        assert_eq!(request.param_id("userId"), None);
        assert_eq!(request.param_id("regionId"), None);
        assert_eq!(request.param_id("missing"), None);
    }

    #[test]
    fn record_from_plain_thread_lands_event() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let f = {
            let _guard = rt.enter();
            fixture()
        };
        let capture = Capture::new(f.dispatcher.clone());
        let spec = ActionSpec::new("op", "answer.vote").score_delta(1);
        let request = RequestContext::new()
            .with_param("userId", 6)
            .with_param("regionId", 1);

        let out = std::thread::spawn(move || {
            capture.record(&spec, &request, || Ok::<_, String>(()))
        })
        .join()
        .unwrap();
        assert_eq!(out, Ok(()));

        rt.block_on(f.dispatcher.wait_idle());
        assert_eq!(f.queue.size().unwrap(), 1);
        assert_eq!(f.scores.read(ScoreKey::new(6, 1)).unwrap(), 1);
    }
}
