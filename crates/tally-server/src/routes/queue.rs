use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use tally_core::queue::QueueStats;
use tally_core::{ActivityEvent, Priority, TallyError};

use super::blocking;
use crate::error::AppError;
use crate::state::AppState;

const MAX_PEEK: usize = 1000;

/// GET /api/queue: depth, per-priority counts and staging size.
pub async fn stats(State(app): State<AppState>) -> Result<Json<QueueStats>, AppError> {
    let queue = app.pipeline.queue.clone();
    let stats = blocking(move || queue.stats()).await?;
    Ok(Json(stats))
}

/// GET /api/queue/critical: size of the critical backlog.
pub async fn critical(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let queue = app.pipeline.queue.clone();
    let count = blocking(move || queue.count(Priority::Critical)).await?;
    Ok(Json(serde_json::json!({ "critical": count })))
}

#[derive(Debug, Deserialize)]
pub struct PeekParams {
    #[serde(default = "default_peek")]
    n: usize,
}

fn default_peek() -> usize {
    20
}

/// GET /api/queue/peek?n=: queued events, most urgent first.
pub async fn peek(
    State(app): State<AppState>,
    Query(params): Query<PeekParams>,
) -> Result<Json<Vec<ActivityEvent>>, AppError> {
    if params.n == 0 || params.n > MAX_PEEK {
        return Err(AppError::bad_request(format!(
            "n must be between 1 and {MAX_PEEK}"
        )));
    }
    let queue = app.pipeline.queue.clone();
    let events = blocking(move || queue.peek(params.n)).await?;
    Ok(Json(events))
}

/// GET /api/events/{log_id}: where one event currently lives.
pub async fn event(
    State(app): State<AppState>,
    Path(log_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let queue = app.pipeline.queue.clone();
    let ledger = app.pipeline.ledger.clone();
    let found = blocking(move || {
        if let Some(event) = queue.lookup(&log_id)? {
            let state = if queue.is_staged(&log_id)? { "staged" } else { "queued" };
            return Ok((state, event));
        }
        match ledger.get(&log_id)? {
            Some(event) => Ok(("flushed", event)),
            None => Err(TallyError::EventNotFound(log_id)),
        }
    })
    .await?;
    Ok(Json(serde_json::json!({ "state": found.0, "event": found.1 })))
}
