use axum::extract::{Path, State};
use axum::Json;

use super::blocking;
use crate::error::AppError;
use crate::state::AppState;

/// GET /api/scores/{actor}: cached counters next to the last merged totals.
pub async fn get_scores(
    State(app): State<AppState>,
    Path(actor_id): Path<u64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let scores = app.pipeline.scores.clone();
    let ledger = app.pipeline.ledger.clone();
    let (cached, merged, pending) = blocking(move || {
        let cached = scores.read_all(actor_id)?;
        let merged = ledger.totals(actor_id)?;
        let mut pending = 0;
        for c in &cached {
            if scores.is_dirty(tally_core::ScoreKey::new(c.actor_id, c.region_id))? {
                pending += 1;
            }
        }
        Ok((cached, merged, pending))
    })
    .await?;

    Ok(Json(serde_json::json!({
        "actor_id": actor_id,
        "counters": cached,
        "ledger": merged,
        "pending_merge": pending,
    })))
}
