use axum::extract::State;
use axum::Json;
use tally_core::{FlushReport, ReconcileReport};

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/flush: run one flush now, alongside any scheduled run.
pub async fn flush(State(app): State<AppState>) -> Result<Json<FlushReport>, AppError> {
    let report = app.pipeline.flush.trigger().await?;
    Ok(Json(report))
}

/// POST /api/reconcile: merge dirty score counters into the ledger now.
pub async fn reconcile(State(app): State<AppState>) -> Result<Json<ReconcileReport>, AppError> {
    let report = app.pipeline.reconcile.trigger().await?;
    Ok(Json(report))
}
