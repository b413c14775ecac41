pub mod error;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tally_core::Pipeline;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the axum Router with all operator routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(pipeline: Arc<Pipeline>) -> Router {
    let app_state = state::AppState::new(pipeline);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Jobs
        .route("/api/flush", post(routes::jobs::flush))
        .route("/api/reconcile", post(routes::jobs::reconcile))
        // Queue
        .route("/api/queue", get(routes::queue::stats))
        .route("/api/queue/critical", get(routes::queue::critical))
        .route("/api/queue/peek", get(routes::queue::peek))
        .route("/api/events/{log_id}", get(routes::queue::event))
        // Scores
        .route("/api/scores/{actor}", get(routes::scores::get_scores))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Start the operator server and the background schedulers.
pub async fn serve(pipeline: Arc<Pipeline>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(pipeline, listener).await
}

/// Start on a pre-bound listener so the caller can read the actual port
/// first (useful when `port = 0`).
///
/// Runs until Ctrl-C, then stops the schedulers and waits for in-flight
/// activity writes.
pub async fn serve_on(pipeline: Arc<Pipeline>, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let jobs = pipeline.start(shutdown_rx);
    let app = build_router(pipeline.clone());

    tracing::info!("tally server listening on http://localhost:{actual_port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for job in jobs {
        if let Err(e) = job.await {
            tracing::warn!(error = %e, "scheduler task ended abnormally");
        }
    }
    pipeline.dispatcher.wait_idle().await;
    Ok(())
}
