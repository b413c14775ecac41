use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tally_core::TallyError;

/// Carries an explicit 400 through the `anyhow::Error` chain for request
/// validation failures that have no `TallyError` counterpart.
#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(b) = self.0.downcast_ref::<BadRequestError>() {
            let body = serde_json::json!({ "error": b.0.clone() });
            return (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
        }

        let status = if let Some(e) = self.0.downcast_ref::<TallyError>() {
            match e {
                TallyError::EventNotFound(_) => StatusCode::NOT_FOUND,
                TallyError::InvalidPriority(_)
                | TallyError::InvalidStatus(_)
                | TallyError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
                TallyError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
                TallyError::Decode { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                TallyError::QueueStore(_)
                | TallyError::ScoreCache(_)
                | TallyError::Ledger(_)
                | TallyError::Io(_)
                | TallyError::Yaml(_)
                | TallyError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            }
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
