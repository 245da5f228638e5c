//! HTTP surface — a thin adapter over the domain services.
//!
//! Errors use the envelope `{"error": {"code", "message"}}` with stable
//! codes; validation failures map to 400, missing resources to 404, and
//! everything unclassified to 500.

pub mod artifacts;
pub mod auth;
pub mod health;
pub mod schedules;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, patch, post, put};
use axum::Router;

use courier_domain::ServiceError;

use crate::state::AppState;

/// Wire error: status + stable code + message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", "resource not found")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({
                "error": { "code": self.code, "message": self.message }
            })),
        )
            .into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::InvalidCron(_)
            | ServiceError::InvalidTimezone(_)
            | ServiceError::QuotaExceeded { .. } => StatusCode::BAD_REQUEST,
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::Storage(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let code = err.code();
        let message = match &err {
            // Never leak backend details to clients.
            ServiceError::Storage(_) | ServiceError::Internal(_) => {
                tracing::error!(error = %err, "internal error");
                "An unexpected error occurred. Please try again later.".to_string()
            }
            other => other.to_string(),
        };
        Self::new(status, code, message)
    }
}

/// Build the full API router.
pub fn router() -> Router<AppState> {
    Router::new()
        // Health probes
        .route("/health", get(health::health))
        .route("/health/ready", get(health::ready))
        // Schedules
        .route("/v1/schedules", post(schedules::create_schedule))
        .route("/v1/schedules", get(schedules::list_schedules))
        .route("/v1/schedules/cron/preview", post(schedules::preview_cron))
        .route("/v1/schedules/:id", get(schedules::get_schedule))
        .route("/v1/schedules/:id", put(schedules::update_schedule))
        .route("/v1/schedules/:id", axum::routing::delete(schedules::delete_schedule))
        .route("/v1/schedules/:id/pause", patch(schedules::pause_schedule))
        .route("/v1/schedules/:id/resume", patch(schedules::resume_schedule))
        // Signed artifact downloads (bearer capability, no tenant header)
        .route("/artifacts/*path", get(artifacts::download))
}
