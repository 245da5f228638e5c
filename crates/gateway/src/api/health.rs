//! Liveness and readiness probes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

/// GET /health — lightweight liveness probe.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /health/ready — dependency checks; 503 until every backend answers.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let database = match state.stores.schedules.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {e}"),
    };
    let kv = match state.kv.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {e}"),
    };
    let counts = state.burst.current_counts(None).await;

    let ready = database == "ok" && kv == "ok";
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if ready { "ready" } else { "degraded" },
            "checks": {
                "database": database,
                "kv": kv,
                "in_flight_global": counts.global_running,
            },
        })),
    )
}
