//! Probes and controller info.

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use serde_json::json;

use crate::state::AppState;

#[derive(Serialize)]
struct InfoResponse {
    name: &'static str,
    version: &'static str,
    status: &'static str,
}

/// GET /
pub async fn info() -> impl IntoResponse {
    Json(InfoResponse {
        name: "pac-controller",
        version: pac_core::VERSION,
        status: "ok",
    })
}

/// GET /live
pub async fn live() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Ready once the store answers.
///
/// GET /ready
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        Err(e) => {
            tracing::error!("Readiness check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unavailable"})),
            )
        }
    }
}
