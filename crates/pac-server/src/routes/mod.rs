//! HTTP route handlers.

pub mod health;
pub mod incoming;
pub mod pipeline_runs;
pub mod repositories;
pub mod secrets;
pub mod webhooks;

use axum::{
    Json, Router,
    http::StatusCode,
    middleware as axum_mw,
    routing::{get, post, put},
};
use pac_core::PacError;
use serde_json::{Value, json};

use crate::middleware::require_admin;
use crate::state::AppState;

/// Forge-facing routes: webhooks, incoming triggers and probes.
pub fn public_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health::info).post(webhooks::handle_webhook))
        .route("/live", get(health::live))
        .route("/ready", get(health::ready))
        .route("/incoming", post(incoming::handle_incoming))
        .with_state(state)
}

/// Management API, guarded by the admin token.
pub fn admin_router(state: AppState) -> Router {
    let admin_config = state.admin_auth_config.clone();

    Router::new()
        // Repositories
        .route(
            "/repositories",
            get(repositories::list_repositories).post(repositories::create_repository),
        )
        .route(
            "/repositories/{namespace}/{name}",
            get(repositories::get_repository)
                .put(repositories::update_repository)
                .delete(repositories::delete_repository),
        )
        // Secrets
        .route("/secrets", post(secrets::create_secret))
        .route("/secrets/{namespace}/{name}", axum::routing::delete(secrets::delete_secret))
        // PipelineRuns
        .route("/pipelineruns", get(pipeline_runs::list_pipeline_runs))
        .route("/pipelineruns/{namespace}/{name}", get(pipeline_runs::get_pipeline_run))
        .route(
            "/pipelineruns/{namespace}/{name}/state",
            put(pipeline_runs::update_pipeline_run_state),
        )
        .layer(axum_mw::from_fn_with_state(admin_config, require_admin))
        .with_state(state)
}

/// The whole HTTP surface.
pub fn app_router(state: AppState) -> Router {
    public_router(state.clone()).nest("/api", admin_router(state))
}

/// Maps store and validation errors of the management API.
pub(crate) fn api_error(e: PacError) -> (StatusCode, Json<Value>) {
    match e {
        PacError::InvalidRepository(message) => {
            (StatusCode::BAD_REQUEST, Json(json!({"error": message})))
        }
        PacError::RepositoryConflict(message) => {
            (StatusCode::CONFLICT, Json(json!({"error": message})))
        }
        e @ (PacError::RepositoryNotFound(_)
        | PacError::PipelineRunNotFound(_)
        | PacError::SecretNotFound { .. }) => {
            (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()})))
        }
        e => {
            tracing::error!("Management API error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Database error"})),
            )
        }
    }
}
