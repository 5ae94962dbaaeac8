//! PipelineRun endpoints.
//!
//! The state endpoint is how the executor reports progress back: every
//! transition to a terminal state is picked up by the reconciler.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use pac_core::PacError;
use pac_core::db::{PipelineRunRepo, RepositoryRepo};
use pac_core::models::PipelineRunState;
use serde::Deserialize;
use serde_json::json;

use super::api_error;
use crate::state::AppState;
use crate::worker::reconciler::report_dequeued;
use crate::worker::{concurrency, transition};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

#[derive(Debug, Default, Deserialize)]
pub struct ListPipelineRunsQuery {
    pub namespace: Option<String>,
    pub repository: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStateRequest {
    pub state: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// List PipelineRuns, newest first.
///
/// GET /api/pipelineruns
pub async fn list_pipeline_runs(
    State(state): State<AppState>,
    Query(query): Query<ListPipelineRunsQuery>,
) -> impl IntoResponse {
    let repository = match (&query.namespace, &query.repository) {
        (Some(namespace), Some(repository)) => Some((namespace.as_str(), repository.as_str())),
        (None, Some(_)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "repository filter requires a namespace"})),
            );
        }
        _ => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    match PipelineRunRepo::list(&state.db, repository, limit).await {
        Ok(runs) => {
            let runs: Vec<_> = match (&query.namespace, repository) {
                (Some(namespace), None) => {
                    runs.into_iter().filter(|r| &r.namespace == namespace).collect()
                }
                _ => runs,
            };
            (StatusCode::OK, Json(json!(runs)))
        }
        Err(e) => api_error(e),
    }
}

/// GET /api/pipelineruns/{namespace}/{name}
pub async fn get_pipeline_run(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match PipelineRunRepo::get(&state.db, &namespace, &name).await {
        Ok(Some(run)) => (StatusCode::OK, Json(json!(run))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "PipelineRun not found"})),
        ),
        Err(e) => api_error(e),
    }
}

/// Move a PipelineRun to a new state.
///
/// PUT /api/pipelineruns/{namespace}/{name}/state
pub async fn update_pipeline_run_state(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(req): Json<UpdateStateRequest>,
) -> impl IntoResponse {
    let new_state: PipelineRunState = match req.state.parse() {
        Ok(s) => s,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("Unknown state {}", req.state)})),
            );
        }
    };

    let repository_key = match PipelineRunRepo::get(&state.db, &namespace, &name).await {
        Ok(Some(run)) => run.repository_key(),
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "PipelineRun not found"})),
            );
        }
        Err(e) => return api_error(e),
    };
    let lock = state.repository_lock(&repository_key);
    let _guard = lock.lock().await;

    if new_state == PipelineRunState::Running {
        match release_held(&state, &namespace, &name).await {
            Ok(Some(response)) => return response,
            Ok(None) => {}
            Err(e) => return api_error(e),
        }
    }

    match transition(&state, &namespace, &name, new_state, req.message.as_deref()).await {
        Ok(run) => {
            tracing::info!("PipelineRun {}/{} is now {}", namespace, name, run.state);
            (StatusCode::OK, Json(json!(run)))
        }
        Err(PacError::Configuration(message)) => {
            (StatusCode::CONFLICT, Json(json!({"error": message})))
        }
        Err(e) => api_error(e),
    }
}

/// Starts a held run only through the queue, so the concurrency limit and
/// queue order hold. Returns `None` when the run is not held.
async fn release_held(
    state: &AppState,
    namespace: &str,
    name: &str,
) -> pac_core::Result<Option<(StatusCode, Json<serde_json::Value>)>> {
    let Some(run) = PipelineRunRepo::get(&state.db, namespace, name).await? else {
        return Ok(Some((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "PipelineRun not found"})),
        )));
    };
    if run.state != PipelineRunState::Pending {
        return Ok(None);
    }
    let Some(repo) =
        RepositoryRepo::get(&state.db, &run.repository_namespace, &run.repository_name).await?
    else {
        return Ok(Some((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Repository not found"})),
        )));
    };

    let started = concurrency::dequeue(state, &repo).await?;
    let released = started
        .iter()
        .find(|r| r.namespace == namespace && r.name == name)
        .cloned();
    let repository = repo.key();
    if !started.is_empty() {
        report_dequeued(state, repo, &started).await;
    }
    if let Some(run) = released {
        tracing::info!("PipelineRun {}/{} is now {}", namespace, name, run.state);
        return Ok(Some((StatusCode::OK, Json(json!(run)))));
    }
    Ok(Some((
        StatusCode::CONFLICT,
        Json(json!({
            "error": format!(
                "{}/{} is queued behind the concurrency limit of {}",
                namespace,
                name,
                repository
            )
        })),
    )))
}
