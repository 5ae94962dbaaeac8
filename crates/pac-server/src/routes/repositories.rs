//! Repository record management endpoints.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use pac_core::db::RepositoryRepo;
use pac_core::models::{Repository, RepositorySpec};
use serde::Deserialize;
use serde_json::json;

use super::api_error;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateRepositoryRequest {
    pub namespace: String,
    pub name: String,
    pub spec: RepositorySpec,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListRepositoriesQuery {
    pub namespace: Option<String>,
}

/// List Repository records, optionally within one namespace.
///
/// GET /api/repositories
pub async fn list_repositories(
    State(state): State<AppState>,
    Query(query): Query<ListRepositoriesQuery>,
) -> impl IntoResponse {
    match RepositoryRepo::list(&state.db, query.namespace.as_deref()).await {
        Ok(repos) => (StatusCode::OK, Json(json!(repos))),
        Err(e) => api_error(e),
    }
}

/// Create a Repository record.
///
/// POST /api/repositories
pub async fn create_repository(
    State(state): State<AppState>,
    Json(req): Json<CreateRepositoryRequest>,
) -> impl IntoResponse {
    let mut repo = Repository::new(req.namespace, req.name, req.spec.url.clone());
    repo.spec = req.spec;

    match RepositoryRepo::create(&state.db, &repo).await {
        Ok(()) => {
            tracing::info!("Created Repository {} for {}", repo.key(), repo.spec.url);
            (StatusCode::CREATED, Json(json!(repo)))
        }
        Err(e) => api_error(e),
    }
}

/// GET /api/repositories/{namespace}/{name}
pub async fn get_repository(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match RepositoryRepo::get(&state.db, &namespace, &name).await {
        Ok(Some(repo)) => (StatusCode::OK, Json(json!(repo))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Repository not found"})),
        ),
        Err(e) => api_error(e),
    }
}

/// Replace the spec of a Repository record. The status list is kept.
///
/// PUT /api/repositories/{namespace}/{name}
pub async fn update_repository(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(spec): Json<RepositorySpec>,
) -> impl IntoResponse {
    match RepositoryRepo::update_spec(&state.db, &namespace, &name, &spec).await {
        Ok(repo) => {
            tracing::info!("Updated Repository {}", repo.key());
            (StatusCode::OK, Json(json!(repo)))
        }
        Err(e) => api_error(e),
    }
}

/// DELETE /api/repositories/{namespace}/{name}
pub async fn delete_repository(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match RepositoryRepo::delete(&state.db, &namespace, &name).await {
        Ok(true) => {
            tracing::info!("Deleted Repository {}/{}", namespace, name);
            (StatusCode::NO_CONTENT, Json(json!({})))
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Repository not found"})),
        ),
        Err(e) => api_error(e),
    }
}
