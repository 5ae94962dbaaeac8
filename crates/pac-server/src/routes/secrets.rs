//! Namespaced secret endpoints. Values are write-only.

use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use pac_core::db::SecretRepo;
use pac_core::models::Secret;
use serde::Deserialize;
use serde_json::json;

use super::api_error;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSecretRequest {
    pub namespace: String,
    pub name: String,
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Create or replace a secret.
///
/// POST /api/secrets
pub async fn create_secret(
    State(state): State<AppState>,
    Json(req): Json<CreateSecretRequest>,
) -> impl IntoResponse {
    if req.namespace.trim().is_empty() || req.name.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "namespace and name are required"})),
        );
    }

    let secret = Secret {
        namespace: req.namespace,
        name: req.name,
        data: req.data,
        labels: req.labels,
        owner_run: None,
    };

    match SecretRepo::upsert(&state.db, &secret).await {
        Ok(()) => {
            tracing::info!("Stored secret {}/{}", secret.namespace, secret.name);
            let keys: Vec<&String> = secret.data.keys().collect();
            (
                StatusCode::CREATED,
                Json(json!({
                    "namespace": secret.namespace,
                    "name": secret.name,
                    "keys": keys,
                })),
            )
        }
        Err(e) => api_error(e),
    }
}

/// DELETE /api/secrets/{namespace}/{name}
pub async fn delete_secret(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match SecretRepo::delete(&state.db, &namespace, &name).await {
        Ok(true) => (StatusCode::NO_CONTENT, Json(json!({}))),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Secret not found"})),
        ),
        Err(e) => api_error(e),
    }
}
