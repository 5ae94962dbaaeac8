//! Programmatic triggers.

use std::collections::BTreeMap;

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::{StatusCode, Uri},
    response::IntoResponse,
};
use pac_core::crypto::verify_plain_secret;
use pac_core::db::{RepositoryRepo, SecretRepo};
use pac_core::models::Repository;
use pac_core::webhook::incoming::{IncomingRequest, build_event, select_incoming};
use pac_core::{PacError, Result};
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;
use crate::worker::process_event;

const DEFAULT_INCOMING_SECRET_KEY: &str = "secret";

/// Fields accepted from the query string and the JSON body.
#[derive(Debug, Default, Deserialize)]
struct IncomingFields {
    repository: Option<String>,
    namespace: Option<String>,
    branch: Option<String>,
    pipelinerun: Option<String>,
    secret: Option<String>,
    #[serde(default)]
    params: BTreeMap<String, serde_json::Value>,
}

/// Query parameters win over body fields of the same name.
fn incoming_request(uri: &Uri, body: &[u8]) -> Result<IncomingRequest> {
    let from_body: IncomingFields = if body.iter().all(u8::is_ascii_whitespace) {
        IncomingFields::default()
    } else {
        serde_json::from_slice(body).map_err(|e| {
            PacError::InvalidWebhookPayload(format!("incoming body is not valid JSON: {}", e))
        })?
    };
    let from_query = Query::<IncomingFields>::try_from_uri(uri)
        .map(|q| q.0)
        .map_err(|e| PacError::InvalidWebhookPayload(format!("invalid query string: {}", e)))?;

    let request = IncomingRequest {
        repository: from_query.repository.or(from_body.repository).unwrap_or_default(),
        namespace: from_query.namespace.or(from_body.namespace),
        branch: from_query.branch.or(from_body.branch).unwrap_or_default(),
        pipelinerun: from_query.pipelinerun.or(from_body.pipelinerun).unwrap_or_default(),
        secret: from_query.secret.or(from_body.secret).unwrap_or_default(),
        params: from_body.params,
    };
    request.validate()?;
    Ok(request)
}

async fn find_repository(state: &AppState, request: &IncomingRequest) -> Result<Option<Repository>> {
    match &request.namespace {
        Some(namespace) => RepositoryRepo::get(&state.db, namespace, &request.repository).await,
        None => {
            let mut matching: Vec<Repository> = RepositoryRepo::list(&state.db, None)
                .await?
                .into_iter()
                .filter(|r| r.name == request.repository)
                .collect();
            if matching.len() > 1 {
                tracing::warn!(
                    "{} Repository records are named {}, using {}",
                    matching.len(),
                    request.repository,
                    matching[0].key()
                );
            }
            Ok((!matching.is_empty()).then(|| matching.remove(0)))
        }
    }
}

/// Handler for incoming triggers.
///
/// POST /incoming
pub async fn handle_incoming(
    State(state): State<AppState>,
    uri: Uri,
    body: Bytes,
) -> impl IntoResponse {
    let request = match incoming_request(&uri, &body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Rejected incoming request: {}", e);
            return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()})));
        }
    };

    let repo = match find_repository(&state, &request).await {
        Ok(Some(repo)) => repo,
        Ok(None) => {
            tracing::info!("Incoming request for unknown repository {}", request.repository);
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Repository not found"})),
            );
        }
        Err(e) => {
            tracing::error!("Failed to look up repository {}: {}", request.repository, e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Database error"})),
            );
        }
    };

    let Some(incoming) = select_incoming(&repo, &request.branch) else {
        tracing::info!(
            "No incoming target of {} matches branch {}",
            repo.key(),
            request.branch
        );
        return (StatusCode::OK, Json(json!({"status": "ignored"})));
    };

    let expected = match SecretRepo::get_value(
        &state.db,
        &repo.namespace,
        &incoming.secret.name,
        incoming.secret.key_or(DEFAULT_INCOMING_SECRET_KEY),
    )
    .await
    {
        Ok(secret) => secret,
        Err(e) => {
            tracing::error!("Cannot read incoming secret of {}: {}", repo.key(), e);
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"})));
        }
    };
    if !verify_plain_secret(&expected, &request.secret) {
        tracing::warn!("Incoming request for {} with a bad secret", repo.key());
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"})));
    }

    let event = build_event(&repo, incoming, &request);
    tracing::info!(
        "Incoming trigger of {} on {} for {}",
        request.pipelinerun,
        request.branch,
        repo.key()
    );

    match tokio::time::timeout(state.config.request_timeout, process_event(&state, event, None)).await {
        Ok(Ok(outcome)) => (StatusCode::OK, Json(json!(outcome))),
        Ok(Err(e)) => {
            tracing::error!("Failed to process incoming trigger for {}: {}", repo.key(), e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Failed to process incoming trigger"})),
            )
        }
        Err(_) => {
            tracing::error!("Incoming trigger for {} exceeded {:?}", repo.key(), state.config.request_timeout);
            (StatusCode::OK, Json(json!({"status": "timeout"})))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_and_body_are_merged() {
        let uri: Uri = "/incoming?repository=app&branch=main&pipelinerun=deploy&secret=s"
            .parse()
            .unwrap();
        let request = incoming_request(&uri, br#"{"params": {"env": "prod"}}"#).unwrap();
        assert_eq!(request.repository, "app");
        assert_eq!(request.pipelinerun, "deploy");
        assert_eq!(request.params["env"], "prod");
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        let uri: Uri = "/incoming".parse().unwrap();
        assert!(incoming_request(&uri, br#"{"repository": "app"}"#).is_err());
        assert!(incoming_request(&uri, b"not json").is_err());
    }
}
