//! Forge webhook endpoint.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::{
    Json,
    body::{Body, to_bytes},
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use pac_core::crypto::MAX_WEBHOOK_SIZE;
use pac_core::models::ProviderKind;
use pac_core::webhook::{self, Detected, ParseOutcome, SourceIpAllowList, WebhookRequest, verify_github};
use pac_core::PacError;
use secrecy::ExposeSecret;
use serde_json::json;

use crate::state::AppState;
use crate::worker::process_event;

fn lowercase_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn ignored(reason: &str) -> (StatusCode, Json<serde_json::Value>) {
    tracing::debug!("Ignoring delivery: {}", reason);
    (StatusCode::OK, Json(json!({"status": "ignored", "reason": reason})))
}

fn error_response(e: &PacError) -> (StatusCode, Json<serde_json::Value>) {
    match e {
        PacError::AuthFail(message) => {
            tracing::warn!("Webhook authentication failed: {}", message);
            (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"})))
        }
        PacError::InvalidWebhookPayload(message) => {
            tracing::warn!("Invalid webhook payload: {}", message);
            (StatusCode::BAD_REQUEST, Json(json!({"error": message})))
        }
        e => {
            tracing::error!("Failed to process webhook: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Failed to process webhook"})),
            )
        }
    }
}

/// Authenticates deliveries that can be checked before repository binding:
/// GitHub App deliveries and Bitbucket Cloud source IPs.
fn verify_early(state: &AppState, detected: &Detected, request: &WebhookRequest) -> Result<(), PacError> {
    if detected.github_app {
        let secret = state.config.webhook_secret.as_ref().ok_or_else(|| {
            PacError::AuthFail("GitHub App delivery but PAC_WEBHOOK_SECRET is not set".to_string())
        })?;
        return verify_github(secret.expose_secret(), request);
    }
    if detected.kind == ProviderKind::BitbucketCloud && state.config.bitbucket_cloud_check_source_ip {
        return SourceIpAllowList::bitbucket_cloud(&state.config.bitbucket_cloud_additional_source_ip)
            .verify(request);
    }
    Ok(())
}

/// Handler for every forge delivery.
///
/// POST /
pub async fn handle_webhook(State(state): State<AppState>, request: Request<Body>) -> impl IntoResponse {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip());
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_WEBHOOK_SIZE).await {
        Ok(body) => body,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({"error": "Payload too large"})),
            );
        }
    };

    let delivery = WebhookRequest {
        headers: lowercase_headers(&parts.headers),
        body: body.to_vec(),
        source_ip: peer,
    };

    let Some(detected) = webhook::detect(&delivery) else {
        return ignored("not a delivery from a supported forge");
    };

    if detected.github_app {
        if let Some(expected) = &state.config.github_enterprise_host {
            if detected.enterprise_host.as_deref() != Some(expected.as_str()) {
                return ignored("delivery from another GitHub Enterprise host");
            }
        }
    }

    if let Err(e) = verify_early(&state, &detected, &delivery) {
        return error_response(&e);
    }

    let event = match webhook::parse(&detected, &delivery) {
        Ok(ParseOutcome::Event(event)) => *event,
        Ok(ParseOutcome::Ignored(reason)) => return ignored(&reason),
        Err(e) => return error_response(&e),
    };
    tracing::info!(
        "Received {} {} event for {}",
        detected.kind.as_str(),
        event.event_type,
        event.full_name()
    );

    match tokio::time::timeout(
        state.config.request_timeout,
        process_event(&state, event, Some(&delivery)),
    )
    .await
    {
        Ok(Ok(outcome)) => (StatusCode::OK, Json(json!(outcome))),
        Ok(Err(e)) => error_response(&e),
        Err(_) => {
            tracing::error!(
                "Processing a {} delivery exceeded {:?}",
                detected.kind.as_str(),
                state.config.request_timeout
            );
            (StatusCode::OK, Json(json!({"status": "timeout"})))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_headers_are_lowercased() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Gitea-Event", HeaderValue::from_static("push"));
        let lowered = lowercase_headers(&headers);
        assert_eq!(lowered.get("x-gitea-event").map(String::as_str), Some("push"));
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(error_response(&PacError::AuthFail("bad".into())).0, StatusCode::UNAUTHORIZED);
        assert_eq!(
            error_response(&PacError::InvalidWebhookPayload("bad".into())).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_response(&PacError::Configuration("bad".into())).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
