//! Forge detection from headers and body shape.

use crate::models::ProviderKind;

use super::WebhookRequest;

/// Which forge sent a delivery, and the forge's own event name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detected {
    pub kind: ProviderKind,
    pub event_name: String,
    /// GitHub delivery carrying an installation id.
    pub github_app: bool,
    /// `X-GitHub-Enterprise-Host`, set by GitHub Enterprise Server.
    pub enterprise_host: Option<String>,
}

impl Detected {
    fn new(kind: ProviderKind, event_name: &str) -> Self {
        Self {
            kind,
            event_name: event_name.to_string(),
            github_app: false,
            enterprise_host: None,
        }
    }
}

/// Detects the forge. Headers are inspected first, then the body shape.
pub fn detect(request: &WebhookRequest) -> Option<Detected> {
    if let Some(event) = request.header("x-github-event") {
        let payload = request.json().ok();
        let installation = payload
            .as_ref()
            .and_then(|p| p.pointer("/installation/id"))
            .and_then(|id| id.as_i64());
        return Some(Detected {
            kind: ProviderKind::GitHub,
            event_name: event.to_string(),
            github_app: installation.is_some(),
            enterprise_host: request
                .header("x-github-enterprise-host")
                .map(str::to_string),
        });
    }

    if let Some(event) = request.header("x-gitlab-event") {
        return Some(Detected::new(ProviderKind::GitLab, event));
    }

    if let Some(event) = request.header("x-gitea-event") {
        // Comments on pull requests arrive as `issue_comment` with a finer type.
        let event = match request.header("x-gitea-event-type") {
            Some("pull_request_comment") => "pull_request_comment",
            Some("pull_request_label") => "pull_request_label",
            _ => event,
        };
        return Some(Detected::new(ProviderKind::Gitea, event));
    }

    if let Some(event) = request.header("x-event-key") {
        let datacenter = request.header("x-request-id").is_some()
            || event.starts_with("pr:")
            || event == "repo:refs_changed"
            || event == "diagnostics:ping";
        let kind = if datacenter {
            ProviderKind::BitbucketDatacenter
        } else {
            ProviderKind::BitbucketCloud
        };
        return Some(Detected::new(kind, event));
    }

    let payload = request.json().ok()?;
    let event_type = payload.get("eventType").and_then(|v| v.as_str())?;
    if payload.get("resource").is_some() {
        return Some(Detected::new(ProviderKind::AzureDevOps, event_type));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)], body: &str) -> WebhookRequest {
        WebhookRequest {
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.as_bytes().to_vec(),
            source_ip: None,
        }
    }

    #[test]
    fn test_detect_github_app_vs_webhook() {
        let app = detect(&request(
            &[("x-github-event", "pull_request")],
            r#"{"installation": {"id": 42}}"#,
        ))
        .unwrap();
        assert_eq!(app.kind, ProviderKind::GitHub);
        assert!(app.github_app);

        let hook = detect(&request(&[("x-github-event", "push")], "{}")).unwrap();
        assert!(!hook.github_app);
    }

    #[test]
    fn test_detect_bitbucket_flavours() {
        let cloud = detect(&request(&[("x-event-key", "repo:push")], "{}")).unwrap();
        assert_eq!(cloud.kind, ProviderKind::BitbucketCloud);

        let dc = detect(&request(
            &[("x-event-key", "repo:refs_changed"), ("x-request-id", "abc")],
            "{}",
        ))
        .unwrap();
        assert_eq!(dc.kind, ProviderKind::BitbucketDatacenter);

        let dc = detect(&request(&[("x-event-key", "pr:opened")], "{}")).unwrap();
        assert_eq!(dc.kind, ProviderKind::BitbucketDatacenter);
    }

    #[test]
    fn test_detect_gitea_comment_type() {
        let d = detect(&request(
            &[
                ("x-gitea-event", "issue_comment"),
                ("x-gitea-event-type", "pull_request_comment"),
            ],
            "{}",
        ))
        .unwrap();
        assert_eq!(d.kind, ProviderKind::Gitea);
        assert_eq!(d.event_name, "pull_request_comment");
    }

    #[test]
    fn test_detect_azure_and_unknown() {
        let azure = detect(&request(&[], r#"{"eventType": "git.push", "resource": {}}"#)).unwrap();
        assert_eq!(azure.kind, ProviderKind::AzureDevOps);
        assert_eq!(azure.event_name, "git.push");

        assert!(detect(&request(&[], r#"{"hello": "world"}"#)).is_none());
        assert!(detect(&request(&[], "not json")).is_none());
    }
}
