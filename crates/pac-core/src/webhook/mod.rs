//! Webhook detection, verification and normalization.
//!
//! The root endpoint hands every delivery to [`detect`]; the matching forge
//! adapter turns the payload into an [`Event`] or explains why it is ignored.

pub mod azure;
pub mod bitbucket_cloud;
pub mod bitbucket_dc;
pub mod detect;
pub mod gitea;
pub mod github;
pub mod gitlab;
pub mod incoming;
pub mod verifier;

pub use detect::*;
pub use verifier::*;

use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::error::{PacError, Result};
use crate::models::{Event, EventType, ProviderKind, TriggerType};
use crate::opscomment::{self, CommentKind};

/// A raw delivery as received by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub source_ip: Option<IpAddr>,
}

impl WebhookRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| PacError::InvalidWebhookPayload(format!("body is not JSON: {}", e)))
    }
}

/// Result of normalizing a delivery.
#[derive(Debug)]
pub enum ParseOutcome {
    Event(Box<Event>),
    /// Valid delivery this controller does not act on; the reason is logged once.
    Ignored(String),
}

/// Normalizes a detected delivery with the forge's adapter.
pub fn parse(detected: &Detected, request: &WebhookRequest) -> Result<ParseOutcome> {
    let outcome = match detected.kind {
        ProviderKind::GitHub => github::parse(&detected.event_name, request)?,
        ProviderKind::GitLab => gitlab::parse(&detected.event_name, request)?,
        ProviderKind::Gitea => gitea::parse(&detected.event_name, request)?,
        ProviderKind::BitbucketCloud => bitbucket_cloud::parse(&detected.event_name, request)?,
        ProviderKind::BitbucketDatacenter => bitbucket_dc::parse(&detected.event_name, request)?,
        ProviderKind::AzureDevOps => azure::parse(&detected.event_name, request)?,
    };

    Ok(match outcome {
        ParseOutcome::Event(mut event) => {
            event.headers = request.headers.clone();
            if event.payload.is_null() {
                event.payload = request.json().unwrap_or(serde_json::Value::Null);
            }
            if detected.github_app {
                event.github_enterprise_host = detected.enterprise_host.clone();
            }
            ParseOutcome::Event(event)
        }
        ignored => ignored,
    })
}

/// Applies the gitops command in `event.trigger_comment`.
///
/// Returns `false` when the comment is not a command. The prefix comes from the
/// Repository settings, so this runs after repository resolution.
pub fn apply_ops_comment(event: &mut Event, prefix: Option<&str>) -> bool {
    let Some(comment) = event.trigger_comment.clone() else {
        return false;
    };
    let parsed = opscomment::classify(&comment, prefix);
    let Some(event_type) = parsed.event_type() else {
        return false;
    };

    event.event_type = event_type;
    event.trigger = match parsed.kind {
        CommentKind::Cancel => TriggerType::Cancel,
        CommentKind::OnComment => TriggerType::OnComment,
        _ if event.is_pull_request() => TriggerType::PullRequest,
        _ => TriggerType::Push,
    };
    match parsed.kind {
        CommentKind::Test | CommentKind::Retest => {
            event.target_test_pipeline_run = parsed.target.clone();
        }
        CommentKind::Cancel => {
            event.target_cancel_pipeline_run = parsed.target.clone();
        }
        _ => {}
    }
    if let Some(branch) = parsed.branch {
        event.target_branch = Some(branch);
    }
    event.custom_params.extend(parsed.args);
    true
}

/// Strips `refs/heads/` (and only that) from a ref.
pub fn branch_from_ref(reference: &str) -> String {
    reference
        .strip_prefix("refs/heads/")
        .unwrap_or(reference)
        .to_string()
}

/// Splits `owner/repo` (owner may contain `/` on GitLab subgroups).
pub(crate) fn split_full_name(full_name: &str) -> Result<(String, String)> {
    match full_name.rsplit_once('/') {
        Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() => {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => Err(PacError::InvalidWebhookPayload(format!(
            "Invalid repository full name: {}",
            full_name
        ))),
    }
}

/// Event type of a push: tags are reported as `tag`, branches as `push`.
pub(crate) fn push_event_type(reference: &str) -> EventType {
    if reference.starts_with("refs/tags/") {
        EventType::Tag
    } else {
        EventType::Push
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment_event(comment: &str, pr: Option<i64>) -> Event {
        let mut event = Event::new(ProviderKind::GitHub, EventType::OnComment, TriggerType::OnComment);
        event.pull_request_number = pr;
        event.trigger_comment = Some(comment.to_string());
        event
    }

    #[test]
    fn test_apply_test_comment() {
        let mut event = comment_event("/test pipeline foo=bar", Some(3));
        assert!(apply_ops_comment(&mut event, None));
        assert_eq!(event.event_type, EventType::TestComment);
        assert_eq!(event.trigger, TriggerType::PullRequest);
        assert_eq!(event.target_test_pipeline_run.as_deref(), Some("pipeline"));
        assert_eq!(event.custom_params.get("foo").map(String::as_str), Some("bar"));
    }

    #[test]
    fn test_apply_retest_on_commit() {
        let mut event = comment_event("/retest branch:stable", None);
        assert!(apply_ops_comment(&mut event, None));
        assert_eq!(event.event_type, EventType::RetestAllComment);
        assert_eq!(event.trigger, TriggerType::Push);
        assert_eq!(event.target_branch.as_deref(), Some("stable"));
    }

    #[test]
    fn test_apply_cancel_and_noop() {
        let mut event = comment_event("/cancel pipeline", Some(1));
        assert!(apply_ops_comment(&mut event, None));
        assert_eq!(event.trigger, TriggerType::Cancel);
        assert_eq!(event.target_cancel_pipeline_run.as_deref(), Some("pipeline"));

        let mut event = comment_event("nice work", Some(1));
        assert!(!apply_ops_comment(&mut event, None));
    }

    #[test]
    fn test_split_full_name() {
        assert_eq!(
            split_full_name("group/sub/project").unwrap(),
            ("group/sub".to_string(), "project".to_string())
        );
        assert!(split_full_name("nope").is_err());
    }
}
