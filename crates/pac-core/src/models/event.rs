//! Normalized forge event.
//!
//! Every forge adapter converts its payload into an [`Event`]; everything
//! downstream of ingress only sees this type.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::ProviderKind;

/// Fine-grained event type, written onto launched workloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[default]
    #[serde(rename = "pull_request")]
    PullRequest,
    #[serde(rename = "push")]
    Push,
    #[serde(rename = "tag")]
    Tag,
    #[serde(rename = "incoming")]
    Incoming,
    #[serde(rename = "test-all-comment")]
    TestAllComment,
    #[serde(rename = "test-comment")]
    TestComment,
    #[serde(rename = "retest-all-comment")]
    RetestAllComment,
    #[serde(rename = "retest-comment")]
    RetestComment,
    #[serde(rename = "cancel-all-comment")]
    CancelAllComment,
    #[serde(rename = "cancel-comment")]
    CancelComment,
    #[serde(rename = "ok-to-test-comment")]
    OkToTestComment,
    #[serde(rename = "on-comment")]
    OnComment,
    #[serde(rename = "check-run-rerequested")]
    CheckRunRerequested,
    #[serde(rename = "check-suite-rerequested")]
    CheckSuiteRerequested,
    #[serde(rename = "pull_request_labeled")]
    PullRequestLabeled,
    #[serde(rename = "pull_request_closed")]
    PullRequestClosed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PullRequest => "pull_request",
            EventType::Push => "push",
            EventType::Tag => "tag",
            EventType::Incoming => "incoming",
            EventType::TestAllComment => "test-all-comment",
            EventType::TestComment => "test-comment",
            EventType::RetestAllComment => "retest-all-comment",
            EventType::RetestComment => "retest-comment",
            EventType::CancelAllComment => "cancel-all-comment",
            EventType::CancelComment => "cancel-comment",
            EventType::OkToTestComment => "ok-to-test-comment",
            EventType::OnComment => "on-comment",
            EventType::CheckRunRerequested => "check-run-rerequested",
            EventType::CheckSuiteRerequested => "check-suite-rerequested",
            EventType::PullRequestLabeled => "pull_request_labeled",
            EventType::PullRequestClosed => "pull_request_closed",
        }
    }

    /// Whether the event came from an ops-comment.
    pub fn is_comment(&self) -> bool {
        matches!(
            self,
            EventType::TestAllComment
                | EventType::TestComment
                | EventType::RetestAllComment
                | EventType::RetestComment
                | EventType::CancelAllComment
                | EventType::CancelComment
                | EventType::OkToTestComment
                | EventType::OnComment
        )
    }

    /// `/test` and `/retest` comments re-trigger runs explicitly.
    pub fn is_explicit_rerun(&self) -> bool {
        matches!(
            self,
            EventType::TestAllComment
                | EventType::TestComment
                | EventType::RetestAllComment
                | EventType::RetestComment
                | EventType::CheckRunRerequested
                | EventType::CheckSuiteRerequested
        )
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, EventType::CancelAllComment | EventType::CancelComment)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("Unknown event type: {}", s))
    }
}

/// Normalized trigger, the value matched against `on-event`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerType {
    #[default]
    #[serde(rename = "pull_request")]
    PullRequest,
    #[serde(rename = "push")]
    Push,
    #[serde(rename = "incoming")]
    Incoming,
    #[serde(rename = "on-comment")]
    OnComment,
    #[serde(rename = "cancel")]
    Cancel,
    #[serde(rename = "pull_request_closed")]
    PullRequestClosed,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::PullRequest => "pull_request",
            TriggerType::Push => "push",
            TriggerType::Incoming => "incoming",
            TriggerType::OnComment => "on-comment",
            TriggerType::Cancel => "cancel",
            TriggerType::PullRequestClosed => "pull_request_closed",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Forge access token. Never printed.
#[derive(Clone)]
pub struct ProviderToken(Arc<SecretString>);

impl ProviderToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::new(SecretString::from(token.into())))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for ProviderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProviderToken(*****)")
    }
}

/// How to talk to the forge for this event.
#[derive(Debug, Clone, Default)]
pub struct ProviderInfo {
    pub token: Option<ProviderToken>,
    /// API base URL.
    pub api_url: Option<String>,
    pub user: Option<String>,
}

/// A normalized forge event.
#[derive(Debug, Clone, Default)]
pub struct Event {
    pub provider: Option<ProviderKind>,
    pub event_type: EventType,
    pub trigger: TriggerType,
    pub organization: String,
    pub repository: String,
    /// Web URL of the base repository, used to find the Repository record.
    pub url: String,
    /// Clone URL, differs from `url` on Bitbucket Data Center.
    pub clone_url: String,
    pub base_branch: String,
    pub head_branch: String,
    /// Web URL of the head repository (fork aware).
    pub head_url: String,
    /// Owner/name of the head repository when the PR comes from a fork.
    pub head_organization: String,
    pub head_repository: String,
    pub sha: String,
    pub sha_url: Option<String>,
    pub sha_title: Option<String>,
    pub head_commit_message: Option<String>,
    pub sender: String,
    pub pull_request_number: Option<i64>,
    pub pull_request_title: Option<String>,
    pub pull_request_author: Option<String>,
    pub pull_request_labels: Vec<String>,
    /// `/test NAME`, `/retest NAME`.
    pub target_test_pipeline_run: Option<String>,
    /// `/cancel NAME`.
    pub target_cancel_pipeline_run: Option<String>,
    /// `branch:X` ops-comment argument.
    pub target_branch: Option<String>,
    /// Overrides from ops-comment arguments or incoming params.
    pub custom_params: BTreeMap<String, String>,
    pub trigger_comment: Option<String>,
    pub comment_id: Option<i64>,
    /// GitLab discussion the ops-comment was made in.
    pub discussion_id: Option<String>,
    pub installation_id: Option<i64>,
    pub github_enterprise_host: Option<String>,
    /// Numeric project ids (GitLab source/target, Azure repository).
    pub source_project_id: Option<i64>,
    pub target_project_id: Option<i64>,
    pub provider_info: ProviderInfo,
    /// Raw payload, exposed to CEL and templates as `body`.
    pub payload: serde_json::Value,
    /// Request headers (lowercased names), exposed as `headers`.
    pub headers: BTreeMap<String, String>,
    pub received_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(provider: ProviderKind, event_type: EventType, trigger: TriggerType) -> Self {
        Self {
            provider: Some(provider),
            event_type,
            trigger,
            received_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.provider.unwrap_or(ProviderKind::GitHub)
    }

    pub fn is_pull_request(&self) -> bool {
        self.pull_request_number.is_some()
    }

    /// Branch runs are matched against, `branch:X` wins over the base branch.
    pub fn matching_branch(&self) -> &str {
        self.target_branch.as_deref().unwrap_or(&self.base_branch)
    }

    /// Whether the head comes from a different repository than the base.
    pub fn is_fork(&self) -> bool {
        !self.head_organization.is_empty()
            && (self.head_organization != self.organization
                || self.head_repository != self.repository)
    }

    /// Owner/name pair files are read from.
    pub fn head_coordinates(&self) -> (&str, &str) {
        if self.is_fork() {
            (&self.head_organization, &self.head_repository)
        } else {
            (&self.organization, &self.repository)
        }
    }

    /// `organization/repository`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.organization, self.repository)
    }

    pub fn short_sha(&self) -> &str {
        short_sha(&self.sha)
    }
}

/// First seven characters of a revision. Revisions from comments and
/// incoming requests are free text, so this counts chars, not bytes.
pub fn short_sha(sha: &str) -> &str {
    sha.char_indices().nth(7).map_or(sha, |(end, _)| &sha[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_strings() {
        assert_eq!(EventType::RetestAllComment.as_str(), "retest-all-comment");
        assert_eq!(
            "ok-to-test-comment".parse::<EventType>().unwrap(),
            EventType::OkToTestComment
        );
        assert!("unknown".parse::<EventType>().is_err());
        assert_eq!(
            serde_json::to_string(&EventType::PullRequest).unwrap(),
            "\"pull_request\""
        );
    }

    #[test]
    fn test_short_sha_counts_chars() {
        assert_eq!(short_sha("0123456789abcdef"), "0123456");
        assert_eq!(short_sha("abc"), "abc");
        assert_eq!(short_sha("ab\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}"), "ab\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}");
        assert_eq!(short_sha("\u{1f680}\u{1f680}\u{1f680}\u{1f680}\u{1f680}\u{1f680}\u{1f680}\u{1f680}").chars().count(), 7);
    }

    #[test]
    fn test_event_classification() {
        assert!(EventType::TestComment.is_comment());
        assert!(EventType::TestComment.is_explicit_rerun());
        assert!(!EventType::CancelComment.is_explicit_rerun());
        assert!(EventType::CancelAllComment.is_cancel());
        assert!(!EventType::Push.is_comment());
    }

    #[test]
    fn test_fork_coordinates() {
        let mut event = Event::new(ProviderKind::GitHub, EventType::PullRequest, TriggerType::PullRequest);
        event.organization = "org".into();
        event.repository = "repo".into();
        assert!(!event.is_fork());
        assert_eq!(event.head_coordinates(), ("org", "repo"));

        event.head_organization = "contributor".into();
        event.head_repository = "repo".into();
        assert!(event.is_fork());
        assert_eq!(event.head_coordinates(), ("contributor", "repo"));
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = ProviderToken::new("ghs_secret");
        assert_eq!(format!("{:?}", token), "ProviderToken(*****)");
        assert_eq!(token.expose(), "ghs_secret");
    }
}
