//! Launched workload model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a launched PipelineRun.
///
/// `(created) -> Pending [if held] -> Running -> {Succeeded | Failed | Cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineRunState {
    /// Held by the concurrency manager; the execution engine does not start it.
    #[serde(rename = "PipelineRunPending")]
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl PipelineRunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineRunState::Pending => "PipelineRunPending",
            PipelineRunState::Running => "Running",
            PipelineRunState::Succeeded => "Succeeded",
            PipelineRunState::Failed => "Failed",
            PipelineRunState::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineRunState::Succeeded | PipelineRunState::Failed | PipelineRunState::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: PipelineRunState) -> bool {
        use PipelineRunState::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Succeeded) | (Running, Failed) | (Running, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PipelineRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PipelineRunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PipelineRunPending" | "Pending" => Ok(PipelineRunState::Pending),
            "Running" => Ok(PipelineRunState::Running),
            "Succeeded" => Ok(PipelineRunState::Succeeded),
            "Failed" => Ok(PipelineRunState::Failed),
            "Cancelled" => Ok(PipelineRunState::Cancelled),
            _ => Err(format!("Unknown PipelineRun state: {}", s)),
        }
    }
}

/// A workload created by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub namespace: String,
    pub name: String,
    pub repository_namespace: String,
    pub repository_name: String,
    pub original_prname: String,
    pub sha: String,
    pub event_type: String,
    pub state: PipelineRunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_number: Option<i64>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Rendered workload document.
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_url: Option<String>,
    /// Forge comment id cached for the update comment strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Set once the reconciler has processed the terminal transition.
    #[serde(default)]
    pub finalized: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// `namespace/name` of the owning Repository.
    pub fn repository_key(&self) -> String {
        format!("{}/{}", self.repository_namespace, self.repository_name)
    }
}

/// A namespaced secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// PipelineRun that owns this secret; deleted with it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_run: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        use PipelineRunState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Cancelled));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(PipelineRunState::Pending.as_str(), "PipelineRunPending");
        assert_eq!(
            "PipelineRunPending".parse::<PipelineRunState>().unwrap(),
            PipelineRunState::Pending
        );
        assert_eq!(
            serde_json::to_string(&PipelineRunState::Pending).unwrap(),
            "\"PipelineRunPending\""
        );
        assert!(PipelineRunState::Cancelled.is_terminal());
        assert!(PipelineRunState::Running.is_active());
    }
}
