//! Programmatic `/incoming` triggers.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{PacError, Result};
use crate::matcher::matches_glob;
use crate::models::{Event, EventType, Incoming, Repository, TriggerType};

/// Body (or query string) of an incoming trigger.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncomingRequest {
    pub repository: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub branch: String,
    pub pipelinerun: String,
    pub secret: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl IncomingRequest {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("repository", &self.repository),
            ("branch", &self.branch),
            ("pipelinerun", &self.pipelinerun),
            ("secret", &self.secret),
        ] {
            if value.trim().is_empty() {
                return Err(PacError::InvalidWebhookPayload(format!(
                    "incoming request is missing {}",
                    field
                )));
            }
        }
        Ok(())
    }
}

/// First incoming descriptor with a target matching `branch`.
///
/// Descriptors are tried in declaration order and targets in list order; the
/// first glob match wins.
pub fn select_incoming<'a>(repo: &'a Repository, branch: &str) -> Option<&'a Incoming> {
    repo.spec
        .incomings
        .iter()
        .find(|incoming| incoming.targets.iter().any(|t| matches_glob(t, branch)))
}

/// Builds the event for a matched incoming trigger.
///
/// Only params listed in the descriptor are carried over; the head SHA is
/// resolved later through the forge.
pub fn build_event(repo: &Repository, incoming: &Incoming, request: &IncomingRequest) -> Event {
    let mut event = Event::new(repo.provider_kind(), EventType::Incoming, TriggerType::Incoming);
    if let Some((owner, name)) = repo.url_coordinates() {
        event.organization = owner;
        event.repository = name;
    }
    event.url = repo.spec.url.clone();
    event.clone_url = format!("{}.git", repo.spec.url.trim_end_matches('/'));
    event.head_url = repo.spec.url.clone();
    event.base_branch = request.branch.clone();
    event.head_branch = request.branch.clone();
    event.target_test_pipeline_run = Some(request.pipelinerun.clone());
    event.sender = "incoming".to_string();

    for (name, value) in &request.params {
        if !incoming.params.iter().any(|allowed| allowed == name) {
            tracing::info!(
                "Ignoring incoming param {} not allowed by repository {}",
                name,
                repo.key()
            );
            continue;
        }
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        event.custom_params.insert(name.clone(), value);
    }
    event.payload = serde_json::to_value(&request.params).unwrap_or(serde_json::Value::Null);
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProviderKind, SecretRef};

    fn repo(targets: &[&str]) -> Repository {
        let mut repo = Repository::new("ns", "app", "https://github.com/pac/app");
        repo.spec.incomings.push(Incoming {
            kind: "webhook-url".into(),
            secret: SecretRef {
                name: "incoming".into(),
                key: None,
            },
            targets: targets.iter().map(|t| t.to_string()).collect(),
            params: vec!["the_best_superhero_is".into()],
        });
        repo
    }

    #[test]
    fn test_no_target_matches() {
        let repo = repo(&["prod-*", "staging-*"]);
        assert!(select_incoming(&repo, "feature-1").is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let mut repo = repo(&["feature-*"]);
        let mut catch_all = repo.spec.incomings[0].clone();
        catch_all.targets = vec!["*".into()];
        catch_all.params = vec![];
        repo.spec.incomings.push(catch_all);

        let selected = select_incoming(&repo, "feature-xyz").unwrap();
        assert_eq!(selected.targets, vec!["feature-*".to_string()]);
        let selected = select_incoming(&repo, "main").unwrap();
        assert_eq!(selected.targets, vec!["*".to_string()]);
    }

    #[test]
    fn test_build_event_filters_params() {
        let repo = repo(&["feature-*"]);
        let request = IncomingRequest {
            repository: "app".into(),
            branch: "feature-1".into(),
            pipelinerun: "deploy".into(),
            secret: "S".into(),
            params: BTreeMap::from([
                ("the_best_superhero_is".to_string(), serde_json::json!("Superman")),
                ("sneaky".to_string(), serde_json::json!("nope")),
            ]),
            ..Default::default()
        };
        let event = build_event(&repo, &repo.spec.incomings[0], &request);
        assert_eq!(event.provider, Some(ProviderKind::GitHub));
        assert_eq!(event.trigger, TriggerType::Incoming);
        assert_eq!(event.organization, "pac");
        assert_eq!(event.target_test_pipeline_run.as_deref(), Some("deploy"));
        assert_eq!(
            event.custom_params.get("the_best_superhero_is").map(String::as_str),
            Some("Superman")
        );
        assert!(!event.custom_params.contains_key("sneaky"));
    }

    #[test]
    fn test_validate() {
        let request = IncomingRequest {
            repository: "app".into(),
            branch: "".into(),
            ..Default::default()
        };
        assert!(request.validate().is_err());
    }
}
