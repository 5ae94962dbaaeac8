//! Repository binding and sender permissions.

use serde::Deserialize;

use crate::db::{DbPool, PipelineRunRepo, RepositoryRepo};
use crate::error::Result;
use crate::models::{Event, EventType, Repository};
use crate::providers::{FileLocation, Provider};

/// File at the root of the base branch listing extra approvers.
pub const OWNERS_FILE: &str = "OWNERS";

/// Where the global Repository record lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRepository {
    pub namespace: String,
    pub name: String,
}

/// Canonical form used to compare forge URLs.
pub fn normalize_url(url: &str) -> String {
    url.trim()
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .to_string()
}

/// Finds the Repository record owning the event and merges the global
/// defaults under it.
///
/// When several records share the URL the first by `namespace/name` wins and
/// a warning is logged.
pub async fn find_repository(
    pool: &DbPool,
    event: &Event,
    global: Option<&GlobalRepository>,
) -> Result<Option<Repository>> {
    let url = normalize_url(&event.url);
    let mut found = RepositoryRepo::list_by_url(pool, &url).await?;
    if found.is_empty() && url != event.url {
        found = RepositoryRepo::list_by_url(pool, &event.url).await?;
    }
    if let Some(global) = global {
        found.retain(|r| !(r.namespace == global.namespace && r.name == global.name));
    }

    if found.len() > 1 {
        tracing::warn!(
            "{} Repository records match {}, using {}",
            found.len(),
            url,
            found[0].key()
        );
    }
    let Some(mut repo) = found.into_iter().next() else {
        return Ok(None);
    };

    if let Some(global) = global {
        if let Some(defaults) = RepositoryRepo::get(pool, &global.namespace, &global.name).await? {
            repo.merge_global(&defaults.spec);
        }
    }
    Ok(Some(repo))
}

/// Why a sender was allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclReason {
    /// Pushes, tags, incoming webhooks and closed pull requests.
    NotRequired,
    Owner,
    AllowedTeam,
    Collaborator,
    PolicyTeam,
    OwnersFile,
    OkToTestMemory,
}

#[derive(Debug, Default, Deserialize)]
struct OwnersFile {
    #[serde(default)]
    approvers: Vec<String>,
    #[serde(default)]
    reviewers: Vec<String>,
}

/// Teams listed under `settings.policy` for this kind of event.
fn policy_teams(repo: &Repository, event_type: EventType) -> Vec<String> {
    let Some(policy) = repo.settings().policy else {
        return Vec::new();
    };
    match event_type {
        EventType::OkToTestComment => policy.ok_to_test,
        EventType::TestAllComment
        | EventType::TestComment
        | EventType::RetestAllComment
        | EventType::RetestComment
        | EventType::CheckRunRerequested
        | EventType::CheckSuiteRerequested => policy.retest,
        EventType::CancelAllComment | EventType::CancelComment => policy.cancel,
        EventType::PullRequest | EventType::PullRequestLabeled | EventType::OnComment => {
            policy.pull_request
        }
        _ => Vec::new(),
    }
}

/// Decides whether the event sender may trigger runs.
///
/// Checks, in order: events that need no check, repository owner,
/// `allowed_teams`, write collaborators, policy teams for the event kind, the
/// `OWNERS` file of the base branch and, when `remember_ok_to_test` is set,
/// an earlier run on the same pull request.
pub async fn check_acl(
    pool: &DbPool,
    provider: &dyn Provider,
    repo: &Repository,
    event: &Event,
    remember_ok_to_test: bool,
) -> Result<Option<AclReason>> {
    if matches!(
        event.event_type,
        EventType::Push | EventType::Tag | EventType::Incoming | EventType::PullRequestClosed
    ) {
        return Ok(Some(AclReason::NotRequired));
    }

    let sender = event.sender.as_str();
    if !sender.is_empty() && sender.eq_ignore_ascii_case(&event.organization) {
        return Ok(Some(AclReason::Owner));
    }

    for team in repo.settings().allowed_teams {
        if provider.is_team_member(event, &team, sender).await? {
            return Ok(Some(AclReason::AllowedTeam));
        }
    }

    if provider.is_collaborator(event, sender).await? {
        return Ok(Some(AclReason::Collaborator));
    }

    for team in policy_teams(repo, event.event_type) {
        if provider.is_team_member(event, &team, sender).await? {
            return Ok(Some(AclReason::PolicyTeam));
        }
    }

    if owners_allow(provider, event, sender).await {
        return Ok(Some(AclReason::OwnersFile));
    }

    if remember_ok_to_test && !event.event_type.is_comment() {
        if let Some(number) = event.pull_request_number {
            let key = (repo.namespace.as_str(), repo.name.as_str());
            if PipelineRunRepo::has_run_for_pull_request(pool, key, number).await? {
                return Ok(Some(AclReason::OkToTestMemory));
            }
        }
    }

    tracing::info!(
        "Sender {} is not allowed to run CI on {}",
        sender,
        event.full_name()
    );
    Ok(None)
}

/// Reads `OWNERS` from the base branch. A missing or unreadable file grants
/// nothing.
async fn owners_allow(provider: &dyn Provider, event: &Event, sender: &str) -> bool {
    if event.base_branch.is_empty() {
        return false;
    }
    let location = FileLocation::base(event, OWNERS_FILE);
    let content = match provider.fetch_file(event, &location).await {
        Ok(content) => content,
        Err(e) => {
            if !e.is_not_found() {
                tracing::debug!("Cannot read {} on {}: {}", OWNERS_FILE, event.full_name(), e);
            }
            return false;
        }
    };
    let owners: OwnersFile = match serde_yaml::from_str(&content) {
        Ok(owners) => owners,
        Err(e) => {
            tracing::warn!("Invalid {} file on {}: {}", OWNERS_FILE, event.full_name(), e);
            return false;
        }
    };
    owners
        .approvers
        .iter()
        .chain(owners.reviewers.iter())
        .any(|u| u.eq_ignore_ascii_case(sender))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Policy, Settings};

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("https://gitea/pac/app/"), "https://gitea/pac/app");
        assert_eq!(normalize_url("https://gitea/pac/app.git"), "https://gitea/pac/app");
        assert_eq!(normalize_url(" https://gitea/pac/app "), "https://gitea/pac/app");
    }

    #[test]
    fn test_policy_teams_by_event_type() {
        let mut repo = Repository::new("ns", "app", "https://gitea/pac/app");
        repo.spec.settings = Some(Settings {
            policy: Some(Policy {
                ok_to_test: vec!["approvers".into()],
                retest: vec!["testers".into()],
                pull_request: vec!["contributors".into()],
                cancel: vec!["operators".into()],
            }),
            ..Default::default()
        });
        assert_eq!(policy_teams(&repo, EventType::OkToTestComment), vec!["approvers"]);
        assert_eq!(policy_teams(&repo, EventType::RetestAllComment), vec!["testers"]);
        assert_eq!(policy_teams(&repo, EventType::TestComment), vec!["testers"]);
        assert_eq!(policy_teams(&repo, EventType::CancelComment), vec!["operators"]);
        assert_eq!(policy_teams(&repo, EventType::PullRequest), vec!["contributors"]);
        assert!(policy_teams(&repo, EventType::Push).is_empty());
    }

    #[test]
    fn test_owners_file_format() {
        let owners: OwnersFile =
            serde_yaml::from_str("approvers:\n  - alice\nreviewers:\n  - bob\n").unwrap();
        assert_eq!(owners.approvers, vec!["alice"]);
        assert_eq!(owners.reviewers, vec!["bob"]);
    }
}
