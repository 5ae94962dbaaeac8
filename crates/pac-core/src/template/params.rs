//! Template parameters: standard event values plus Repository custom params.

use std::collections::BTreeMap;

use crate::cel::{CelVariables, evaluate_bool};
use crate::db::{DbPool, SecretRepo};
use crate::error::{PacError, Result};
use crate::models::{Event, EventType, Param, Repository};

/// Names filled in from the event; see [`standard_params`].
const STANDARD_PARAMS: &[&str] = &[
    "repo_url",
    "repo_owner",
    "repo_name",
    "source_url",
    "source_branch",
    "target_branch",
    "revision",
    "sender",
    "event_type",
    "trigger_comment",
    "pull_request_number",
    "git_auth_secret",
];

/// Key read from a param secret when the reference names none.
const DEFAULT_PARAM_SECRET_KEY: &str = "secret";

/// Values available to `{{ }}` placeholders for one event.
#[derive(Debug, Clone, Default)]
pub struct ResolvedParams {
    pub values: BTreeMap<String, String>,
    /// Values that came from secrets; they must be redacted from output.
    pub secrets: Vec<String>,
}

/// Standard params derived from the event alone.
pub fn standard_params(event: &Event, git_auth_secret: Option<&str>) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let mut set = |name: &str, value: &str| {
        params.insert(name.to_string(), value.to_string());
    };
    set("repo_url", &event.url);
    set("repo_owner", &event.organization.to_lowercase());
    set("repo_name", &event.repository.to_lowercase());
    set("source_url", if event.head_url.is_empty() { &event.url } else { &event.head_url });
    set("source_branch", &event.head_branch);
    set("target_branch", event.matching_branch());
    set("revision", &event.sha);
    set("sender", &event.sender.to_lowercase());
    set("event_type", event.event_type.as_str());
    set("trigger_comment", event.trigger_comment.as_deref().unwrap_or_default());
    set(
        "pull_request_number",
        &event
            .pull_request_number
            .map(|n| n.to_string())
            .unwrap_or_default(),
    );
    if let Some(secret) = git_auth_secret {
        set("git_auth_secret", secret);
    }
    params
}

/// Resolves standard and custom params for an event.
///
/// Custom params override standard ones of the same name. Values carried by
/// the event (ops-comment arguments, incoming params) override custom params
/// but never standard ones; see [`accepts_event_param`]. For a
/// name declared several times, the first declaration whose filter holds
/// wins. A filter that fails to evaluate is an error. A secret that cannot
/// be read leaves the param undefined.
pub async fn resolve_params(
    pool: &DbPool,
    repo: &Repository,
    event: &Event,
    git_auth_secret: Option<&str>,
) -> Result<ResolvedParams> {
    let mut resolved = ResolvedParams {
        values: standard_params(event, git_auth_secret),
        secrets: Vec::new(),
    };

    let variables = CelVariables::for_event(event, None);
    let mut custom: BTreeMap<String, String> = BTreeMap::new();
    for param in &repo.spec.params {
        if custom.contains_key(&param.name) {
            continue;
        }
        if !filter_holds(param, &variables)? {
            tracing::debug!("Param {} filtered out for {}", param.name, event.event_type);
            continue;
        }
        if let Some(value) = &param.value {
            custom.insert(param.name.clone(), value.clone());
            continue;
        }
        let Some(secret) = &param.secret_ref else {
            custom.insert(param.name.clone(), String::new());
            continue;
        };
        match SecretRepo::get_value(
            pool,
            &repo.namespace,
            &secret.name,
            secret.key_or(DEFAULT_PARAM_SECRET_KEY),
        )
        .await
        {
            Ok(value) => {
                resolved.secrets.push(value.clone());
                custom.insert(param.name.clone(), value);
            }
            Err(e) => {
                tracing::info!(
                    "Param {} of {} is left unresolved: {}",
                    param.name,
                    repo.key(),
                    e
                );
            }
        }
    }

    resolved.values.extend(custom);
    for (name, value) in &event.custom_params {
        if !accepts_event_param(repo, event, name) {
            tracing::info!(
                "Ignoring param {} from {} event for {}: not a declared custom param",
                name,
                event.event_type,
                repo.key()
            );
            continue;
        }
        resolved.values.insert(name.clone(), value.clone());
    }
    Ok(resolved)
}

/// Whether a value carried by the event itself may set param `name`.
///
/// Standard params are never overridden this way. Comment arguments only
/// set params the Repository declares; incoming params were already checked
/// against the descriptor allow-list.
fn accepts_event_param(repo: &Repository, event: &Event, name: &str) -> bool {
    if STANDARD_PARAMS.contains(&name) {
        return false;
    }
    event.event_type == EventType::Incoming || repo.spec.params.iter().any(|p| p.name == name)
}

fn filter_holds(param: &Param, variables: &CelVariables) -> Result<bool> {
    let Some(filter) = param.filter.as_deref().filter(|f| !f.trim().is_empty()) else {
        return Ok(true);
    };
    evaluate_bool(filter, variables).map_err(|e| {
        PacError::Cel(format!("filter of param {} failed: {}", param.name, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, run_migrations};
    use crate::models::{EventType, ProviderKind, Secret, SecretRef, TriggerType};

    fn event() -> Event {
        let mut event = Event::new(ProviderKind::Gitea, EventType::PullRequest, TriggerType::PullRequest);
        event.organization = "Pac".into();
        event.repository = "App".into();
        event.url = "https://gitea/pac/app".into();
        event.base_branch = "main".into();
        event.head_branch = "feature".into();
        event.sha = "abc123".into();
        event.sender = "Alice".into();
        event.pull_request_number = Some(4);
        event
    }

    fn param(name: &str, value: &str, filter: Option<&str>) -> Param {
        Param {
            name: name.into(),
            value: Some(value.into()),
            secret_ref: None,
            filter: filter.map(str::to_string),
        }
    }

    async fn pool() -> DbPool {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[test]
    fn test_standard_params() {
        let params = standard_params(&event(), Some("pac-gitauth-abcdef"));
        assert_eq!(params["repo_owner"], "pac");
        assert_eq!(params["repo_name"], "app");
        assert_eq!(params["source_url"], "https://gitea/pac/app");
        assert_eq!(params["revision"], "abc123");
        assert_eq!(params["sender"], "alice");
        assert_eq!(params["pull_request_number"], "4");
        assert_eq!(params["event_type"], "pull_request");
        assert_eq!(params["git_auth_secret"], "pac-gitauth-abcdef");
    }

    #[tokio::test]
    async fn test_custom_overrides_standard_and_filters() {
        let pool = pool().await;
        let mut repo = Repository::new("ns", "app", "https://gitea/pac/app");
        repo.spec.params = vec![
            param("revision", "custom", None),
            param("env", "comment", Some("pac.event_type == \"on-comment\"")),
            param("env", "pr", Some("pac.event_type == \"pull_request\"")),
        ];

        let resolved = resolve_params(&pool, &repo, &event(), None).await.unwrap();
        assert_eq!(resolved.values["revision"], "custom");
        assert_eq!(resolved.values["env"], "pr");

        let mut comment = event();
        comment.event_type = EventType::OnComment;
        let resolved = resolve_params(&pool, &repo, &comment, None).await.unwrap();
        assert_eq!(resolved.values["env"], "comment");
    }

    #[tokio::test]
    async fn test_comment_args_only_set_declared_params() {
        let pool = pool().await;
        let mut repo = Repository::new("ns", "app", "https://gitea/pac/app");
        repo.spec.params = vec![param("env", "staging", None)];

        let mut comment = event();
        comment.event_type = EventType::TestComment;
        for (name, value) in [
            ("env", "prod"),
            ("revision", "evil"),
            ("repo_url", "https://evil.example.com/x"),
            ("git_auth_secret", "someone-elses"),
            ("undeclared", "x"),
        ] {
            comment.custom_params.insert(name.into(), value.into());
        }

        let resolved = resolve_params(&pool, &repo, &comment, Some("pac-gitauth-abcdef"))
            .await
            .unwrap();
        assert_eq!(resolved.values["env"], "prod");
        assert_eq!(resolved.values["revision"], "abc123");
        assert_eq!(resolved.values["repo_url"], "https://gitea/pac/app");
        assert_eq!(resolved.values["git_auth_secret"], "pac-gitauth-abcdef");
        assert!(!resolved.values.contains_key("undeclared"));
    }

    #[tokio::test]
    async fn test_incoming_params_skip_standard_names() {
        let pool = pool().await;
        let repo = Repository::new("ns", "app", "https://gitea/pac/app");

        let mut incoming = event();
        incoming.event_type = EventType::Incoming;
        incoming.custom_params.insert("the_best_superhero_is".into(), "Superman".into());
        incoming.custom_params.insert("revision".into(), "evil".into());

        let resolved = resolve_params(&pool, &repo, &incoming, None).await.unwrap();
        assert_eq!(resolved.values["the_best_superhero_is"], "Superman");
        assert_eq!(resolved.values["revision"], "abc123");
    }

    #[tokio::test]
    async fn test_filter_error_fails_loud() {
        let pool = pool().await;
        let mut repo = Repository::new("ns", "app", "https://gitea/pac/app");
        repo.spec.params = vec![param("x", "y", Some("undefined_variable == 1"))];
        let err = resolve_params(&pool, &repo, &event(), None).await.unwrap_err();
        assert!(matches!(err, PacError::Cel(_)));
    }

    #[tokio::test]
    async fn test_secret_params() {
        let pool = pool().await;
        SecretRepo::upsert(
            &pool,
            &Secret {
                namespace: "ns".into(),
                name: "creds".into(),
                data: [("token".to_string(), "s3cr3t-value".to_string())].into(),
                labels: Default::default(),
                owner_run: None,
            },
        )
        .await
        .unwrap();

        let mut repo = Repository::new("ns", "app", "https://gitea/pac/app");
        repo.spec.params = vec![
            Param {
                name: "token".into(),
                value: None,
                secret_ref: Some(SecretRef {
                    name: "creds".into(),
                    key: Some("token".into()),
                }),
                filter: None,
            },
            Param {
                name: "missing".into(),
                value: None,
                secret_ref: Some(SecretRef {
                    name: "nope".into(),
                    key: None,
                }),
                filter: None,
            },
        ];
        let resolved = resolve_params(&pool, &repo, &event(), None).await.unwrap();
        assert_eq!(resolved.values["token"], "s3cr3t-value");
        assert_eq!(resolved.secrets, vec!["s3cr3t-value"]);
        assert!(!resolved.values.contains_key("missing"));
    }

    #[tokio::test]
    async fn test_event_overrides_win() {
        let pool = pool().await;
        let mut repo = Repository::new("ns", "app", "https://gitea/pac/app");
        repo.spec.params = vec![param("the_best_superhero_is", "Batman", None)];
        let mut event = event();
        event
            .custom_params
            .insert("the_best_superhero_is".into(), "Superman".into());
        let resolved = resolve_params(&pool, &repo, &event, None).await.unwrap();
        assert_eq!(resolved.values["the_best_superhero_is"], "Superman");
    }
}
