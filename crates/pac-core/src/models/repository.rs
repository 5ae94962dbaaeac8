//! Repository record model.
//!
//! A Repository binds a forge URL to a namespace and carries the per-repository
//! settings that drive matching, templating, concurrency and reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::ProviderKind;
use crate::error::{PacError, Result};

/// Default key looked up inside a provider token secret.
pub const DEFAULT_PROVIDER_TOKEN_KEY: &str = "provider.token";

/// Default key looked up inside a webhook secret.
pub const DEFAULT_WEBHOOK_SECRET_KEY: &str = "webhook.secret";

/// Reference to a key inside a namespaced secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
}

impl SecretRef {
    /// Key to read, falling back to the given default.
    pub fn key_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.key.as_deref().unwrap_or(default)
    }
}

/// Forge connection settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitProviderSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ProviderKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<SecretRef>,
}

/// How status comments are posted on pull/merge requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentStrategy {
    /// A new comment for every run.
    #[default]
    Append,
    /// One comment per candidate, updated in place.
    Update,
    /// No comments at all.
    #[serde(alias = "disabled_all")]
    DisableAll,
}

/// Per-forge comment settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgeCommentSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_strategy: Option<CommentStrategy>,
}

/// Teams allowed to issue each kind of ops-comment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ok_to_test: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retest: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pull_request: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancel: Vec<String>,
}

/// A prompt sent to the AI provider when a run fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiRole {
    pub name: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Failure analysis settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiAnalysis {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret_ref: Option<SecretRef>,
    #[serde(default)]
    pub roles: Vec<AiRole>,
}

/// Repository settings block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<ForgeCommentSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitlab: Option<ForgeCommentSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitea: Option<ForgeCommentSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitops_command_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_teams: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Policy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_analysis: Option<AiAnalysis>,
    /// Other repositories remote references may be read from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remote_scope_repos: Vec<String>,
}

/// A user-defined template parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
    /// CEL predicate over `{body, headers, pac}`; absent means always.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// An incoming webhook descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incoming {
    #[serde(rename = "type", default = "default_incoming_type")]
    pub kind: String,
    pub secret: SecretRef,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub params: Vec<String>,
}

fn default_incoming_type() -> String {
    "webhook-url".to_string()
}

/// User-facing Repository spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositorySpec {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_provider: Option<GitProviderSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Settings>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incomings: Vec<Incoming>,
}

/// Condition of a finished or running PipelineRun.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    /// `True`, `False` or `Unknown`.
    pub status: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One entry in the rolling Repository status list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRunStatus {
    pub pipeline_run_name: String,
    pub sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_url: Option<String>,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A Repository record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub namespace: String,
    pub name: String,
    pub spec: RepositorySpec,
    #[serde(default)]
    pub status: Vec<RepositoryRunStatus>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    /// Creates a new repository record for the given URL.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            namespace: namespace.into(),
            name: name.into(),
            spec: RepositorySpec {
                url: url.into(),
                ..Default::default()
            },
            status: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// `namespace/name`, the key used for per-record locks.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Validates the user-supplied parts of the record.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.namespace.trim().is_empty() {
            return Err(PacError::InvalidRepository(
                "namespace and name are required".to_string(),
            ));
        }
        let url = Url::parse(&self.spec.url).map_err(|e| {
            PacError::InvalidRepository(format!("invalid url {}: {}", self.spec.url, e))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(PacError::InvalidRepository(format!(
                "url scheme must be http or https, got {}",
                url.scheme()
            )));
        }
        for incoming in &self.spec.incomings {
            if incoming.kind != "webhook-url" {
                return Err(PacError::InvalidRepository(format!(
                    "unsupported incoming type {}",
                    incoming.kind
                )));
            }
            if incoming.targets.is_empty() {
                return Err(PacError::InvalidRepository(
                    "incoming webhook needs at least one target".to_string(),
                ));
            }
        }
        for param in &self.spec.params {
            if param.value.is_some() && param.secret_ref.is_some() {
                return Err(PacError::InvalidRepository(format!(
                    "param {} cannot set both value and secret_ref",
                    param.name
                )));
            }
        }
        Ok(())
    }

    /// Merges global defaults under this record. Per-repository values win.
    pub fn merge_global(&mut self, global: &RepositorySpec) {
        let spec = &mut self.spec;
        if spec.concurrency_limit.is_none() {
            spec.concurrency_limit = global.concurrency_limit;
        }

        spec.git_provider = match (spec.git_provider.take(), &global.git_provider) {
            (Some(mine), Some(theirs)) => Some(GitProviderSpec {
                url: mine.url.or_else(|| theirs.url.clone()),
                user: mine.user.or_else(|| theirs.user.clone()),
                kind: mine.kind.or(theirs.kind),
                secret: mine.secret.or_else(|| theirs.secret.clone()),
                webhook_secret: mine.webhook_secret.or_else(|| theirs.webhook_secret.clone()),
            }),
            (mine, theirs) => mine.or_else(|| theirs.clone()),
        };

        spec.settings = match (spec.settings.take(), &global.settings) {
            (Some(mine), Some(theirs)) => Some(Settings {
                github: mine.github.or_else(|| theirs.github.clone()),
                gitlab: mine.gitlab.or_else(|| theirs.gitlab.clone()),
                gitea: mine.gitea.or_else(|| theirs.gitea.clone()),
                gitops_command_prefix: mine
                    .gitops_command_prefix
                    .or_else(|| theirs.gitops_command_prefix.clone()),
                allowed_teams: if mine.allowed_teams.is_empty() {
                    theirs.allowed_teams.clone()
                } else {
                    mine.allowed_teams
                },
                policy: mine.policy.or_else(|| theirs.policy.clone()),
                ai_analysis: mine.ai_analysis.or_else(|| theirs.ai_analysis.clone()),
                remote_scope_repos: if mine.remote_scope_repos.is_empty() {
                    theirs.remote_scope_repos.clone()
                } else {
                    mine.remote_scope_repos
                },
            }),
            (mine, theirs) => mine.or_else(|| theirs.clone()),
        };

        for param in &global.params {
            if !spec.params.iter().any(|p| p.name == param.name) {
                spec.params.push(param.clone());
            }
        }

        if spec.incomings.is_empty() {
            spec.incomings = global.incomings.clone();
        }
    }

    /// Settings block, or defaults.
    pub fn settings(&self) -> Settings {
        self.spec.settings.clone().unwrap_or_default()
    }

    /// The comment strategy configured for the given forge.
    pub fn comment_strategy(&self, kind: ProviderKind) -> CommentStrategy {
        let Some(settings) = &self.spec.settings else {
            return CommentStrategy::Append;
        };
        let forge = match kind {
            ProviderKind::GitHub => settings.github.as_ref(),
            ProviderKind::GitLab => settings.gitlab.as_ref(),
            ProviderKind::Gitea => settings.gitea.as_ref(),
            _ => None,
        };
        forge
            .and_then(|f| f.comment_strategy)
            .unwrap_or(CommentStrategy::Append)
    }

    /// Forge kind: `git_provider.type` when set, otherwise guessed from the URL
    /// host. Self-hosted forges without a well-known host default to Gitea.
    pub fn provider_kind(&self) -> ProviderKind {
        if let Some(kind) = self.spec.git_provider.as_ref().and_then(|g| g.kind) {
            return kind;
        }
        let host = Url::parse(&self.spec.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        if host.contains("github") {
            ProviderKind::GitHub
        } else if host.contains("gitlab") {
            ProviderKind::GitLab
        } else if host == "bitbucket.org" {
            ProviderKind::BitbucketCloud
        } else if host == "dev.azure.com" || host.ends_with(".visualstudio.com") {
            ProviderKind::AzureDevOps
        } else {
            ProviderKind::Gitea
        }
    }

    /// Owner and name parsed from the URL path (the last segment is the name).
    pub fn url_coordinates(&self) -> Option<(String, String)> {
        let url = Url::parse(&self.spec.url).ok()?;
        let path = url.path().trim_matches('/').trim_end_matches(".git");
        let (owner, name) = path.rsplit_once('/')?;
        if owner.is_empty() || name.is_empty() {
            return None;
        }
        Some((owner.to_string(), name.to_string()))
    }

    /// Custom ops-comment prefix, if any.
    pub fn gitops_prefix(&self) -> Option<String> {
        self.spec
            .settings
            .as_ref()
            .and_then(|s| s.gitops_command_prefix.clone())
            .filter(|p| !p.trim().is_empty())
    }

    /// Prepends a status entry and trims the list to `max` entries.
    pub fn push_status(&mut self, entry: RepositoryRunStatus, max: usize) {
        self.status
            .retain(|s| s.pipeline_run_name != entry.pipeline_run_name);
        self.status.insert(0, entry);
        self.status.truncate(max.max(1));
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(name: &str) -> RepositoryRunStatus {
        RepositoryRunStatus {
            pipeline_run_name: name.to_string(),
            sha: "abc".to_string(),
            sha_url: None,
            title: None,
            log_url: None,
            event_type: "pull_request".to_string(),
            target_branch: None,
            start_time: None,
            completion_time: None,
            conditions: vec![],
        }
    }

    #[test]
    fn test_validate_url_scheme() {
        let repo = Repository::new("ns", "repo", "https://github.com/owner/repo");
        assert!(repo.validate().is_ok());

        let repo = Repository::new("ns", "repo", "ssh://github.com/owner/repo");
        assert!(repo.validate().is_err());

        let repo = Repository::new("ns", "repo", "not a url");
        assert!(repo.validate().is_err());
    }

    #[test]
    fn test_merge_global_repo_wins() {
        let mut repo = Repository::new("ns", "repo", "https://github.com/owner/repo");
        repo.spec.concurrency_limit = Some(2);
        repo.spec.params.push(Param {
            name: "shared".into(),
            value: Some("mine".into()),
            secret_ref: None,
            filter: None,
        });

        let global = RepositorySpec {
            url: String::new(),
            concurrency_limit: Some(10),
            git_provider: Some(GitProviderSpec {
                secret: Some(SecretRef {
                    name: "global-token".into(),
                    key: None,
                }),
                ..Default::default()
            }),
            settings: Some(Settings {
                gitops_command_prefix: Some("pac".into()),
                ..Default::default()
            }),
            params: vec![
                Param {
                    name: "shared".into(),
                    value: Some("global".into()),
                    secret_ref: None,
                    filter: None,
                },
                Param {
                    name: "extra".into(),
                    value: Some("global".into()),
                    secret_ref: None,
                    filter: None,
                },
            ],
            incomings: vec![],
        };

        repo.merge_global(&global);

        assert_eq!(repo.spec.concurrency_limit, Some(2));
        assert_eq!(repo.spec.params.len(), 2);
        assert_eq!(repo.spec.params[0].value.as_deref(), Some("mine"));
        assert_eq!(repo.gitops_prefix().as_deref(), Some("pac"));
        assert_eq!(
            repo.spec
                .git_provider
                .and_then(|g| g.secret)
                .map(|s| s.name)
                .as_deref(),
            Some("global-token")
        );
    }

    #[test]
    fn test_push_status_is_bounded_and_newest_first() {
        let mut repo = Repository::new("ns", "repo", "https://github.com/owner/repo");
        for i in 0..7 {
            repo.push_status(status(&format!("run-{}", i)), 5);
        }
        assert_eq!(repo.status.len(), 5);
        assert_eq!(repo.status[0].pipeline_run_name, "run-6");
        assert_eq!(repo.status[4].pipeline_run_name, "run-2");

        // Updating an existing entry moves it to the front without duplicating it.
        repo.push_status(status("run-4"), 5);
        assert_eq!(repo.status.len(), 5);
        assert_eq!(repo.status[0].pipeline_run_name, "run-4");
    }

    #[test]
    fn test_comment_strategy_lookup() {
        let mut repo = Repository::new("ns", "repo", "https://gitlab.com/g/p");
        assert_eq!(repo.comment_strategy(ProviderKind::GitLab), CommentStrategy::Append);
        repo.spec.settings = Some(Settings {
            gitlab: Some(ForgeCommentSettings {
                comment_strategy: Some(CommentStrategy::DisableAll),
            }),
            ..Default::default()
        });
        assert_eq!(
            repo.comment_strategy(ProviderKind::GitLab),
            CommentStrategy::DisableAll
        );
        assert_eq!(repo.comment_strategy(ProviderKind::GitHub), CommentStrategy::Append);
    }

    #[test]
    fn test_deserialize_spec_from_yaml() {
        let yaml = r#"
url: "https://gitea.example/pac/app"
concurrency_limit: 1
git_provider:
  type: gitea
  url: https://gitea.example
  secret: {name: gitea-token}
settings:
  gitea: {comment_strategy: update}
  policy:
    ok_to_test: [maintainers]
params:
  - name: company
    value: acme
  - name: token
    secret_ref: {name: creds, key: token}
    filter: pac.event_type == "pull_request"
incomings:
  - type: webhook-url
    secret: {name: incoming-secret, key: secret}
    targets: ["main", "feature-*"]
    params: [the_best_superhero_is]
"#;
        let spec: RepositorySpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.concurrency_limit, Some(1));
        assert_eq!(
            spec.git_provider.as_ref().and_then(|g| g.kind),
            Some(ProviderKind::Gitea)
        );
        assert_eq!(spec.params.len(), 2);
        assert_eq!(spec.incomings[0].targets, vec!["main", "feature-*"]);
        let settings = spec.settings.unwrap();
        assert_eq!(
            settings.gitea.and_then(|g| g.comment_strategy),
            Some(CommentStrategy::Update)
        );
    }
    #[test]
    fn test_provider_kind_and_coordinates() {
        let repo = Repository::new("ns", "r", "https://gitlab.com/group/sub/app");
        assert_eq!(repo.provider_kind(), ProviderKind::GitLab);
        assert_eq!(
            repo.url_coordinates(),
            Some(("group/sub".to_string(), "app".to_string()))
        );

        let mut repo = Repository::new("ns", "r", "https://git.example.com/pac/app");
        assert_eq!(repo.provider_kind(), ProviderKind::Gitea);
        repo.spec.git_provider = Some(GitProviderSpec {
            kind: Some(ProviderKind::BitbucketDatacenter),
            ..Default::default()
        });
        assert_eq!(repo.provider_kind(), ProviderKind::BitbucketDatacenter);
    }
}
