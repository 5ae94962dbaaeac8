//! Forge API clients.
//!
//! Every forge implements [`Provider`]; the event processor only sees
//! `Arc<dyn Provider>` handed out by a [`ProviderFactory`]. Files are always
//! read through the forge API, never through a local clone.

pub mod azure;
pub mod bitbucket_cloud;
pub mod bitbucket_dc;
pub mod gitea;
pub mod github;
pub mod gitlab;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use url::Url;

use crate::cel::ChangedFiles;
use crate::db::{DbPool, SecretRepo};
use crate::error::{PacError, Result};
use crate::models::{
    DEFAULT_PROVIDER_TOKEN_KEY, Event, ProviderInfo, ProviderKind, ProviderToken, Repository,
};
use crate::retry::{RetryConfig, retry_with_backoff};

pub use github::GitHubAppAuth;

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// One entry returned by a directory listing. `path` is repository-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: String,
    pub kind: EntryKind,
}

impl DirEntry {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Dir,
        }
    }
}

/// A file (or directory) at a given revision of some repository on the forge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    pub owner: String,
    pub repo: String,
    pub path: String,
    /// Commit SHA, branch or tag.
    pub reference: String,
}

impl FileLocation {
    /// `path` in the head repository at the event SHA (fork aware).
    pub fn head(event: &Event, path: &str) -> Self {
        let (owner, repo) = event.head_coordinates();
        Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            path: path.to_string(),
            reference: event.sha.clone(),
        }
    }

    /// `path` in the base repository on the base branch.
    pub fn base(event: &Event, path: &str) -> Self {
        Self {
            owner: event.organization.clone(),
            repo: event.repository.clone(),
            path: path.to_string(),
            reference: event.base_branch.clone(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// State of a commit status / check-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
    /// ACL refusal, reported as "Skipped".
    Neutral,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Pending => "pending",
            StatusState::Running => "in_progress",
            StatusState::Success => "success",
            StatusState::Failure => "failure",
            StatusState::Cancelled => "cancelled",
            StatusState::Neutral => "neutral",
        }
    }
}

/// A commit status to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitStatus {
    /// Context / check name, e.g. `Pipelines as Code CI / pipeline`.
    pub name: String,
    pub state: StatusState,
    pub title: String,
    /// Short description; forges truncate this.
    pub summary: String,
    /// Longer markdown body where the forge supports one (check-runs).
    pub text: Option<String>,
    pub details_url: Option<String>,
}

/// A pull-request comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: String,
    pub body: String,
}

/// Capability set every forge implements.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Lists one directory level.
    async fn list_dir(&self, event: &Event, location: &FileLocation) -> Result<Vec<DirEntry>>;

    /// Reads a file, falling back to the blob API for files the contents API
    /// refuses to inline.
    async fn fetch_file(&self, event: &Event, location: &FileLocation) -> Result<String>;

    /// Files changed by the pull request, or by the pushed commit.
    async fn changed_files(&self, event: &Event) -> Result<ChangedFiles>;

    async fn create_status(&self, event: &Event, status: &CommitStatus) -> Result<()>;

    async fn list_comments(&self, event: &Event) -> Result<Vec<Comment>>;

    /// Posts a comment on the pull request (or commit) and returns its id.
    async fn create_comment(&self, event: &Event, body: &str) -> Result<String>;

    async fn update_comment(&self, event: &Event, id: &str, body: &str) -> Result<()>;

    /// Whether `user` has write access (or more) on the base repository.
    async fn is_collaborator(&self, event: &Event, user: &str) -> Result<bool>;

    /// Whether `user` belongs to `team` (`org/team` or a team of the event org).
    async fn is_team_member(&self, _event: &Event, _team: &str, _user: &str) -> Result<bool> {
        Ok(false)
    }

    /// Fills head SHA, branches and labels of `event.pull_request_number`.
    async fn populate_pull_request(&self, event: &mut Event) -> Result<()>;

    /// Resolves the head SHA from the branch when missing, and the head commit
    /// message and URL.
    async fn commit_info(&self, event: &mut Event) -> Result<()>;

    /// Updates the comment whose body contains `marker`, or posts a new one.
    ///
    /// `marker` is matched as a literal. Forges without comment update always
    /// append.
    async fn create_or_update_comment(
        &self,
        event: &Event,
        marker: &str,
        body: &str,
    ) -> Result<String> {
        if !self.kind().supports_comment_update() {
            return self.create_comment(event, body).await;
        }
        let pattern = regex_lite::Regex::new(&regex_lite::escape(marker))
            .map_err(|e| PacError::Template(format!("invalid comment marker: {}", e)))?;
        let comments = self.list_comments(event).await?;
        if let Some(existing) = comments.iter().find(|c| pattern.is_match(&c.body)) {
            self.update_comment(event, &existing.id, body).await?;
            return Ok(existing.id.clone());
        }
        self.create_comment(event, body).await
    }
}

/// Hands out a connected provider for an event.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    /// Resolves credentials for `repo`, fills `event.provider_info` and
    /// returns a client bound to them.
    async fn connect(&self, event: &mut Event, repo: &Repository) -> Result<Arc<dyn Provider>>;
}

/// Factory for the real forge clients.
pub struct ForgeProviderFactory {
    pool: DbPool,
    client: reqwest::Client,
    github_app: Option<Arc<GitHubAppAuth>>,
}

impl ForgeProviderFactory {
    pub fn new(pool: DbPool, github_app: Option<Arc<GitHubAppAuth>>) -> Result<Self> {
        Ok(Self {
            pool,
            client: http_client()?,
            github_app,
        })
    }

    async fn token(&self, event: &Event, repo: &Repository, api_url: &str) -> Result<ProviderToken> {
        if let Some(secret) = repo.spec.git_provider.as_ref().and_then(|g| g.secret.as_ref()) {
            let value = SecretRepo::get_value(
                &self.pool,
                &repo.namespace,
                &secret.name,
                secret.key_or(DEFAULT_PROVIDER_TOKEN_KEY),
            )
            .await?;
            return Ok(ProviderToken::new(value));
        }
        if let (Some(app), Some(installation)) = (&self.github_app, event.installation_id) {
            return app.installation_token(api_url, installation).await;
        }
        Err(PacError::Configuration(format!(
            "no git_provider secret configured for repository {}",
            repo.key()
        )))
    }
}

#[async_trait]
impl ProviderFactory for ForgeProviderFactory {
    async fn connect(&self, event: &mut Event, repo: &Repository) -> Result<Arc<dyn Provider>> {
        let kind = event.provider.unwrap_or_else(|| repo.provider_kind());
        let git_provider = repo.spec.git_provider.clone().unwrap_or_default();
        let api_url = api_url(kind, git_provider.url.as_deref(), event)?;
        let token = self.token(event, repo, &api_url).await?;

        event.provider_info = ProviderInfo {
            token: Some(token.clone()),
            api_url: Some(api_url.clone()),
            user: git_provider.user.clone(),
        };

        let client = self.client.clone();
        let provider: Arc<dyn Provider> = match kind {
            ProviderKind::GitHub => Arc::new(github::GitHubProvider::new(client, api_url, token)),
            ProviderKind::GitLab => Arc::new(gitlab::GitLabProvider::new(client, api_url, token)),
            ProviderKind::Gitea => Arc::new(gitea::GiteaProvider::new(client, api_url, token)),
            ProviderKind::BitbucketCloud => Arc::new(bitbucket_cloud::BitbucketCloudProvider::new(
                client,
                api_url,
                token,
                git_provider.user,
            )),
            ProviderKind::BitbucketDatacenter => Arc::new(
                bitbucket_dc::BitbucketDataCenterProvider::new(client, api_url, token),
            ),
            ProviderKind::AzureDevOps => {
                Arc::new(azure::AzureDevOpsProvider::new(client, api_url, token))
            }
        };
        Ok(provider)
    }
}

/// API base URL for a forge.
///
/// `git_provider.url` wins. Otherwise GitHub uses the public API (or the
/// enterprise host of an app delivery), Bitbucket Cloud its public API, Azure
/// DevOps the organization URL, and self-hosted forges the event host.
pub fn api_url(kind: ProviderKind, configured: Option<&str>, event: &Event) -> Result<String> {
    if let Some(url) = configured.filter(|u| !u.trim().is_empty()) {
        return Ok(url.trim_end_matches('/').to_string());
    }
    let event_url = Url::parse(&event.url)
        .map_err(|e| PacError::Configuration(format!("invalid event url {}: {}", event.url, e)))?;
    let origin = format!(
        "{}://{}",
        event_url.scheme(),
        event_url.host_str().unwrap_or_default()
    );
    let origin = match event_url.port() {
        Some(port) => format!("{}:{}", origin, port),
        None => origin,
    };

    Ok(match kind {
        ProviderKind::GitHub => match &event.github_enterprise_host {
            Some(host) => format!("https://{}/api/v3", host),
            None if event_url.host_str() == Some("github.com") => {
                "https://api.github.com".to_string()
            }
            None => format!("{}/api/v3", origin),
        },
        ProviderKind::BitbucketCloud => "https://api.bitbucket.org/2.0".to_string(),
        ProviderKind::AzureDevOps => {
            let organization = event_url
                .path_segments()
                .and_then(|mut s| s.next())
                .unwrap_or_default()
                .to_string();
            format!("{}/{}", origin, organization)
        }
        ProviderKind::GitLab | ProviderKind::Gitea | ProviderKind::BitbucketDatacenter => origin,
    })
}

/// HTTP client shared by all forge clients.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent(concat!("pipelines-as-code/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| PacError::Configuration(format!("Failed to create HTTP client: {}", e)))
}

/// Turns a non-2xx answer into a provider error carrying the status.
async fn check(what: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(500).collect();
    Err(PacError::provider(
        status.as_u16(),
        format!("{} returned {}: {}", what, status, body),
    ))
}

/// Sends the request built by `build` with retries and decodes a JSON answer.
pub(crate) async fn send_json<T, F>(what: &str, build: F) -> Result<T>
where
    T: DeserializeOwned,
    F: Fn() -> reqwest::RequestBuilder,
{
    let text = send_text(what, build).await?;
    serde_json::from_str(&text).map_err(PacError::from)
}

/// Sends the request built by `build` with retries and returns the body.
pub(crate) async fn send_text<F>(what: &str, build: F) -> Result<String>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    retry_with_backoff(RetryConfig::DEFAULT, what, || {
        let request = build();
        async move {
            let response = check(what, request.send().await?).await?;
            Ok(response.text().await?)
        }
    })
    .await
}

/// Sends the request built by `build` with retries, ignoring the body.
pub(crate) async fn send_empty<F>(what: &str, build: F) -> Result<()>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    send_text(what, build).await.map(|_| ())
}

/// Decodes base64 content as returned by contents APIs (with line breaks).
pub(crate) fn decode_base64(content: &str) -> Result<String> {
    use base64::Engine;
    let cleaned: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(cleaned)
        .map_err(|e| PacError::transport(format!("invalid base64 content: {}", e)))?;
    String::from_utf8(bytes)
        .map_err(|e| PacError::Template(format!("file is not valid UTF-8: {}", e)))
}

/// Groups `(status, path)` pairs into the CEL `files` shape.
pub(crate) fn group_changes<I>(changes: I) -> ChangedFiles
where
    I: IntoIterator<Item = (ChangeKind, String)>,
{
    let mut files = ChangedFiles::default();
    for (kind, path) in changes {
        match kind {
            ChangeKind::Added => files.added.push(path.clone()),
            ChangeKind::Deleted => files.deleted.push(path.clone()),
            ChangeKind::Modified => files.modified.push(path.clone()),
            ChangeKind::Renamed => files.renamed.push(path.clone()),
        }
        files.all.push(path);
    }
    files
}

/// Normalized change type of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangeKind {
    Added,
    Deleted,
    Modified,
    Renamed,
}

impl ChangeKind {
    /// Maps the many spellings forges use.
    pub(crate) fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "added" | "add" | "new" => ChangeKind::Added,
            "removed" | "deleted" | "delete" => ChangeKind::Deleted,
            "renamed" | "rename" | "move" | "moved" | "copied" | "copy" => ChangeKind::Renamed,
            _ => ChangeKind::Modified,
        }
    }
}

/// Truncates a status description to what forges accept.
pub(crate) fn short_description(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, TriggerType};

    fn event(url: &str) -> Event {
        let mut event = Event::new(ProviderKind::GitHub, EventType::Push, TriggerType::Push);
        event.url = url.to_string();
        event
    }

    #[test]
    fn test_api_url_defaults() {
        assert_eq!(
            api_url(ProviderKind::GitHub, None, &event("https://github.com/o/r")).unwrap(),
            "https://api.github.com"
        );
        assert_eq!(
            api_url(ProviderKind::GitHub, None, &event("https://ghe.corp/o/r")).unwrap(),
            "https://ghe.corp/api/v3"
        );
        assert_eq!(
            api_url(ProviderKind::Gitea, None, &event("http://gitea:3000/pac/app")).unwrap(),
            "http://gitea:3000"
        );
        assert_eq!(
            api_url(
                ProviderKind::AzureDevOps,
                None,
                &event("https://dev.azure.com/org/proj/_git/repo")
            )
            .unwrap(),
            "https://dev.azure.com/org"
        );
        assert_eq!(
            api_url(ProviderKind::GitLab, Some("https://gl.corp/"), &event("https://x/o/r")).unwrap(),
            "https://gl.corp"
        );
    }

    #[test]
    fn test_group_changes() {
        let files = group_changes(vec![
            (ChangeKind::parse("added"), "a".to_string()),
            (ChangeKind::parse("MODIFY"), "b".to_string()),
            (ChangeKind::parse("renamed"), "c".to_string()),
        ]);
        assert_eq!(files.all, vec!["a", "b", "c"]);
        assert_eq!(files.added, vec!["a"]);
        assert_eq!(files.modified, vec!["b"]);
        assert_eq!(files.renamed, vec!["c"]);
    }

    #[test]
    fn test_decode_base64_with_newlines() {
        assert_eq!(decode_base64("aGVs\nbG8=\n").unwrap(), "hello");
    }

    #[test]
    fn test_short_description() {
        assert_eq!(short_description("abc", 10), "abc");
        assert_eq!(short_description("abcdefghijk", 6), "abc...");
    }
}
