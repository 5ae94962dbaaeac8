//! GitHub (App and webhook) API client.
//!
//! App installations report through check-runs, plain webhooks through commit
//! statuses. Installation tokens are cached process-wide and refreshed five
//! minutes before GitHub expires them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use super::{
    ChangeKind, Comment, CommitStatus, DirEntry, FileLocation, Provider, StatusState,
    decode_base64, group_changes, send_empty, send_json, short_description,
};
use crate::cel::ChangedFiles;
use crate::error::{PacError, Result};
use crate::models::{Event, ProviderKind, ProviderToken};

const API_VERSION: &str = "2022-11-28";
const ACCEPT: &str = "application/vnd.github+json";

/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN_MINUTES: i64 = 5;

#[derive(Clone)]
struct CachedToken {
    token: ProviderToken,
    expires_at: DateTime<Utc>,
}

/// GitHub App identity and installation-token cache.
pub struct GitHubAppAuth {
    app_id: String,
    private_key: SecretString,
    client: reqwest::Client,
    tokens: DashMap<i64, Arc<Mutex<Option<CachedToken>>>>,
}

impl GitHubAppAuth {
    pub fn new(app_id: impl Into<String>, private_key_pem: impl Into<String>) -> Result<Self> {
        Ok(Self {
            app_id: app_id.into(),
            private_key: SecretString::from(private_key_pem.into()),
            client: super::http_client()?,
            tokens: DashMap::new(),
        })
    }

    /// Loads the private key from a PEM file.
    pub fn from_key_file(app_id: impl Into<String>, path: &str) -> Result<Self> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            PacError::Configuration(format!("Cannot read GitHub App private key {}: {}", path, e))
        })?;
        Self::new(app_id, pem)
    }

    /// Signs the short-lived app JWT.
    fn app_jwt(&self) -> Result<String> {
        use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};

        #[derive(Serialize)]
        struct Claims {
            iat: i64,
            exp: i64,
            iss: String,
        }

        let now = Utc::now().timestamp();
        let claims = Claims {
            iat: now - 60,
            exp: now + 540,
            iss: self.app_id.clone(),
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.expose_secret().as_bytes())
            .map_err(|e| PacError::Configuration(format!("Invalid GitHub App private key: {}", e)))?;
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| PacError::AuthFail(format!("Failed to sign GitHub App JWT: {}", e)))
    }

    /// Returns a valid installation token, exchanging a new one when the cached
    /// token is missing or about to expire. Exchanges for one installation are
    /// serialized.
    pub async fn installation_token(&self, api_url: &str, installation_id: i64) -> Result<ProviderToken> {
        let slot = self
            .tokens
            .entry(installation_id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        let mut cached = slot.lock().await;

        if let Some(entry) = cached.as_ref() {
            if entry.expires_at - ChronoDuration::minutes(REFRESH_MARGIN_MINUTES) > Utc::now() {
                return Ok(entry.token.clone());
            }
        }

        #[derive(Deserialize)]
        struct AccessToken {
            token: String,
            expires_at: DateTime<Utc>,
        }

        let jwt = self.app_jwt()?;
        let url = format!("{}/app/installations/{}/access_tokens", api_url, installation_id);
        let response: AccessToken = send_json("GitHub installation token", || {
            self.client
                .post(&url)
                .bearer_auth(&jwt)
                .header("Accept", ACCEPT)
                .header("X-GitHub-Api-Version", API_VERSION)
        })
        .await
        .map_err(|e| match e {
            PacError::Provider {
                status: Some(401), ..
            } => PacError::AuthFail(format!(
                "GitHub refused the app credentials for installation {}",
                installation_id
            )),
            other => other,
        })?;

        tracing::debug!("Refreshed installation token for installation {}", installation_id);
        let token = ProviderToken::new(response.token);
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at: response.expires_at,
        });
        Ok(token)
    }

    /// Drops every cached token.
    pub fn clear(&self) {
        self.tokens.clear();
    }
}

/// GitHub REST client bound to one token.
pub struct GitHubProvider {
    client: reqwest::Client,
    api_url: String,
    token: ProviderToken,
}

#[derive(Deserialize)]
struct ContentEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct FileContent {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
    sha: String,
}

#[derive(Deserialize)]
struct Blob {
    content: String,
}

#[derive(Deserialize)]
struct ChangedFile {
    filename: String,
    status: String,
}

#[derive(Deserialize)]
struct CommitFiles {
    #[serde(default)]
    files: Vec<ChangedFile>,
}

#[derive(Deserialize)]
struct IssueComment {
    id: i64,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Deserialize)]
struct Created {
    id: i64,
}

#[derive(Deserialize)]
struct Permission {
    permission: String,
}

#[derive(Deserialize)]
struct Membership {
    state: String,
}

#[derive(Deserialize)]
struct RepoRef {
    full_name: String,
    html_url: String,
}

#[derive(Deserialize)]
struct Branch {
    #[serde(rename = "ref")]
    ref_name: String,
    sha: String,
    #[serde(default)]
    repo: Option<RepoRef>,
}

#[derive(Deserialize)]
struct Label {
    name: String,
}

#[derive(Deserialize)]
struct User {
    login: String,
}

#[derive(Deserialize)]
struct PullRequest {
    title: String,
    user: User,
    head: Branch,
    base: Branch,
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Deserialize)]
struct CommitDetail {
    message: String,
}

#[derive(Deserialize)]
struct Commit {
    sha: String,
    html_url: String,
    commit: CommitDetail,
}

impl GitHubProvider {
    pub fn new(client: reqwest::Client, api_url: String, token: ProviderToken) -> Self {
        Self {
            client,
            api_url,
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .bearer_auth(self.token.expose())
            .header("Accept", ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::GET, path)
    }

    fn repo_path(event: &Event) -> String {
        format!("/repos/{}/{}", event.organization, event.repository)
    }

    fn pr_number(event: &Event) -> Result<i64> {
        event.pull_request_number.ok_or_else(|| {
            PacError::Unsupported("operation requires a pull request".to_string())
        })
    }
}

#[async_trait]
impl Provider for GitHubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitHub
    }

    async fn list_dir(&self, _event: &Event, location: &FileLocation) -> Result<Vec<DirEntry>> {
        let path = format!(
            "/repos/{}/contents/{}?ref={}",
            location.full_name(),
            location.path,
            urlencoding::encode(&location.reference)
        );
        let entries: Vec<ContentEntry> = match send_json("GitHub list contents", || self.get(&path)).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(entries
            .into_iter()
            .filter_map(|e| match e.kind.as_str() {
                "file" => Some(DirEntry::file(e.path)),
                "dir" => Some(DirEntry::dir(e.path)),
                _ => None,
            })
            .collect())
    }

    async fn fetch_file(&self, _event: &Event, location: &FileLocation) -> Result<String> {
        let path = format!(
            "/repos/{}/contents/{}?ref={}",
            location.full_name(),
            location.path,
            urlencoding::encode(&location.reference)
        );
        let file: FileContent = send_json("GitHub get contents", || self.get(&path)).await?;
        match (file.encoding.as_deref(), file.content.as_deref()) {
            (Some("base64"), Some(content)) if !content.is_empty() => decode_base64(content),
            _ => {
                // Files over 1MB come back without content; read the blob.
                let path = format!("/repos/{}/git/blobs/{}", location.full_name(), file.sha);
                let blob: Blob = send_json("GitHub get blob", || self.get(&path)).await?;
                decode_base64(&blob.content)
            }
        }
    }

    async fn changed_files(&self, event: &Event) -> Result<ChangedFiles> {
        let mut changes = Vec::new();
        if let Some(number) = event.pull_request_number {
            let mut page = 1;
            loop {
                let path = format!(
                    "{}/pulls/{}/files?per_page=100&page={}",
                    Self::repo_path(event),
                    number,
                    page
                );
                let files: Vec<ChangedFile> =
                    send_json("GitHub list pull request files", || self.get(&path)).await?;
                let done = files.len() < 100;
                changes.extend(
                    files
                        .into_iter()
                        .map(|f| (ChangeKind::parse(&f.status), f.filename)),
                );
                if done {
                    break;
                }
                page += 1;
            }
        } else {
            let path = format!("{}/commits/{}", Self::repo_path(event), event.sha);
            let commit: CommitFiles = send_json("GitHub get commit", || self.get(&path)).await?;
            changes.extend(
                commit
                    .files
                    .into_iter()
                    .map(|f| (ChangeKind::parse(&f.status), f.filename)),
            );
        }
        Ok(group_changes(changes))
    }

    async fn create_status(&self, event: &Event, status: &CommitStatus) -> Result<()> {
        if event.installation_id.is_some() {
            let (run_status, conclusion) = match status.state {
                StatusState::Pending => ("queued", None),
                StatusState::Running => ("in_progress", None),
                StatusState::Success => ("completed", Some("success")),
                StatusState::Failure => ("completed", Some("failure")),
                StatusState::Cancelled => ("completed", Some("cancelled")),
                StatusState::Neutral => ("completed", Some("neutral")),
            };
            let mut body = json!({
                "name": status.name,
                "head_sha": event.sha,
                "status": run_status,
                "output": {
                    "title": status.title,
                    "summary": status.summary,
                    "text": status.text.clone().unwrap_or_default(),
                },
            });
            if let Some(conclusion) = conclusion {
                body["conclusion"] = json!(conclusion);
                body["completed_at"] = json!(Utc::now().to_rfc3339());
            }
            if let Some(url) = &status.details_url {
                body["details_url"] = json!(url);
            }
            let path = format!("{}/check-runs", Self::repo_path(event));
            return send_empty("GitHub create check-run", || {
                self.request(reqwest::Method::POST, &path).json(&body)
            })
            .await;
        }

        let state = match status.state {
            StatusState::Pending | StatusState::Running => "pending",
            StatusState::Success | StatusState::Neutral => "success",
            StatusState::Failure => "failure",
            StatusState::Cancelled => "error",
        };
        let mut body = json!({
            "state": state,
            "context": status.name,
            "description": short_description(&status.summary, 140),
        });
        if let Some(url) = &status.details_url {
            body["target_url"] = json!(url);
        }
        let path = format!("{}/statuses/{}", Self::repo_path(event), event.sha);
        send_empty("GitHub create commit status", || {
            self.request(reqwest::Method::POST, &path).json(&body)
        })
        .await
    }

    async fn list_comments(&self, event: &Event) -> Result<Vec<Comment>> {
        let number = Self::pr_number(event)?;
        let path = format!(
            "{}/issues/{}/comments?per_page=100",
            Self::repo_path(event),
            number
        );
        let comments: Vec<IssueComment> =
            send_json("GitHub list comments", || self.get(&path)).await?;
        Ok(comments
            .into_iter()
            .map(|c| Comment {
                id: c.id.to_string(),
                body: c.body.unwrap_or_default(),
            })
            .collect())
    }

    async fn create_comment(&self, event: &Event, body: &str) -> Result<String> {
        let path = match event.pull_request_number {
            Some(number) => format!("{}/issues/{}/comments", Self::repo_path(event), number),
            None => format!("{}/commits/{}/comments", Self::repo_path(event), event.sha),
        };
        let payload = json!({ "body": body });
        let created: Created = send_json("GitHub create comment", || {
            self.request(reqwest::Method::POST, &path).json(&payload)
        })
        .await?;
        Ok(created.id.to_string())
    }

    async fn update_comment(&self, event: &Event, id: &str, body: &str) -> Result<()> {
        let path = format!("{}/issues/comments/{}", Self::repo_path(event), id);
        let payload = json!({ "body": body });
        send_empty("GitHub update comment", || {
            self.request(reqwest::Method::PATCH, &path).json(&payload)
        })
        .await
    }

    async fn is_collaborator(&self, event: &Event, user: &str) -> Result<bool> {
        let path = format!(
            "{}/collaborators/{}/permission",
            Self::repo_path(event),
            user
        );
        match send_json::<Permission, _>("GitHub collaborator permission", || self.get(&path)).await {
            Ok(p) => Ok(matches!(p.permission.as_str(), "admin" | "write" | "maintain")),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_team_member(&self, event: &Event, team: &str, user: &str) -> Result<bool> {
        let (org, slug) = team
            .split_once('/')
            .unwrap_or((event.organization.as_str(), team));
        let path = format!("/orgs/{}/teams/{}/memberships/{}", org, slug, user);
        match send_json::<Membership, _>("GitHub team membership", || self.get(&path)).await {
            Ok(m) => Ok(m.state == "active"),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn populate_pull_request(&self, event: &mut Event) -> Result<()> {
        let number = Self::pr_number(event)?;
        let path = format!("{}/pulls/{}", Self::repo_path(event), number);
        let pr: PullRequest = send_json("GitHub get pull request", || self.get(&path)).await?;
        event.sha = pr.head.sha;
        event.head_branch = pr.head.ref_name;
        event.base_branch = pr.base.ref_name;
        event.pull_request_title = Some(pr.title);
        event.pull_request_author = Some(pr.user.login);
        event.pull_request_labels = pr.labels.into_iter().map(|l| l.name).collect();
        if let Some(head) = pr.head.repo {
            if let Some((owner, name)) = head.full_name.rsplit_once('/') {
                event.head_organization = owner.to_string();
                event.head_repository = name.to_string();
            }
            event.head_url = head.html_url;
        }
        Ok(())
    }

    async fn commit_info(&self, event: &mut Event) -> Result<()> {
        let reference = if event.sha.is_empty() {
            event.head_branch.clone()
        } else {
            event.sha.clone()
        };
        let path = format!(
            "{}/commits/{}",
            Self::repo_path(event),
            urlencoding::encode(&reference)
        );
        let commit: Commit = send_json("GitHub get commit", || self.get(&path)).await?;
        event.sha = commit.sha;
        event.sha_url = Some(commit.html_url);
        event.sha_title = commit.commit.message.lines().next().map(str::to_string);
        event.head_commit_message = Some(commit.commit.message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_key_file_is_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a pem").unwrap();

        let auth = GitHubAppAuth::from_key_file("12345", file.path().to_str().unwrap()).unwrap();
        assert_eq!(auth.private_key.expose_secret().trim(), "not a pem");

        // Garbage keys only fail once a JWT is signed.
        let err = auth.app_jwt().unwrap_err();
        assert!(matches!(err, PacError::Configuration(_)));
    }

    #[test]
    fn test_missing_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.pem");

        let err = GitHubAppAuth::from_key_file("12345", path.to_str().unwrap()).err().unwrap();
        assert!(err.to_string().contains("missing.pem"));
    }
}
