//! Gitea / Forgejo v1 API client.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{
    ChangeKind, Comment, CommitStatus, DirEntry, FileLocation, Provider, StatusState,
    group_changes, send_empty, send_json, send_text, short_description,
};
use crate::cel::ChangedFiles;
use crate::error::{PacError, Result};
use crate::models::{Event, ProviderKind, ProviderToken};

pub struct GiteaProvider {
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
    body: String,
}

#[derive(Deserialize)]
struct Permission {
    permission: String,
}

#[derive(Deserialize)]
struct Team {
    id: i64,
    name: String,
}

#[derive(Deserialize)]
struct TeamSearch {
    #[serde(default)]
    data: Vec<Team>,
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
    #[serde(default)]
    html_url: Option<String>,
    commit: CommitDetail,
}

impl GiteaProvider {
    pub fn new(client: reqwest::Client, api_url: String, token: ProviderToken) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches("/api/v1").to_string(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/api/v1{}", self.api_url, path))
            .header("Authorization", format!("token {}", self.token.expose()))
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
impl Provider for GiteaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gitea
    }

    async fn list_dir(&self, _event: &Event, location: &FileLocation) -> Result<Vec<DirEntry>> {
        let path = format!(
            "/repos/{}/contents/{}?ref={}",
            location.full_name(),
            location.path,
            urlencoding::encode(&location.reference)
        );
        let entries: Vec<ContentEntry> = match send_json("Gitea list contents", || self.get(&path)).await {
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
            "/repos/{}/raw/{}?ref={}",
            location.full_name(),
            location.path,
            urlencoding::encode(&location.reference)
        );
        send_text("Gitea get raw file", || self.get(&path)).await
    }

    async fn changed_files(&self, event: &Event) -> Result<ChangedFiles> {
        let files: Vec<ChangedFile> = match event.pull_request_number {
            Some(number) => {
                let path = format!("{}/pulls/{}/files?limit=100", Self::repo_path(event), number);
                send_json("Gitea pull request files", || self.get(&path)).await?
            }
            None => {
                let path = format!("{}/git/commits/{}", Self::repo_path(event), event.sha);
                let commit: CommitFiles = send_json("Gitea get commit", || self.get(&path)).await?;
                commit.files
            }
        };
        Ok(group_changes(
            files
                .into_iter()
                .map(|f| (ChangeKind::parse(&f.status), f.filename)),
        ))
    }

    async fn create_status(&self, event: &Event, status: &CommitStatus) -> Result<()> {
        let state = match status.state {
            StatusState::Pending | StatusState::Running => "pending",
            StatusState::Success => "success",
            StatusState::Failure => "failure",
            StatusState::Cancelled => "error",
            StatusState::Neutral => "warning",
        };
        let mut body = json!({
            "state": state,
            "context": status.name,
            "description": short_description(&status.summary, 255),
        });
        if let Some(url) = &status.details_url {
            body["target_url"] = json!(url);
        }
        let path = format!("{}/statuses/{}", Self::repo_path(event), event.sha);
        send_empty("Gitea create status", || {
            self.request(reqwest::Method::POST, &path).json(&body)
        })
        .await
    }

    async fn list_comments(&self, event: &Event) -> Result<Vec<Comment>> {
        let number = Self::pr_number(event)?;
        let path = format!("{}/issues/{}/comments", Self::repo_path(event), number);
        let comments: Vec<IssueComment> = send_json("Gitea list comments", || self.get(&path)).await?;
        Ok(comments
            .into_iter()
            .map(|c| Comment {
                id: c.id.to_string(),
                body: c.body,
            })
            .collect())
    }

    async fn create_comment(&self, event: &Event, body: &str) -> Result<String> {
        let number = Self::pr_number(event)?;
        let path = format!("{}/issues/{}/comments", Self::repo_path(event), number);
        let payload = json!({ "body": body });
        let comment: IssueComment = send_json("Gitea create comment", || {
            self.request(reqwest::Method::POST, &path).json(&payload)
        })
        .await?;
        Ok(comment.id.to_string())
    }

    async fn update_comment(&self, event: &Event, id: &str, body: &str) -> Result<()> {
        let path = format!("{}/issues/comments/{}", Self::repo_path(event), id);
        let payload = json!({ "body": body });
        send_empty("Gitea update comment", || {
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
        match send_json::<Permission, _>("Gitea collaborator permission", || self.get(&path)).await {
            Ok(p) => Ok(matches!(p.permission.as_str(), "admin" | "owner" | "write")),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_team_member(&self, event: &Event, team: &str, user: &str) -> Result<bool> {
        let (org, name) = team
            .split_once('/')
            .unwrap_or((event.organization.as_str(), team));
        let path = format!("/orgs/{}/teams/search?q={}", org, urlencoding::encode(name));
        let search: TeamSearch = send_json("Gitea search teams", || self.get(&path)).await?;
        let Some(team) = search.data.into_iter().find(|t| t.name == name) else {
            return Ok(false);
        };
        let path = format!("/teams/{}/members/{}", team.id, user);
        match send_empty("Gitea team member", || self.get(&path)).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn populate_pull_request(&self, event: &mut Event) -> Result<()> {
        let number = Self::pr_number(event)?;
        let path = format!("{}/pulls/{}", Self::repo_path(event), number);
        let pr: PullRequest = send_json("Gitea get pull request", || self.get(&path)).await?;
        event.sha = pr.head.sha;
        event.head_branch = pr.head.ref_name;
        event.base_branch = pr.base.ref_name;
        event.pull_request_title = Some(pr.title);
        event.pull_request_author = Some(pr.user.login);
        event.pull_request_labels = pr.labels.into_iter().map(|l| l.name).collect();
        event.sha_url = Some(format!("{}/commit/{}", event.url, event.sha));
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
            "{}/git/commits/{}",
            Self::repo_path(event),
            urlencoding::encode(&reference)
        );
        let commit: Commit = send_json("Gitea get commit", || self.get(&path)).await?;
        event.sha = commit.sha;
        event.sha_url = commit
            .html_url
            .or_else(|| Some(format!("{}/commit/{}", event.url, event.sha)));
        event.sha_title = commit.commit.message.lines().next().map(str::to_string);
        event.head_commit_message = Some(commit.commit.message);
        Ok(())
    }
}
