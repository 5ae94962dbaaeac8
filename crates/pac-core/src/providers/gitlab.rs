//! GitLab v4 API client.

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

/// Developer access level; merge rights start here.
const DEVELOPER_ACCESS: i64 = 30;

pub struct GitLabProvider {
    client: reqwest::Client,
    api_url: String,
    token: ProviderToken,
}

#[derive(Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct Diff {
    new_path: String,
    #[serde(default)]
    new_file: bool,
    #[serde(default)]
    deleted_file: bool,
    #[serde(default)]
    renamed_file: bool,
}

impl Diff {
    fn change(&self) -> ChangeKind {
        if self.new_file {
            ChangeKind::Added
        } else if self.deleted_file {
            ChangeKind::Deleted
        } else if self.renamed_file {
            ChangeKind::Renamed
        } else {
            ChangeKind::Modified
        }
    }
}

#[derive(Deserialize)]
struct Note {
    id: i64,
    body: String,
    #[serde(default)]
    system: bool,
}

#[derive(Deserialize)]
struct UserRef {
    id: i64,
}

#[derive(Deserialize)]
struct Member {
    access_level: i64,
}

#[derive(Deserialize)]
struct Author {
    username: String,
}

#[derive(Deserialize)]
struct MergeRequest {
    sha: String,
    source_branch: String,
    target_branch: String,
    title: String,
    source_project_id: i64,
    target_project_id: i64,
    author: Author,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Deserialize)]
struct Commit {
    id: String,
    message: String,
    #[serde(default)]
    web_url: Option<String>,
}

impl GitLabProvider {
    pub fn new(client: reqwest::Client, api_url: String, token: ProviderToken) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches("/api/v4").to_string(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/api/v4{}", self.api_url, path))
            .header("PRIVATE-TOKEN", self.token.expose())
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::GET, path)
    }

    /// URL-encoded `group/project` path, accepted wherever a project id is.
    fn project_path(owner: &str, repo: &str) -> String {
        urlencoding::encode(&format!("{}/{}", owner, repo)).into_owned()
    }

    fn target_project(event: &Event) -> String {
        match event.target_project_id {
            Some(id) => id.to_string(),
            None => Self::project_path(&event.organization, &event.repository),
        }
    }

    /// Project where the head commit lives (the fork for fork MRs).
    fn source_project(event: &Event) -> String {
        match event.source_project_id {
            Some(id) => id.to_string(),
            None => Self::target_project(event),
        }
    }

    fn mr_iid(event: &Event) -> Result<i64> {
        event.pull_request_number.ok_or_else(|| {
            PacError::Unsupported("operation requires a merge request".to_string())
        })
    }

    async fn user_id(&self, username: &str) -> Result<Option<i64>> {
        let path = format!("/users?username={}", urlencoding::encode(username));
        let users: Vec<UserRef> = send_json("GitLab find user", || self.get(&path)).await?;
        Ok(users.first().map(|u| u.id))
    }
}

#[async_trait]
impl Provider for GitLabProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitLab
    }

    async fn list_dir(&self, _event: &Event, location: &FileLocation) -> Result<Vec<DirEntry>> {
        let path = format!(
            "/projects/{}/repository/tree?path={}&ref={}&per_page=100",
            Self::project_path(&location.owner, &location.repo),
            urlencoding::encode(&location.path),
            urlencoding::encode(&location.reference)
        );
        let entries: Vec<TreeEntry> = match send_json("GitLab list tree", || self.get(&path)).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(entries
            .into_iter()
            .filter_map(|e| match e.kind.as_str() {
                "blob" => Some(DirEntry::file(e.path)),
                "tree" => Some(DirEntry::dir(e.path)),
                _ => None,
            })
            .collect())
    }

    async fn fetch_file(&self, _event: &Event, location: &FileLocation) -> Result<String> {
        // The raw endpoint streams any size, no blob fallback needed.
        let path = format!(
            "/projects/{}/repository/files/{}/raw?ref={}",
            Self::project_path(&location.owner, &location.repo),
            urlencoding::encode(&location.path),
            urlencoding::encode(&location.reference)
        );
        send_text("GitLab get raw file", || self.get(&path)).await
    }

    async fn changed_files(&self, event: &Event) -> Result<ChangedFiles> {
        let diffs: Vec<Diff> = match event.pull_request_number {
            Some(iid) => {
                let path = format!(
                    "/projects/{}/merge_requests/{}/diffs?per_page=100",
                    Self::target_project(event),
                    iid
                );
                send_json("GitLab merge request diffs", || self.get(&path)).await?
            }
            None => {
                let path = format!(
                    "/projects/{}/repository/commits/{}/diff?per_page=100",
                    Self::target_project(event),
                    event.sha
                );
                send_json("GitLab commit diff", || self.get(&path)).await?
            }
        };
        Ok(group_changes(
            diffs.into_iter().map(|d| (d.change(), d.new_path.clone())),
        ))
    }

    async fn create_status(&self, event: &Event, status: &CommitStatus) -> Result<()> {
        let state = match status.state {
            StatusState::Pending => "pending",
            StatusState::Running => "running",
            StatusState::Success | StatusState::Neutral => "success",
            StatusState::Failure => "failed",
            StatusState::Cancelled => "canceled",
        };
        let mut body = json!({
            "state": state,
            "name": status.name,
            "description": short_description(&status.summary, 255),
        });
        if let Some(url) = &status.details_url {
            body["target_url"] = json!(url);
        }
        if event.is_pull_request() {
            body["ref"] = json!(event.head_branch);
        }
        // Statuses are set on the source project so fork MRs show them.
        let path = format!(
            "/projects/{}/statuses/{}",
            Self::source_project(event),
            event.sha
        );
        match send_empty("GitLab set commit status", || {
            self.request(reqwest::Method::POST, &path).json(&body)
        })
        .await
        {
            // GitLab refuses a transition to the state the commit already has.
            Err(PacError::Provider {
                status: Some(400), ..
            }) => Ok(()),
            other => other,
        }
    }

    async fn list_comments(&self, event: &Event) -> Result<Vec<Comment>> {
        let iid = Self::mr_iid(event)?;
        let path = format!(
            "/projects/{}/merge_requests/{}/notes?per_page=100",
            Self::target_project(event),
            iid
        );
        let notes: Vec<Note> = send_json("GitLab list notes", || self.get(&path)).await?;
        Ok(notes
            .into_iter()
            .filter(|n| !n.system)
            .map(|n| Comment {
                id: n.id.to_string(),
                body: n.body,
            })
            .collect())
    }

    async fn create_comment(&self, event: &Event, body: &str) -> Result<String> {
        let payload = json!({ "body": body });
        let path = match (event.pull_request_number, &event.discussion_id) {
            (Some(iid), Some(discussion)) => format!(
                "/projects/{}/merge_requests/{}/discussions/{}/notes",
                Self::target_project(event),
                iid,
                discussion
            ),
            (Some(iid), None) => format!(
                "/projects/{}/merge_requests/{}/notes",
                Self::target_project(event),
                iid
            ),
            (None, _) => {
                let path = format!(
                    "/projects/{}/repository/commits/{}/comments",
                    Self::target_project(event),
                    event.sha
                );
                let payload = json!({ "note": body });
                send_empty("GitLab commit comment", || {
                    self.request(reqwest::Method::POST, &path).json(&payload)
                })
                .await?;
                return Ok(String::new());
            }
        };
        let note: Note = send_json("GitLab create note", || {
            self.request(reqwest::Method::POST, &path).json(&payload)
        })
        .await?;
        Ok(note.id.to_string())
    }

    async fn update_comment(&self, event: &Event, id: &str, body: &str) -> Result<()> {
        let iid = Self::mr_iid(event)?;
        let path = format!(
            "/projects/{}/merge_requests/{}/notes/{}",
            Self::target_project(event),
            iid,
            id
        );
        let payload = json!({ "body": body });
        send_empty("GitLab update note", || {
            self.request(reqwest::Method::PUT, &path).json(&payload)
        })
        .await
    }

    async fn is_collaborator(&self, event: &Event, user: &str) -> Result<bool> {
        let Some(user_id) = self.user_id(user).await? else {
            return Ok(false);
        };
        let path = format!(
            "/projects/{}/members/all/{}",
            Self::target_project(event),
            user_id
        );
        match send_json::<Member, _>("GitLab project member", || self.get(&path)).await {
            Ok(member) => Ok(member.access_level >= DEVELOPER_ACCESS),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_team_member(&self, _event: &Event, team: &str, user: &str) -> Result<bool> {
        let Some(user_id) = self.user_id(user).await? else {
            return Ok(false);
        };
        let path = format!(
            "/groups/{}/members/all/{}",
            urlencoding::encode(team),
            user_id
        );
        match send_json::<Member, _>("GitLab group member", || self.get(&path)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn populate_pull_request(&self, event: &mut Event) -> Result<()> {
        let iid = Self::mr_iid(event)?;
        let path = format!(
            "/projects/{}/merge_requests/{}",
            Self::target_project(event),
            iid
        );
        let mr: MergeRequest = send_json("GitLab get merge request", || self.get(&path)).await?;
        event.sha = mr.sha;
        event.head_branch = mr.source_branch;
        event.base_branch = mr.target_branch;
        event.pull_request_title = Some(mr.title);
        event.pull_request_author = Some(mr.author.username);
        event.pull_request_labels = mr.labels;
        event.source_project_id = Some(mr.source_project_id);
        event.target_project_id = Some(mr.target_project_id);
        Ok(())
    }

    async fn commit_info(&self, event: &mut Event) -> Result<()> {
        let reference = if event.sha.is_empty() {
            event.head_branch.clone()
        } else {
            event.sha.clone()
        };
        let path = format!(
            "/projects/{}/repository/commits/{}",
            Self::source_project(event),
            urlencoding::encode(&reference)
        );
        let commit: Commit = send_json("GitLab get commit", || self.get(&path)).await?;
        event.sha = commit.id;
        event.sha_url = commit.web_url;
        event.sha_title = commit.message.lines().next().map(str::to_string);
        event.head_commit_message = Some(commit.message);
        Ok(())
    }
}
