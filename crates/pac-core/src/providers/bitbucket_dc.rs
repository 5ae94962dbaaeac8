//! Bitbucket Data Center REST client.

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

const PAGE_LIMIT: usize = 1000;

pub struct BitbucketDataCenterProvider {
    client: reqwest::Client,
    /// Server root, without `/rest`.
    base_url: String,
    token: ProviderToken,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
    #[serde(default = "default_last_page")]
    is_last_page: bool,
    #[serde(default)]
    next_page_start: Option<usize>,
}

fn default_last_page() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePath {
    to_string: String,
}

#[derive(Deserialize)]
struct Change {
    path: ChangePath,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct PrComment {
    id: i64,
    text: String,
    #[serde(default)]
    version: i64,
}

#[derive(Deserialize)]
struct Activity {
    action: String,
    #[serde(default)]
    comment: Option<PrComment>,
}

#[derive(Deserialize)]
struct UserRef {
    name: String,
    #[serde(default)]
    slug: Option<String>,
}

#[derive(Deserialize)]
struct UserPermission {
    user: UserRef,
    permission: String,
}

#[derive(Deserialize)]
struct Participant {
    user: UserRef,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrRef {
    display_id: String,
    latest_commit: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    title: String,
    from_ref: PrRef,
    to_ref: PrRef,
    author: Participant,
}

#[derive(Deserialize)]
struct Commit {
    id: String,
    message: String,
}

impl BitbucketDataCenterProvider {
    pub fn new(client: reqwest::Client, api_url: String, token: ProviderToken) -> Self {
        let base_url = api_url
            .trim_end_matches('/')
            .trim_end_matches("/rest/api/1.0")
            .trim_end_matches("/rest")
            .to_string();
        Self {
            client,
            base_url,
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(self.token.expose())
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::GET, path)
    }

    fn repo_path(owner: &str, repo: &str) -> String {
        format!("/rest/api/1.0/projects/{}/repos/{}", owner, repo)
    }

    fn event_repo(event: &Event) -> String {
        Self::repo_path(&event.organization, &event.repository)
    }

    fn pr_id(event: &Event) -> Result<i64> {
        event.pull_request_number.ok_or_else(|| {
            PacError::Unsupported("operation requires a pull request".to_string())
        })
    }

    /// Pages through `start`/`limit` results.
    async fn collect<T: serde::de::DeserializeOwned>(&self, what: &str, path: &str) -> Result<Vec<T>> {
        let separator = if path.contains('?') { '&' } else { '?' };
        let mut values = Vec::new();
        let mut start = 0;
        loop {
            let url = format!("{}{}start={}&limit={}", path, separator, start, PAGE_LIMIT);
            let page: Page<T> = send_json(what, || self.get(&url)).await?;
            values.extend(page.values);
            match (page.is_last_page, page.next_page_start) {
                (false, Some(next)) => start = next,
                _ => break,
            }
        }
        Ok(values)
    }
}

#[async_trait]
impl Provider for BitbucketDataCenterProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::BitbucketDatacenter
    }

    /// The files endpoint lists recursively; nested paths are reported as
    /// files directly.
    async fn list_dir(&self, _event: &Event, location: &FileLocation) -> Result<Vec<DirEntry>> {
        let dir = location.path.trim_end_matches('/');
        let path = format!(
            "{}/files/{}?at={}",
            Self::repo_path(&location.owner, &location.repo),
            dir,
            urlencoding::encode(&location.reference)
        );
        let files: Vec<String> = match self.collect("Bitbucket Data Center list files", &path).await {
            Ok(files) => files,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(files
            .into_iter()
            .map(|f| DirEntry::file(format!("{}/{}", dir, f)))
            .collect())
    }

    async fn fetch_file(&self, _event: &Event, location: &FileLocation) -> Result<String> {
        let path = format!(
            "{}/raw/{}?at={}",
            Self::repo_path(&location.owner, &location.repo),
            location.path,
            urlencoding::encode(&location.reference)
        );
        send_text("Bitbucket Data Center get raw file", || self.get(&path)).await
    }

    async fn changed_files(&self, event: &Event) -> Result<ChangedFiles> {
        let path = match event.pull_request_number {
            Some(id) => format!("{}/pull-requests/{}/changes", Self::event_repo(event), id),
            None => format!("{}/commits/{}/changes", Self::event_repo(event), event.sha),
        };
        let changes: Vec<Change> = self.collect("Bitbucket Data Center changes", &path).await?;
        Ok(group_changes(
            changes
                .into_iter()
                .map(|c| (ChangeKind::parse(&c.kind), c.path.to_string)),
        ))
    }

    async fn create_status(&self, event: &Event, status: &CommitStatus) -> Result<()> {
        let state = match status.state {
            StatusState::Pending | StatusState::Running => "INPROGRESS",
            StatusState::Success | StatusState::Neutral => "SUCCESSFUL",
            StatusState::Failure | StatusState::Cancelled => "FAILED",
        };
        let body = json!({
            "state": state,
            "key": status.name,
            "name": status.name,
            "description": short_description(&status.summary, 255),
            "url": status.details_url.clone().unwrap_or_else(|| event.url.clone()),
        });
        let path = format!("/rest/build-status/1.0/commits/{}", event.sha);
        send_empty("Bitbucket Data Center build status", || {
            self.request(reqwest::Method::POST, &path).json(&body)
        })
        .await
    }

    async fn list_comments(&self, event: &Event) -> Result<Vec<Comment>> {
        let id = Self::pr_id(event)?;
        let path = format!("{}/pull-requests/{}/activities", Self::event_repo(event), id);
        let activities: Vec<Activity> =
            self.collect("Bitbucket Data Center activities", &path).await?;
        Ok(activities
            .into_iter()
            .filter(|a| a.action == "COMMENTED")
            .filter_map(|a| a.comment)
            .map(|c| Comment {
                id: c.id.to_string(),
                body: c.text,
            })
            .collect())
    }

    async fn create_comment(&self, event: &Event, body: &str) -> Result<String> {
        let id = Self::pr_id(event)?;
        let path = format!("{}/pull-requests/{}/comments", Self::event_repo(event), id);
        let payload = json!({ "text": body });
        let comment: PrComment = send_json("Bitbucket Data Center create comment", || {
            self.request(reqwest::Method::POST, &path).json(&payload)
        })
        .await?;
        Ok(comment.id.to_string())
    }

    /// Updates need the current comment version.
    async fn update_comment(&self, event: &Event, comment_id: &str, body: &str) -> Result<()> {
        let id = Self::pr_id(event)?;
        let path = format!(
            "{}/pull-requests/{}/comments/{}",
            Self::event_repo(event),
            id,
            comment_id
        );
        let current: PrComment =
            send_json("Bitbucket Data Center get comment", || self.get(&path)).await?;
        let payload = json!({ "text": body, "version": current.version });
        send_empty("Bitbucket Data Center update comment", || {
            self.request(reqwest::Method::PUT, &path).json(&payload)
        })
        .await
    }

    async fn is_collaborator(&self, event: &Event, user: &str) -> Result<bool> {
        let path = format!(
            "{}/permissions/users?filter={}",
            Self::event_repo(event),
            urlencoding::encode(user)
        );
        let permissions: Vec<UserPermission> =
            self.collect("Bitbucket Data Center permissions", &path).await?;
        Ok(permissions.iter().any(|p| {
            (p.user.slug.as_deref() == Some(user) || p.user.name == user)
                && matches!(p.permission.as_str(), "REPO_WRITE" | "REPO_ADMIN")
        }))
    }

    async fn populate_pull_request(&self, event: &mut Event) -> Result<()> {
        let id = Self::pr_id(event)?;
        let path = format!("{}/pull-requests/{}", Self::event_repo(event), id);
        let pr: PullRequest =
            send_json("Bitbucket Data Center get pull request", || self.get(&path)).await?;
        event.sha = pr.from_ref.latest_commit;
        event.head_branch = pr.from_ref.display_id;
        event.base_branch = pr.to_ref.display_id;
        event.pull_request_title = Some(pr.title);
        event.pull_request_author = Some(pr.author.user.slug.unwrap_or(pr.author.user.name));
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
            Self::event_repo(event),
            urlencoding::encode(&reference)
        );
        let commit: Commit = send_json("Bitbucket Data Center get commit", || self.get(&path)).await?;
        event.sha_url = Some(format!("{}/commits/{}", event.url, commit.id));
        event.sha = commit.id;
        event.sha_title = commit.message.lines().next().map(str::to_string);
        event.head_commit_message = Some(commit.message);
        Ok(())
    }
}
