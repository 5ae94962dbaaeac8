//! Azure DevOps Git REST client.
//!
//! Comments are pull-request threads; an id is `thread:comment`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{
    ChangeKind, Comment, CommitStatus, DirEntry, FileLocation, Provider, StatusState,
    group_changes, send_empty, send_json, short_description,
};
use crate::cel::ChangedFiles;
use crate::error::{PacError, Result};
use crate::models::{Event, ProviderKind, ProviderToken};

const API_VERSION: &str = "7.1";

pub struct AzureDevOpsProvider {
    client: reqwest::Client,
    /// `https://dev.azure.com/<organization>`.
    org_url: String,
    token: ProviderToken,
}

#[derive(Deserialize)]
struct List<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Item {
    path: String,
    #[serde(default)]
    is_folder: bool,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChangeItem {
    path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeEntry {
    item: ChangeItem,
    change_type: String,
}

#[derive(Deserialize)]
struct CommitChanges {
    #[serde(default)]
    changes: Vec<ChangeEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IterationChanges {
    #[serde(default)]
    change_entries: Vec<ChangeEntry>,
}

#[derive(Deserialize)]
struct Iteration {
    id: i64,
}

#[derive(Deserialize)]
struct ThreadComment {
    id: i64,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Thread {
    id: i64,
    #[serde(default)]
    comments: Vec<ThreadComment>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Identity {
    #[serde(default)]
    unique_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitRef {
    commit_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    title: String,
    source_ref_name: String,
    target_ref_name: String,
    last_merge_source_commit: CommitRef,
    created_by: Identity,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Commit {
    commit_id: String,
    comment: String,
    #[serde(default)]
    remote_url: Option<String>,
}

impl AzureDevOpsProvider {
    pub fn new(client: reqwest::Client, api_url: String, token: ProviderToken) -> Self {
        Self {
            client,
            org_url: api_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let separator = if path.contains('?') { '&' } else { '?' };
        self.client
            .request(
                method,
                format!("{}{}{}api-version={}", self.org_url, path, separator, API_VERSION),
            )
            .basic_auth("", Some(self.token.expose()))
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::GET, path)
    }

    fn repo_path(project: &str, repo: &str) -> String {
        format!(
            "/{}/_apis/git/repositories/{}",
            urlencoding::encode(project),
            urlencoding::encode(repo)
        )
    }

    fn event_repo(event: &Event) -> String {
        Self::repo_path(&event.organization, &event.repository)
    }

    fn pr_id(event: &Event) -> Result<i64> {
        event.pull_request_number.ok_or_else(|| {
            PacError::Unsupported("operation requires a pull request".to_string())
        })
    }

    /// Azure accepts commit SHAs and branch names as different version types.
    fn version_query(reference: &str) -> String {
        let is_sha = reference.len() == 40 && reference.chars().all(|c| c.is_ascii_hexdigit());
        let kind = if is_sha { "commit" } else { "branch" };
        format!(
            "versionDescriptor.version={}&versionDescriptor.versionType={}",
            urlencoding::encode(reference),
            kind
        )
    }
}

#[async_trait]
impl Provider for AzureDevOpsProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AzureDevOps
    }

    async fn list_dir(&self, _event: &Event, location: &FileLocation) -> Result<Vec<DirEntry>> {
        let scope = format!("/{}", location.path.trim_matches('/'));
        let path = format!(
            "{}/items?scopePath={}&recursionLevel=OneLevel&{}",
            Self::repo_path(&location.owner, &location.repo),
            urlencoding::encode(&scope),
            Self::version_query(&location.reference)
        );
        let items: List<Item> = match send_json("Azure DevOps list items", || self.get(&path)).await {
            Ok(items) => items,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(items
            .value
            .into_iter()
            .filter(|i| i.path != scope)
            .map(|i| {
                let path = i.path.trim_start_matches('/').to_string();
                if i.is_folder {
                    DirEntry::dir(path)
                } else {
                    DirEntry::file(path)
                }
            })
            .collect())
    }

    async fn fetch_file(&self, _event: &Event, location: &FileLocation) -> Result<String> {
        let path = format!(
            "{}/items?path={}&includeContent=true&{}",
            Self::repo_path(&location.owner, &location.repo),
            urlencoding::encode(&format!("/{}", location.path.trim_start_matches('/'))),
            Self::version_query(&location.reference)
        );
        let item: Item = send_json("Azure DevOps get item", || self.get(&path)).await?;
        Ok(item.content.unwrap_or_default())
    }

    async fn changed_files(&self, event: &Event) -> Result<ChangedFiles> {
        let entries = match event.pull_request_number {
            Some(id) => {
                let path = format!("{}/pullRequests/{}/iterations", Self::event_repo(event), id);
                let iterations: List<Iteration> =
                    send_json("Azure DevOps list iterations", || self.get(&path)).await?;
                let Some(last) = iterations.value.iter().map(|i| i.id).max() else {
                    return Ok(ChangedFiles::default());
                };
                let path = format!(
                    "{}/pullRequests/{}/iterations/{}/changes",
                    Self::event_repo(event),
                    id,
                    last
                );
                let changes: IterationChanges =
                    send_json("Azure DevOps iteration changes", || self.get(&path)).await?;
                changes.change_entries
            }
            None => {
                let path = format!("{}/commits/{}/changes", Self::event_repo(event), event.sha);
                let changes: CommitChanges =
                    send_json("Azure DevOps commit changes", || self.get(&path)).await?;
                changes.changes
            }
        };
        Ok(group_changes(entries.into_iter().map(|e| {
            (
                ChangeKind::parse(&e.change_type),
                e.item.path.trim_start_matches('/').to_string(),
            )
        })))
    }

    async fn create_status(&self, event: &Event, status: &CommitStatus) -> Result<()> {
        let state = match status.state {
            StatusState::Pending | StatusState::Running => "pending",
            StatusState::Success | StatusState::Neutral => "succeeded",
            StatusState::Failure => "failed",
            StatusState::Cancelled => "error",
        };
        let mut body = json!({
            "state": state,
            "description": short_description(&status.summary, 255),
            "context": { "name": status.name, "genre": "pipelines-as-code" },
        });
        if let Some(url) = &status.details_url {
            body["targetUrl"] = json!(url);
        }
        let path = format!("{}/commits/{}/statuses", Self::event_repo(event), event.sha);
        send_empty("Azure DevOps create status", || {
            self.request(reqwest::Method::POST, &path).json(&body)
        })
        .await
    }

    async fn list_comments(&self, event: &Event) -> Result<Vec<Comment>> {
        let id = Self::pr_id(event)?;
        let path = format!("{}/pullRequests/{}/threads", Self::event_repo(event), id);
        let threads: List<Thread> = send_json("Azure DevOps list threads", || self.get(&path)).await?;
        Ok(threads
            .value
            .into_iter()
            .flat_map(|t| {
                let thread = t.id;
                t.comments.into_iter().map(move |c| Comment {
                    id: format!("{}:{}", thread, c.id),
                    body: c.content.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn create_comment(&self, event: &Event, body: &str) -> Result<String> {
        let id = Self::pr_id(event)?;
        let path = format!("{}/pullRequests/{}/threads", Self::event_repo(event), id);
        let payload = json!({
            "comments": [{ "parentCommentId": 0, "content": body, "commentType": 1 }],
            "status": 1,
        });
        let thread: Thread = send_json("Azure DevOps create thread", || {
            self.request(reqwest::Method::POST, &path).json(&payload)
        })
        .await?;
        let comment = thread.comments.first().map(|c| c.id).unwrap_or(1);
        Ok(format!("{}:{}", thread.id, comment))
    }

    async fn update_comment(&self, event: &Event, id: &str, body: &str) -> Result<()> {
        let pr = Self::pr_id(event)?;
        let (thread, comment) = id.split_once(':').ok_or_else(|| {
            PacError::Unsupported(format!("malformed Azure DevOps comment id {}", id))
        })?;
        let path = format!(
            "{}/pullRequests/{}/threads/{}/comments/{}",
            Self::event_repo(event),
            pr,
            thread,
            comment
        );
        let payload = json!({ "content": body });
        send_empty("Azure DevOps update comment", || {
            self.request(reqwest::Method::PATCH, &path).json(&payload)
        })
        .await
    }

    /// Service hooks only fire for project members; every sender is treated as
    /// one.
    async fn is_collaborator(&self, _event: &Event, user: &str) -> Result<bool> {
        Ok(!user.is_empty())
    }

    async fn populate_pull_request(&self, event: &mut Event) -> Result<()> {
        let id = Self::pr_id(event)?;
        let path = format!("{}/pullRequests/{}", Self::event_repo(event), id);
        let pr: PullRequest = send_json("Azure DevOps get pull request", || self.get(&path)).await?;
        event.sha = pr.last_merge_source_commit.commit_id;
        event.head_branch = crate::webhook::branch_from_ref(&pr.source_ref_name);
        event.base_branch = crate::webhook::branch_from_ref(&pr.target_ref_name);
        event.pull_request_title = Some(pr.title);
        event.pull_request_author = pr.created_by.unique_name;
        Ok(())
    }

    async fn commit_info(&self, event: &mut Event) -> Result<()> {
        if event.sha.is_empty() {
            let path = format!(
                "{}/commits?searchCriteria.itemVersion.version={}&$top=1",
                Self::event_repo(event),
                urlencoding::encode(&event.head_branch)
            );
            let commits: List<Commit> =
                send_json("Azure DevOps list commits", || self.get(&path)).await?;
            let Some(commit) = commits.value.into_iter().next() else {
                return Err(PacError::RemoteFetch {
                    path: event.head_branch.clone(),
                    message: "branch has no commits".to_string(),
                });
            };
            event.sha = commit.commit_id;
        }
        let path = format!("{}/commits/{}", Self::event_repo(event), event.sha);
        let commit: Commit = send_json("Azure DevOps get commit", || self.get(&path)).await?;
        event.sha_url = commit
            .remote_url
            .or_else(|| Some(format!("{}/commit/{}", event.url, commit.commit_id)));
        event.sha_title = commit.comment.lines().next().map(str::to_string);
        event.head_commit_message = Some(commit.comment);
        Ok(())
    }
}
