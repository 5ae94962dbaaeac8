//! Bitbucket Cloud 2.0 API client.

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

pub struct BitbucketCloudProvider {
    client: reqwest::Client,
    api_url: String,
    token: ProviderToken,
    /// With a user, the token is an app password used with basic auth.
    user: Option<String>,
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize)]
struct SrcEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct PathRef {
    path: String,
}

#[derive(Deserialize)]
struct DiffStat {
    status: String,
    #[serde(default)]
    new: Option<PathRef>,
    #[serde(default)]
    old: Option<PathRef>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    raw: String,
}

#[derive(Deserialize)]
struct PrComment {
    id: i64,
    content: Content,
}

#[derive(Deserialize)]
struct RepoPermission {
    permission: String,
}

#[derive(Deserialize)]
struct BranchName {
    name: String,
}

#[derive(Deserialize)]
struct CommitHash {
    hash: String,
}

#[derive(Deserialize)]
struct Href {
    href: String,
}

#[derive(Deserialize)]
struct Links {
    html: Href,
}

#[derive(Deserialize)]
struct RepoRef {
    full_name: String,
    links: Links,
}

#[derive(Deserialize)]
struct Endpoint {
    branch: BranchName,
    commit: CommitHash,
    #[serde(default)]
    repository: Option<RepoRef>,
}

#[derive(Deserialize)]
struct Account {
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
}

#[derive(Deserialize)]
struct PullRequest {
    title: String,
    author: Account,
    source: Endpoint,
    destination: Endpoint,
}

#[derive(Deserialize)]
struct Commit {
    hash: String,
    message: String,
    links: Links,
}

impl BitbucketCloudProvider {
    pub fn new(
        client: reqwest::Client,
        api_url: String,
        token: ProviderToken,
        user: Option<String>,
    ) -> Self {
        Self {
            client,
            api_url,
            token,
            user,
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let url = if url.starts_with("http") {
            url.to_string()
        } else {
            format!("{}{}", self.api_url, url)
        };
        let builder = self.client.request(method, url);
        match &self.user {
            Some(user) => builder.basic_auth(user, Some(self.token.expose())),
            None => builder.bearer_auth(self.token.expose()),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::GET, path)
    }

    fn repo_path(event: &Event) -> String {
        format!("/repositories/{}/{}", event.organization, event.repository)
    }

    fn pr_id(event: &Event) -> Result<i64> {
        event.pull_request_number.ok_or_else(|| {
            PacError::Unsupported("operation requires a pull request".to_string())
        })
    }

    /// Follows `next` links until the last page.
    async fn collect<T: serde::de::DeserializeOwned>(&self, what: &str, first: String) -> Result<Vec<T>> {
        let mut values = Vec::new();
        let mut next = Some(first);
        while let Some(url) = next {
            let page: Page<T> = send_json(what, || self.get(&url)).await?;
            values.extend(page.values);
            next = page.next;
        }
        Ok(values)
    }
}

#[async_trait]
impl Provider for BitbucketCloudProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::BitbucketCloud
    }

    async fn list_dir(&self, _event: &Event, location: &FileLocation) -> Result<Vec<DirEntry>> {
        let path = format!(
            "/repositories/{}/src/{}/{}/",
            location.full_name(),
            location.reference,
            location.path.trim_end_matches('/')
        );
        let entries: Vec<SrcEntry> = match self.collect("Bitbucket Cloud list source", path).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(entries
            .into_iter()
            .filter_map(|e| match e.kind.as_str() {
                "commit_file" => Some(DirEntry::file(e.path)),
                "commit_directory" => Some(DirEntry::dir(e.path)),
                _ => None,
            })
            .collect())
    }

    async fn fetch_file(&self, _event: &Event, location: &FileLocation) -> Result<String> {
        let path = format!(
            "/repositories/{}/src/{}/{}",
            location.full_name(),
            location.reference,
            location.path
        );
        send_text("Bitbucket Cloud get file", || self.get(&path)).await
    }

    async fn changed_files(&self, event: &Event) -> Result<ChangedFiles> {
        let first = match event.pull_request_number {
            Some(id) => format!("{}/pullrequests/{}/diffstat", Self::repo_path(event), id),
            None => format!("{}/diffstat/{}", Self::repo_path(event), event.sha),
        };
        let stats: Vec<DiffStat> = self.collect("Bitbucket Cloud diffstat", first).await?;
        Ok(group_changes(stats.into_iter().filter_map(|s| {
            let path = s.new.or(s.old)?.path;
            Some((ChangeKind::parse(&s.status), path))
        })))
    }

    async fn create_status(&self, event: &Event, status: &CommitStatus) -> Result<()> {
        let state = match status.state {
            StatusState::Pending | StatusState::Running => "INPROGRESS",
            StatusState::Success | StatusState::Neutral => "SUCCESSFUL",
            StatusState::Failure => "FAILED",
            StatusState::Cancelled => "STOPPED",
        };
        // Bitbucket limits keys to 40 characters.
        let key: String = status.name.chars().take(40).collect();
        let body = json!({
            "state": state,
            "key": key,
            "name": status.name,
            "description": short_description(&status.summary, 255),
            "url": status.details_url.clone().unwrap_or_else(|| event.url.clone()),
        });
        let path = format!(
            "{}/commit/{}/statuses/build",
            Self::repo_path(event),
            event.sha
        );
        send_empty("Bitbucket Cloud create status", || {
            self.request(reqwest::Method::POST, &path).json(&body)
        })
        .await
    }

    async fn list_comments(&self, event: &Event) -> Result<Vec<Comment>> {
        let id = Self::pr_id(event)?;
        let first = format!("{}/pullrequests/{}/comments", Self::repo_path(event), id);
        let comments: Vec<PrComment> = self.collect("Bitbucket Cloud list comments", first).await?;
        Ok(comments
            .into_iter()
            .map(|c| Comment {
                id: c.id.to_string(),
                body: c.content.raw,
            })
            .collect())
    }

    async fn create_comment(&self, event: &Event, body: &str) -> Result<String> {
        let id = Self::pr_id(event)?;
        let path = format!("{}/pullrequests/{}/comments", Self::repo_path(event), id);
        let payload = json!({ "content": { "raw": body } });
        let comment: PrComment = send_json("Bitbucket Cloud create comment", || {
            self.request(reqwest::Method::POST, &path).json(&payload)
        })
        .await?;
        Ok(comment.id.to_string())
    }

    async fn update_comment(&self, event: &Event, comment_id: &str, body: &str) -> Result<()> {
        let id = Self::pr_id(event)?;
        let path = format!(
            "{}/pullrequests/{}/comments/{}",
            Self::repo_path(event),
            id,
            comment_id
        );
        let payload = json!({ "content": { "raw": body } });
        send_empty("Bitbucket Cloud update comment", || {
            self.request(reqwest::Method::PUT, &path).json(&payload)
        })
        .await
    }

    async fn is_collaborator(&self, event: &Event, user: &str) -> Result<bool> {
        let query = urlencoding::encode(&format!("user.account_id=\"{}\"", user)).into_owned();
        let first = format!(
            "/workspaces/{}/permissions/repositories/{}?q={}",
            event.organization, event.repository, query
        );
        let permissions: Vec<RepoPermission> =
            self.collect("Bitbucket Cloud repository permissions", first).await?;
        Ok(permissions
            .iter()
            .any(|p| p.permission == "admin" || p.permission == "write"))
    }

    async fn populate_pull_request(&self, event: &mut Event) -> Result<()> {
        let id = Self::pr_id(event)?;
        let path = format!("{}/pullrequests/{}", Self::repo_path(event), id);
        let pr: PullRequest = send_json("Bitbucket Cloud get pull request", || self.get(&path)).await?;
        event.sha = pr.source.commit.hash;
        event.head_branch = pr.source.branch.name;
        event.base_branch = pr.destination.branch.name;
        event.pull_request_title = Some(pr.title);
        event.pull_request_author = pr.author.account_id.or(pr.author.nickname);
        if let Some(head) = pr.source.repository {
            if let Some((owner, name)) = head.full_name.rsplit_once('/') {
                event.head_organization = owner.to_string();
                event.head_repository = name.to_string();
            }
            event.head_url = head.links.html.href;
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
            "{}/commit/{}",
            Self::repo_path(event),
            urlencoding::encode(&reference)
        );
        let commit: Commit = send_json("Bitbucket Cloud get commit", || self.get(&path)).await?;
        event.sha = commit.hash;
        event.sha_url = Some(commit.links.html.href);
        event.sha_title = commit.message.lines().next().map(str::to_string);
        event.head_commit_message = Some(commit.message);
        Ok(())
    }
}
