//! Azure DevOps service-hook normalization.

use serde::Deserialize;

use super::{ParseOutcome, WebhookRequest, branch_from_ref};
use crate::error::Result;
use crate::models::{Event, EventType, ProviderKind, TriggerType};

#[derive(Deserialize)]
struct Project {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Repository {
    name: String,
    project: Project,
    #[serde(default)]
    remote_url: Option<String>,
    #[serde(default)]
    web_url: Option<String>,
}

impl Repository {
    /// Web URL without the `org@` user info Azure puts in `remoteUrl`.
    fn browse_url(&self) -> String {
        let raw = self
            .web_url
            .clone()
            .or_else(|| self.remote_url.clone())
            .unwrap_or_default();
        match url::Url::parse(&raw) {
            Ok(mut parsed) => {
                let _ = parsed.set_username("");
                let _ = parsed.set_password(None);
                parsed.to_string().trim_end_matches('/').to_string()
            }
            Err(_) => raw,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Identity {
    #[serde(default)]
    unique_name: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

impl Identity {
    fn identity(&self) -> String {
        self.unique_name
            .clone()
            .or_else(|| self.display_name.clone())
            .unwrap_or_default()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitRef {
    commit_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    pull_request_id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    status: Option<String>,
    source_ref_name: String,
    target_ref_name: String,
    #[serde(default)]
    last_merge_source_commit: Option<CommitRef>,
    repository: Repository,
    created_by: Identity,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Comment {
    id: i64,
    content: String,
    author: Identity,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentResource {
    comment: Comment,
    pull_request: PullRequest,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefUpdate {
    name: String,
    new_object_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushCommit {
    commit_id: String,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushResource {
    ref_updates: Vec<RefUpdate>,
    #[serde(default)]
    commits: Vec<PushCommit>,
    repository: Repository,
    pushed_by: Identity,
}

#[derive(Deserialize)]
struct Envelope<T> {
    resource: T,
}

const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

/// Normalizes an Azure DevOps delivery.
pub fn parse(event_name: &str, request: &WebhookRequest) -> Result<ParseOutcome> {
    match event_name {
        "git.push" => parse_push(&request.body),
        "git.pullrequest.created" | "git.pullrequest.updated" => {
            let data: Envelope<PullRequest> = serde_json::from_slice(&request.body)?;
            let pr = data.resource;
            let (event_type, trigger) = match pr.status.as_deref() {
                Some("completed") | Some("abandoned") => {
                    (EventType::PullRequestClosed, TriggerType::PullRequestClosed)
                }
                _ => (EventType::PullRequest, TriggerType::PullRequest),
            };
            let sender = pr.created_by.identity();
            Ok(ParseOutcome::Event(Box::new(pull_request_event(
                pr, event_type, trigger, sender,
            ))))
        }
        "ms.vss-code.git-pullrequest-comment-event" => {
            let data: Envelope<CommentResource> = serde_json::from_slice(&request.body)?;
            let comment = data.resource.comment;
            let mut event = pull_request_event(
                data.resource.pull_request,
                EventType::OnComment,
                TriggerType::OnComment,
                comment.author.identity(),
            );
            event.trigger_comment = Some(comment.content);
            event.comment_id = Some(comment.id);
            Ok(ParseOutcome::Event(Box::new(event)))
        }
        other => Ok(ParseOutcome::Ignored(format!(
            "event \"{}\" is not supported",
            other
        ))),
    }
}

fn base_event(
    event_type: EventType,
    trigger: TriggerType,
    repository: &Repository,
    sender: String,
) -> Event {
    let mut event = Event::new(ProviderKind::AzureDevOps, event_type, trigger);
    event.organization = repository.project.name.clone();
    event.repository = repository.name.clone();
    event.url = repository.browse_url();
    event.clone_url = event.url.clone();
    event.head_url = event.url.clone();
    event.sender = sender;
    event
}

fn pull_request_event(
    pr: PullRequest,
    event_type: EventType,
    trigger: TriggerType,
    sender: String,
) -> Event {
    let mut event = base_event(event_type, trigger, &pr.repository, sender);
    event.base_branch = branch_from_ref(&pr.target_ref_name);
    event.head_branch = branch_from_ref(&pr.source_ref_name);
    if let Some(commit) = pr.last_merge_source_commit {
        event.sha_url = Some(format!("{}/commit/{}", event.url, commit.commit_id));
        event.sha = commit.commit_id;
    }
    event.pull_request_number = Some(pr.pull_request_id);
    event.pull_request_title = pr.title;
    event.pull_request_author = Some(pr.created_by.identity());
    event
}

fn parse_push(body: &[u8]) -> Result<ParseOutcome> {
    let data: Envelope<PushResource> = serde_json::from_slice(body)?;
    let push = data.resource;
    let Some(update) = push
        .ref_updates
        .into_iter()
        .find(|u| u.new_object_id != ZERO_SHA)
    else {
        return Ok(ParseOutcome::Ignored(
            "push only deletes refs".to_string(),
        ));
    };

    let event_type = if update.name.starts_with("refs/tags/") {
        EventType::Tag
    } else {
        EventType::Push
    };
    let mut event = base_event(
        event_type,
        TriggerType::Push,
        &push.repository,
        push.pushed_by.identity(),
    );
    event.base_branch = branch_from_ref(&update.name);
    event.head_branch = event.base_branch.clone();
    if let Some(commit) = push
        .commits
        .into_iter()
        .find(|c| c.commit_id == update.new_object_id)
    {
        event.sha_url = commit.url;
        event.sha_title = commit
            .comment
            .as_deref()
            .and_then(|m| m.lines().next())
            .map(str::to_string);
        event.head_commit_message = commit.comment;
    }
    event.sha = update.new_object_id;
    Ok(ParseOutcome::Event(Box::new(event)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: &str) -> WebhookRequest {
        WebhookRequest {
            body: body.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    fn event(outcome: ParseOutcome) -> Event {
        match outcome {
            ParseOutcome::Event(e) => *e,
            ParseOutcome::Ignored(reason) => panic!("ignored: {}", reason),
        }
    }

    const REPO: &str = r#"{"name": "repo", "project": {"name": "proj"},
        "remoteUrl": "https://org@dev.azure.com/org/proj/_git/repo"}"#;

    #[test]
    fn test_push() {
        let body = format!(
            r#"{{"eventType": "git.push", "resource": {{"repository": {},
              "pushedBy": {{"uniqueName": "alice@example.com"}},
              "refUpdates": [{{"name": "refs/heads/main", "newObjectId": "abc"}}],
              "commits": [{{"commitId": "abc", "comment": "fix it"}}]}}}}"#,
            REPO
        );
        let e = event(parse("git.push", &request(&body)).unwrap());
        assert_eq!(e.url, "https://dev.azure.com/org/proj/_git/repo");
        assert_eq!(e.organization, "proj");
        assert_eq!(e.base_branch, "main");
        assert_eq!(e.sha, "abc");
        assert_eq!(e.sha_title.as_deref(), Some("fix it"));
        assert_eq!(e.sender, "alice@example.com");
    }

    #[test]
    fn test_pull_request_and_comment() {
        let pr = format!(
            r#"{{"pullRequestId": 9, "title": "t", "status": "active",
              "sourceRefName": "refs/heads/feat", "targetRefName": "refs/heads/main",
              "lastMergeSourceCommit": {{"commitId": "abc"}}, "repository": {},
              "createdBy": {{"uniqueName": "bob"}}}}"#,
            REPO
        );
        let body = format!(r#"{{"resource": {}}}"#, pr);
        let e = event(parse("git.pullrequest.updated", &request(&body)).unwrap());
        assert_eq!(e.pull_request_number, Some(9));
        assert_eq!(e.head_branch, "feat");
        assert_eq!(e.event_type, EventType::PullRequest);

        let body = format!(
            r#"{{"resource": {{"comment": {{"id": 1, "content": "/test", "author": {{"uniqueName": "carol"}}}},
              "pullRequest": {}}}}}"#,
            pr
        );
        let e = event(parse("ms.vss-code.git-pullrequest-comment-event", &request(&body)).unwrap());
        assert_eq!(e.sender, "carol");
        assert_eq!(e.trigger_comment.as_deref(), Some("/test"));
    }
}
