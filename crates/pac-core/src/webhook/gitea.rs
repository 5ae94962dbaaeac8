//! Gitea (and Forgejo) payload normalization.

use serde::Deserialize;

use super::{ParseOutcome, WebhookRequest, branch_from_ref, push_event_type, split_full_name};
use crate::error::Result;
use crate::models::{Event, EventType, ProviderKind, TriggerType};

#[derive(Deserialize)]
struct Repository {
    full_name: String,
    html_url: String,
    #[serde(default)]
    clone_url: Option<String>,
    #[serde(default)]
    default_branch: Option<String>,
}

#[derive(Deserialize)]
struct User {
    login: String,
}

#[derive(Deserialize)]
struct Label {
    name: String,
}

#[derive(Deserialize)]
struct Branch {
    #[serde(rename = "ref")]
    ref_name: String,
    sha: String,
    #[serde(default)]
    repo: Option<Repository>,
}

#[derive(Deserialize)]
struct PullRequest {
    number: i64,
    #[serde(default)]
    title: Option<String>,
    user: User,
    head: Branch,
    base: Branch,
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    action: String,
    pull_request: PullRequest,
    repository: Repository,
    sender: User,
}

#[derive(Deserialize)]
struct Commit {
    id: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    ref_name: String,
    after: String,
    #[serde(default)]
    head_commit: Option<Commit>,
    repository: Repository,
    sender: User,
}

#[derive(Deserialize)]
struct Issue {
    number: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct Comment {
    id: i64,
    body: String,
}

#[derive(Deserialize)]
struct CommentPayload {
    action: String,
    issue: Issue,
    comment: Comment,
    repository: Repository,
    sender: User,
    #[serde(default)]
    is_pull: bool,
}

const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

/// Normalizes a Gitea delivery.
pub fn parse(event_name: &str, request: &WebhookRequest) -> Result<ParseOutcome> {
    match event_name {
        "pull_request" | "pull_request_label" => parse_pull_request(&request.body),
        "push" => parse_push(&request.body),
        "issue_comment" | "pull_request_comment" => parse_comment(&request.body),
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
    sender: &str,
) -> Result<Event> {
    let (organization, name) = split_full_name(&repository.full_name)?;
    let mut event = Event::new(ProviderKind::Gitea, event_type, trigger);
    event.organization = organization;
    event.repository = name;
    event.url = repository.html_url.clone();
    event.clone_url = repository
        .clone_url
        .clone()
        .unwrap_or_else(|| format!("{}.git", repository.html_url));
    event.sender = sender.to_string();
    Ok(event)
}

fn parse_pull_request(body: &[u8]) -> Result<ParseOutcome> {
    let data: PullRequestPayload = serde_json::from_slice(body)?;
    let (event_type, trigger) = match data.action.as_str() {
        "opened" | "synchronized" | "reopened" => {
            (EventType::PullRequest, TriggerType::PullRequest)
        }
        "label_updated" => (EventType::PullRequestLabeled, TriggerType::PullRequest),
        "closed" => (EventType::PullRequestClosed, TriggerType::PullRequestClosed),
        other => {
            return Ok(ParseOutcome::Ignored(format!(
                "pull_request action \"{}\" is not supported",
                other
            )));
        }
    };

    let pr = data.pull_request;
    let mut event = base_event(event_type, trigger, &data.repository, &data.sender.login)?;
    event.base_branch = pr.base.ref_name;
    event.head_branch = pr.head.ref_name;
    event.sha = pr.head.sha;
    event.sha_url = Some(format!("{}/commit/{}", data.repository.html_url, event.sha));
    event.pull_request_number = Some(pr.number);
    event.pull_request_title = pr.title;
    event.pull_request_author = Some(pr.user.login);
    event.pull_request_labels = pr.labels.into_iter().map(|l| l.name).collect();
    match pr.head.repo {
        Some(head) => {
            let (owner, name) = split_full_name(&head.full_name)?;
            event.head_organization = owner;
            event.head_repository = name;
            event.head_url = head.html_url;
        }
        None => event.head_url = event.url.clone(),
    }
    Ok(ParseOutcome::Event(Box::new(event)))
}

fn parse_push(body: &[u8]) -> Result<ParseOutcome> {
    let data: PushPayload = serde_json::from_slice(body)?;
    if data.after == ZERO_SHA {
        return Ok(ParseOutcome::Ignored(format!(
            "delete push on {} is not supported",
            data.ref_name
        )));
    }

    let mut event = base_event(
        push_event_type(&data.ref_name),
        TriggerType::Push,
        &data.repository,
        &data.sender.login,
    )?;
    event.base_branch = branch_from_ref(&data.ref_name);
    event.head_branch = event.base_branch.clone();
    event.head_url = event.url.clone();
    event.sha = data.after;
    if let Some(commit) = data.head_commit {
        event.sha_url = commit.url;
        event.sha_title = commit
            .message
            .as_deref()
            .and_then(|m| m.lines().next())
            .map(str::to_string);
        event.head_commit_message = commit.message;
    }
    Ok(ParseOutcome::Event(Box::new(event)))
}

fn parse_comment(body: &[u8]) -> Result<ParseOutcome> {
    let data: CommentPayload = serde_json::from_slice(body)?;
    if data.action != "created" {
        return Ok(ParseOutcome::Ignored(format!(
            "comment action \"{}\" is not supported",
            data.action
        )));
    }
    if !data.is_pull && data.issue.pull_request.is_none() {
        return Ok(ParseOutcome::Ignored(
            "comments on issues are not supported".to_string(),
        ));
    }

    let mut event = base_event(
        EventType::OnComment,
        TriggerType::OnComment,
        &data.repository,
        &data.sender.login,
    )?;
    event.pull_request_number = Some(data.issue.number);
    event.pull_request_title = data.issue.title;
    event.trigger_comment = Some(data.comment.body);
    event.comment_id = Some(data.comment.id);
    event.head_url = event.url.clone();
    if event.base_branch.is_empty() {
        event.base_branch = data.repository.default_branch.clone().unwrap_or_default();
    }
    Ok(ParseOutcome::Event(Box::new(event)))
}
