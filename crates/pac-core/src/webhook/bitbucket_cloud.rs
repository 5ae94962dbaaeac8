//! Bitbucket Cloud payload normalization.

use serde::Deserialize;

use super::{ParseOutcome, WebhookRequest, split_full_name};
use crate::error::Result;
use crate::models::{Event, EventType, ProviderKind, TriggerType};

#[derive(Deserialize)]
struct Href {
    href: String,
}

#[derive(Deserialize)]
struct Links {
    html: Href,
}

#[derive(Deserialize)]
struct Repository {
    full_name: String,
    links: Links,
}

#[derive(Deserialize)]
struct Actor {
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
}

impl Actor {
    /// Account id is what the ACL checks compare against.
    fn identity(&self) -> String {
        self.account_id
            .clone()
            .or_else(|| self.nickname.clone())
            .unwrap_or_default()
    }
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
struct Endpoint {
    branch: BranchName,
    commit: CommitHash,
    #[serde(default)]
    repository: Option<Repository>,
}

#[derive(Deserialize)]
struct PullRequest {
    id: i64,
    #[serde(default)]
    title: Option<String>,
    author: Actor,
    source: Endpoint,
    destination: Endpoint,
}

#[derive(Deserialize)]
struct Content {
    raw: String,
}

#[derive(Deserialize)]
struct Comment {
    id: i64,
    content: Content,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    pullrequest: PullRequest,
    repository: Repository,
    actor: Actor,
    #[serde(default)]
    comment: Option<Comment>,
}

#[derive(Deserialize)]
struct Target {
    hash: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    links: Option<Links>,
}

#[derive(Deserialize)]
struct RefState {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    target: Target,
}

#[derive(Deserialize)]
struct Change {
    #[serde(default)]
    new: Option<RefState>,
}

#[derive(Deserialize)]
struct Push {
    changes: Vec<Change>,
}

#[derive(Deserialize)]
struct PushPayload {
    push: Push,
    repository: Repository,
    actor: Actor,
}

/// Normalizes a Bitbucket Cloud delivery.
pub fn parse(event_name: &str, request: &WebhookRequest) -> Result<ParseOutcome> {
    let (event_type, trigger) = match event_name {
        "pullrequest:created" | "pullrequest:updated" => {
            (EventType::PullRequest, TriggerType::PullRequest)
        }
        "pullrequest:fulfilled" | "pullrequest:rejected" => {
            (EventType::PullRequestClosed, TriggerType::PullRequestClosed)
        }
        "pullrequest:comment_created" => (EventType::OnComment, TriggerType::OnComment),
        "repo:push" => return parse_push(&request.body),
        other => {
            return Ok(ParseOutcome::Ignored(format!(
                "event \"{}\" is not supported",
                other
            )));
        }
    };
    parse_pull_request(&request.body, event_type, trigger)
}

fn base_event(
    event_type: EventType,
    trigger: TriggerType,
    repository: &Repository,
    actor: &Actor,
) -> Result<Event> {
    let (organization, name) = split_full_name(&repository.full_name)?;
    let mut event = Event::new(ProviderKind::BitbucketCloud, event_type, trigger);
    event.organization = organization;
    event.repository = name;
    event.url = repository.links.html.href.clone();
    event.clone_url = format!("{}.git", event.url);
    event.sender = actor.identity();
    Ok(event)
}

fn parse_pull_request(
    body: &[u8],
    event_type: EventType,
    trigger: TriggerType,
) -> Result<ParseOutcome> {
    let data: PullRequestPayload = serde_json::from_slice(body)?;
    let pr = data.pullrequest;
    let mut event = base_event(event_type, trigger, &data.repository, &data.actor)?;
    event.base_branch = pr.destination.branch.name;
    event.head_branch = pr.source.branch.name;
    event.sha = pr.source.commit.hash;
    event.sha_url = Some(format!("{}/commits/{}", event.url, event.sha));
    event.pull_request_number = Some(pr.id);
    event.pull_request_title = pr.title;
    event.pull_request_author = Some(pr.author.identity());
    match pr.source.repository {
        Some(head) => {
            let (owner, name) = split_full_name(&head.full_name)?;
            event.head_organization = owner;
            event.head_repository = name;
            event.head_url = head.links.html.href;
        }
        None => event.head_url = event.url.clone(),
    }
    if let Some(comment) = data.comment {
        event.trigger_comment = Some(comment.content.raw);
        event.comment_id = Some(comment.id);
    }
    Ok(ParseOutcome::Event(Box::new(event)))
}

fn parse_push(body: &[u8]) -> Result<ParseOutcome> {
    let data: PushPayload = serde_json::from_slice(body)?;
    // The last change carrying a new ref state is the head of the push.
    let Some(new) = data.push.changes.into_iter().rev().find_map(|c| c.new) else {
        return Ok(ParseOutcome::Ignored(
            "push without new ref (branch deletion)".to_string(),
        ));
    };

    let event_type = if new.kind == "tag" {
        EventType::Tag
    } else {
        EventType::Push
    };
    let mut event = base_event(event_type, TriggerType::Push, &data.repository, &data.actor)?;
    event.base_branch = if new.kind == "tag" {
        format!("refs/tags/{}", new.name)
    } else {
        new.name
    };
    event.head_branch = event.base_branch.clone();
    event.head_url = event.url.clone();
    event.sha = new.target.hash;
    event.sha_url = new.target.links.map(|l| l.html.href);
    event.sha_title = new
        .target
        .message
        .as_deref()
        .and_then(|m| m.lines().next())
        .map(str::to_string);
    event.head_commit_message = new.target.message;
    Ok(ParseOutcome::Event(Box::new(event)))
}
