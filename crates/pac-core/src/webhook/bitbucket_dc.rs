//! Bitbucket Data Center payload normalization.

use serde::Deserialize;

use super::{ParseOutcome, WebhookRequest, branch_from_ref};
use crate::error::{PacError, Result};
use crate::models::{Event, EventType, ProviderKind, TriggerType};

#[derive(Deserialize)]
struct Link {
    href: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize, Default)]
struct Links {
    #[serde(rename = "self", default)]
    self_links: Vec<Link>,
    #[serde(default)]
    clone: Vec<Link>,
}

#[derive(Deserialize)]
struct Project {
    key: String,
}

#[derive(Deserialize)]
struct Repository {
    slug: String,
    project: Project,
    #[serde(default)]
    links: Links,
}

impl Repository {
    /// Browse URL without the trailing `/browse`.
    fn web_url(&self) -> Result<String> {
        let link = self.links.self_links.first().ok_or_else(|| {
            PacError::InvalidWebhookPayload(format!(
                "repository {}/{} has no self link",
                self.project.key, self.slug
            ))
        })?;
        Ok(link
            .href
            .strip_suffix("/browse")
            .unwrap_or(&link.href)
            .to_string())
    }

    fn clone_url(&self) -> Option<String> {
        self.links
            .clone
            .iter()
            .find(|l| l.name.as_deref() == Some("http"))
            .map(|l| l.href.clone())
    }
}

#[derive(Deserialize)]
struct User {
    name: String,
    #[serde(default)]
    slug: Option<String>,
}

impl User {
    fn identity(&self) -> String {
        self.slug.clone().unwrap_or_else(|| self.name.clone())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrRef {
    display_id: String,
    latest_commit: String,
    repository: Repository,
}

#[derive(Deserialize)]
struct Participant {
    user: User,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    id: i64,
    #[serde(default)]
    title: Option<String>,
    from_ref: PrRef,
    to_ref: PrRef,
    author: Participant,
}

#[derive(Deserialize)]
struct Comment {
    id: i64,
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestPayload {
    actor: User,
    pull_request: PullRequest,
    #[serde(default)]
    comment: Option<Comment>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefInfo {
    id: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefChange {
    #[serde(rename = "ref")]
    reference: RefInfo,
    to_hash: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct PushPayload {
    actor: User,
    repository: Repository,
    changes: Vec<RefChange>,
}

/// Normalizes a Bitbucket Data Center delivery.
pub fn parse(event_name: &str, request: &WebhookRequest) -> Result<ParseOutcome> {
    let (event_type, trigger) = match event_name {
        "pr:opened" | "pr:from_ref_updated" => (EventType::PullRequest, TriggerType::PullRequest),
        "pr:declined" | "pr:merged" | "pr:deleted" => {
            (EventType::PullRequestClosed, TriggerType::PullRequestClosed)
        }
        "pr:comment:added" => (EventType::OnComment, TriggerType::OnComment),
        "repo:refs_changed" => return parse_push(&request.body),
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
    actor: &User,
) -> Result<Event> {
    let mut event = Event::new(ProviderKind::BitbucketDatacenter, event_type, trigger);
    event.organization = repository.project.key.clone();
    event.repository = repository.slug.clone();
    event.url = repository.web_url()?;
    event.clone_url = repository
        .clone_url()
        .unwrap_or_else(|| format!("{}.git", event.url));
    event.sender = actor.identity();
    Ok(event)
}

fn parse_pull_request(
    body: &[u8],
    event_type: EventType,
    trigger: TriggerType,
) -> Result<ParseOutcome> {
    let data: PullRequestPayload = serde_json::from_slice(body)?;
    let pr = data.pull_request;
    let mut event = base_event(event_type, trigger, &pr.to_ref.repository, &data.actor)?;
    event.base_branch = pr.to_ref.display_id;
    event.head_branch = pr.from_ref.display_id;
    event.sha = pr.from_ref.latest_commit;
    event.sha_url = Some(format!("{}/commits/{}", event.url, event.sha));
    event.pull_request_number = Some(pr.id);
    event.pull_request_title = pr.title;
    event.pull_request_author = Some(pr.author.user.identity());
    event.head_organization = pr.from_ref.repository.project.key.clone();
    event.head_repository = pr.from_ref.repository.slug.clone();
    event.head_url = pr.from_ref.repository.web_url()?;
    if let Some(comment) = data.comment {
        event.trigger_comment = Some(comment.text);
        event.comment_id = Some(comment.id);
    }
    Ok(ParseOutcome::Event(Box::new(event)))
}

fn parse_push(body: &[u8]) -> Result<ParseOutcome> {
    let data: PushPayload = serde_json::from_slice(body)?;
    let Some(change) = data
        .changes
        .into_iter()
        .rev()
        .find(|c| c.kind != "DELETE")
    else {
        return Ok(ParseOutcome::Ignored(
            "push only deletes refs".to_string(),
        ));
    };

    let is_tag = change.reference.kind.as_deref() == Some("TAG")
        || change.reference.id.starts_with("refs/tags/");
    let event_type = if is_tag { EventType::Tag } else { EventType::Push };
    let mut event = base_event(event_type, TriggerType::Push, &data.repository, &data.actor)?;
    event.base_branch = branch_from_ref(&change.reference.id);
    event.head_branch = event.base_branch.clone();
    event.head_url = event.url.clone();
    event.sha = change.to_hash;
    event.sha_url = Some(format!("{}/commits/{}", event.url, event.sha));
    Ok(ParseOutcome::Event(Box::new(event)))
}
