//! GitLab payload normalization.

use serde::Deserialize;

use super::{ParseOutcome, WebhookRequest, branch_from_ref, push_event_type, split_full_name};
use crate::error::Result;
use crate::models::{Event, EventType, ProviderKind, TriggerType};

#[derive(Deserialize)]
struct Project {
    id: i64,
    path_with_namespace: String,
    web_url: String,
    #[serde(default)]
    git_http_url: Option<String>,
    #[serde(default)]
    default_branch: Option<String>,
}

#[derive(Deserialize)]
struct User {
    username: String,
}

#[derive(Deserialize)]
struct Commit {
    id: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct Label {
    title: String,
}

#[derive(Deserialize)]
struct SourceProject {
    web_url: String,
    path_with_namespace: String,
}

#[derive(Deserialize)]
struct MergeRequestAttributes {
    iid: i64,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    oldrev: Option<String>,
    #[serde(default)]
    title: Option<String>,
    source_branch: String,
    target_branch: String,
    source_project_id: i64,
    target_project_id: i64,
    last_commit: Commit,
    #[serde(default)]
    source: Option<SourceProject>,
}

#[derive(Deserialize)]
struct MergeRequestChanges {
    #[serde(default)]
    labels: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct MergeRequestPayload {
    object_attributes: MergeRequestAttributes,
    project: Project,
    user: User,
    #[serde(default)]
    labels: Vec<Label>,
    #[serde(default)]
    changes: Option<MergeRequestChanges>,
}

#[derive(Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    ref_name: String,
    #[serde(default)]
    checkout_sha: Option<String>,
    #[serde(default)]
    after: Option<String>,
    user_username: String,
    project: Project,
    #[serde(default)]
    commits: Vec<Commit>,
}

#[derive(Deserialize)]
struct NoteAttributes {
    id: i64,
    note: String,
    noteable_type: String,
    #[serde(default)]
    discussion_id: Option<String>,
    #[serde(default)]
    commit_id: Option<String>,
}

#[derive(Deserialize)]
struct NoteMergeRequest {
    iid: i64,
    #[serde(default)]
    title: Option<String>,
    source_branch: String,
    target_branch: String,
    source_project_id: i64,
    target_project_id: i64,
    last_commit: Commit,
    #[serde(default)]
    source: Option<SourceProject>,
}

#[derive(Deserialize)]
struct NotePayload {
    object_attributes: NoteAttributes,
    project: Project,
    user: User,
    #[serde(default)]
    merge_request: Option<NoteMergeRequest>,
}

/// Normalizes a GitLab delivery.
pub fn parse(event_name: &str, request: &WebhookRequest) -> Result<ParseOutcome> {
    match event_name {
        "Merge Request Hook" => parse_merge_request(&request.body),
        "Push Hook" | "Tag Push Hook" => parse_push(&request.body),
        "Note Hook" => parse_note(&request.body),
        other => Ok(ParseOutcome::Ignored(format!(
            "event \"{}\" is not supported",
            other
        ))),
    }
}

fn base_event(
    event_type: EventType,
    trigger: TriggerType,
    project: &Project,
    sender: &str,
) -> Result<Event> {
    let (organization, name) = split_full_name(&project.path_with_namespace)?;
    let mut event = Event::new(ProviderKind::GitLab, event_type, trigger);
    event.organization = organization;
    event.repository = name;
    event.url = project.web_url.clone();
    event.clone_url = project
        .git_http_url
        .clone()
        .unwrap_or_else(|| format!("{}.git", project.web_url));
    event.sender = sender.to_string();
    event.target_project_id = Some(project.id);
    event.source_project_id = Some(project.id);
    Ok(event)
}

fn apply_source(event: &mut Event, source: Option<SourceProject>) -> Result<()> {
    match source {
        Some(source) => {
            let (owner, name) = split_full_name(&source.path_with_namespace)?;
            event.head_organization = owner;
            event.head_repository = name;
            event.head_url = source.web_url;
        }
        None => event.head_url = event.url.clone(),
    }
    Ok(())
}

fn parse_merge_request(body: &[u8]) -> Result<ParseOutcome> {
    let data: MergeRequestPayload = serde_json::from_slice(body)?;
    let attrs = data.object_attributes;
    let labels_changed = data
        .changes
        .as_ref()
        .and_then(|c| c.labels.as_ref())
        .is_some();

    let action = attrs.action.clone().unwrap_or_default();
    let (event_type, trigger) = match action.as_str() {
        "open" | "reopen" => (EventType::PullRequest, TriggerType::PullRequest),
        // An update without a new head revision is metadata only.
        "update" if attrs.oldrev.is_some() => (EventType::PullRequest, TriggerType::PullRequest),
        "update" if labels_changed => (EventType::PullRequestLabeled, TriggerType::PullRequest),
        "close" | "merge" => (EventType::PullRequestClosed, TriggerType::PullRequestClosed),
        other => {
            return Ok(ParseOutcome::Ignored(format!(
                "merge request action \"{}\" is not supported",
                other
            )));
        }
    };

    let mut event = base_event(event_type, trigger, &data.project, &data.user.username)?;
    event.base_branch = attrs.target_branch;
    event.head_branch = attrs.source_branch;
    event.sha = attrs.last_commit.id;
    event.sha_url = attrs.last_commit.url;
    event.sha_title = attrs.last_commit.title;
    event.head_commit_message = attrs.last_commit.message;
    event.pull_request_number = Some(attrs.iid);
    event.pull_request_title = attrs.title;
    event.pull_request_author = Some(data.user.username.clone());
    event.pull_request_labels = data.labels.into_iter().map(|l| l.title).collect();
    event.source_project_id = Some(attrs.source_project_id);
    event.target_project_id = Some(attrs.target_project_id);
    apply_source(&mut event, attrs.source)?;
    Ok(ParseOutcome::Event(Box::new(event)))
}

fn parse_push(body: &[u8]) -> Result<ParseOutcome> {
    let data: PushPayload = serde_json::from_slice(body)?;
    let Some(sha) = data.checkout_sha.clone().filter(|s| !s.is_empty()) else {
        return Ok(ParseOutcome::Ignored(format!(
            "delete push on {} is not supported",
            data.ref_name
        )));
    };

    let mut event = base_event(
        push_event_type(&data.ref_name),
        TriggerType::Push,
        &data.project,
        &data.user_username,
    )?;
    event.base_branch = branch_from_ref(&data.ref_name);
    event.head_branch = event.base_branch.clone();
    event.head_url = event.url.clone();
    // The head commit is the one matching checkout_sha, usually the last.
    let head = data
        .commits
        .into_iter()
        .rev()
        .find(|c| c.id == sha || data.after.as_deref() == Some(c.id.as_str()));
    if let Some(commit) = head {
        event.sha_url = commit.url;
        event.sha_title = commit
            .title
            .or_else(|| commit.message.as_deref().and_then(|m| m.lines().next()).map(str::to_string));
        event.head_commit_message = commit.message;
    }
    event.sha = sha;
    Ok(ParseOutcome::Event(Box::new(event)))
}

fn parse_note(body: &[u8]) -> Result<ParseOutcome> {
    let data: NotePayload = serde_json::from_slice(body)?;
    let note = data.object_attributes;

    let mut event = base_event(
        EventType::OnComment,
        TriggerType::OnComment,
        &data.project,
        &data.user.username,
    )?;
    event.trigger_comment = Some(note.note);
    event.comment_id = Some(note.id);
    event.discussion_id = note.discussion_id;

    match note.noteable_type.as_str() {
        "MergeRequest" => {
            let Some(mr) = data.merge_request else {
                return Ok(ParseOutcome::Ignored(
                    "merge request note without merge request".to_string(),
                ));
            };
            event.base_branch = mr.target_branch;
            event.head_branch = mr.source_branch;
            event.sha = mr.last_commit.id;
            event.sha_url = mr.last_commit.url;
            event.sha_title = mr.last_commit.title;
            event.head_commit_message = mr.last_commit.message;
            event.pull_request_number = Some(mr.iid);
            event.pull_request_title = mr.title;
            event.source_project_id = Some(mr.source_project_id);
            event.target_project_id = Some(mr.target_project_id);
            apply_source(&mut event, mr.source)?;
        }
        "Commit" => {
            let Some(sha) = note.commit_id else {
                return Ok(ParseOutcome::Ignored("commit note without commit".to_string()));
            };
            let branch = data.project.default_branch.clone().unwrap_or_default();
            event.base_branch = branch.clone();
            event.head_branch = branch;
            event.head_url = event.url.clone();
            event.sha = sha;
        }
        other => {
            return Ok(ParseOutcome::Ignored(format!(
                "comments on {} are not supported",
                other
            )));
        }
    }
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

    const PROJECT: &str = r#""project": {"id": 10, "path_with_namespace": "group/sub/app", "web_url": "https://gitlab.com/group/sub/app", "default_branch": "main"}"#;

    #[test]
    fn test_merge_request_open() {
        let body = format!(
            r#"{{"object_kind": "merge_request", "user": {{"username": "bob"}}, {},
              "labels": [{{"title": "ci"}}],
              "object_attributes": {{"iid": 4, "action": "open", "title": "MR",
                "source_branch": "feature", "target_branch": "main",
                "source_project_id": 11, "target_project_id": 10,
                "last_commit": {{"id": "sha1", "message": "msg", "title": "msg"}},
                "source": {{"web_url": "https://gitlab.com/bob/app", "path_with_namespace": "bob/app"}}}}}}"#,
            PROJECT
        );
        let e = event(parse("Merge Request Hook", &request(&body)).unwrap());
        assert_eq!(e.organization, "group/sub");
        assert_eq!(e.repository, "app");
        assert_eq!(e.pull_request_number, Some(4));
        assert_eq!(e.source_project_id, Some(11));
        assert_eq!(e.target_project_id, Some(10));
        assert_eq!(e.pull_request_labels, vec!["ci".to_string()]);
        assert!(e.is_fork());
    }

    #[test]
    fn test_merge_request_metadata_update_is_ignored() {
        let body = format!(
            r#"{{"user": {{"username": "bob"}}, {},
              "object_attributes": {{"iid": 4, "action": "update",
                "source_branch": "feature", "target_branch": "main",
                "source_project_id": 10, "target_project_id": 10,
                "last_commit": {{"id": "sha1"}}}}}}"#,
            PROJECT
        );
        assert!(matches!(
            parse("Merge Request Hook", &request(&body)).unwrap(),
            ParseOutcome::Ignored(_)
        ));
    }

    #[test]
    fn test_push_and_deleted_branch() {
        let body = format!(
            r#"{{"ref": "refs/heads/main", "checkout_sha": "sha2", "after": "sha2", "user_username": "bob", {},
              "commits": [{{"id": "sha1", "message": "old"}}, {{"id": "sha2", "message": "new [skip tkn]"}}]}}"#,
            PROJECT
        );
        let e = event(parse("Push Hook", &request(&body)).unwrap());
        assert_eq!(e.sha, "sha2");
        assert_eq!(e.base_branch, "main");
        assert!(e.head_commit_message.unwrap().contains("[skip tkn]"));

        let body = format!(
            r#"{{"ref": "refs/tags/v1", "checkout_sha": null, "user_username": "bob", {}}}"#,
            PROJECT
        );
        assert!(matches!(
            parse("Tag Push Hook", &request(&body)).unwrap(),
            ParseOutcome::Ignored(_)
        ));
    }

    #[test]
    fn test_note_in_discussion() {
        let body = format!(
            r#"{{"user": {{"username": "bob"}}, {},
              "object_attributes": {{"id": 99, "note": "/retest", "noteable_type": "MergeRequest", "discussion_id": "d1"}},
              "merge_request": {{"iid": 4, "source_branch": "feature", "target_branch": "main",
                "source_project_id": 10, "target_project_id": 10, "last_commit": {{"id": "sha1"}}}}}}"#,
            PROJECT
        );
        let e = event(parse("Note Hook", &request(&body)).unwrap());
        assert_eq!(e.trigger_comment.as_deref(), Some("/retest"));
        assert_eq!(e.discussion_id.as_deref(), Some("d1"));
        assert_eq!(e.sha, "sha1");
        assert_eq!(e.pull_request_number, Some(4));
    }
}
