//! GitHub (App and plain webhook) payload normalization.

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
struct Installation {
    id: i64,
}

#[derive(Deserialize)]
struct Label {
    name: String,
}

#[derive(Deserialize)]
struct Ref {
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
    head: Ref,
    base: Ref,
    user: User,
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    action: String,
    pull_request: PullRequest,
    repository: Repository,
    sender: User,
    #[serde(default)]
    installation: Option<Installation>,
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
    deleted: bool,
    #[serde(default)]
    head_commit: Option<Commit>,
    repository: Repository,
    sender: User,
    #[serde(default)]
    installation: Option<Installation>,
}

#[derive(Deserialize)]
struct Comment {
    id: i64,
    body: String,
    #[serde(default)]
    commit_id: Option<String>,
}

#[derive(Deserialize)]
struct IssuePullRequestLink {}

#[derive(Deserialize)]
struct Issue {
    number: i64,
    #[serde(default)]
    pull_request: Option<IssuePullRequestLink>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Deserialize)]
struct IssueCommentPayload {
    action: String,
    issue: Issue,
    comment: Comment,
    repository: Repository,
    sender: User,
    #[serde(default)]
    installation: Option<Installation>,
}

#[derive(Deserialize)]
struct CommitCommentPayload {
    action: String,
    comment: Comment,
    repository: Repository,
    sender: User,
    #[serde(default)]
    installation: Option<Installation>,
}

#[derive(Deserialize)]
struct CheckPullRequest {
    number: i64,
}

#[derive(Deserialize)]
struct CheckSuite {
    #[serde(default)]
    head_branch: Option<String>,
    head_sha: String,
    #[serde(default)]
    pull_requests: Vec<CheckPullRequest>,
}

#[derive(Deserialize)]
struct CheckRun {
    check_suite: CheckSuite,
}

#[derive(Deserialize)]
struct CheckRunPayload {
    action: String,
    check_run: CheckRun,
    repository: Repository,
    sender: User,
    #[serde(default)]
    installation: Option<Installation>,
}

#[derive(Deserialize)]
struct CheckSuitePayload {
    action: String,
    check_suite: CheckSuite,
    repository: Repository,
    sender: User,
    #[serde(default)]
    installation: Option<Installation>,
}

/// Normalizes a GitHub delivery.
pub fn parse(event_name: &str, request: &WebhookRequest) -> Result<ParseOutcome> {
    match event_name {
        "pull_request" => parse_pull_request(&request.body),
        "push" => parse_push(&request.body),
        "issue_comment" => parse_issue_comment(&request.body),
        "commit_comment" => parse_commit_comment(&request.body),
        "check_run" => {
            let data: CheckRunPayload = serde_json::from_slice(&request.body)?;
            if data.action != "rerequested" {
                return Ok(ignored("check_run", &data.action));
            }
            rerequest(
                EventType::CheckRunRerequested,
                data.check_run.check_suite,
                data.repository,
                data.sender,
                data.installation,
            )
        }
        "check_suite" => {
            let data: CheckSuitePayload = serde_json::from_slice(&request.body)?;
            if data.action != "rerequested" {
                return Ok(ignored("check_suite", &data.action));
            }
            rerequest(
                EventType::CheckSuiteRerequested,
                data.check_suite,
                data.repository,
                data.sender,
                data.installation,
            )
        }
        other => Ok(ParseOutcome::Ignored(format!(
            "event \"{}\" is not supported",
            other
        ))),
    }
}

fn ignored(event: &str, action: &str) -> ParseOutcome {
    ParseOutcome::Ignored(format!("{} action \"{}\" is not supported", event, action))
}

fn base_event(
    event_type: EventType,
    trigger: TriggerType,
    repository: &Repository,
    sender: &User,
    installation: Option<&Installation>,
) -> Result<Event> {
    let (organization, name) = split_full_name(&repository.full_name)?;
    let mut event = Event::new(ProviderKind::GitHub, event_type, trigger);
    event.organization = organization;
    event.repository = name;
    event.url = repository.html_url.clone();
    event.clone_url = repository
        .clone_url
        .clone()
        .unwrap_or_else(|| format!("{}.git", repository.html_url));
    event.sender = sender.login.clone();
    event.installation_id = installation.map(|i| i.id);
    Ok(event)
}

fn parse_pull_request(body: &[u8]) -> Result<ParseOutcome> {
    let data: PullRequestPayload = serde_json::from_slice(body)?;
    let (event_type, trigger) = match data.action.as_str() {
        "opened" | "synchronize" | "reopened" | "ready_for_review" => {
            (EventType::PullRequest, TriggerType::PullRequest)
        }
        "labeled" => (EventType::PullRequestLabeled, TriggerType::PullRequest),
        "closed" => (EventType::PullRequestClosed, TriggerType::PullRequestClosed),
        other => return Ok(ignored("pull_request", other)),
    };

    let pr = data.pull_request;
    let mut event = base_event(
        event_type,
        trigger,
        &data.repository,
        &data.sender,
        data.installation.as_ref(),
    )?;
    event.base_branch = pr.base.ref_name;
    event.head_branch = pr.head.ref_name;
    event.sha = pr.head.sha;
    event.sha_url = Some(format!("{}/commit/{}", event.url, event.sha));
    event.pull_request_number = Some(pr.number);
    event.pull_request_title = pr.title.clone();
    event.sha_title = pr.title;
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
    if data.deleted {
        return Ok(ParseOutcome::Ignored(format!(
            "delete push on {} is not supported",
            data.ref_name
        )));
    }

    let mut event = base_event(
        push_event_type(&data.ref_name),
        TriggerType::Push,
        &data.repository,
        &data.sender,
        data.installation.as_ref(),
    )?;
    event.base_branch = branch_from_ref(&data.ref_name);
    event.head_branch = event.base_branch.clone();
    event.head_url = event.url.clone();
    event.sha = data.after;
    match data.head_commit {
        Some(commit) => {
            event.sha_url = commit.url.or_else(|| Some(format!("{}/commit/{}", event.url, commit.id)));
            event.sha_title = commit
                .message
                .as_deref()
                .and_then(|m| m.lines().next())
                .map(str::to_string);
            event.head_commit_message = commit.message;
        }
        None => event.sha_url = Some(format!("{}/commit/{}", event.url, event.sha)),
    }
    Ok(ParseOutcome::Event(Box::new(event)))
}

fn parse_issue_comment(body: &[u8]) -> Result<ParseOutcome> {
    let data: IssueCommentPayload = serde_json::from_slice(body)?;
    if data.action != "created" {
        return Ok(ignored("issue_comment", &data.action));
    }
    if data.issue.pull_request.is_none() {
        return Ok(ParseOutcome::Ignored(
            "comment is on an issue, not a pull request".to_string(),
        ));
    }

    // Branches and head SHA are filled in by pull request population.
    let mut event = base_event(
        EventType::OnComment,
        TriggerType::OnComment,
        &data.repository,
        &data.sender,
        data.installation.as_ref(),
    )?;
    event.pull_request_number = Some(data.issue.number);
    event.pull_request_title = data.issue.title;
    event.trigger_comment = Some(data.comment.body);
    event.comment_id = Some(data.comment.id);
    Ok(ParseOutcome::Event(Box::new(event)))
}

fn parse_commit_comment(body: &[u8]) -> Result<ParseOutcome> {
    let data: CommitCommentPayload = serde_json::from_slice(body)?;
    if data.action != "created" {
        return Ok(ignored("commit_comment", &data.action));
    }
    let Some(sha) = data.comment.commit_id.clone() else {
        return Ok(ParseOutcome::Ignored("commit comment without commit".to_string()));
    };

    let mut event = base_event(
        EventType::OnComment,
        TriggerType::OnComment,
        &data.repository,
        &data.sender,
        data.installation.as_ref(),
    )?;
    let default_branch = data.repository.default_branch.clone().unwrap_or_default();
    event.base_branch = default_branch.clone();
    event.head_branch = default_branch;
    event.head_url = event.url.clone();
    event.sha_url = Some(format!("{}/commit/{}", event.url, sha));
    event.sha = sha;
    event.trigger_comment = Some(data.comment.body);
    event.comment_id = Some(data.comment.id);
    Ok(ParseOutcome::Event(Box::new(event)))
}

fn rerequest(
    event_type: EventType,
    suite: CheckSuite,
    repository: Repository,
    sender: User,
    installation: Option<Installation>,
) -> Result<ParseOutcome> {
    let pull_request = suite.pull_requests.first().map(|p| p.number);
    let trigger = if pull_request.is_some() {
        TriggerType::PullRequest
    } else {
        TriggerType::Push
    };
    let mut event = base_event(event_type, trigger, &repository, &sender, installation.as_ref())?;
    event.sha = suite.head_sha;
    event.sha_url = Some(format!("{}/commit/{}", event.url, event.sha));
    event.pull_request_number = pull_request;
    let branch = suite.head_branch.unwrap_or_default();
    event.head_branch = branch.clone();
    event.base_branch = branch;
    event.head_url = event.url.clone();
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

    const REPO: &str = r#""repository": {"full_name": "owner/repo", "html_url": "https://github.com/owner/repo", "default_branch": "main"}, "sender": {"login": "alice"}"#;

    #[test]
    fn test_pull_request_from_fork() {
        let body = format!(
            r#"{{"action": "opened", "pull_request": {{
                "number": 5, "title": "Add feature",
                "head": {{"ref": "feature", "sha": "abc123", "repo": {{"full_name": "fork/repo", "html_url": "https://github.com/fork/repo"}}}},
                "base": {{"ref": "main", "sha": "000"}},
                "user": {{"login": "alice"}},
                "labels": [{{"name": "bug"}}]
            }}, "installation": {{"id": 9}}, {}}}"#,
            REPO
        );
        let e = event(parse("pull_request", &request(&body)).unwrap());
        assert_eq!(e.event_type, EventType::PullRequest);
        assert_eq!(e.url, "https://github.com/owner/repo");
        assert_eq!(e.base_branch, "main");
        assert_eq!(e.head_branch, "feature");
        assert_eq!(e.sha, "abc123");
        assert_eq!(e.pull_request_number, Some(5));
        assert_eq!(e.pull_request_labels, vec!["bug".to_string()]);
        assert_eq!(e.installation_id, Some(9));
        assert!(e.is_fork());
        assert_eq!(e.head_coordinates(), ("fork", "repo"));
    }

    #[test]
    fn test_pull_request_closed_and_unsupported_action() {
        let body = format!(
            r#"{{"action": "closed", "pull_request": {{
                "number": 5, "head": {{"ref": "f", "sha": "a"}}, "base": {{"ref": "main", "sha": "b"}},
                "user": {{"login": "alice"}}
            }}, {}}}"#,
            REPO
        );
        let e = event(parse("pull_request", &request(&body)).unwrap());
        assert_eq!(e.trigger, TriggerType::PullRequestClosed);

        let body = body.replace("\"closed\"", "\"assigned\"");
        assert!(matches!(
            parse("pull_request", &request(&body)).unwrap(),
            ParseOutcome::Ignored(_)
        ));
    }

    #[test]
    fn test_push_and_tag() {
        let body = format!(
            r#"{{"ref": "refs/heads/main", "after": "abc123", "head_commit": {{"id": "abc123", "message": "fix things\n\n[skip ci]"}}, {}}}"#,
            REPO
        );
        let e = event(parse("push", &request(&body)).unwrap());
        assert_eq!(e.event_type, EventType::Push);
        assert_eq!(e.base_branch, "main");
        assert_eq!(e.sha_title.as_deref(), Some("fix things"));
        assert!(e.head_commit_message.unwrap().contains("[skip ci]"));

        let body = body.replace("refs/heads/main", "refs/tags/v1.0");
        let e = event(parse("push", &request(&body)).unwrap());
        assert_eq!(e.event_type, EventType::Tag);
        assert_eq!(e.base_branch, "refs/tags/v1.0");
    }

    #[test]
    fn test_deleted_push_is_ignored() {
        let body = format!(r#"{{"ref": "refs/tags/v1", "after": "000", "deleted": true, {}}}"#, REPO);
        assert!(matches!(parse("push", &request(&body)).unwrap(), ParseOutcome::Ignored(_)));
    }

    #[test]
    fn test_issue_comment_on_pull_request() {
        let body = format!(
            r#"{{"action": "created", "issue": {{"number": 7, "pull_request": {{}}}}, "comment": {{"id": 11, "body": "/test pipeline"}}, {}}}"#,
            REPO
        );
        let e = event(parse("issue_comment", &request(&body)).unwrap());
        assert_eq!(e.pull_request_number, Some(7));
        assert_eq!(e.trigger_comment.as_deref(), Some("/test pipeline"));
        assert_eq!(e.comment_id, Some(11));

        let body = body.replace(r#", "pull_request": {}"#, "");
        assert!(matches!(
            parse("issue_comment", &request(&body)).unwrap(),
            ParseOutcome::Ignored(_)
        ));
    }

    #[test]
    fn test_check_run_rerequested() {
        let body = format!(
            r#"{{"action": "rerequested", "check_run": {{"check_suite": {{"head_branch": "feature", "head_sha": "abc", "pull_requests": [{{"number": 3}}]}}}}, {}}}"#,
            REPO
        );
        let e = event(parse("check_run", &request(&body)).unwrap());
        assert_eq!(e.event_type, EventType::CheckRunRerequested);
        assert_eq!(e.pull_request_number, Some(3));
        assert_eq!(e.trigger, TriggerType::PullRequest);
    }
}
