//! Text and state of what gets reported back to the forge.

use crate::models::{Event, PipelineRun, PipelineRunState, short_sha};
use crate::providers::{CommitStatus, StatusState};

/// Default prefix of commit status names.
pub const DEFAULT_APPLICATION_NAME: &str = "Pipelines as Code CI";

/// Header opening every error comment.
pub const CAUTION_HEADER: &str = "> [!CAUTION]";

/// `<app> / <original-prname>`, the name of the commit status of a candidate.
pub fn status_name(application_name: &str, original_prname: &str) -> String {
    format!("{} / {}", application_name, original_prname)
}

/// Marker locating the status comment of a candidate on a pull request.
pub fn comment_marker(original_prname: &str) -> String {
    format!("<!-- pac-status-{} -->", original_prname)
}

pub fn state_of(run: PipelineRunState) -> StatusState {
    match run {
        PipelineRunState::Pending => StatusState::Pending,
        PipelineRunState::Running => StatusState::Running,
        PipelineRunState::Succeeded => StatusState::Success,
        PipelineRunState::Failed => StatusState::Failure,
        PipelineRunState::Cancelled => StatusState::Cancelled,
    }
}

fn title_of(state: StatusState) -> &'static str {
    match state {
        StatusState::Pending => "Queued",
        StatusState::Running => "Running",
        StatusState::Success => "Success",
        StatusState::Failure => "Failed",
        StatusState::Cancelled => "Cancelled",
        StatusState::Neutral => "Skipped",
    }
}

fn emoji_of(state: StatusState) -> &'static str {
    match state {
        StatusState::Pending => "⏳",
        StatusState::Running => "🚀",
        StatusState::Success => "✅",
        StatusState::Failure => "❌",
        StatusState::Cancelled => "🚫",
        StatusState::Neutral => "⏭️",
    }
}

/// Commit status for a launched run.
pub fn run_status(application_name: &str, run: &PipelineRun) -> CommitStatus {
    let state = state_of(run.state);
    let summary = match run.state {
        PipelineRunState::Pending => format!(
            "PipelineRun {} is waiting for a concurrency slot",
            run.name
        ),
        PipelineRunState::Running => format!("PipelineRun {} has started", run.name),
        _ => format!("PipelineRun {} {}", run.name, title_of(state).to_lowercase()),
    };
    CommitStatus {
        name: status_name(application_name, &run.original_prname),
        state,
        title: title_of(state).to_string(),
        summary,
        text: run.message.clone(),
        details_url: run.log_url.clone(),
    }
}

/// Body of the per-run pull request comment. Always starts with the marker so
/// the update strategy finds it again.
pub fn run_comment(application_name: &str, run: &PipelineRun) -> String {
    let state = state_of(run.state);
    let mut body = format!(
        "{}\n{} **{}** for `{}` on commit {}: {}\n",
        comment_marker(&run.original_prname),
        emoji_of(state),
        status_name(application_name, &run.original_prname),
        run.name,
        short_sha(&run.sha),
        title_of(state),
    );
    if let Some(url) = &run.log_url {
        body.push_str(&format!("\n[View logs]({})\n", url));
    }
    if let Some(message) = run.message.as_deref().filter(|m| !m.is_empty()) {
        body.push_str(&format!("\n<details><summary>Details</summary>\n\n```\n{}\n```\n</details>\n", message));
    }
    body
}

/// Failure status for a candidate that could not be created.
pub fn failure_status(application_name: &str, name: &str, error: &str) -> CommitStatus {
    CommitStatus {
        name: status_name(application_name, name),
        state: StatusState::Failure,
        title: "Failed".to_string(),
        summary: format!("There was an issue validating {}", name),
        text: Some(error.to_string()),
        details_url: None,
    }
}

/// Error comment for a file or candidate that could not be used.
pub fn caution_comment(subject: &str, error: &str) -> String {
    format!(
        "{}\n> There was an issue with `{}`, no PipelineRun was created from it:\n>\n> ```\n{}\n> ```\n",
        CAUTION_HEADER,
        subject,
        error
            .lines()
            .map(|l| format!("> {}", l))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Marker of the single skip comment on a pull request.
pub const SKIPPED_MARKER: &str = "<!-- pac-status-skipped -->";

/// Comment explaining why a pull request was not tested.
pub fn skipped_comment(event: &Event) -> String {
    format!(
        "{}\nUser @{} is not allowed to trigger CI via pull request on this repository. \
         An authorized user can comment `/ok-to-test` to run CI on commit {}.\n",
        SKIPPED_MARKER,
        event.sender,
        event.short_sha()
    )
}

/// Neutral status posted when the sender is not allowed.
pub fn skipped_status(application_name: &str, event: &Event) -> CommitStatus {
    CommitStatus {
        name: application_name.to_string(),
        state: StatusState::Neutral,
        title: "Skipped".to_string(),
        summary: "Pending approval, waiting for an /ok-to-test from an authorized user".to_string(),
        text: Some(format!(
            "User {} is not allowed to trigger CI on this repository",
            event.sender
        )),
        details_url: None,
    }
}
