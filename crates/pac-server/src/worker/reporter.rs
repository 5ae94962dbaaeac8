//! Posts run results back to the forge.
//!
//! Commit statuses are posted for every report. Pull request comments follow
//! the Repository comment strategy: `append` posts one comment per finished
//! run, `update` keeps a single comment per candidate (located by its marker)
//! and `disable_all` posts none.

use pac_core::db::PipelineRunRepo;
use pac_core::keys;
use pac_core::models::{
    CommentStrategy, Condition, Event, PipelineRun, PipelineRunState, Repository,
    RepositoryRunStatus,
};
use pac_core::providers::{CommitStatus, Provider};
use pac_core::redact::Redactor;
use pac_core::retry::{RetryConfig, retry_with_backoff};
use pac_core::status::{self, comment_marker};
use pac_core::Result;
use secrecy::ExposeSecret;

use crate::state::AppState;

/// Redactor seeded with the values every report must hide.
pub fn base_redactor(state: &AppState, event: &Event) -> Redactor {
    let mut redactor = Redactor::new();
    if let Some(token) = &event.provider_info.token {
        redactor.add(token.expose());
    }
    if let Some(secret) = &state.config.webhook_secret {
        redactor.add(secret.expose_secret());
    }
    redactor
}

async fn post_status(provider: &dyn Provider, event: &Event, status: &CommitStatus) -> Result<()> {
    retry_with_backoff(RetryConfig::DEFAULT, "create status", || {
        provider.create_status(event, status)
    })
    .await
}

/// Reports the current state of a run: commit status, then the comment the
/// strategy asks for.
pub async fn report_run(
    state: &AppState,
    provider: &dyn Provider,
    repo: &Repository,
    event: &Event,
    run: &PipelineRun,
    redactor: &Redactor,
) -> Result<()> {
    let mut commit_status = status::run_status(&state.config.application_name, run);
    commit_status.text = commit_status.text.map(|t| redactor.redact(&t));
    post_status(provider, event, &commit_status).await?;

    if !event.is_pull_request() {
        return Ok(());
    }
    let body = redactor.redact(&status::run_comment(&state.config.application_name, run));
    match repo.comment_strategy(provider.kind()) {
        CommentStrategy::DisableAll => {}
        CommentStrategy::Append => {
            if run.state.is_terminal() {
                retry_with_backoff(RetryConfig::DEFAULT, "create comment", || {
                    provider.create_comment(event, &body)
                })
                .await?;
            }
        }
        CommentStrategy::Update => {
            let id = update_comment(state, provider, repo, event, run, &body).await?;
            PipelineRunRepo::set_comment_id(&state.db, &run.namespace, &run.name, &id).await?;
        }
    }
    Ok(())
}

/// Updates the candidate's comment in place, using the cached id when a
/// previous run of the same candidate already posted one.
async fn update_comment(
    state: &AppState,
    provider: &dyn Provider,
    repo: &Repository,
    event: &Event,
    run: &PipelineRun,
    body: &str,
) -> Result<String> {
    let cached = match &run.comment_id {
        Some(id) => Some(id.clone()),
        None => match event.pull_request_number {
            Some(number) => {
                PipelineRunRepo::find_comment_id(
                    &state.db,
                    (&repo.namespace, &repo.name),
                    &run.original_prname,
                    number,
                )
                .await?
            }
            None => None,
        },
    };
    if let Some(id) = cached {
        match provider.update_comment(event, &id, body).await {
            Ok(()) => return Ok(id),
            Err(e) if e.is_not_found() => {
                tracing::info!("Comment {} on {} is gone, looking for the marker", id, event.full_name());
            }
            Err(e) => return Err(e),
        }
    }
    let marker = comment_marker(&run.original_prname);
    retry_with_backoff(RetryConfig::DEFAULT, "create or update comment", || {
        provider.create_or_update_comment(event, &marker, body)
    })
    .await
}

/// Reports a file or candidate that could not be turned into a run: a
/// caution comment, plus a failure status when a candidate name is known.
pub async fn report_error(
    state: &AppState,
    provider: &dyn Provider,
    repo: &Repository,
    event: &Event,
    subject: &str,
    candidate: Option<&str>,
    error: &str,
    redactor: &Redactor,
) {
    let error = redactor.redact(error);
    if let Some(name) = candidate {
        let failure = status::failure_status(&state.config.application_name, name, &error);
        if let Err(e) = post_status(provider, event, &failure).await {
            tracing::warn!("Failed to post failure status for {}: {}", name, e);
        }
    }

    let body = status::caution_comment(subject, &error);
    let result = match repo.comment_strategy(provider.kind()) {
        CommentStrategy::DisableAll => return,
        CommentStrategy::Append => provider.create_comment(event, &body).await,
        CommentStrategy::Update => {
            let marker = comment_marker(candidate.unwrap_or(subject));
            provider
                .create_or_update_comment(event, &marker, &format!("{}\n{}", marker, body))
                .await
        }
    };
    if let Err(e) = result {
        tracing::warn!("Failed to post error comment about {}: {}", subject, e);
    }
}

/// Tells the sender why nothing ran: a neutral status and a single comment.
pub async fn report_skipped(
    state: &AppState,
    provider: &dyn Provider,
    repo: &Repository,
    event: &Event,
) {
    let skipped = status::skipped_status(&state.config.application_name, event);
    if let Err(e) = post_status(provider, event, &skipped).await {
        tracing::warn!("Failed to post skipped status on {}: {}", event.full_name(), e);
    }
    if !event.is_pull_request()
        || repo.comment_strategy(provider.kind()) == CommentStrategy::DisableAll
    {
        return;
    }
    if let Err(e) = provider
        .create_or_update_comment(event, status::SKIPPED_MARKER, &status::skipped_comment(event))
        .await
    {
        tracing::warn!("Failed to post skip comment on {}: {}", event.full_name(), e);
    }
}

/// Entry of the Repository status list for a run.
pub fn status_entry(run: &PipelineRun) -> RepositoryRunStatus {
    let (status, reason) = match run.state {
        PipelineRunState::Pending => ("Unknown", "PipelineRunPending"),
        PipelineRunState::Running => ("Unknown", "Running"),
        PipelineRunState::Succeeded => ("True", "Succeeded"),
        PipelineRunState::Failed => ("False", "Failed"),
        PipelineRunState::Cancelled => ("False", "Cancelled"),
    };
    RepositoryRunStatus {
        pipeline_run_name: run.name.clone(),
        sha: run.sha.clone(),
        sha_url: run.annotations.get(keys::SHA_URL).cloned(),
        title: run.annotations.get(keys::SHA_TITLE).cloned(),
        log_url: run.log_url.clone(),
        event_type: run.event_type.clone(),
        target_branch: run.target_branch.clone(),
        start_time: run.started_at,
        completion_time: run.completed_at,
        conditions: vec![Condition {
            kind: "Succeeded".to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: run.message.clone(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_status_entry_conditions() {
        let mut annotations = BTreeMap::new();
        annotations.insert(keys::SHA_TITLE.to_string(), "Add feature".to_string());
        let mut run = PipelineRun {
            namespace: "ns".into(),
            name: "pipeline-abcdef".into(),
            repository_namespace: "ns".into(),
            repository_name: "app".into(),
            original_prname: "pipeline".into(),
            sha: "abc123".into(),
            event_type: "push".into(),
            state: PipelineRunState::Failed,
            source_branch: Some("main".into()),
            target_branch: Some("main".into()),
            pull_request_number: None,
            labels: BTreeMap::new(),
            annotations,
            body: String::new(),
            secret_name: None,
            log_url: None,
            comment_id: None,
            message: Some("step build failed".into()),
            finalized: false,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let entry = status_entry(&run);
        assert_eq!(entry.title.as_deref(), Some("Add feature"));
        assert_eq!(entry.conditions[0].status, "False");
        assert_eq!(entry.conditions[0].reason, "Failed");

        run.state = PipelineRunState::Pending;
        assert_eq!(status_entry(&run).conditions[0].reason, "PipelineRunPending");
    }
}
