//! From a normalized event to launched PipelineRuns.
//!
//! Order of work: bind the Repository, authenticate the delivery, connect to
//! the forge, resolve ops-comments and missing commit data, handle cancels,
//! skip markers and permissions, then read `.tekton/`, template, match,
//! inline remote references and launch. Problems with single files or
//! candidates are reported on the forge and collected; only failures before
//! any candidate is considered abort the event.

use pac_core::candidate::{Candidate, LocalResources, parse_documents};
use pac_core::db::{PipelineRunRepo, SecretRepo};
use pac_core::fetcher::{SourceFile, TEKTON_DIR, fetch_tekton_files};
use pac_core::keys;
use pac_core::matcher::{ChangedFilesLoader, match_candidates};
use pac_core::models::{
    DEFAULT_WEBHOOK_SECRET_KEY, Event, EventType, PipelineRun, PipelineRunState, ProviderKind,
    Repository,
};
use pac_core::providers::Provider;
use pac_core::redact::Redactor;
use pac_core::resolver::{check_acl, find_repository};
use pac_core::template::{RemoteResolver, ResolvedParams, expand, resolve_params};
use pac_core::webhook::{
    WebhookRequest, apply_ops_comment, verify_azure, verify_bitbucket_dc, verify_gitea,
    verify_github, verify_gitlab,
};
use pac_core::{PacError, Result};
use serde::Serialize;

use crate::state::AppState;

use super::{is_manual_trigger, launcher, reconciler::transition, reporter};

/// What one event led to.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EventOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    pub pipelineruns: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cancelled: Vec<String>,
    /// Why nothing was considered for launch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl EventOutcome {
    fn skip(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::info!("{}", reason);
        self.skipped = Some(reason);
        self
    }
}

/// Processes one event. `request` is the raw delivery, absent for incoming
/// triggers which authenticate on their own.
pub async fn process_event(
    state: &AppState,
    mut event: Event,
    request: Option<&WebhookRequest>,
) -> Result<EventOutcome> {
    let global = state.config.global_repository();
    let Some(repo) = find_repository(&state.db, &event, Some(&global)).await? else {
        return Ok(EventOutcome::default().skip(format!("No Repository matches {}", event.url)));
    };
    let mut outcome = EventOutcome {
        repository: Some(repo.key()),
        ..Default::default()
    };

    if let Some(request) = request {
        if event.installation_id.is_none() {
            verify_delivery(state, &repo, event.provider_kind(), request).await?;
        }
    }

    let provider = state.providers.connect(&mut event, &repo).await?;
    let mut redactor = reporter::base_redactor(state, &event);

    if event.event_type == EventType::OnComment
        && !apply_ops_comment(&mut event, repo.gitops_prefix().as_deref())
    {
        return Ok(outcome.skip(format!("Comment on {} is not a command", event.full_name())));
    }

    if event.is_pull_request()
        && (event.event_type.is_comment() || event.event_type.is_explicit_rerun())
    {
        provider.populate_pull_request(&mut event).await?;
    }
    if event.sha.is_empty() {
        provider.commit_info(&mut event).await?;
    } else if event.head_commit_message.is_none() {
        if let Err(e) = provider.commit_info(&mut event).await {
            tracing::warn!("Cannot read head commit of {}: {}", event.full_name(), e);
        }
    }

    if event.event_type == EventType::PullRequestClosed {
        outcome.cancelled = cancel_on_close(state, &repo, &event).await?;
    }

    if event.event_type.is_cancel() {
        if check_acl(&state.db, provider.as_ref(), &repo, &event, false).await?.is_none() {
            return Ok(outcome.skip(format!(
                "{} may not cancel PipelineRuns on {}",
                event.sender,
                event.full_name()
            )));
        }
        outcome.cancelled = cancel_requested(state, &repo, &event).await?;
        return Ok(outcome);
    }

    if !is_manual_trigger(event.event_type) {
        if let Some(marker) = skip_marker(state, &event) {
            return Ok(outcome.skip(format!(
                "Commit {} on {} carries {}",
                event.short_sha(),
                event.full_name(),
                marker
            )));
        }
    }

    let allowed = check_acl(
        &state.db,
        provider.as_ref(),
        &repo,
        &event,
        state.config.remember_ok_to_test,
    )
    .await?;
    if allowed.is_none() {
        if event.is_pull_request() && !event.event_type.is_comment() {
            reporter::report_skipped(state, provider.as_ref(), &repo, &event).await;
        }
        return Ok(outcome.skip(format!(
            "{} is not allowed to trigger CI on {}",
            event.sender,
            event.full_name()
        )));
    }

    let files = match fetch_tekton_files(provider.as_ref(), &event).await {
        Ok(files) => files,
        Err(e) => {
            report(state, provider.as_ref(), &repo, &event, TEKTON_DIR, None, &e, &redactor, &mut outcome).await;
            Vec::new()
        }
    };
    if files.is_empty() {
        return Ok(outcome.skip(format!(
            "No {} files on {} at {}",
            TEKTON_DIR,
            event.full_name(),
            event.short_sha()
        )));
    }

    let params = match resolve_params(&state.db, &repo, &event, None).await {
        Ok(params) => params,
        Err(e) => {
            report(state, provider.as_ref(), &repo, &event, "params", None, &e, &redactor, &mut outcome).await;
            return Ok(outcome);
        }
    };
    for secret in &params.secrets {
        redactor.add(secret.as_str());
    }

    let mut candidates: Vec<Candidate> = Vec::new();
    let mut local = LocalResources::default();
    for file in &files {
        let rendered = expand(&file.content, &params.values, &event);
        match parse_documents(&file.path, &rendered) {
            Ok(parsed) => {
                candidates.extend(parsed.candidates);
                local.extend(parsed.resources);
            }
            Err(e) => {
                report(state, provider.as_ref(), &repo, &event, &file.path, None, &e, &redactor, &mut outcome).await;
            }
        }
    }

    let mut loader = ChangedFilesLoader::new(provider.as_ref());
    let matched = match_candidates(&event, candidates, &mut loader).await;
    for failure in &matched.errors {
        let subject = format!("{} ({})", failure.candidate.name, failure.candidate.path);
        report(
            state,
            provider.as_ref(),
            &repo,
            &event,
            &subject,
            Some(&failure.candidate.name),
            &failure.error,
            &redactor,
            &mut outcome,
        )
        .await;
    }
    if matched.matched.is_empty() {
        return Ok(outcome.skip(format!(
            "No PipelineRun matched {} on {}",
            event.event_type,
            event.full_name()
        )));
    }

    // Candidates selected by their on-comment regex launch as on-comment
    // events, rendered again so the template sees that event.
    let comment_event = (event.event_type != EventType::OnComment
        && matched.matched.iter().any(|m| m.via_comment))
    .then(|| {
        let mut comment_event = event.clone();
        comment_event.event_type = EventType::OnComment;
        comment_event
    });
    let comment_params = match &comment_event {
        Some(comment_event) => match resolve_params(&state.db, &repo, comment_event, None).await {
            Ok(params) => {
                for secret in &params.secrets {
                    redactor.add(secret.as_str());
                }
                Some(params)
            }
            Err(e) => {
                report(state, provider.as_ref(), &repo, &event, "params", None, &e, &redactor, &mut outcome).await;
                return Ok(outcome);
            }
        },
        None => None,
    };

    let resolver = RemoteResolver::new(
        provider.as_ref(),
        state.http.clone(),
        &event,
        &local,
        remote_scope(&repo, &event),
    );
    let mut resolved = Vec::new();
    for selected in matched.matched {
        let name = selected.candidate.name.clone();
        let rendered = match (&comment_event, &comment_params) {
            (Some(comment_event), Some(params)) if selected.via_comment => {
                render_again(&files, &selected.candidate, params, comment_event)
                    .map(|candidate| (candidate, comment_event))
            }
            _ => Ok((selected.candidate, &event)),
        };
        let (mut candidate, launch_event) = match rendered {
            Ok(rendered) => rendered,
            Err(e) => {
                report(state, provider.as_ref(), &repo, &event, &name, Some(&name), &e, &redactor, &mut outcome).await;
                continue;
            }
        };
        if let Err(e) = resolver.resolve(&mut candidate).await {
            report(
                state,
                provider.as_ref(),
                &repo,
                &event,
                &name,
                Some(&name),
                &e,
                &redactor,
                &mut outcome,
            )
            .await;
            continue;
        }
        resolved.push((candidate, launch_event));
    }

    for (candidate, launch_event) in resolved {
        let name = candidate.name.clone();
        let launched =
            launcher::launch(state, &repo, launch_event, provider.as_ref(), candidate, &redactor).await;
        match launched {
            Ok(Some(run)) => outcome.pipelineruns.push(run.name),
            Ok(None) => {}
            Err(e) => {
                report(state, provider.as_ref(), &repo, &event, &name, Some(&name), &e, &redactor, &mut outcome).await;
            }
        }
    }

    Ok(outcome)
}

/// Renders the file `candidate` came from again, with `params` for `event`.
fn render_again(
    files: &[SourceFile],
    candidate: &Candidate,
    params: &ResolvedParams,
    event: &Event,
) -> Result<Candidate> {
    let missing = || {
        PacError::Template(format!(
            "{} no longer renders PipelineRun {} for {}",
            candidate.path, candidate.name, event.event_type
        ))
    };
    let file = files.iter().find(|f| f.path == candidate.path).ok_or_else(missing)?;
    let rendered = expand(&file.content, &params.values, event);
    parse_documents(&file.path, &rendered)?
        .candidates
        .into_iter()
        .find(|c| c.name == candidate.name)
        .ok_or_else(missing)
}

#[allow(clippy::too_many_arguments)]
async fn report(
    state: &AppState,
    provider: &dyn Provider,
    repo: &Repository,
    event: &Event,
    subject: &str,
    candidate: Option<&str>,
    error: &PacError,
    redactor: &Redactor,
    outcome: &mut EventOutcome,
) {
    let message = redactor.redact(&error.to_string());
    tracing::warn!("{} on {}: {}", subject, event.full_name(), message);
    reporter::report_error(state, provider, repo, event, subject, candidate, &message, redactor).await;
    outcome.errors.push(format!("{}: {}", subject, message));
}

/// Checks a non-app delivery against the Repository webhook secret.
///
/// Bitbucket Cloud is authenticated by source IP at the HTTP layer. A
/// Repository without a webhook secret accepts the delivery with a warning.
async fn verify_delivery(
    state: &AppState,
    repo: &Repository,
    kind: ProviderKind,
    request: &WebhookRequest,
) -> Result<()> {
    if kind == ProviderKind::BitbucketCloud {
        return Ok(());
    }
    let Some(secret_ref) = repo
        .spec
        .git_provider
        .as_ref()
        .and_then(|g| g.webhook_secret.as_ref())
    else {
        tracing::warn!(
            "Repository {} has no webhook secret, accepting unauthenticated {} delivery",
            repo.key(),
            kind.as_str()
        );
        return Ok(());
    };

    let secret = SecretRepo::get_value(
        &state.db,
        &repo.namespace,
        &secret_ref.name,
        secret_ref.key_or(DEFAULT_WEBHOOK_SECRET_KEY),
    )
    .await
    .map_err(|e| {
        PacError::AuthFail(format!("cannot read webhook secret of {}: {}", repo.key(), e))
    })?;

    match kind {
        ProviderKind::GitHub => verify_github(&secret, request),
        ProviderKind::GitLab => verify_gitlab(&secret, request),
        ProviderKind::Gitea => verify_gitea(&secret, request),
        ProviderKind::BitbucketDatacenter => verify_bitbucket_dc(&secret, request),
        ProviderKind::AzureDevOps => verify_azure(&secret, request),
        ProviderKind::BitbucketCloud => Ok(()),
    }
}

fn skip_marker<'a>(state: &'a AppState, event: &Event) -> Option<&'a str> {
    let message = event.head_commit_message.as_deref()?;
    state
        .config
        .skip_ci_markers
        .iter()
        .find(|marker| message.contains(marker.as_str()))
        .map(String::as_str)
}

/// Repositories remote references may be read from besides the event one.
fn remote_scope(repo: &Repository, event: &Event) -> Vec<String> {
    let mut scope = repo.settings().remote_scope_repos;
    if event.is_fork() {
        scope.push(format!("{}/{}", event.head_organization, event.head_repository));
    }
    scope
}

fn is_cancel_in_progress(run: &PipelineRun) -> bool {
    run.annotations
        .get(keys::CANCEL_IN_PROGRESS)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

async fn cancel_runs(
    state: &AppState,
    repo: &Repository,
    runs: Vec<PipelineRun>,
    message: &str,
) -> Result<Vec<String>> {
    let lock = state.repository_lock(&repo.key());
    let _guard = lock.lock().await;

    let mut cancelled = Vec::new();
    for run in runs {
        // Re-read under the lock; the run may have finished meanwhile.
        let Some(current) = PipelineRunRepo::get(&state.db, &run.namespace, &run.name).await? else {
            continue;
        };
        if current.state.is_terminal() {
            continue;
        }
        let run = transition(state, &current.namespace, &current.name, PipelineRunState::Cancelled, Some(message)).await?;
        tracing::info!("Cancelled PipelineRun {}", run.key());
        cancelled.push(run.name);
    }
    Ok(cancelled)
}

/// A closed pull request stops its runs that opted into cancel-in-progress.
async fn cancel_on_close(state: &AppState, repo: &Repository, event: &Event) -> Result<Vec<String>> {
    let Some(number) = event.pull_request_number else {
        return Ok(Vec::new());
    };
    let runs: Vec<PipelineRun> = PipelineRunRepo::list_active_for_pull_request(
        &state.db,
        (&repo.namespace, &repo.name),
        number,
    )
    .await?
    .into_iter()
    .filter(is_cancel_in_progress)
    .collect();
    cancel_runs(state, repo, runs, "Pull request was closed").await
}

/// `/cancel [name]`: stops the active runs of the pull request, or of the
/// branch for commit comments.
async fn cancel_requested(state: &AppState, repo: &Repository, event: &Event) -> Result<Vec<String>> {
    let key = (repo.namespace.as_str(), repo.name.as_str());
    let active = match event.pull_request_number {
        Some(number) => PipelineRunRepo::list_active_for_pull_request(&state.db, key, number).await?,
        None => {
            PipelineRunRepo::list_active_for_branch(&state.db, key, super::concurrency::source_branch(event))
                .await?
        }
    };
    let runs: Vec<PipelineRun> = active
        .into_iter()
        .filter(|run| match &event.target_cancel_pipeline_run {
            Some(target) => &run.original_prname == target,
            None => true,
        })
        .collect();
    let message = format!("Cancelled by {} with a comment", event.sender);
    cancel_runs(state, repo, runs, &message).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ServerConfig;
    use crate::test_utils::setup_test_state;
    use pac_core::models::{Settings, TriggerType};

    #[tokio::test]
    async fn test_skip_marker_in_commit_message() {
        let (mut state, _config) = setup_test_state().await;
        state.config = std::sync::Arc::new(ServerConfig {
            skip_ci_markers: vec!["[skip ci]".into(), "[ci skip]".into()],
            ..ServerConfig::default()
        });

        let mut event = Event::new(ProviderKind::Gitea, EventType::Push, TriggerType::Push);
        assert_eq!(skip_marker(&state, &event), None);

        event.head_commit_message = Some("docs: typo [ci skip]".into());
        assert_eq!(skip_marker(&state, &event), Some("[ci skip]"));
    }

    #[test]
    fn test_remote_scope_adds_fork() {
        let mut repo = Repository::new("ns", "app", "https://github.com/pac/app");
        repo.spec.settings = Some(Settings {
            remote_scope_repos: vec!["pac/catalog".into()],
            ..Default::default()
        });
        let mut event = Event::new(ProviderKind::GitHub, EventType::PullRequest, TriggerType::PullRequest);
        event.organization = "pac".into();
        event.repository = "app".into();
        assert_eq!(remote_scope(&repo, &event), vec!["pac/catalog"]);

        event.head_organization = "contributor".into();
        event.head_repository = "app".into();
        assert_eq!(remote_scope(&repo, &event), vec!["pac/catalog", "contributor/app"]);
    }
}
