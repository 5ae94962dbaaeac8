//! Terminal-state reconciler.
//!
//! Every transition into a terminal state queues a [`ReconcileJob`]. The
//! reconciler records the run in the Repository status, releases its git
//! credentials, prunes old runs, starts queued runs and reports the final
//! status to the forge. A periodic sweep picks up runs whose job was lost.

use std::time::Duration;

use pac_core::ai::{AiAnalyzer, analysis_marker};
use pac_core::db::{DbPool, PipelineRunRepo, RepositoryRepo, SecretRepo};
use pac_core::keys;
use pac_core::models::{
    CommentStrategy, Event, EventType, PipelineRun, PipelineRunState, ProviderKind, Repository,
    TriggerType,
};
use pac_core::providers::Provider;
use pac_core::redact::Redactor;
use pac_core::{PacError, Result};
use tokio::sync::mpsc;

use crate::state::AppState;

use super::{concurrency, reporter};

const CHANNEL_CAPACITY: usize = 1000;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A run that reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileJob {
    pub namespace: String,
    pub name: String,
}

impl ReconcileJob {
    pub fn for_run(run: &PipelineRun) -> Self {
        Self {
            namespace: run.namespace.clone(),
            name: run.name.clone(),
        }
    }
}

/// Creates the reconciler channel. The sender goes into [`AppState`].
pub fn reconcile_channel() -> (mpsc::Sender<ReconcileJob>, mpsc::Receiver<ReconcileJob>) {
    mpsc::channel(CHANNEL_CAPACITY)
}

/// Starts the reconciler worker.
pub fn start_reconciler(
    state: AppState,
    rx: mpsc::Receiver<ReconcileJob>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run_reconciler(state, rx).await;
    })
}

/// Queues terminal runs that were never finalized, on startup.
pub async fn recover_unfinalized(db: &DbPool, tx: &mpsc::Sender<ReconcileJob>) {
    match PipelineRunRepo::list_unfinalized(db).await {
        Ok(runs) => {
            let count = runs.len();
            for run in runs {
                if tx.send(ReconcileJob::for_run(&run)).await.is_err() {
                    tracing::error!("Failed to queue recovered run - channel closed");
                    break;
                }
            }
            if count > 0 {
                tracing::info!("Recovered {} unfinalized PipelineRuns", count);
            }
        }
        Err(e) => {
            tracing::error!("Failed to recover unfinalized PipelineRuns: {}", e);
        }
    }
}

async fn run_reconciler(state: AppState, mut rx: mpsc::Receiver<ReconcileJob>) {
    tracing::info!("Reconciler started");

    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    sweep.tick().await;

    loop {
        tokio::select! {
            job = rx.recv() => {
                let Some(job) = job else { break };
                if let Err(e) = reconcile(&state, &job).await {
                    tracing::error!("Failed to reconcile {}/{}: {}", job.namespace, job.name, e);
                }
            }
            _ = sweep.tick() => sweep_unfinalized(&state).await,
        }
    }

    tracing::info!("Reconciler stopped");
}

async fn sweep_unfinalized(state: &AppState) {
    let runs = match PipelineRunRepo::list_unfinalized(&state.db).await {
        Ok(runs) => runs,
        Err(e) => {
            tracing::error!("Failed to list unfinalized PipelineRuns: {}", e);
            return;
        }
    };
    for run in runs {
        let job = ReconcileJob::for_run(&run);
        if let Err(e) = reconcile(state, &job).await {
            tracing::error!("Failed to reconcile {}: {}", run.key(), e);
        }
    }

    match SecretRepo::delete_orphaned(&state.db).await {
        Ok(0) => {}
        Ok(count) => tracing::info!("Removed {} secrets without an owning PipelineRun", count),
        Err(e) => tracing::error!("Failed to remove orphaned secrets: {}", e),
    }
}

/// Moves a run to `new_state` and queues reconciliation when it is terminal.
pub async fn transition(
    state: &AppState,
    namespace: &str,
    name: &str,
    new_state: PipelineRunState,
    message: Option<&str>,
) -> Result<PipelineRun> {
    let run = PipelineRunRepo::update_state(&state.db, namespace, name, new_state, message).await?;
    if run.state.is_terminal() && !run.finalized {
        // Callers may hold the Repository lock the reconciler waits for, so
        // never block here. A dropped job is picked up by the sweep.
        if let Err(e) = state.reconcile_tx.try_send(ReconcileJob::for_run(&run)) {
            tracing::warn!("Could not queue reconciliation of {}: {}", run.key(), e);
        }
    }
    Ok(run)
}

/// Finalizes one terminal run. Non-terminal and already finalized runs are
/// left alone.
pub async fn reconcile(state: &AppState, job: &ReconcileJob) -> Result<()> {
    let Some(run) = PipelineRunRepo::get(&state.db, &job.namespace, &job.name).await? else {
        tracing::debug!("PipelineRun {}/{} is gone, nothing to reconcile", job.namespace, job.name);
        return Ok(());
    };
    if !run.state.is_terminal() || run.finalized {
        return Ok(());
    }

    let lock = state.repository_lock(&run.repository_key());
    let (repo, started) = {
        let _guard = lock.lock().await;

        let Some(mut repo) =
            RepositoryRepo::get(&state.db, &run.repository_namespace, &run.repository_name).await?
        else {
            tracing::warn!(
                "Repository {} of PipelineRun {} no longer exists",
                run.repository_key(),
                run.key()
            );
            SecretRepo::delete_owned_by(&state.db, &run.key()).await?;
            PipelineRunRepo::mark_finalized(&state.db, &run.namespace, &run.name).await?;
            return Ok(());
        };

        repo.push_status(reporter::status_entry(&run), state.config.max_repository_status);
        RepositoryRepo::update_status(&state.db, &repo.namespace, &repo.name, &repo.status).await?;

        let released = SecretRepo::delete_owned_by(&state.db, &run.key()).await?;
        if released > 0 {
            tracing::debug!("Released {} git credential secret(s) of {}", released, run.key());
        }

        if let Some(keep) = max_keep_runs(&run) {
            concurrency::prune(state, &repo, &run.original_prname, keep).await?;
        }

        let started = concurrency::dequeue(state, &repo).await?;
        (repo, started)
    };

    let repo = with_global_defaults(state, repo).await?;

    report_final(state, &repo, &run).await;
    for queued in &started {
        report_started(state, &repo, queued).await;
    }

    PipelineRunRepo::mark_finalized(&state.db, &run.namespace, &run.name).await?;
    tracing::info!("Finalized PipelineRun {} ({})", run.key(), run.state);
    Ok(())
}

async fn with_global_defaults(state: &AppState, mut repo: Repository) -> Result<Repository> {
    let global = state.config.global_repository();
    if repo.namespace == global.namespace && repo.name == global.name {
        return Ok(repo);
    }
    if let Some(defaults) = RepositoryRepo::get(&state.db, &global.namespace, &global.name).await? {
        repo.merge_global(&defaults.spec);
    }
    Ok(repo)
}

fn max_keep_runs(run: &PipelineRun) -> Option<usize> {
    run.annotations
        .get(keys::MAX_KEEP_RUNS)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
}

async fn report_final(state: &AppState, repo: &Repository, run: &PipelineRun) {
    let mut event = match event_for_run(run) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("Cannot rebuild the event of {}: {}", run.key(), e);
            return;
        }
    };
    let provider = match state.providers.connect(&mut event, repo).await {
        Ok(provider) => provider,
        Err(e) => {
            tracing::warn!("Cannot report {} to {}: {}", run.key(), event.full_name(), e);
            return;
        }
    };
    let redactor = reporter::base_redactor(state, &event);

    if let Err(e) =
        reporter::report_run(state, provider.as_ref(), repo, &event, run, &redactor).await
    {
        tracing::warn!("Failed to report final status of {}: {}", run.key(), e);
    }

    if run.state == PipelineRunState::Failed && event.is_pull_request() {
        post_analysis(state, provider.as_ref(), repo, &event, run, &redactor).await;
    }
}

/// Tells the forge that runs released from the queue have started.
pub(crate) async fn report_dequeued(state: &AppState, repo: Repository, started: &[PipelineRun]) {
    let repo = match with_global_defaults(state, repo).await {
        Ok(repo) => repo,
        Err(e) => {
            tracing::warn!("Cannot report started runs: {}", e);
            return;
        }
    };
    for run in started {
        report_started(state, &repo, run).await;
    }
}

async fn report_started(state: &AppState, repo: &Repository, run: &PipelineRun) {
    let mut event = match event_for_run(run) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("Cannot rebuild the event of {}: {}", run.key(), e);
            return;
        }
    };
    match state.providers.connect(&mut event, repo).await {
        Ok(provider) => {
            let redactor = reporter::base_redactor(state, &event);
            if let Err(e) =
                reporter::report_run(state, provider.as_ref(), repo, &event, run, &redactor).await
            {
                tracing::warn!("Failed to report start of {}: {}", run.key(), e);
            }
        }
        Err(e) => tracing::warn!("Cannot report {} to {}: {}", run.key(), event.full_name(), e),
    }
}

async fn post_analysis(
    state: &AppState,
    provider: &dyn Provider,
    repo: &Repository,
    event: &Event,
    run: &PipelineRun,
    redactor: &Redactor,
) {
    let Some(settings) = AiAnalyzer::settings(repo) else {
        return;
    };
    let strategy = repo.comment_strategy(provider.kind());
    if strategy == CommentStrategy::DisableAll {
        return;
    }
    let analyses = match AiAnalyzer::new(state.http.clone())
        .analyze(&state.db, repo, &settings, run, redactor)
        .await
    {
        Ok(analyses) => analyses,
        Err(e) => {
            tracing::warn!("AI analysis of {} failed: {}", run.key(), e);
            return;
        }
    };
    for analysis in analyses {
        let posted = match strategy {
            CommentStrategy::Update => {
                let marker = analysis_marker(&analysis.role, &run.original_prname);
                provider
                    .create_or_update_comment(event, &marker, &analysis.body)
                    .await
            }
            _ => provider.create_comment(event, &analysis.body).await,
        };
        if let Err(e) = posted {
            tracing::warn!("Failed to post {} analysis of {}: {}", analysis.role, run.key(), e);
        }
    }
}

/// Rebuilds the forge coordinates of the event that launched `run` from the
/// annotations written at launch.
pub fn event_for_run(run: &PipelineRun) -> Result<Event> {
    let annotation = |key: &str| run.annotations.get(key).cloned().unwrap_or_default();
    let optional = |key: &str| run.annotations.get(key).filter(|v| !v.is_empty()).cloned();
    let number = |key: &str| optional(key).and_then(|v| v.parse::<i64>().ok());

    let kind: ProviderKind = optional(keys::GIT_PROVIDER)
        .ok_or_else(|| {
            PacError::Configuration(format!("PipelineRun {} has no git-provider annotation", run.key()))
        })?
        .parse()?;
    let event_type: EventType = run
        .event_type
        .parse()
        .map_err(|e: String| PacError::Configuration(e))?;
    let trigger = match event_type {
        EventType::Push | EventType::Tag => TriggerType::Push,
        EventType::Incoming => TriggerType::Incoming,
        _ => TriggerType::PullRequest,
    };

    let mut event = Event::new(kind, event_type, trigger);
    event.organization = annotation(keys::URL_ORG);
    event.repository = annotation(keys::URL_REPOSITORY);
    event.url = annotation(keys::REPO_URL);
    event.base_branch = annotation(keys::BRANCH);
    event.head_branch = annotation(keys::SOURCE_BRANCH);
    event.sha = run.sha.clone();
    event.sha_url = optional(keys::SHA_URL);
    event.sha_title = optional(keys::SHA_TITLE);
    event.sender = annotation(keys::SENDER);
    event.pull_request_number = run.pull_request_number.or_else(|| number(keys::PULL_REQUEST));
    event.installation_id = number(keys::INSTALLATION_ID);
    event.github_enterprise_host = optional(keys::GHE_URL);
    event.source_project_id = number(keys::SOURCE_PROJECT_ID);
    event.target_project_id = number(keys::TARGET_PROJECT_ID);
    event.discussion_id = optional(keys::DISCUSSION_ID);
    if let Some((owner, name)) = optional(keys::HEAD_REPOSITORY)
        .as_deref()
        .and_then(|full| full.rsplit_once('/'))
    {
        event.head_organization = owner.to_string();
        event.head_repository = name.to_string();
    }
    Ok(event)
}
