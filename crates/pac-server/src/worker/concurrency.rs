//! Per-Repository admission, cancel-in-progress and run retention.
//!
//! Callers hold the Repository admission lock around every function here so
//! that counts and transitions are not interleaved.

use pac_core::db::PipelineRunRepo;
use pac_core::models::{Event, PipelineRun, PipelineRunState, Repository};
use pac_core::Result;

use crate::state::AppState;

use super::reconciler::transition;

fn repository_key(repo: &Repository) -> (&str, &str) {
    (&repo.namespace, &repo.name)
}

/// Branch a run is filed under: the head branch, or the base branch of
/// events that carry none.
pub fn source_branch(event: &Event) -> &str {
    if event.head_branch.is_empty() {
        &event.base_branch
    } else {
        &event.head_branch
    }
}

/// State a new run of `repo` starts in.
///
/// Without a limit every run starts. With one, a run is held when the limit
/// is reached or earlier runs are already queued, so queued runs keep their
/// order.
pub async fn admit_state(state: &AppState, repo: &Repository) -> Result<PipelineRunState> {
    let Some(limit) = repo.spec.concurrency_limit.filter(|l| *l > 0) else {
        return Ok(PipelineRunState::Running);
    };
    let key = repository_key(repo);
    let running = PipelineRunRepo::count_running(&state.db, key).await?;
    if running >= i64::from(limit) {
        return Ok(PipelineRunState::Pending);
    }
    let queued = PipelineRunRepo::list_queued(&state.db, key).await?;
    if queued.is_empty() {
        Ok(PipelineRunState::Running)
    } else {
        Ok(PipelineRunState::Pending)
    }
}

/// Starts held runs, oldest first, while slots are free.
pub async fn dequeue(state: &AppState, repo: &Repository) -> Result<Vec<PipelineRun>> {
    let key = repository_key(repo);
    let queued = PipelineRunRepo::list_queued(&state.db, key).await?;
    if queued.is_empty() {
        return Ok(Vec::new());
    }

    let free = match repo.spec.concurrency_limit.filter(|l| *l > 0) {
        Some(limit) => {
            let running = PipelineRunRepo::count_running(&state.db, key).await?;
            (i64::from(limit) - running).max(0) as usize
        }
        None => queued.len(),
    };

    let mut started = Vec::new();
    for run in queued.into_iter().take(free) {
        let run = PipelineRunRepo::update_state(
            &state.db,
            &run.namespace,
            &run.name,
            PipelineRunState::Running,
            None,
        )
        .await?;
        tracing::info!("Started queued PipelineRun {} for {}", run.key(), repo.key());
        started.push(run);
    }
    Ok(started)
}

/// Cancels active runs of the same candidate that a new run supersedes.
///
/// A pull request supersedes runs of the same pull request; a push supersedes
/// runs of the same branch that belong to no pull request.
pub async fn cancel_in_progress(
    state: &AppState,
    repo: &Repository,
    event: &Event,
    original_prname: &str,
) -> Result<Vec<PipelineRun>> {
    let key = repository_key(repo);
    let active = match event.pull_request_number {
        Some(number) => PipelineRunRepo::list_active_for_pull_request(&state.db, key, number).await?,
        None => {
            PipelineRunRepo::list_active_for_branch(&state.db, key, source_branch(event)).await?
        }
    };

    let mut cancelled = Vec::new();
    for run in active.into_iter().filter(|r| r.original_prname == original_prname) {
        let message = format!("Cancelled by a newer run on {}", event.short_sha());
        let run = transition(state, &run.namespace, &run.name, PipelineRunState::Cancelled, Some(&message)).await?;
        tracing::info!("Cancelled in-progress PipelineRun {}", run.key());
        cancelled.push(run);
    }
    Ok(cancelled)
}

/// Deletes succeeded runs of a candidate beyond the newest `keep`.
pub async fn prune(
    state: &AppState,
    repo: &Repository,
    original_prname: &str,
    keep: usize,
) -> Result<usize> {
    let finished =
        PipelineRunRepo::list_terminal_by_prname(&state.db, repository_key(repo), original_prname)
            .await?;
    let mut removed = 0;
    for run in finished
        .into_iter()
        .filter(|r| r.state == PipelineRunState::Succeeded)
        .skip(keep)
    {
        if PipelineRunRepo::delete(&state.db, &run.namespace, &run.name).await? {
            tracing::debug!("Pruned PipelineRun {} (max-keep-runs {})", run.key(), keep);
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{sample_run, seed_repository, setup_test_state};

    #[tokio::test]
    async fn test_admit_without_limit_runs_immediately() {
        let (state, _config) = setup_test_state().await;
        let repo = Repository::new("ns", "app", "https://gitea/pac/app");
        assert_eq!(admit_state(&state, &repo).await.unwrap(), PipelineRunState::Running);
    }

    #[tokio::test]
    async fn test_admit_holds_at_limit_and_dequeues_in_order() {
        let (state, _config) = setup_test_state().await;
        let mut repo = seed_repository(&state.db, "ns").await;
        repo.spec.concurrency_limit = Some(1);

        PipelineRunRepo::create(&state.db, &sample_run("ns", "first", PipelineRunState::Running))
            .await
            .unwrap();
        assert_eq!(admit_state(&state, &repo).await.unwrap(), PipelineRunState::Pending);

        let now = chrono::Utc::now();
        for (offset, name) in [(1, "second"), (2, "third")] {
            let mut run = sample_run("ns", name, PipelineRunState::Pending);
            run.created_at = now + chrono::Duration::seconds(offset);
            PipelineRunRepo::create(&state.db, &run).await.unwrap();
        }

        // Slot still taken: nothing moves.
        assert!(dequeue(&state, &repo).await.unwrap().is_empty());

        PipelineRunRepo::update_state(&state.db, "ns", "first", PipelineRunState::Succeeded, None)
            .await
            .unwrap();
        let started = dequeue(&state, &repo).await.unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].name, "second");
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_succeeded() {
        let (state, _config) = setup_test_state().await;
        let repo = seed_repository(&state.db, "ns").await;
        for name in ["a", "b", "c"] {
            PipelineRunRepo::create(&state.db, &sample_run("ns", name, PipelineRunState::Running))
                .await
                .unwrap();
            PipelineRunRepo::update_state(&state.db, "ns", name, PipelineRunState::Succeeded, None)
                .await
                .unwrap();
        }
        assert_eq!(prune(&state, &repo, "pipeline", 1).await.unwrap(), 2);
        let left = PipelineRunRepo::list(&state.db, Some(("ns", "app")), 10).await.unwrap();
        assert_eq!(left.len(), 1);
    }
}
