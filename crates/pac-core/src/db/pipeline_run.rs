//! Database operations for launched PipelineRuns.

use std::collections::BTreeMap;

use chrono::Utc;
use sqlx::Row;

use super::{DbPool, SecretRepo, parse_optional_timestamp, parse_timestamp};
use crate::error::{PacError, Result};
use crate::models::{PipelineRun, PipelineRunState, Secret};

const COLUMNS: &str = r#"
    namespace, name, repository_namespace, repository_name, original_prname, sha,
    event_type, state, source_branch, target_branch, pull_request_number, labels,
    annotations, body, secret_name, log_url, comment_id, message, finalized,
    created_at, started_at, completed_at
"#;

/// PipelineRun database operations.
pub struct PipelineRunRepo;

impl PipelineRunRepo {
    /// Persists a new PipelineRun.
    pub async fn create(pool: &DbPool, run: &PipelineRun) -> Result<()> {
        Self::insert(pool, run).await
    }

    /// Persists a new PipelineRun together with the secret it owns.
    ///
    /// Both rows land in one transaction, so an interrupted launch never
    /// leaves a secret behind without its run.
    pub async fn create_with_secret(pool: &DbPool, run: &PipelineRun, secret: &Secret) -> Result<()> {
        let mut tx = pool.begin().await.map_err(|e| PacError::Admit(e.to_string()))?;
        Self::insert(&mut *tx, run).await?;
        SecretRepo::upsert(&mut *tx, secret)
            .await
            .map_err(|e| PacError::Admit(e.to_string()))?;
        tx.commit().await.map_err(|e| PacError::Admit(e.to_string()))?;
        Ok(())
    }

    async fn insert<'e, E>(executor: E, run: &PipelineRun) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(&format!(
            "INSERT INTO pipeline_runs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            COLUMNS
        ))
        .bind(&run.namespace)
        .bind(&run.name)
        .bind(&run.repository_namespace)
        .bind(&run.repository_name)
        .bind(&run.original_prname)
        .bind(&run.sha)
        .bind(&run.event_type)
        .bind(run.state.as_str())
        .bind(&run.source_branch)
        .bind(&run.target_branch)
        .bind(run.pull_request_number)
        .bind(serde_json::to_string(&run.labels)?)
        .bind(serde_json::to_string(&run.annotations)?)
        .bind(&run.body)
        .bind(&run.secret_name)
        .bind(&run.log_url)
        .bind(&run.comment_id)
        .bind(&run.message)
        .bind(run.finalized)
        .bind(run.created_at.to_rfc3339())
        .bind(run.started_at.map(|t| t.to_rfc3339()))
        .bind(run.completed_at.map(|t| t.to_rfc3339()))
        .execute(executor)
        .await
        .map_err(|e| PacError::Admit(e.to_string()))?;

        Ok(())
    }

    /// Gets a PipelineRun by key.
    pub async fn get(pool: &DbPool, namespace: &str, name: &str) -> Result<Option<PipelineRun>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM pipeline_runs WHERE namespace = ? AND name = ?",
            COLUMNS
        ))
        .bind(namespace)
        .bind(name)
        .fetch_optional(pool)
        .await?;

        row.map(|r| Self::row_to_run(&r)).transpose()
    }

    /// Lists PipelineRuns, newest first, optionally filtered by owning Repository.
    pub async fn list(
        pool: &DbPool,
        repository: Option<(&str, &str)>,
        limit: i64,
    ) -> Result<Vec<PipelineRun>> {
        let rows = match repository {
            Some((ns, name)) => {
                sqlx::query(&format!(
                    "SELECT {} FROM pipeline_runs
                     WHERE repository_namespace = ? AND repository_name = ?
                     ORDER BY created_at DESC, name LIMIT ?",
                    COLUMNS
                ))
                .bind(ns)
                .bind(name)
                .bind(limit)
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM pipeline_runs ORDER BY created_at DESC, name LIMIT ?",
                    COLUMNS
                ))
                .bind(limit)
                .fetch_all(pool)
                .await?
            }
        };

        rows.iter().map(Self::row_to_run).collect()
    }

    /// Whether a run already exists for this (repository, sha, original-prname).
    pub async fn exists_for(
        pool: &DbPool,
        repository: (&str, &str),
        sha: &str,
        original_prname: &str,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM pipeline_runs
            WHERE repository_namespace = ? AND repository_name = ?
              AND sha = ? AND original_prname = ?
            "#,
        )
        .bind(repository.0)
        .bind(repository.1)
        .bind(sha)
        .bind(original_prname)
        .fetch_one(pool)
        .await?;

        Ok(count > 0)
    }

    /// Counts non-terminal runs owned by a Repository (running or held).
    pub async fn count_active(pool: &DbPool, repository: (&str, &str)) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM pipeline_runs
            WHERE repository_namespace = ? AND repository_name = ?
              AND state IN ('Running', 'PipelineRunPending')
            "#,
        )
        .bind(repository.0)
        .bind(repository.1)
        .fetch_one(pool)
        .await?;

        Ok(count)
    }

    /// Counts runs currently executing for a Repository.
    pub async fn count_running(pool: &DbPool, repository: (&str, &str)) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM pipeline_runs
            WHERE repository_namespace = ? AND repository_name = ? AND state = 'Running'
            "#,
        )
        .bind(repository.0)
        .bind(repository.1)
        .fetch_one(pool)
        .await?;

        Ok(count)
    }

    /// Held runs in queue order: creation time, then SHA, then candidate name.
    pub async fn list_queued(pool: &DbPool, repository: (&str, &str)) -> Result<Vec<PipelineRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pipeline_runs
             WHERE repository_namespace = ? AND repository_name = ? AND state = 'PipelineRunPending'
             ORDER BY created_at ASC, sha ASC, original_prname ASC",
            COLUMNS
        ))
        .bind(repository.0)
        .bind(repository.1)
        .fetch_all(pool)
        .await?;

        rows.iter().map(Self::row_to_run).collect()
    }

    /// Active runs of one candidate for a Repository.
    pub async fn list_active_by_prname(
        pool: &DbPool,
        repository: (&str, &str),
        original_prname: &str,
    ) -> Result<Vec<PipelineRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pipeline_runs
             WHERE repository_namespace = ? AND repository_name = ? AND original_prname = ?
               AND state IN ('Running', 'PipelineRunPending')
             ORDER BY created_at ASC",
            COLUMNS
        ))
        .bind(repository.0)
        .bind(repository.1)
        .bind(original_prname)
        .fetch_all(pool)
        .await?;

        rows.iter().map(Self::row_to_run).collect()
    }

    /// Active runs for a pull request.
    pub async fn list_active_for_pull_request(
        pool: &DbPool,
        repository: (&str, &str),
        pull_request_number: i64,
    ) -> Result<Vec<PipelineRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pipeline_runs
             WHERE repository_namespace = ? AND repository_name = ? AND pull_request_number = ?
               AND state IN ('Running', 'PipelineRunPending')
             ORDER BY created_at ASC",
            COLUMNS
        ))
        .bind(repository.0)
        .bind(repository.1)
        .bind(pull_request_number)
        .fetch_all(pool)
        .await?;

        rows.iter().map(Self::row_to_run).collect()
    }

    /// Active runs on a branch without a pull request (push events).
    pub async fn list_active_for_branch(
        pool: &DbPool,
        repository: (&str, &str),
        source_branch: &str,
    ) -> Result<Vec<PipelineRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pipeline_runs
             WHERE repository_namespace = ? AND repository_name = ? AND source_branch = ?
               AND pull_request_number IS NULL
               AND state IN ('Running', 'PipelineRunPending')
             ORDER BY created_at ASC",
            COLUMNS
        ))
        .bind(repository.0)
        .bind(repository.1)
        .bind(source_branch)
        .fetch_all(pool)
        .await?;

        rows.iter().map(Self::row_to_run).collect()
    }

    /// Terminal runs of one candidate, newest first.
    pub async fn list_terminal_by_prname(
        pool: &DbPool,
        repository: (&str, &str),
        original_prname: &str,
    ) -> Result<Vec<PipelineRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pipeline_runs
             WHERE repository_namespace = ? AND repository_name = ? AND original_prname = ?
               AND state IN ('Succeeded', 'Failed', 'Cancelled')
             ORDER BY created_at DESC, name DESC",
            COLUMNS
        ))
        .bind(repository.0)
        .bind(repository.1)
        .bind(original_prname)
        .fetch_all(pool)
        .await?;

        rows.iter().map(Self::row_to_run).collect()
    }

    /// Terminal runs the reconciler has not processed yet.
    pub async fn list_unfinalized(pool: &DbPool) -> Result<Vec<PipelineRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pipeline_runs
             WHERE finalized = 0 AND state IN ('Succeeded', 'Failed', 'Cancelled')
             ORDER BY completed_at ASC",
            COLUMNS
        ))
        .fetch_all(pool)
        .await?;

        rows.iter().map(Self::row_to_run).collect()
    }

    /// Whether the pull request already had a run (ok-to-test memory).
    pub async fn has_run_for_pull_request(
        pool: &DbPool,
        repository: (&str, &str),
        pull_request_number: i64,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM pipeline_runs
            WHERE repository_namespace = ? AND repository_name = ? AND pull_request_number = ?
            "#,
        )
        .bind(repository.0)
        .bind(repository.1)
        .bind(pull_request_number)
        .fetch_one(pool)
        .await?;

        Ok(count > 0)
    }

    /// Latest cached forge comment id for a candidate on a pull request.
    pub async fn find_comment_id(
        pool: &DbPool,
        repository: (&str, &str),
        original_prname: &str,
        pull_request_number: i64,
    ) -> Result<Option<String>> {
        let id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT comment_id FROM pipeline_runs
            WHERE repository_namespace = ? AND repository_name = ?
              AND original_prname = ? AND pull_request_number = ?
              AND comment_id IS NOT NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(repository.0)
        .bind(repository.1)
        .bind(original_prname)
        .bind(pull_request_number)
        .fetch_optional(pool)
        .await?;

        Ok(id)
    }

    /// Moves a run to a new state, stamping start and completion times.
    ///
    /// Illegal transitions are rejected with `Configuration`, and a run that is
    /// already in `state` is returned unchanged.
    pub async fn update_state(
        pool: &DbPool,
        namespace: &str,
        name: &str,
        state: PipelineRunState,
        message: Option<&str>,
    ) -> Result<PipelineRun> {
        let mut run = Self::get(pool, namespace, name)
            .await?
            .ok_or_else(|| PacError::PipelineRunNotFound(format!("{}/{}", namespace, name)))?;
        if run.state == state {
            return Ok(run);
        }
        if !run.state.can_transition_to(state) {
            return Err(PacError::Configuration(format!(
                "cannot move {} from {} to {}",
                run.key(),
                run.state,
                state
            )));
        }

        let now = Utc::now();
        if state == PipelineRunState::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if state.is_terminal() {
            run.completed_at = Some(now);
        }
        run.state = state;
        if let Some(message) = message {
            run.message = Some(message.to_string());
        }

        sqlx::query(
            r#"
            UPDATE pipeline_runs SET state = ?, message = ?, started_at = ?, completed_at = ?
            WHERE namespace = ? AND name = ?
            "#,
        )
        .bind(run.state.as_str())
        .bind(&run.message)
        .bind(run.started_at.map(|t| t.to_rfc3339()))
        .bind(run.completed_at.map(|t| t.to_rfc3339()))
        .bind(namespace)
        .bind(name)
        .execute(pool)
        .await?;

        Ok(run)
    }

    /// Caches the forge comment id on the run.
    pub async fn set_comment_id(
        pool: &DbPool,
        namespace: &str,
        name: &str,
        comment_id: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE pipeline_runs SET comment_id = ? WHERE namespace = ? AND name = ?")
            .bind(comment_id)
            .bind(namespace)
            .bind(name)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Marks the terminal transition as processed.
    pub async fn mark_finalized(pool: &DbPool, namespace: &str, name: &str) -> Result<()> {
        sqlx::query("UPDATE pipeline_runs SET finalized = 1 WHERE namespace = ? AND name = ?")
            .bind(namespace)
            .bind(name)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Deletes a run and every secret it owns.
    pub async fn delete(pool: &DbPool, namespace: &str, name: &str) -> Result<bool> {
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM secrets WHERE owner_run = ?")
            .bind(format!("{}/{}", namespace, name))
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM pipeline_runs WHERE namespace = ? AND name = ?")
            .bind(namespace)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> Result<PipelineRun> {
        let state: String = row.get("state");
        let labels: String = row.get("labels");
        let annotations: String = row.get("annotations");
        let created_at: String = row.get("created_at");

        Ok(PipelineRun {
            namespace: row.get("namespace"),
            name: row.get("name"),
            repository_namespace: row.get("repository_namespace"),
            repository_name: row.get("repository_name"),
            original_prname: row.get("original_prname"),
            sha: row.get("sha"),
            event_type: row.get("event_type"),
            state: state
                .parse()
                .map_err(|e: String| PacError::Database(sqlx::Error::Decode(e.into())))?,
            source_branch: row.get("source_branch"),
            target_branch: row.get("target_branch"),
            pull_request_number: row.get("pull_request_number"),
            labels: serde_json::from_str::<BTreeMap<String, String>>(&labels)?,
            annotations: serde_json::from_str::<BTreeMap<String, String>>(&annotations)?,
            body: row.get("body"),
            secret_name: row.get("secret_name"),
            log_url: row.get("log_url"),
            comment_id: row.get("comment_id"),
            message: row.get("message"),
            finalized: row.get("finalized"),
            created_at: parse_timestamp("pipeline_run.created_at", &created_at)?,
            started_at: parse_optional_timestamp("pipeline_run.started_at", row.get("started_at"))?,
            completed_at: parse_optional_timestamp(
                "pipeline_run.completed_at",
                row.get("completed_at"),
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RepositoryRepo, create_pool, run_migrations};
    use crate::models::Repository;
    use chrono::Duration;

    async fn pool() -> DbPool {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = Repository::new("ns", "app", "https://gitea/pac/app");
        RepositoryRepo::create(&pool, &repo).await.unwrap();
        pool
    }

    fn run(name: &str, prname: &str, state: PipelineRunState, offset: i64) -> PipelineRun {
        PipelineRun {
            namespace: "ns".into(),
            name: name.into(),
            repository_namespace: "ns".into(),
            repository_name: "app".into(),
            original_prname: prname.into(),
            sha: "abc123".into(),
            event_type: "pull_request".into(),
            state,
            source_branch: Some("topic".into()),
            target_branch: Some("main".into()),
            pull_request_number: Some(1),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            body: "kind: PipelineRun".into(),
            secret_name: None,
            log_url: None,
            comment_id: None,
            message: None,
            finalized: false,
            created_at: Utc::now() + Duration::seconds(offset),
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_identity_lookup() {
        let pool = pool().await;
        PipelineRunRepo::create(&pool, &run("pr-abcdef", "pr", PipelineRunState::Running, 0))
            .await
            .unwrap();

        assert!(PipelineRunRepo::exists_for(&pool, ("ns", "app"), "abc123", "pr").await.unwrap());
        assert!(!PipelineRunRepo::exists_for(&pool, ("ns", "app"), "abc123", "other").await.unwrap());
        assert_eq!(PipelineRunRepo::count_active(&pool, ("ns", "app")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_queue_order() {
        let pool = pool().await;
        PipelineRunRepo::create(&pool, &run("b-1", "b", PipelineRunState::Pending, 2))
            .await
            .unwrap();
        PipelineRunRepo::create(&pool, &run("a-1", "a", PipelineRunState::Pending, 1))
            .await
            .unwrap();

        let queued = PipelineRunRepo::list_queued(&pool, ("ns", "app")).await.unwrap();
        let names: Vec<_> = queued.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a-1", "b-1"]);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let pool = pool().await;
        PipelineRunRepo::create(&pool, &run("pr-1", "pr", PipelineRunState::Pending, 0))
            .await
            .unwrap();

        let running = PipelineRunRepo::update_state(&pool, "ns", "pr-1", PipelineRunState::Running, None)
            .await
            .unwrap();
        assert!(running.started_at.is_some());

        let done = PipelineRunRepo::update_state(&pool, "ns", "pr-1", PipelineRunState::Succeeded, None)
            .await
            .unwrap();
        assert!(done.completed_at.is_some());

        let err = PipelineRunRepo::update_state(&pool, "ns", "pr-1", PipelineRunState::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PacError::Configuration(_)));

        let unfinalized = PipelineRunRepo::list_unfinalized(&pool).await.unwrap();
        assert_eq!(unfinalized.len(), 1);
        PipelineRunRepo::mark_finalized(&pool, "ns", "pr-1").await.unwrap();
        assert!(PipelineRunRepo::list_unfinalized(&pool).await.unwrap().is_empty());
    }

    fn secret(name: &str, owner: &str) -> Secret {
        let mut data = BTreeMap::new();
        data.insert("git-provider-token".to_string(), "tok".to_string());
        Secret {
            namespace: "ns".into(),
            name: name.into(),
            data,
            labels: BTreeMap::new(),
            owner_run: Some(owner.into()),
        }
    }

    #[tokio::test]
    async fn test_create_with_secret_is_atomic() {
        let pool = pool().await;
        let first = run("pr-1", "pr", PipelineRunState::Running, 0);
        PipelineRunRepo::create_with_secret(&pool, &first, &secret("pac-gitauth-one", "ns/pr-1"))
            .await
            .unwrap();
        assert!(SecretRepo::get(&pool, "ns", "pac-gitauth-one").await.unwrap().is_some());

        // Same run name again: the insert fails and the second secret is rolled back.
        let err = PipelineRunRepo::create_with_secret(&pool, &first, &secret("pac-gitauth-two", "ns/pr-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PacError::Admit(_)));
        assert!(SecretRepo::get(&pool, "ns", "pac-gitauth-two").await.unwrap().is_none());
        assert_eq!(SecretRepo::list_names(&pool, "ns").await.unwrap(), vec!["pac-gitauth-one"]);
    }
}
