//! Database operations for namespaced secrets.

use std::collections::BTreeMap;

use chrono::Utc;
use sqlx::Row;

use super::DbPool;
use crate::error::{PacError, Result};
use crate::models::Secret;

/// Secret database operations.
pub struct SecretRepo;

impl SecretRepo {
    /// Creates or replaces a secret.
    pub async fn upsert<'e, E>(executor: E, secret: &Secret) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO secrets (namespace, name, data, labels, owner_run, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(namespace, name) DO UPDATE SET
                data = excluded.data,
                labels = excluded.labels,
                owner_run = excluded.owner_run
            "#,
        )
        .bind(&secret.namespace)
        .bind(&secret.name)
        .bind(serde_json::to_string(&secret.data)?)
        .bind(serde_json::to_string(&secret.labels)?)
        .bind(&secret.owner_run)
        .bind(Utc::now().to_rfc3339())
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Gets a secret by key.
    pub async fn get(pool: &DbPool, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let row = sqlx::query(
            r#"
            SELECT namespace, name, data, labels, owner_run
            FROM secrets
            WHERE namespace = ? AND name = ?
            "#,
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(pool)
        .await?;

        row.map(|r| Self::row_to_secret(&r)).transpose()
    }

    /// Reads one value out of a secret.
    pub async fn get_value(
        pool: &DbPool,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<String> {
        let secret = Self::get(pool, namespace, name)
            .await?
            .ok_or_else(|| PacError::SecretNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        secret
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| PacError::SecretNotFound {
                namespace: namespace.to_string(),
                name: format!("{}[{}]", name, key),
            })
    }

    /// Lists the names of secrets in a namespace. Values are never listed.
    pub async fn list_names(pool: &DbPool, namespace: &str) -> Result<Vec<String>> {
        let names = sqlx::query_scalar(
            "SELECT name FROM secrets WHERE namespace = ? ORDER BY name",
        )
        .bind(namespace)
        .fetch_all(pool)
        .await?;
        Ok(names)
    }

    pub async fn delete(pool: &DbPool, namespace: &str, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM secrets WHERE namespace = ? AND name = ?")
            .bind(namespace)
            .bind(name)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes every secret owned by a PipelineRun (`namespace/name`).
    pub async fn delete_owned_by(pool: &DbPool, owner_run: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM secrets WHERE owner_run = ?")
            .bind(owner_run)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Deletes run-owned secrets whose owning PipelineRun no longer exists.
    pub async fn delete_orphaned(pool: &DbPool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM secrets
            WHERE owner_run IS NOT NULL
              AND owner_run NOT IN (SELECT namespace || '/' || name FROM pipeline_runs)
            "#,
        )
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    fn row_to_secret(row: &sqlx::sqlite::SqliteRow) -> Result<Secret> {
        let data: String = row.get("data");
        let labels: String = row.get("labels");

        Ok(Secret {
            namespace: row.get("namespace"),
            name: row.get("name"),
            data: serde_json::from_str::<BTreeMap<String, String>>(&data)?,
            labels: serde_json::from_str::<BTreeMap<String, String>>(&labels)?,
            owner_run: row.get("owner_run"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PipelineRunRepo, RepositoryRepo, create_pool, run_migrations};
    use crate::models::{PipelineRun, PipelineRunState, Repository};

    #[tokio::test]
    async fn test_value_lookup_and_owner_cascade() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();

        let mut data = BTreeMap::new();
        data.insert("git-provider-token".to_string(), "tok".to_string());
        let secret = Secret {
            namespace: "ns".into(),
            name: "pac-gitauth-abcdef".into(),
            data,
            labels: BTreeMap::new(),
            owner_run: Some("ns/pr-abcdef".into()),
        };
        SecretRepo::upsert(&pool, &secret).await.unwrap();

        assert_eq!(
            SecretRepo::get_value(&pool, "ns", "pac-gitauth-abcdef", "git-provider-token")
                .await
                .unwrap(),
            "tok"
        );
        assert!(matches!(
            SecretRepo::get_value(&pool, "ns", "pac-gitauth-abcdef", "missing").await,
            Err(PacError::SecretNotFound { .. })
        ));

        assert_eq!(SecretRepo::delete_owned_by(&pool, "ns/pr-abcdef").await.unwrap(), 1);
        assert!(SecretRepo::get(&pool, "ns", "pac-gitauth-abcdef").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_orphaned_secrets_are_swept() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = Repository::new("ns", "app", "https://gitea/pac/app");
        RepositoryRepo::create(&pool, &repo).await.unwrap();
        PipelineRunRepo::create(&pool, &sample_run("live")).await.unwrap();

        for (name, owner) in [
            ("pac-gitauth-live", Some("ns/live")),
            ("pac-gitauth-gone", Some("ns/gone")),
            ("user-token", None),
        ] {
            let secret = Secret {
                namespace: "ns".into(),
                name: name.into(),
                data: BTreeMap::new(),
                labels: BTreeMap::new(),
                owner_run: owner.map(String::from),
            };
            SecretRepo::upsert(&pool, &secret).await.unwrap();
        }

        assert_eq!(SecretRepo::delete_orphaned(&pool).await.unwrap(), 1);
        assert_eq!(
            SecretRepo::list_names(&pool, "ns").await.unwrap(),
            vec!["pac-gitauth-live", "user-token"]
        );
    }

    fn sample_run(name: &str) -> PipelineRun {
        PipelineRun {
            namespace: "ns".into(),
            name: name.into(),
            repository_namespace: "ns".into(),
            repository_name: "app".into(),
            original_prname: "pr".into(),
            sha: "abc123".into(),
            event_type: "push".into(),
            state: PipelineRunState::Running,
            source_branch: None,
            target_branch: None,
            pull_request_number: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            body: "kind: PipelineRun".into(),
            secret_name: None,
            log_url: None,
            comment_id: None,
            message: None,
            finalized: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}
