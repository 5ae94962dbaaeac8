//! Database operations for Repository records.

use chrono::Utc;
use sqlx::Row;

use super::{DbPool, parse_timestamp};
use crate::error::{PacError, Result};
use crate::models::{Repository, RepositoryRunStatus, RepositorySpec};

/// Repository record database operations.
pub struct RepositoryRepo;

impl RepositoryRepo {
    /// Creates a new Repository record.
    ///
    /// Fails with `RepositoryConflict` when the key or the URL is already taken.
    pub async fn create(pool: &DbPool, repo: &Repository) -> Result<()> {
        repo.validate()?;
        if let Some(existing) = Self::get_by_url(pool, &repo.spec.url).await? {
            return Err(PacError::RepositoryConflict(format!(
                "url {} is already used by {}",
                repo.spec.url,
                existing.key()
            )));
        }
        if Self::get(pool, &repo.namespace, &repo.name).await?.is_some() {
            return Err(PacError::RepositoryConflict(repo.key()));
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO repositories (namespace, name, url, spec, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&repo.namespace)
        .bind(&repo.name)
        .bind(&repo.spec.url)
        .bind(serde_json::to_string(&repo.spec)?)
        .bind(serde_json::to_string(&repo.status)?)
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Gets a Repository record by key.
    pub async fn get(pool: &DbPool, namespace: &str, name: &str) -> Result<Option<Repository>> {
        let row = sqlx::query(
            r#"
            SELECT namespace, name, spec, status, created_at, updated_at
            FROM repositories
            WHERE namespace = ? AND name = ?
            "#,
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(pool)
        .await?;

        row.map(|r| Self::row_to_repository(&r)).transpose()
    }

    /// Gets the Repository record bound to a forge URL.
    pub async fn get_by_url(pool: &DbPool, url: &str) -> Result<Option<Repository>> {
        let row = sqlx::query(
            r#"
            SELECT namespace, name, spec, status, created_at, updated_at
            FROM repositories
            WHERE url = ?
            "#,
        )
        .bind(url)
        .fetch_optional(pool)
        .await?;

        row.map(|r| Self::row_to_repository(&r)).transpose()
    }

    /// Lists Repository records whose URL equals `url`, ordered by key.
    pub async fn list_by_url(pool: &DbPool, url: &str) -> Result<Vec<Repository>> {
        let rows = sqlx::query(
            r#"
            SELECT namespace, name, spec, status, created_at, updated_at
            FROM repositories
            WHERE url = ?
            ORDER BY namespace, name
            "#,
        )
        .bind(url)
        .fetch_all(pool)
        .await?;

        rows.iter().map(Self::row_to_repository).collect()
    }

    /// Lists all Repository records, optionally restricted to a namespace.
    pub async fn list(pool: &DbPool, namespace: Option<&str>) -> Result<Vec<Repository>> {
        let rows = match namespace {
            Some(ns) => {
                sqlx::query(
                    r#"
                    SELECT namespace, name, spec, status, created_at, updated_at
                    FROM repositories
                    WHERE namespace = ?
                    ORDER BY namespace, name
                    "#,
                )
                .bind(ns)
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT namespace, name, spec, status, created_at, updated_at
                    FROM repositories
                    ORDER BY namespace, name
                    "#,
                )
                .fetch_all(pool)
                .await?
            }
        };

        rows.iter().map(Self::row_to_repository).collect()
    }

    /// Replaces the spec of a Repository record.
    pub async fn update_spec(
        pool: &DbPool,
        namespace: &str,
        name: &str,
        spec: &RepositorySpec,
    ) -> Result<Repository> {
        let mut repo = Self::get(pool, namespace, name)
            .await?
            .ok_or_else(|| PacError::RepositoryNotFound(format!("{}/{}", namespace, name)))?;
        repo.spec = spec.clone();
        repo.validate()?;

        if let Some(other) = Self::get_by_url(pool, &spec.url).await? {
            if other.key() != repo.key() {
                return Err(PacError::RepositoryConflict(format!(
                    "url {} is already used by {}",
                    spec.url,
                    other.key()
                )));
            }
        }

        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE repositories SET url = ?, spec = ?, updated_at = ?
            WHERE namespace = ? AND name = ?
            "#,
        )
        .bind(&spec.url)
        .bind(serde_json::to_string(spec)?)
        .bind(now.to_rfc3339())
        .bind(namespace)
        .bind(name)
        .execute(pool)
        .await?;

        repo.updated_at = now;
        Ok(repo)
    }

    /// Writes the rolling status list.
    pub async fn update_status(
        pool: &DbPool,
        namespace: &str,
        name: &str,
        status: &[RepositoryRunStatus],
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE repositories SET status = ?, updated_at = ?
            WHERE namespace = ? AND name = ?
            "#,
        )
        .bind(serde_json::to_string(status)?)
        .bind(Utc::now().to_rfc3339())
        .bind(namespace)
        .bind(name)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PacError::RepositoryNotFound(format!("{}/{}", namespace, name)));
        }
        Ok(())
    }

    /// Deletes a Repository record with its PipelineRuns and their secrets.
    pub async fn delete(pool: &DbPool, namespace: &str, name: &str) -> Result<bool> {
        let mut tx = pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM secrets WHERE owner_run IN (
                SELECT namespace || '/' || name FROM pipeline_runs
                WHERE repository_namespace = ? AND repository_name = ?
            )
            "#,
        )
        .bind(namespace)
        .bind(name)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM pipeline_runs WHERE repository_namespace = ? AND repository_name = ?",
        )
        .bind(namespace)
        .bind(name)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM repositories WHERE namespace = ? AND name = ?")
            .bind(namespace)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    fn row_to_repository(row: &sqlx::sqlite::SqliteRow) -> Result<Repository> {
        let spec: String = row.get("spec");
        let status: String = row.get("status");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");

        Ok(Repository {
            namespace: row.get("namespace"),
            name: row.get("name"),
            spec: serde_json::from_str(&spec)?,
            status: serde_json::from_str(&status)?,
            created_at: parse_timestamp("repository.created_at", &created_at)?,
            updated_at: parse_timestamp("repository.updated_at", &updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, run_migrations};

    async fn pool() -> DbPool {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_create_and_lookup_by_url() {
        let pool = pool().await;
        let repo = Repository::new("ns", "app", "https://gitea/pac/app");
        RepositoryRepo::create(&pool, &repo).await.unwrap();

        let found = RepositoryRepo::get_by_url(&pool, "https://gitea/pac/app")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.key(), "ns/app");
        assert!(found.status.is_empty());
    }

    #[tokio::test]
    async fn test_url_uniqueness() {
        let pool = pool().await;
        let repo = Repository::new("ns", "app", "https://gitea/pac/app");
        RepositoryRepo::create(&pool, &repo).await.unwrap();

        let clash = Repository::new("other", "app", "https://gitea/pac/app");
        let err = RepositoryRepo::create(&pool, &clash).await.unwrap_err();
        assert!(matches!(err, PacError::RepositoryConflict(_)));
    }

    #[tokio::test]
    async fn test_update_spec_rejects_bad_scheme() {
        let pool = pool().await;
        let repo = Repository::new("ns", "app", "https://gitea/pac/app");
        RepositoryRepo::create(&pool, &repo).await.unwrap();

        let mut spec = repo.spec.clone();
        spec.url = "ftp://gitea/pac/app".into();
        let err = RepositoryRepo::update_spec(&pool, "ns", "app", &spec)
            .await
            .unwrap_err();
        assert!(matches!(err, PacError::InvalidRepository(_)));
    }

    #[tokio::test]
    async fn test_delete() {
        let pool = pool().await;
        let repo = Repository::new("ns", "app", "https://gitea/pac/app");
        RepositoryRepo::create(&pool, &repo).await.unwrap();
        assert!(RepositoryRepo::delete(&pool, "ns", "app").await.unwrap());
        assert!(!RepositoryRepo::delete(&pool, "ns", "app").await.unwrap());
        assert!(RepositoryRepo::get(&pool, "ns", "app").await.unwrap().is_none());
    }
}
