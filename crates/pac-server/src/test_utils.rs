//! Test utilities for pac-server unit and integration tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use pac_core::cel::ChangedFiles;
use pac_core::db::{DbPool, RepositoryRepo, create_pool, run_migrations};
use pac_core::models::{
    Event, PipelineRun, PipelineRunState, ProviderKind, ProviderToken, Repository,
};
use pac_core::providers::{
    Comment, CommitStatus, DirEntry, FileLocation, Provider, ProviderFactory,
};
use pac_core::{PacError, Result};
use tokio::sync::mpsc;

use crate::middleware::AdminAuthConfig;
use crate::routes;
use crate::state::{AppState, ServerConfig};
use crate::worker::{ReconcileJob, reconcile, reconcile_channel};

/// Test admin token used in all tests.
pub const TEST_ADMIN_TOKEN: &str = "test-admin-token-12345";

/// Token the fake forge hands out.
pub const FAKE_PROVIDER_TOKEN: &str = "fake-forge-token";

/// A pull request known to the fake forge.
#[derive(Debug, Clone)]
pub struct FakePullRequest {
    pub head_sha: String,
    pub head_branch: String,
    pub base_branch: String,
    pub labels: Vec<String>,
}

/// A comment posted on the fake forge.
#[derive(Debug, Clone)]
pub struct PostedComment {
    pub id: String,
    pub pull_request: Option<i64>,
    pub body: String,
}

/// A commit status posted on the fake forge.
#[derive(Debug, Clone)]
pub struct PostedStatus {
    pub sha: String,
    pub status: CommitStatus,
}

#[derive(Default)]
struct ForgeData {
    files: BTreeMap<String, String>,
    branches: BTreeMap<String, String>,
    commit_messages: BTreeMap<String, String>,
    pull_requests: BTreeMap<i64, FakePullRequest>,
    collaborators: Vec<String>,
    changed_files: Vec<String>,
    statuses: Vec<PostedStatus>,
    comments: Vec<PostedComment>,
    next_comment_id: u64,
}

/// Scripted forge: serves files and pull requests, records what the
/// controller posts back.
#[derive(Default)]
pub struct FakeForge {
    data: Mutex<ForgeData>,
}

impl FakeForge {
    fn data(&self) -> MutexGuard<'_, ForgeData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Serves `content` at `path` for every revision.
    pub fn add_file(&self, path: &str, content: &str) {
        self.data().files.insert(path.to_string(), content.to_string());
    }

    pub fn remove_file(&self, path: &str) {
        self.data().files.remove(path);
    }

    /// Head commit of a branch, used when an event carries no SHA.
    pub fn set_branch(&self, branch: &str, sha: &str) {
        self.data().branches.insert(branch.to_string(), sha.to_string());
    }

    pub fn set_commit_message(&self, sha: &str, message: &str) {
        self.data().commit_messages.insert(sha.to_string(), message.to_string());
    }

    pub fn add_pull_request(&self, number: i64, pull_request: FakePullRequest) {
        self.data().pull_requests.insert(number, pull_request);
    }

    pub fn add_collaborator(&self, user: &str) {
        self.data().collaborators.push(user.to_string());
    }

    pub fn set_changed_files(&self, files: &[&str]) {
        self.data().changed_files = files.iter().map(|f| f.to_string()).collect();
    }

    pub fn statuses(&self) -> Vec<PostedStatus> {
        self.data().statuses.clone()
    }

    /// Last status posted under `name`.
    pub fn last_status(&self, name: &str) -> Option<CommitStatus> {
        self.data()
            .statuses
            .iter()
            .rev()
            .find(|s| s.status.name == name)
            .map(|s| s.status.clone())
    }

    pub fn comments(&self) -> Vec<PostedComment> {
        self.data().comments.clone()
    }
}

/// Provider backed by a [`FakeForge`].
pub struct FakeProvider {
    kind: ProviderKind,
    forge: Arc<FakeForge>,
}

fn not_found(what: &str) -> PacError {
    PacError::provider(404, format!("{} not found", what))
}

#[async_trait]
impl Provider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn list_dir(&self, _event: &Event, location: &FileLocation) -> Result<Vec<DirEntry>> {
        let prefix = format!("{}/", location.path.trim_end_matches('/'));
        let data = self.forge.data();
        let mut entries: Vec<DirEntry> = Vec::new();
        for path in data.files.keys() {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            let entry = match rest.split_once('/') {
                Some((dir, _)) => DirEntry::dir(format!("{}{}", prefix, dir)),
                None => DirEntry::file(path.clone()),
            };
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn fetch_file(&self, _event: &Event, location: &FileLocation) -> Result<String> {
        self.forge
            .data()
            .files
            .get(&location.path)
            .cloned()
            .ok_or_else(|| not_found(&location.path))
    }

    async fn changed_files(&self, _event: &Event) -> Result<ChangedFiles> {
        let all = self.forge.data().changed_files.clone();
        Ok(ChangedFiles {
            modified: all.clone(),
            all,
            ..Default::default()
        })
    }

    async fn create_status(&self, event: &Event, status: &CommitStatus) -> Result<()> {
        self.forge.data().statuses.push(PostedStatus {
            sha: event.sha.clone(),
            status: status.clone(),
        });
        Ok(())
    }

    async fn list_comments(&self, event: &Event) -> Result<Vec<Comment>> {
        Ok(self
            .forge
            .data()
            .comments
            .iter()
            .filter(|c| c.pull_request == event.pull_request_number)
            .map(|c| Comment {
                id: c.id.clone(),
                body: c.body.clone(),
            })
            .collect())
    }

    async fn create_comment(&self, event: &Event, body: &str) -> Result<String> {
        let mut data = self.forge.data();
        data.next_comment_id += 1;
        let id = data.next_comment_id.to_string();
        data.comments.push(PostedComment {
            id: id.clone(),
            pull_request: event.pull_request_number,
            body: body.to_string(),
        });
        Ok(id)
    }

    async fn update_comment(&self, _event: &Event, id: &str, body: &str) -> Result<()> {
        let mut data = self.forge.data();
        let comment = data
            .comments
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| not_found("comment"))?;
        comment.body = body.to_string();
        Ok(())
    }

    async fn is_collaborator(&self, _event: &Event, user: &str) -> Result<bool> {
        Ok(self.forge.data().collaborators.iter().any(|c| c == user))
    }

    async fn populate_pull_request(&self, event: &mut Event) -> Result<()> {
        let number = event
            .pull_request_number
            .ok_or_else(|| PacError::Configuration("event has no pull request".to_string()))?;
        let pr = self
            .forge
            .data()
            .pull_requests
            .get(&number)
            .cloned()
            .ok_or_else(|| not_found("pull request"))?;
        event.sha = pr.head_sha;
        event.head_branch = pr.head_branch;
        event.base_branch = pr.base_branch;
        event.pull_request_labels = pr.labels;
        Ok(())
    }

    async fn commit_info(&self, event: &mut Event) -> Result<()> {
        let data = self.forge.data();
        if event.sha.is_empty() {
            let branch = if event.head_branch.is_empty() {
                &event.base_branch
            } else {
                &event.head_branch
            };
            event.sha = data
                .branches
                .get(branch)
                .cloned()
                .ok_or_else(|| not_found(&format!("branch {}", branch)))?;
        }
        event.head_commit_message = data.commit_messages.get(&event.sha).cloned();
        Ok(())
    }
}

/// Hands out [`FakeProvider`]s bound to one forge.
pub struct FakeProviderFactory {
    forge: Arc<FakeForge>,
}

impl FakeProviderFactory {
    pub fn new(forge: Arc<FakeForge>) -> Self {
        Self { forge }
    }
}

#[async_trait]
impl ProviderFactory for FakeProviderFactory {
    async fn connect(&self, event: &mut Event, repo: &Repository) -> Result<Arc<dyn Provider>> {
        let kind = event.provider.unwrap_or_else(|| repo.provider_kind());
        event.provider_info.token = Some(ProviderToken::new(FAKE_PROVIDER_TOKEN));
        event.provider_info.api_url = Some("http://forge.test".to_string());
        Ok(Arc::new(FakeProvider {
            kind,
            forge: self.forge.clone(),
        }))
    }
}

/// Test server configuration for integration tests.
pub struct TestConfig {
    pub db: DbPool,
    pub forge: Arc<FakeForge>,
    pub reconcile_rx: mpsc::Receiver<ReconcileJob>,
}

/// Creates an in-memory test database with migrations applied.
pub async fn setup_test_db() -> DbPool {
    let pool = create_pool("sqlite::memory:")
        .await
        .expect("Failed to create test database");
    run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

/// Creates test application state with in-memory database and a fake forge.
pub async fn setup_test_state() -> (AppState, TestConfig) {
    let db = setup_test_db().await;
    let forge = Arc::new(FakeForge::default());
    let (reconcile_tx, reconcile_rx) = reconcile_channel();

    let config = ServerConfig {
        controller_url: "http://localhost:8080".to_string(),
        database_url: "sqlite::memory:".to_string(),
        dev_mode: true,
        ..ServerConfig::default()
    };

    let admin_auth_config = AdminAuthConfig {
        admin_token: Some(Arc::new(TEST_ADMIN_TOKEN.to_string())),
        require_https: false,
        dev_mode: true,
        trusted_proxies: vec![],
    };

    let state = AppState::new(
        db.clone(),
        config,
        Arc::new(FakeProviderFactory::new(forge.clone())),
        reqwest::Client::new(),
        reconcile_tx,
        admin_auth_config,
    );

    let test_config = TestConfig {
        db,
        forge,
        reconcile_rx,
    };

    (state, test_config)
}

/// Creates the full application router for testing.
pub fn create_test_app(state: AppState) -> Router {
    routes::app_router(state)
}

/// Creates a test application with in-memory database.
/// Returns the router, the state and the test configuration.
pub async fn create_test_app_with_state() -> (Router, AppState, TestConfig) {
    let (state, config) = setup_test_state().await;
    let app = create_test_app(state.clone());
    (app, state, config)
}

/// Runs every queued reconcile job, including jobs queued by those runs.
pub async fn drain_reconciler(state: &AppState, rx: &mut mpsc::Receiver<ReconcileJob>) {
    while let Ok(job) = rx.try_recv() {
        reconcile(state, &job)
            .await
            .expect("Failed to reconcile PipelineRun");
    }
}

/// Stores Repository `namespace/app`, the owner of every [`sample_run`].
pub async fn seed_repository(db: &DbPool, namespace: &str) -> Repository {
    let repo = Repository::new(namespace, "app", "https://gitea/pac/app");
    RepositoryRepo::create(db, &repo)
        .await
        .expect("Failed to store test repository");
    repo
}

/// A bare run owned by Repository `namespace/app`.
pub fn sample_run(namespace: &str, name: &str, state: PipelineRunState) -> PipelineRun {
    let now = Utc::now();
    PipelineRun {
        namespace: namespace.to_string(),
        name: name.to_string(),
        repository_namespace: namespace.to_string(),
        repository_name: "app".to_string(),
        original_prname: "pipeline".to_string(),
        sha: "abc123".to_string(),
        event_type: "push".to_string(),
        state,
        source_branch: Some("main".to_string()),
        target_branch: Some("main".to_string()),
        pull_request_number: None,
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
        body: String::new(),
        secret_name: None,
        log_url: None,
        comment_id: None,
        message: None,
        finalized: false,
        created_at: now,
        started_at: (state != PipelineRunState::Pending).then_some(now),
        completed_at: state.is_terminal().then_some(now),
    }
}
