//! Application state for the controller.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use pac_core::db::DbPool;
use pac_core::providers::ProviderFactory;
use pac_core::resolver::GlobalRepository;
use pac_core::status::DEFAULT_APPLICATION_NAME;
use secrecy::SecretString;
use tokio::sync::{Mutex, mpsc};
use url::Url;

use crate::middleware::AdminAuthConfig;
use crate::worker::ReconcileJob;

/// Skip markers honored in head commit messages.
pub const DEFAULT_SKIP_CI_MARKERS: [&str; 2] = ["[skip ci]", "[skip tkn]"];

/// Server configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to.
    pub listen_addr: String,
    /// Public URL of the controller, used for log links.
    pub controller_url: String,
    /// Database URL.
    pub database_url: String,
    /// Namespace the controller (and the global Repository) lives in.
    pub namespace: String,
    /// Name of the global Repository record.
    pub global_repository: String,
    /// Prefix of commit status names.
    pub application_name: String,
    /// Webhook secret of the GitHub App.
    pub webhook_secret: Option<Arc<SecretString>>,
    pub github_app_id: Option<String>,
    pub github_private_key_path: Option<String>,
    /// Only app deliveries carrying this enterprise host are served.
    pub github_enterprise_host: Option<String>,
    /// Deadline for handling one webhook delivery.
    pub request_timeout: Duration,
    /// Bound of the Repository status list.
    pub max_repository_status: usize,
    pub bitbucket_cloud_check_source_ip: bool,
    pub bitbucket_cloud_additional_source_ip: Vec<String>,
    /// An approved pull request stays approved for later pushes.
    pub remember_ok_to_test: bool,
    /// Label `/retest` and `/test` runs with `pull_request`.
    pub legacy_comment_event_label: bool,
    pub skip_ci_markers: Vec<String>,
    /// Whether dev mode is enabled.
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            controller_url: "http://localhost:8080".to_string(),
            database_url: "sqlite:pac.db".to_string(),
            namespace: "pipelines-as-code".to_string(),
            global_repository: "pipelines-as-code".to_string(),
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            webhook_secret: None,
            github_app_id: None,
            github_private_key_path: None,
            github_enterprise_host: None,
            request_timeout: Duration::from_secs(30),
            max_repository_status: 5,
            bitbucket_cloud_check_source_ip: true,
            bitbucket_cloud_additional_source_ip: Vec::new(),
            remember_ok_to_test: true,
            legacy_comment_event_label: false,
            skip_ci_markers: DEFAULT_SKIP_CI_MARKERS.iter().map(|m| m.to_string()).collect(),
            dev_mode: false,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(name: &str, default: bool) -> Result<bool, String> {
    match env_string(name) {
        None => Ok(default),
        Some(value) => match value.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(format!("{} must be true or false, got {}", name, value)),
        },
    }
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match env_string(name) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| format!("{} must be a number, got {}", name, value)),
    }
}

fn env_list(name: &str) -> Vec<String> {
    env_string(name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();

        let controller_url =
            env_string("PAC_CONTROLLER_URL").unwrap_or(defaults.controller_url.clone());
        let parsed = Url::parse(&controller_url)
            .map_err(|e| format!("Invalid PAC_CONTROLLER_URL: {}", e))?;

        let dev_mode = env_bool("PAC_DEV_MODE", false)?;

        // Validate HTTPS in production
        if !dev_mode && parsed.scheme() != "https" {
            let host = parsed.host_str().unwrap_or("");
            let is_loopback = host == "localhost" || host == "127.0.0.1" || host == "[::1]";
            if !is_loopback {
                return Err("PAC_CONTROLLER_URL must use HTTPS in production. Set PAC_DEV_MODE=true for development.".to_string());
            }
        }

        let github_app_id = env_string("PAC_GITHUB_APP_ID");
        let github_private_key_path = env_string("PAC_GITHUB_PRIVATE_KEY_PATH");
        if github_app_id.is_some() != github_private_key_path.is_some() {
            return Err(
                "PAC_GITHUB_APP_ID and PAC_GITHUB_PRIVATE_KEY_PATH must be set together".to_string(),
            );
        }

        let request_timeout_secs: u64 = env_number("PAC_REQUEST_TIMEOUT_SECS", 30)?;
        if request_timeout_secs == 0 {
            return Err("PAC_REQUEST_TIMEOUT_SECS must be greater than zero".to_string());
        }

        let mut skip_ci_markers = defaults.skip_ci_markers.clone();
        skip_ci_markers.extend(env_list("PAC_SKIP_CI_MARKERS"));

        Ok(Self {
            listen_addr: env_string("PAC_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            controller_url: controller_url.trim_end_matches('/').to_string(),
            database_url: env_string("DATABASE_URL").unwrap_or(defaults.database_url),
            namespace: env_string("PAC_NAMESPACE").unwrap_or(defaults.namespace),
            global_repository: env_string("PAC_GLOBAL_REPOSITORY")
                .unwrap_or(defaults.global_repository),
            application_name: env_string("PAC_APPLICATION_NAME")
                .unwrap_or(defaults.application_name),
            webhook_secret: env_string("PAC_WEBHOOK_SECRET")
                .map(|s| Arc::new(SecretString::from(s))),
            github_app_id,
            github_private_key_path,
            github_enterprise_host: env_string("PAC_GITHUB_ENTERPRISE_HOST"),
            request_timeout: Duration::from_secs(request_timeout_secs),
            max_repository_status: env_number("PAC_MAX_REPOSITORY_STATUS", 5)?,
            bitbucket_cloud_check_source_ip: env_bool("PAC_BITBUCKET_CLOUD_CHECK_SOURCE_IP", true)?,
            bitbucket_cloud_additional_source_ip: env_list(
                "PAC_BITBUCKET_CLOUD_ADDITIONAL_SOURCE_IP",
            ),
            remember_ok_to_test: env_bool("PAC_REMEMBER_OK_TO_TEST", true)?,
            legacy_comment_event_label: env_bool("PAC_LEGACY_COMMENT_EVENT_LABEL", false)?,
            skip_ci_markers,
            dev_mode,
        })
    }

    /// Where the global Repository record lives.
    pub fn global_repository(&self) -> GlobalRepository {
        GlobalRepository {
            namespace: self.namespace.clone(),
            name: self.global_repository.clone(),
        }
    }

    /// Log link of a launched run.
    pub fn log_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/api/pipelineruns/{}/{}", self.controller_url, namespace, name)
    }
}

/// Per-Repository admission locks keyed by `namespace/name`.
pub type RepositoryLocks = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub db: DbPool,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Hands out forge clients for events.
    pub providers: Arc<dyn ProviderFactory>,
    /// Client for remote references and AI analysis.
    pub http: reqwest::Client,
    pub repository_locks: RepositoryLocks,
    /// Channel for terminal transitions picked up by the reconciler.
    pub reconcile_tx: mpsc::Sender<ReconcileJob>,
    /// Admin authentication configuration.
    pub admin_auth_config: Arc<AdminAuthConfig>,
}

impl AppState {
    /// Creates a new application state.
    pub fn new(
        db: DbPool,
        config: ServerConfig,
        providers: Arc<dyn ProviderFactory>,
        http: reqwest::Client,
        reconcile_tx: mpsc::Sender<ReconcileJob>,
        admin_auth_config: AdminAuthConfig,
    ) -> Self {
        Self {
            db,
            config: Arc::new(config),
            providers,
            http,
            repository_locks: Arc::new(DashMap::new()),
            reconcile_tx,
            admin_auth_config: Arc::new(admin_auth_config),
        }
    }

    /// The admission lock of one Repository record.
    pub fn repository_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.repository_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
