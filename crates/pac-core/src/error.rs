//! Error types for the Pipelines-as-Code core library.

use thiserror::Error;

/// Core error type for the controller.
#[derive(Error, Debug)]
pub enum PacError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Signature mismatch, missing secret, or expired token.
    #[error("Authentication failed: {0}")]
    AuthFail(String),

    /// Sender is not allowed to trigger runs on this repository.
    #[error("Sender {0} is not allowed to trigger runs")]
    AclDenied(String),

    #[error("Invalid webhook payload: {0}")]
    InvalidWebhookPayload(String),

    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Repository already exists: {0}")]
    RepositoryConflict(String),

    #[error("Invalid repository: {0}")]
    InvalidRepository(String),

    #[error("PipelineRun not found: {0}")]
    PipelineRunNotFound(String),

    #[error("Secret not found: {namespace}/{name}")]
    SecretNotFound { namespace: String, name: String },

    /// CEL type/reference error, YAML parse failure, unknown remote reference.
    #[error("{0}")]
    Template(String),

    #[error("CEL expression error: {0}")]
    Cel(String),

    /// Forge error while reading `.tekton` or remote references.
    #[error("Failed to fetch {path}: {message}")]
    RemoteFetch { path: String, message: String },

    /// Failure to persist a workload.
    #[error("Failed to create PipelineRun: {0}")]
    Admit(String),

    /// Forge API failure. `status` is absent for transport errors.
    #[error("Provider error{}: {message}", status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    Provider { status: Option<u16>, message: String },

    #[error("Unsupported provider operation: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid timestamp in {field}: {message}")]
    DateParse {
        field: &'static str,
        message: String,
    },
}

impl PacError {
    /// Shorthand for a provider error with an HTTP status.
    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        PacError::Provider {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Shorthand for a provider transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        PacError::Provider {
            status: None,
            message: message.into(),
        }
    }

    /// Whether the operation may succeed if attempted again.
    ///
    /// Only forge transport failures, rate limits, and 5xx answers are retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            PacError::Provider { status: None, .. } => true,
            PacError::Provider {
                status: Some(code), ..
            } => *code == 429 || *code >= 500,
            PacError::Admit(_) => true,
            _ => false,
        }
    }

    /// Whether the forge answered "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PacError::Provider {
                status: Some(404),
                ..
            }
        )
    }
}

impl From<reqwest::Error> for PacError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => PacError::provider(status.as_u16(), err.to_string()),
            None => PacError::transport(err.to_string()),
        }
    }
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, PacError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PacError::provider(502, "bad gateway").is_retryable());
        assert!(PacError::provider(429, "slow down").is_retryable());
        assert!(PacError::transport("connection reset").is_retryable());
        assert!(!PacError::provider(404, "missing").is_retryable());
        assert!(!PacError::Template("bad yaml".into()).is_retryable());
    }

    #[test]
    fn test_provider_error_display() {
        let err = PacError::provider(403, "forbidden");
        assert_eq!(err.to_string(), "Provider error (403): forbidden");
        let err = PacError::transport("timeout");
        assert_eq!(err.to_string(), "Provider error: timeout");
    }
}
