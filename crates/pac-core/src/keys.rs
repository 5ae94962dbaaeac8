//! Annotation and label keys shared by candidates and launched workloads.

/// Prefix of every annotation and label the controller reads or writes.
pub const GROUP: &str = "pipelinesascode.tekton.dev";

pub const ON_EVENT: &str = "pipelinesascode.tekton.dev/on-event";
pub const ON_TARGET_BRANCH: &str = "pipelinesascode.tekton.dev/on-target-branch";
pub const ON_CEL_EXPRESSION: &str = "pipelinesascode.tekton.dev/on-cel-expression";
pub const ON_PATH_CHANGE: &str = "pipelinesascode.tekton.dev/on-path-change";
pub const ON_PATH_CHANGE_IGNORE: &str = "pipelinesascode.tekton.dev/on-path-change-ignore";
pub const ON_LABEL: &str = "pipelinesascode.tekton.dev/on-label";
pub const ON_COMMENT: &str = "pipelinesascode.tekton.dev/on-comment";
pub const MAX_KEEP_RUNS: &str = "pipelinesascode.tekton.dev/max-keep-runs";
pub const CANCEL_IN_PROGRESS: &str = "pipelinesascode.tekton.dev/cancel-in-progress";
pub const TASK: &str = "pipelinesascode.tekton.dev/task";
pub const PIPELINE: &str = "pipelinesascode.tekton.dev/pipeline";
pub const TARGET_NAMESPACE: &str = "pipelinesascode.tekton.dev/target-namespace";
pub const ORIGINAL_PRNAME: &str = "pipelinesascode.tekton.dev/original-prname";

pub const EVENT_TYPE: &str = "pipelinesascode.tekton.dev/event-type";
pub const SHA: &str = "pipelinesascode.tekton.dev/sha";
pub const SHA_URL: &str = "pipelinesascode.tekton.dev/sha-url";
pub const SHA_TITLE: &str = "pipelinesascode.tekton.dev/sha-title";
pub const URL_ORG: &str = "pipelinesascode.tekton.dev/url-org";
pub const URL_REPOSITORY: &str = "pipelinesascode.tekton.dev/url-repository";
pub const BRANCH: &str = "pipelinesascode.tekton.dev/branch";
pub const SOURCE_BRANCH: &str = "pipelinesascode.tekton.dev/source-branch";
pub const REPOSITORY: &str = "pipelinesascode.tekton.dev/repository";
pub const PULL_REQUEST: &str = "pipelinesascode.tekton.dev/pull-request";
pub const LOG_URL: &str = "pipelinesascode.tekton.dev/log-url";
pub const GIT_PROVIDER: &str = "pipelinesascode.tekton.dev/git-provider";
pub const STATE: &str = "pipelinesascode.tekton.dev/state";
pub const STATUS: &str = "pipelinesascode.tekton.dev/status";
pub const GIT_AUTH_SECRET: &str = "pipelinesascode.tekton.dev/git-auth-secret";
pub const COMMENT_ID: &str = "pipelinesascode.tekton.dev/comment-id";
pub const INSTALLATION_ID: &str = "pipelinesascode.tekton.dev/installation-id";
pub const GHE_URL: &str = "pipelinesascode.tekton.dev/ghe-url";
pub const SOURCE_PROJECT_ID: &str = "pipelinesascode.tekton.dev/source-project-id";
pub const TARGET_PROJECT_ID: &str = "pipelinesascode.tekton.dev/target-project-id";
pub const HEAD_REPOSITORY: &str = "pipelinesascode.tekton.dev/head-repository";
pub const REPO_URL: &str = "pipelinesascode.tekton.dev/repo-url";
pub const SENDER: &str = "pipelinesascode.tekton.dev/sender";
pub const DISCUSSION_ID: &str = "pipelinesascode.tekton.dev/discussion-id";
pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "pipelinesascode.tekton.dev";

/// Maximum length of a Kubernetes label value.
const MAX_LABEL_LEN: usize = 63;

/// Makes a string safe to use as a label value.
///
/// Label values allow `[A-Za-z0-9._-]`, at most 63 characters, starting and
/// ending with an alphanumeric character.
pub fn sanitize_label_value(value: &str) -> String {
    let mapped: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let mut truncated: String = mapped.chars().take(MAX_LABEL_LEN).collect();
    while truncated
        .chars()
        .last()
        .is_some_and(|c| !c.is_ascii_alphanumeric())
    {
        truncated.pop();
    }
    truncated
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Makes a string safe to use as a resource name (DNS-1123 subdomain).
pub fn sanitize_resource_name(value: &str) -> String {
    let lowered: String = value
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    lowered
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_label_value() {
        assert_eq!(sanitize_label_value("feature/new-thing"), "feature-new-thing");
        assert_eq!(sanitize_label_value("refs/heads/main"), "refs-heads-main");
        assert_eq!(sanitize_label_value("--x--"), "x");
        let long = "a".repeat(80);
        assert_eq!(sanitize_label_value(&long).len(), 63);
        assert_eq!(sanitize_label_value("Owner Name"), "Owner-Name");
    }

    #[test]
    fn test_sanitize_resource_name() {
        assert_eq!(sanitize_resource_name("My_Pipeline"), "my-pipeline");
        assert_eq!(sanitize_resource_name("-pr-"), "pr");
    }
}
