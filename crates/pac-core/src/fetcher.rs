//! Reads `.tekton/` at the event commit through the forge API.

use crate::error::{PacError, Result};
use crate::models::Event;
use crate::providers::{EntryKind, FileLocation, Provider};

/// Directory holding the candidates.
pub const TEKTON_DIR: &str = ".tekton";

/// A file read from the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

fn is_yaml(path: &str) -> bool {
    path.ends_with(".yaml") || path.ends_with(".yml")
}

/// Depth of `path` below `.tekton/`; `.tekton/a.yaml` is 1.
fn depth_below_root(path: &str) -> usize {
    path.trim_start_matches('/')
        .strip_prefix(TEKTON_DIR)
        .map(|rest| rest.trim_start_matches('/').split('/').count())
        .unwrap_or(usize::MAX)
}

/// Lists and reads every `.yaml`/`.yml` file under `.tekton/` at the head
/// commit, descending one sub-directory level where the forge can list it.
///
/// A missing directory yields no files. Files come back sorted by path.
pub async fn fetch_tekton_files(provider: &dyn Provider, event: &Event) -> Result<Vec<SourceFile>> {
    let root = FileLocation::head(event, TEKTON_DIR);
    let entries = provider.list_dir(event, &root).await.map_err(|e| remote_error(TEKTON_DIR, e))?;

    let mut paths = Vec::new();
    for entry in entries {
        match entry.kind {
            EntryKind::File => paths.push(entry.path),
            EntryKind::Dir if provider.kind().supports_nested_listing() => {
                let location = FileLocation::head(event, &entry.path);
                let nested = provider
                    .list_dir(event, &location)
                    .await
                    .map_err(|e| remote_error(&entry.path, e))?;
                paths.extend(
                    nested
                        .into_iter()
                        .filter(|e| e.kind == EntryKind::File)
                        .map(|e| e.path),
                );
            }
            EntryKind::Dir => {
                tracing::debug!("Not descending into {} on {}", entry.path, provider.kind());
            }
        }
    }
    paths.retain(|p| is_yaml(p) && depth_below_root(p) <= 2);
    paths.sort();
    paths.dedup();

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let location = FileLocation::head(event, &path);
        let content = provider
            .fetch_file(event, &location)
            .await
            .map_err(|e| remote_error(&path, e))?;
        files.push(SourceFile { path, content });
    }

    tracing::debug!(
        "Fetched {} file(s) from {} at {}",
        files.len(),
        TEKTON_DIR,
        event.short_sha()
    );
    Ok(files)
}

fn remote_error(path: &str, err: PacError) -> PacError {
    match err {
        PacError::RemoteFetch { .. } => err,
        other => PacError::RemoteFetch {
            path: path.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_filter_and_depth() {
        assert!(is_yaml(".tekton/pr.yaml"));
        assert!(is_yaml(".tekton/pr.yml"));
        assert!(!is_yaml(".tekton/README.md"));
        assert_eq!(depth_below_root(".tekton/pr.yaml"), 1);
        assert_eq!(depth_below_root(".tekton/tasks/lint.yaml"), 2);
        assert_eq!(depth_below_root(".tekton/a/b/c.yaml"), 3);
        assert_eq!(depth_below_root("other/x.yaml"), usize::MAX);
    }
}
