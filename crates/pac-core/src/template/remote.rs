//! Inlines `taskRef` / `pipelineRef` targets into a candidate.
//!
//! References come from the `task`, `task-N` and `pipeline` annotations and
//! from Pipeline/Task documents found in `.tekton/`. An annotation entry is
//! one of:
//!
//! - an `http(s)://` URL,
//! - `owner/repo/path@ref`, read through the forge (the event repository or
//!   one listed in `settings.remote_scope_repos`),
//! - a repository path such as `.tekton/tasks/lint.yaml` or
//!   `.other-tasks/x.yaml`, read at the event commit,
//! - the name of a Pipeline/Task document in `.tekton/`.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_yaml::Value;

use crate::candidate::{Candidate, LocalResources, PIPELINE_KIND, TASK_KIND, kind_of};
use crate::error::{PacError, Result};
use crate::models::Event;
use crate::providers::{FileLocation, Provider, send_text};

/// A parsed annotation entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRef {
    Url(String),
    Forge(FileLocation),
    RepoPath(String),
    Local(String),
}

impl RemoteRef {
    pub fn parse(reference: &str) -> Self {
        let reference = reference.trim();
        if reference.starts_with("https://") || reference.starts_with("http://") {
            return RemoteRef::Url(reference.to_string());
        }
        if let Some((path, at)) = reference.rsplit_once('@') {
            let mut parts = path.splitn(3, '/');
            if let (Some(owner), Some(repo), Some(file)) = (parts.next(), parts.next(), parts.next()) {
                if !owner.is_empty() && !repo.is_empty() && !file.is_empty() && !at.is_empty() {
                    return RemoteRef::Forge(FileLocation {
                        owner: owner.to_string(),
                        repo: repo.to_string(),
                        path: file.to_string(),
                        reference: at.to_string(),
                    });
                }
            }
        }
        if reference.ends_with(".yaml") || reference.ends_with(".yml") {
            return RemoteRef::RepoPath(reference.trim_start_matches("./").to_string());
        }
        RemoteRef::Local(reference.to_string())
    }
}

/// Resolves remote references for the candidates of one event.
pub struct RemoteResolver<'a> {
    provider: &'a dyn Provider,
    client: reqwest::Client,
    event: &'a Event,
    local: &'a LocalResources,
    /// `owner/repo` entries besides the event repository that may be read.
    scope: Vec<String>,
}

impl<'a> RemoteResolver<'a> {
    pub fn new(
        provider: &'a dyn Provider,
        client: reqwest::Client,
        event: &'a Event,
        local: &'a LocalResources,
        scope: Vec<String>,
    ) -> Self {
        Self {
            provider,
            client,
            event,
            local,
            scope,
        }
    }

    /// Inlines every reference the candidate needs.
    ///
    /// Annotation tasks take precedence over `.tekton` documents of the same
    /// name. A reference that cannot be fetched or does not hold the expected
    /// kind fails the candidate.
    pub async fn resolve(&self, candidate: &mut Candidate) -> Result<()> {
        let mut tasks: BTreeMap<String, Value> = BTreeMap::new();
        for reference in candidate.remote_tasks() {
            for task in self.fetch_kind(&reference, TASK_KIND).await? {
                if let Some(name) = resource_name(&task) {
                    tasks.insert(name, task);
                }
            }
        }

        let pipeline = match candidate.remote_pipeline() {
            Some(reference) => {
                let mut found = self.fetch_kind(&reference, PIPELINE_KIND).await?;
                if found.is_empty() {
                    return Err(PacError::Template(format!(
                        "{} does not contain a Pipeline",
                        reference
                    )));
                }
                Some(found.remove(0))
            }
            None => None,
        };

        let spec = candidate
            .document
            .get_mut("spec")
            .ok_or_else(|| PacError::Template(format!("PipelineRun {} has no spec", candidate.name)))?;

        if let Some(ref_name) = spec
            .get("pipelineRef")
            .and_then(|r| r.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
        {
            let source = pipeline
                .as_ref()
                .filter(|p| resource_name(p).as_deref() == Some(ref_name.as_str()))
                .or_else(|| self.local.pipeline(&ref_name));
            if let Some(pipeline) = source {
                let pipeline_spec = pipeline.get("spec").cloned().unwrap_or(Value::Null);
                if let Value::Mapping(map) = spec {
                    map.remove("pipelineRef");
                    map.insert(Value::from("pipelineSpec"), pipeline_spec);
                }
                tracing::debug!("Inlined Pipeline {} into {}", ref_name, candidate.name);
            }
        }

        if let Some(pipeline_spec) = spec.get_mut("pipelineSpec") {
            for section in ["tasks", "finally"] {
                if let Some(Value::Sequence(entries)) = pipeline_spec.get_mut(section) {
                    for entry in entries {
                        self.inline_task(entry, &tasks);
                    }
                }
            }
        }
        Ok(())
    }

    fn inline_task(&self, entry: &mut Value, remote: &BTreeMap<String, Value>) {
        let Some(task_ref) = entry.get("taskRef") else {
            return;
        };
        // Cluster-scoped kinds and resolvers are left to the engine.
        if task_ref.get("resolver").is_some()
            || task_ref
                .get("kind")
                .and_then(Value::as_str)
                .is_some_and(|k| k != TASK_KIND)
        {
            return;
        }
        let Some(name) = task_ref.get("name").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        let Some(task) = remote.get(&name).or_else(|| self.local.task(&name)) else {
            return;
        };
        let task_spec = task.get("spec").cloned().unwrap_or(Value::Null);
        if let Value::Mapping(map) = entry {
            map.remove("taskRef");
            map.insert(Value::from("taskSpec"), task_spec);
        }
    }

    /// Documents of `kind` behind one reference.
    async fn fetch_kind(&self, reference: &str, kind: &str) -> Result<Vec<Value>> {
        let parsed = RemoteRef::parse(reference);
        if let RemoteRef::Local(name) = &parsed {
            let local = match kind {
                PIPELINE_KIND => self.local.pipeline(name),
                _ => self.local.task(name),
            };
            return local.cloned().map(|v| vec![v]).ok_or_else(|| {
                PacError::Template(format!("cannot find {} {} referenced by annotation", kind, name))
            });
        }

        let text = self.fetch(&parsed, reference).await?;
        let mut documents = Vec::new();
        for document in serde_yaml::Deserializer::from_str(&text) {
            let value = Value::deserialize(document).map_err(|e| {
                PacError::Template(format!("remote {} is not valid YAML: {}", reference, e))
            })?;
            if kind_of(&value) == Some(kind) {
                documents.push(value);
            }
        }
        if documents.is_empty() {
            return Err(PacError::Template(format!(
                "remote {} does not contain a {}",
                reference, kind
            )));
        }
        Ok(documents)
    }

    async fn fetch(&self, parsed: &RemoteRef, reference: &str) -> Result<String> {
        let result = match parsed {
            RemoteRef::Url(url) => {
                let client = self.client.clone();
                send_text("fetch remote reference", || client.get(url.as_str())).await
            }
            RemoteRef::Forge(location) => {
                if !self.in_scope(location) {
                    return Err(PacError::Template(format!(
                        "remote reference {} is outside of the repositories this Repository may read",
                        reference
                    )));
                }
                self.provider.fetch_file(self.event, location).await
            }
            RemoteRef::RepoPath(path) => {
                let location = FileLocation::head(self.event, path);
                self.provider.fetch_file(self.event, &location).await
            }
            RemoteRef::Local(_) => return Err(PacError::Template(format!("{} is not remote", reference))),
        };
        result.map_err(|e| PacError::RemoteFetch {
            path: reference.to_string(),
            message: e.to_string(),
        })
    }

    fn in_scope(&self, location: &FileLocation) -> bool {
        let full_name = location.full_name();
        let own = self.event.full_name();
        let (head_owner, head_repo) = self.event.head_coordinates();
        full_name.eq_ignore_ascii_case(&own)
            || full_name.eq_ignore_ascii_case(&format!("{}/{}", head_owner, head_repo))
            || self.scope.iter().any(|s| s.eq_ignore_ascii_case(&full_name))
    }
}

fn resource_name(document: &Value) -> Option<String> {
    document
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_references() {
        assert_eq!(
            RemoteRef::parse("https://example.com/task.yaml"),
            RemoteRef::Url("https://example.com/task.yaml".into())
        );
        assert_eq!(
            RemoteRef::parse("pac/catalog/tasks/lint.yaml@main"),
            RemoteRef::Forge(FileLocation {
                owner: "pac".into(),
                repo: "catalog".into(),
                path: "tasks/lint.yaml".into(),
                reference: "main".into(),
            })
        );
        assert_eq!(
            RemoteRef::parse(".other-tasks/build.yaml"),
            RemoteRef::RepoPath(".other-tasks/build.yaml".into())
        );
        assert_eq!(RemoteRef::parse("git-clone"), RemoteRef::Local("git-clone".into()));
    }
}
