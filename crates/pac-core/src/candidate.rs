//! Workload documents discovered under `.tekton/`.
//!
//! A file may hold several YAML documents. `PipelineRun` documents become
//! [`Candidate`]s; `Pipeline` and `Task` documents are kept as
//! [`LocalResources`] that candidates can reference by name.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_yaml::Value;

use crate::error::{PacError, Result};
use crate::keys;

pub const PIPELINE_RUN_KIND: &str = "PipelineRun";
pub const PIPELINE_KIND: &str = "Pipeline";
pub const TASK_KIND: &str = "Task";

/// A `PipelineRun` document from `.tekton/`.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// File the document was read from.
    pub path: String,
    /// Original-PRName: `metadata.name`, or `generateName` without its
    /// trailing dash.
    pub name: String,
    pub document: Value,
    pub annotations: BTreeMap<String, String>,
}

impl Candidate {
    fn from_document(path: &str, document: Value) -> Result<Self> {
        let metadata = document.get("metadata");
        let name = metadata
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                metadata
                    .and_then(|m| m.get("generateName"))
                    .and_then(Value::as_str)
                    .map(|n| n.trim_end_matches('-').to_string())
            })
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                PacError::Template(format!("PipelineRun in {} has neither name nor generateName", path))
            })?;
        let annotations = string_map(metadata.and_then(|m| m.get("annotations")));
        Ok(Self {
            path: path.to_string(),
            name,
            document,
            annotations,
        })
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// An annotation holding a list, `[a, b]` or `a, b`.
    pub fn annotation_list(&self, key: &str) -> Option<Vec<String>> {
        self.annotation(key).map(parse_list)
    }

    pub fn on_event(&self) -> Option<Vec<String>> {
        self.annotation_list(keys::ON_EVENT)
    }

    pub fn on_target_branch(&self) -> Option<Vec<String>> {
        self.annotation_list(keys::ON_TARGET_BRANCH)
    }

    pub fn on_cel_expression(&self) -> Option<&str> {
        self.annotation(keys::ON_CEL_EXPRESSION)
    }

    pub fn on_path_change(&self) -> Option<Vec<String>> {
        self.annotation_list(keys::ON_PATH_CHANGE)
    }

    pub fn on_path_change_ignore(&self) -> Option<Vec<String>> {
        self.annotation_list(keys::ON_PATH_CHANGE_IGNORE)
    }

    pub fn on_label(&self) -> Option<Vec<String>> {
        self.annotation_list(keys::ON_LABEL)
    }

    pub fn on_comment(&self) -> Option<&str> {
        self.annotation(keys::ON_COMMENT)
    }

    /// `max-keep-runs`; unparseable values are ignored with a warning.
    pub fn max_keep_runs(&self) -> Option<usize> {
        let raw = self.annotation(keys::MAX_KEEP_RUNS)?;
        match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => Some(n),
            _ => {
                tracing::warn!("Ignoring invalid max-keep-runs {:?} on {}", raw, self.name);
                None
            }
        }
    }

    pub fn cancel_in_progress(&self) -> bool {
        self.annotation(keys::CANCEL_IN_PROGRESS)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
    }

    pub fn target_namespace(&self) -> Option<&str> {
        self.annotation(keys::TARGET_NAMESPACE)
    }

    /// Remote task references, from `task` and the numbered `task-N` keys.
    pub fn remote_tasks(&self) -> Vec<String> {
        let prefix = format!("{}-", keys::TASK);
        let mut numbered: Vec<(u32, &String)> = self
            .annotations
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&prefix)
                    .and_then(|n| n.parse::<u32>().ok())
                    .map(|n| (n, v))
            })
            .collect();
        numbered.sort_by_key(|(n, _)| *n);

        let mut tasks = self
            .annotation_list(keys::TASK)
            .unwrap_or_default();
        for (_, value) in numbered {
            tasks.extend(parse_list(value));
        }
        tasks
    }

    pub fn remote_pipeline(&self) -> Option<String> {
        self.annotation_list(keys::PIPELINE)
            .and_then(|p| p.into_iter().next())
    }

    /// Sets an annotation on both the map and the document.
    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.annotations.insert(key.to_string(), value.to_string());
        set_metadata_entry(&mut self.document, "annotations", key, value);
    }

    /// Sets a label on the document.
    pub fn set_label(&mut self, key: &str, value: &str) {
        set_metadata_entry(&mut self.document, "labels", key, value);
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        string_map(self.document.get("metadata").and_then(|m| m.get("labels")))
    }

    /// Renders the document back to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.document)?)
    }
}

/// `Pipeline` and `Task` documents found next to the candidates.
#[derive(Debug, Clone, Default)]
pub struct LocalResources {
    pipelines: BTreeMap<String, Value>,
    tasks: BTreeMap<String, Value>,
}

impl LocalResources {
    pub fn pipeline(&self, name: &str) -> Option<&Value> {
        self.pipelines.get(name)
    }

    pub fn task(&self, name: &str) -> Option<&Value> {
        self.tasks.get(name)
    }

    pub fn insert(&mut self, document: Value) {
        let Some(name) = document
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return;
        };
        match kind_of(&document) {
            Some(PIPELINE_KIND) => {
                self.pipelines.insert(name, document);
            }
            Some(TASK_KIND) => {
                self.tasks.insert(name, document);
            }
            _ => {}
        }
    }

    pub fn extend(&mut self, other: LocalResources) {
        self.pipelines.extend(other.pipelines);
        self.tasks.extend(other.tasks);
    }
}

/// Documents of one `.tekton` file.
#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub candidates: Vec<Candidate>,
    pub resources: LocalResources,
}

/// Parses every YAML document of a (templated) file.
///
/// Documents of other kinds are ignored; a document that is not valid YAML
/// fails the whole file.
pub fn parse_documents(path: &str, content: &str) -> Result<ParsedFile> {
    let mut parsed = ParsedFile::default();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(document)
            .map_err(|e| PacError::Template(format!("{} is not valid YAML: {}", path, e)))?;
        if value.is_null() {
            continue;
        }
        match kind_of(&value) {
            Some(PIPELINE_RUN_KIND) => parsed.candidates.push(Candidate::from_document(path, value)?),
            Some(PIPELINE_KIND) | Some(TASK_KIND) => parsed.resources.insert(value),
            other => {
                tracing::debug!("Skipping document of kind {:?} in {}", other, path);
            }
        }
    }
    Ok(parsed)
}

pub fn kind_of(document: &Value) -> Option<&str> {
    document.get("kind").and_then(Value::as_str)
}

/// Parses an annotation list: `[a, b]`, `a, b` or a single value.
pub fn parse_list(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .unwrap_or(trimmed);
    inner
        .split(',')
        .map(|item| item.trim().trim_matches(|c| c == '"' || c == '\'').trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let Some(Value::Mapping(mapping)) = value else {
        return BTreeMap::new();
    };
    mapping
        .iter()
        .filter_map(|(k, v)| {
            let key = k.as_str()?.to_string();
            let value = match v {
                Value::String(s) => s.clone(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            Some((key, value))
        })
        .collect()
}

fn set_metadata_entry(document: &mut Value, section: &str, key: &str, value: &str) {
    let Value::Mapping(root) = document else {
        return;
    };
    let metadata = root
        .entry(Value::from("metadata"))
        .or_insert_with(|| Value::Mapping(Default::default()));
    let Value::Mapping(metadata) = metadata else {
        return;
    };
    let entries = metadata
        .entry(Value::from(section))
        .or_insert_with(|| Value::Mapping(Default::default()));
    if let Value::Mapping(entries) = entries {
        entries.insert(Value::from(key), Value::from(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"
apiVersion: tekton.dev/v1
kind: PipelineRun
metadata:
  name: pipeline
  annotations:
    pipelinesascode.tekton.dev/on-event: "[pull_request, push]"
    pipelinesascode.tekton.dev/on-target-branch: "main"
    pipelinesascode.tekton.dev/max-keep-runs: "3"
    pipelinesascode.tekton.dev/cancel-in-progress: "true"
    pipelinesascode.tekton.dev/task: "[git-clone, .tekton/tasks/lint.yaml]"
    pipelinesascode.tekton.dev/task-1: "https://example.com/task.yaml"
spec:
  pipelineRef:
    name: build
---
apiVersion: tekton.dev/v1
kind: Pipeline
metadata:
  name: build
spec:
  tasks: []
"#;

    #[test]
    fn test_parse_documents() {
        let parsed = parse_documents(".tekton/pr.yaml", FILE).unwrap();
        assert_eq!(parsed.candidates.len(), 1);
        let candidate = &parsed.candidates[0];
        assert_eq!(candidate.name, "pipeline");
        assert_eq!(candidate.on_event().unwrap(), vec!["pull_request", "push"]);
        assert_eq!(candidate.on_target_branch().unwrap(), vec!["main"]);
        assert_eq!(candidate.max_keep_runs(), Some(3));
        assert!(candidate.cancel_in_progress());
        assert_eq!(
            candidate.remote_tasks(),
            vec!["git-clone", ".tekton/tasks/lint.yaml", "https://example.com/task.yaml"]
        );
        assert!(parsed.resources.pipeline("build").is_some());
    }

    #[test]
    fn test_generate_name_is_trimmed() {
        let parsed = parse_documents(
            "x.yaml",
            "kind: PipelineRun\nmetadata:\n  generateName: deploy-\nspec: {}\n",
        )
        .unwrap();
        assert_eq!(parsed.candidates[0].name, "deploy");
    }

    #[test]
    fn test_unnamed_run_is_an_error() {
        let err = parse_documents("x.yaml", "kind: PipelineRun\nmetadata: {}\n").unwrap_err();
        assert!(matches!(err, PacError::Template(_)));
    }

    #[test]
    fn test_invalid_yaml_fails_the_file() {
        let err = parse_documents("bad.yaml", "kind: PipelineRun\n  metadata: [\n").unwrap_err();
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("[a, 'b', \"c\"]"), vec!["a", "b", "c"]);
        assert_eq!(parse_list("main"), vec!["main"]);
        assert_eq!(parse_list("main, release-*"), vec!["main", "release-*"]);
        assert!(parse_list("[]").is_empty());
    }

    #[test]
    fn test_set_annotation_updates_document() {
        let mut parsed = parse_documents(".tekton/pr.yaml", FILE).unwrap();
        let candidate = &mut parsed.candidates[0];
        candidate.set_annotation(keys::SHA, "abc123");
        candidate.set_label(keys::EVENT_TYPE, "pull_request");
        let yaml = candidate.to_yaml().unwrap();
        assert!(yaml.contains("abc123"));
        assert_eq!(candidate.labels().get(keys::EVENT_TYPE).unwrap(), "pull_request");
    }
}
