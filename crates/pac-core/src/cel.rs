//! CEL evaluation for `on-cel-expression` predicates and param filters.
//!
//! The variable set is built explicitly for every evaluation; a reference to a
//! variable that is not in the set is an error, never a silent `false`.

use std::collections::BTreeMap;

use cel_interpreter::{Context, Program, Value};
use serde_json::json;

use crate::error::{PacError, Result};
use crate::models::Event;

/// Files touched by the event, grouped the way CEL expressions see them.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ChangedFiles {
    pub all: Vec<String>,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    pub modified: Vec<String>,
    pub renamed: Vec<String>,
}

/// Variables visible to one CEL evaluation.
#[derive(Debug, Clone, Default)]
pub struct CelVariables {
    vars: BTreeMap<String, serde_json::Value>,
}

impl CelVariables {
    /// Variables for an event: `body`, `headers`, `pac`, and the flattened
    /// shortcuts `event`, `event_type`, `target_branch`, `source_branch`,
    /// `target_url`, `source_url`, `event_title`, `sender`, `revision`.
    /// `files` is only defined when the changed-file list was fetched.
    pub fn for_event(event: &Event, files: Option<&ChangedFiles>) -> Self {
        let mut vars = BTreeMap::new();
        let pac = pac_object(event);

        vars.insert("body".to_string(), event.payload.clone());
        vars.insert("headers".to_string(), json!(event.headers));
        vars.insert("event".to_string(), json!(event.trigger.as_str()));
        vars.insert("event_type".to_string(), json!(event.event_type.as_str()));
        vars.insert("target_branch".to_string(), json!(event.matching_branch()));
        vars.insert("source_branch".to_string(), json!(event.head_branch));
        vars.insert("target_url".to_string(), json!(event.url));
        vars.insert("source_url".to_string(), json!(event.head_url));
        vars.insert(
            "event_title".to_string(),
            json!(
                event
                    .pull_request_title
                    .clone()
                    .or_else(|| event.sha_title.clone())
                    .unwrap_or_default()
            ),
        );
        vars.insert("sender".to_string(), json!(event.sender));
        vars.insert("revision".to_string(), json!(event.sha));
        if let Some(files) = files {
            vars.insert("files".to_string(), json!(files));
        }
        vars.insert("pac".to_string(), pac);

        Self { vars }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.vars.get(name)
    }
}

/// Normalized event fields exposed as `pac`.
fn pac_object(event: &Event) -> serde_json::Value {
    json!({
        "event_type": event.event_type.as_str(),
        "trigger": event.trigger.as_str(),
        "repo_owner": event.organization,
        "repo_name": event.repository,
        "repo_url": event.url,
        "source_url": event.head_url,
        "source_branch": event.head_branch,
        "target_branch": event.matching_branch(),
        "revision": event.sha,
        "sender": event.sender,
        "pull_request_number": event.pull_request_number.map(|n| n.to_string()).unwrap_or_default(),
        "git_provider": event.provider_kind().as_str(),
    })
}

/// Compiles and runs an expression, returning its raw value.
fn execute(expression: &str, variables: &CelVariables) -> Result<Value> {
    let program = Program::compile(expression)
        .map_err(|e| PacError::Cel(format!("failed to parse expression {:?}: {}", expression, e)))?;

    let mut context = Context::default();
    for (name, value) in &variables.vars {
        context
            .add_variable(name.as_str(), value.clone())
            .map_err(|e| PacError::Cel(format!("cannot expose variable {}: {}", name, e)))?;
    }

    program
        .execute(&context)
        .map_err(|e| PacError::Cel(format!("failed to evaluate expression {:?}: {}", expression, e)))
}

/// Evaluates a predicate. Anything but a boolean result is an error.
pub fn evaluate_bool(expression: &str, variables: &CelVariables) -> Result<bool> {
    match execute(expression, variables)? {
        Value::Bool(b) => Ok(b),
        other => Err(PacError::Cel(format!(
            "expression {:?} returned {:?}, expected a boolean",
            expression, other
        ))),
    }
}
