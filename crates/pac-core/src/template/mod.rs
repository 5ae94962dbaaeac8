//! `{{ var }}` expansion over `.tekton` files.
//!
//! Lookup order: resolved params, then `body.<path>` into the payload, then
//! `headers.<name>`. A placeholder that resolves to nothing stays as written.

pub mod params;
pub mod remote;

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex_lite::{Captures, Regex};

use crate::models::Event;

pub use params::{ResolvedParams, resolve_params};
pub use remote::RemoteResolver;

fn placeholder() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-\[\]]+)\s*\}\}").ok())
        .as_ref()
}

/// Replaces every known placeholder in `text`.
pub fn expand(text: &str, params: &BTreeMap<String, String>, event: &Event) -> String {
    let Some(re) = placeholder() else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &Captures<'_>| {
        let name = &caps[1];
        match lookup(name, params, event) {
            Some(value) => value,
            None => {
                tracing::info!("Template variable {} is not defined, leaving it as is", name);
                caps[0].to_string()
            }
        }
    })
    .into_owned()
}

fn lookup(name: &str, params: &BTreeMap<String, String>, event: &Event) -> Option<String> {
    if let Some(value) = params.get(name) {
        return Some(value.clone());
    }
    if let Some(path) = name.strip_prefix("body.") {
        return json_path(&event.payload, path).map(json_to_text);
    }
    if let Some(header) = name.strip_prefix("headers.") {
        return event.headers.get(&header.to_ascii_lowercase()).cloned();
    }
    None
}

/// Walks `a.b[0].c` through a JSON value.
pub fn json_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        let (key, indexes) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for index in indexes.split('[').filter(|s| !s.is_empty()) {
            let index: usize = index.trim_end_matches(']').parse().ok()?;
            current = current.get(index)?;
        }
    }
    Some(current)
}

fn json_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, ProviderKind, TriggerType};
    use serde_json::json;

    fn event() -> Event {
        let mut event = Event::new(ProviderKind::GitHub, EventType::PullRequest, TriggerType::PullRequest);
        event.payload = json!({
            "pull_request": {"number": 12, "labels": [{"name": "bug"}], "draft": false},
            "sender": {"login": "alice"}
        });
        event.headers.insert("x-github-event".into(), "pull_request".into());
        event
    }

    #[test]
    fn test_expand_params_body_and_headers() {
        let mut params = BTreeMap::new();
        params.insert("revision".to_string(), "abc123".to_string());
        let text = "rev={{ revision }} n={{body.pull_request.number}} l={{ body.pull_request.labels[0].name }} \
                    d={{ body.pull_request.draft }} h={{ headers.X-GitHub-Event }}";
        assert_eq!(
            expand(text, &params, &event()),
            "rev=abc123 n=12 l=bug d=false h=pull_request"
        );
    }

    #[test]
    fn test_unknown_placeholder_stays_literal() {
        let params = BTreeMap::new();
        assert_eq!(
            expand("value: {{ secret_param }}", &params, &event()),
            "value: {{ secret_param }}"
        );
        assert_eq!(
            expand("{{ body.missing.field }}", &params, &event()),
            "{{ body.missing.field }}"
        );
    }

    #[test]
    fn test_non_placeholders_untouched() {
        let params = BTreeMap::new();
        let text = "script: echo ${HOME} $(params.x) {not a var}";
        assert_eq!(expand(text, &params, &event()), text);
    }
}
