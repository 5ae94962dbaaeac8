//! Selects which candidates run for an event.
//!
//! Per candidate, in order:
//! 1. `on-cel-expression`, when present, decides alone.
//! 2. `on-event` must contain the trigger and `on-target-branch` must match.
//! 3. `on-path-change` / `on-path-change-ignore` filter on changed files.
//! 4. `on-label` must match a pull-request label.
//! 5. On comment events `on-comment` must match the comment.
//!
//! `/test NAME`, `/retest NAME` and incoming triggers name their candidate
//! explicitly and skip annotation matching.

use std::collections::HashSet;

use crate::candidate::Candidate;
use crate::cel::{CelVariables, ChangedFiles, evaluate_bool};
use crate::error::{PacError, Result};
use crate::models::{Event, EventType, TriggerType};
use crate::opscomment;
use crate::providers::Provider;

/// Matches a value against a glob pattern.
pub fn matches_glob(pattern: &str, value: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(value),
        Err(_) => {
            tracing::warn!("Invalid pattern '{}', using exact match", pattern);
            pattern == value
        }
    }
}

/// Matches a branch against an `on-target-branch` entry.
///
/// `refs/heads/` is optional on both sides; tags must be spelled
/// `refs/tags/...`.
pub fn matches_branch(pattern: &str, branch: &str) -> bool {
    let short_pattern = pattern.strip_prefix("refs/heads/").unwrap_or(pattern);
    let short_branch = branch.strip_prefix("refs/heads/").unwrap_or(branch);
    matches_glob(short_pattern, short_branch) || matches_glob(pattern, branch)
}

/// Lazily fetched changed-file list, shared by all candidates of an event.
pub struct ChangedFilesLoader<'a> {
    provider: Option<&'a dyn Provider>,
    files: Option<ChangedFiles>,
}

impl<'a> ChangedFilesLoader<'a> {
    pub fn new(provider: &'a dyn Provider) -> Self {
        Self {
            provider: Some(provider),
            files: None,
        }
    }

    /// A loader that never talks to the forge.
    pub fn fixed(files: ChangedFiles) -> Self {
        Self {
            provider: None,
            files: Some(files),
        }
    }

    pub async fn get(&mut self, event: &Event) -> Result<&ChangedFiles> {
        if self.files.is_none() {
            let files = match self.provider {
                Some(provider) => provider.changed_files(event).await?,
                None => ChangedFiles::default(),
            };
            self.files = Some(files);
        }
        Ok(self.files.get_or_insert_with(ChangedFiles::default))
    }
}

/// A candidate selected for launch.
#[derive(Debug, Clone)]
pub struct Matched {
    pub candidate: Candidate,
    /// Selected through its `on-comment` regex; the event becomes an
    /// `on-comment` event for this candidate.
    pub via_comment: bool,
}

/// A candidate whose predicate could not be evaluated.
#[derive(Debug)]
pub struct MatchError {
    pub candidate: Candidate,
    pub error: PacError,
}

#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub matched: Vec<Matched>,
    pub errors: Vec<MatchError>,
}

enum Decision {
    Accept { via_comment: bool },
    Reject(String),
}

/// Runs the matching rules over every candidate and de-duplicates by
/// original-prname, keeping the first.
pub async fn match_candidates(
    event: &Event,
    candidates: Vec<Candidate>,
    files: &mut ChangedFilesLoader<'_>,
) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();
    let mut seen = HashSet::new();

    for candidate in candidates {
        match decide(event, &candidate, files).await {
            Ok(Decision::Accept { via_comment }) => {
                if !seen.insert(candidate.name.clone()) {
                    tracing::debug!(
                        "Skipping duplicate PipelineRun {} from {}",
                        candidate.name,
                        candidate.path
                    );
                    continue;
                }
                tracing::info!(
                    "PipelineRun {} matched {} event on {}",
                    candidate.name,
                    event.event_type,
                    event.full_name()
                );
                outcome.matched.push(Matched {
                    candidate,
                    via_comment,
                });
            }
            Ok(Decision::Reject(reason)) => {
                tracing::debug!("PipelineRun {} not matched: {}", candidate.name, reason);
            }
            Err(error) => {
                tracing::warn!("PipelineRun {} could not be matched: {}", candidate.name, error);
                outcome.errors.push(MatchError { candidate, error });
            }
        }
    }
    outcome
}

async fn decide(
    event: &Event,
    candidate: &Candidate,
    files: &mut ChangedFilesLoader<'_>,
) -> Result<Decision> {
    if let Some(decision) = explicit_target(event, candidate) {
        return Ok(decision);
    }

    if let Some(expression) = candidate.on_cel_expression() {
        let changed = if expression.contains("files.") {
            Some(files.get(event).await?.clone())
        } else {
            None
        };
        let variables = CelVariables::for_event(event, changed.as_ref());
        return Ok(if evaluate_bool(expression, &variables)? {
            Decision::Accept { via_comment: false }
        } else {
            Decision::Reject(format!("on-cel-expression {:?} is false", expression))
        });
    }

    if event.trigger == TriggerType::OnComment {
        return on_comment_decision(event, candidate);
    }

    let Some(on_event) = candidate.on_event() else {
        return Ok(Decision::Reject("no on-event annotation".to_string()));
    };
    if !on_event.iter().any(|e| e == event.trigger.as_str()) {
        return Ok(Decision::Reject(format!(
            "on-event {:?} does not contain {}",
            on_event, event.trigger
        )));
    }
    let Some(branches) = candidate.on_target_branch() else {
        return Ok(Decision::Reject("no on-target-branch annotation".to_string()));
    };
    let branch = event.matching_branch();
    if !branches.iter().any(|b| matches_branch(b, branch)) {
        return Ok(Decision::Reject(format!(
            "on-target-branch {:?} does not match {}",
            branches, branch
        )));
    }

    let include = candidate.on_path_change();
    let ignore = candidate.on_path_change_ignore();
    if include.is_some() || ignore.is_some() {
        let changed = files.get(event).await?;
        if !paths_match(
            &changed.all,
            include.as_deref().unwrap_or(&[]),
            ignore.as_deref().unwrap_or(&[]),
        ) {
            return Ok(Decision::Reject("no changed file matches on-path-change".to_string()));
        }
    }

    match candidate.on_label() {
        Some(labels) => {
            let hit = labels
                .iter()
                .any(|l| event.pull_request_labels.iter().any(|pl| matches_glob(l, pl)));
            if !hit {
                return Ok(Decision::Reject(format!("on-label {:?} does not match", labels)));
            }
        }
        None if event.event_type == EventType::PullRequestLabeled => {
            return Ok(Decision::Reject("labeled event without on-label".to_string()));
        }
        None => {}
    }

    if candidate.on_comment().is_some() && event.event_type.is_comment() {
        return on_comment_decision(event, candidate);
    }

    Ok(Decision::Accept { via_comment: false })
}

/// `/test NAME`, `/retest NAME` and incoming triggers.
fn explicit_target(event: &Event, candidate: &Candidate) -> Option<Decision> {
    let target = event.target_test_pipeline_run.as_deref()?;
    match event.event_type {
        EventType::TestComment | EventType::RetestComment => Some(if candidate.name == target {
            Decision::Accept { via_comment: false }
        } else {
            Decision::Reject(format!("comment targets {}", target))
        }),
        EventType::Incoming => {
            if candidate.name != target {
                return Some(Decision::Reject(format!("incoming targets {}", target)));
            }
            let listens = candidate
                .on_event()
                .is_some_and(|events| events.iter().any(|e| e == TriggerType::Incoming.as_str()));
            if !listens {
                return Some(Decision::Reject("on-event does not contain incoming".to_string()));
            }
            let branch_ok = candidate
                .on_target_branch()
                .is_some_and(|branches| branches.iter().any(|b| matches_branch(b, event.matching_branch())));
            Some(if branch_ok {
                Decision::Accept { via_comment: false }
            } else {
                Decision::Reject("incoming branch does not match on-target-branch".to_string())
            })
        }
        _ => None,
    }
}

fn on_comment_decision(event: &Event, candidate: &Candidate) -> Result<Decision> {
    let Some(pattern) = candidate.on_comment() else {
        return Ok(Decision::Reject("no on-comment annotation".to_string()));
    };
    let comment = event.trigger_comment.as_deref().unwrap_or_default();
    let hit = opscomment::matches_on_comment(comment, pattern).map_err(PacError::Template)?;
    if !hit {
        return Ok(Decision::Reject(format!("on-comment {:?} does not match", pattern)));
    }
    if let Some(branches) = candidate.on_target_branch() {
        if !branches.iter().any(|b| matches_branch(b, event.matching_branch())) {
            return Ok(Decision::Reject("on-comment branch does not match".to_string()));
        }
    }
    Ok(Decision::Accept { via_comment: true })
}

/// At least one changed file is matched by `include` (any file when empty)
/// and not by `ignore`.
fn paths_match(changed: &[String], include: &[String], ignore: &[String]) -> bool {
    changed
        .iter()
        .filter(|path| !ignore.iter().any(|g| matches_glob(g, path)))
        .any(|path| include.is_empty() || include.iter().any(|g| matches_glob(g, path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::parse_documents;
    use crate::models::ProviderKind;

    fn candidate(name: &str, annotations: &[(&str, &str)]) -> Candidate {
        let mut yaml = format!(
            "kind: PipelineRun\nmetadata:\n  name: {}\n  annotations:\n",
            name
        );
        for (k, v) in annotations {
            yaml.push_str(&format!(
                "    pipelinesascode.tekton.dev/{}: {:?}\n",
                k, v
            ));
        }
        yaml.push_str("spec: {}\n");
        parse_documents(".tekton/x.yaml", &yaml)
            .unwrap()
            .candidates
            .remove(0)
    }

    fn pull_request() -> Event {
        let mut event = Event::new(ProviderKind::Gitea, EventType::PullRequest, TriggerType::PullRequest);
        event.organization = "pac".into();
        event.repository = "app".into();
        event.base_branch = "main".into();
        event.head_branch = "feature".into();
        event.pull_request_number = Some(1);
        event
    }

    async fn run(event: &Event, candidates: Vec<Candidate>, files: ChangedFiles) -> MatchOutcome {
        let mut loader = ChangedFilesLoader::fixed(files);
        match_candidates(event, candidates, &mut loader).await
    }

    #[test]
    fn test_glob_matching() {
        assert!(matches_glob("*", "anything"));
        assert!(matches_glob("feature-*", "feature-xyz"));
        assert!(!matches_glob("prod-*", "feature-1"));
        assert!(matches_glob("[invalid", "[invalid"));
        assert!(matches_branch("refs/heads/main", "main"));
        assert!(matches_branch("main", "refs/heads/main"));
        assert!(matches_branch("refs/tags/*", "refs/tags/v1.0"));
        assert!(!matches_branch("main", "refs/tags/main-1"));
    }

    #[tokio::test]
    async fn test_on_event_and_branch() {
        let event = pull_request();
        let outcome = run(
            &event,
            vec![
                candidate("pr", &[("on-event", "[pull_request]"), ("on-target-branch", "[main]")]),
                candidate("push", &[("on-event", "[push]"), ("on-target-branch", "[main]")]),
                candidate("other-branch", &[("on-event", "[pull_request]"), ("on-target-branch", "[release-*]")]),
                candidate("no-annotations", &[]),
            ],
            ChangedFiles::default(),
        )
        .await;
        let names: Vec<_> = outcome.matched.iter().map(|m| m.candidate.name.as_str()).collect();
        assert_eq!(names, vec!["pr"]);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn test_cel_expression_overrides_annotations() {
        let event = pull_request();
        let outcome = run(
            &event,
            vec![
                candidate(
                    "cel",
                    &[
                        ("on-cel-expression", "event == \"pull_request\" && target_branch == \"main\""),
                        ("on-event", "[push]"),
                    ],
                ),
                candidate("bad", &[("on-cel-expression", "event == \"pull request\" |")]),
                candidate("undefined", &[("on-cel-expression", "nope == 1")]),
            ],
            ChangedFiles::default(),
        )
        .await;
        assert_eq!(outcome.matched.len(), 1);
        assert_eq!(outcome.matched[0].candidate.name, "cel");
        let failed: Vec<_> = outcome.errors.iter().map(|e| e.candidate.name.as_str()).collect();
        assert_eq!(failed, vec!["bad", "undefined"]);
    }

    #[tokio::test]
    async fn test_path_change_filters() {
        let event = pull_request();
        let files = ChangedFiles {
            all: vec!["docs/readme.md".into(), "src/main.rs".into()],
            ..Default::default()
        };
        let base = [("on-event", "[pull_request]"), ("on-target-branch", "[main]")];
        let with = |extra: (&'static str, &'static str)| {
            let mut annotations = base.to_vec();
            annotations.push(extra);
            annotations
        };
        let outcome = run(
            &event,
            vec![
                candidate("src", &with(("on-path-change", "[src/**]"))),
                candidate("chart", &with(("on-path-change", "[chart/*]"))),
                candidate("not-docs", &with(("on-path-change-ignore", "[docs/**]"))),
            ],
            files,
        )
        .await;
        let names: Vec<_> = outcome.matched.iter().map(|m| m.candidate.name.as_str()).collect();
        assert_eq!(names, vec!["src", "not-docs"]);
    }

    #[tokio::test]
    async fn test_only_docs_changed_is_ignored() {
        let event = pull_request();
        let files = ChangedFiles {
            all: vec!["docs/readme.md".into()],
            ..Default::default()
        };
        let outcome = run(
            &event,
            vec![candidate(
                "code",
                &[
                    ("on-event", "[pull_request]"),
                    ("on-target-branch", "[main]"),
                    ("on-path-change-ignore", "[docs/**]"),
                ],
            )],
            files,
        )
        .await;
        assert!(outcome.matched.is_empty());
    }

    #[tokio::test]
    async fn test_labels() {
        let mut event = pull_request();
        event.event_type = EventType::PullRequestLabeled;
        event.pull_request_labels = vec!["bug".into()];
        let base = [("on-event", "[pull_request]"), ("on-target-branch", "[main]")];
        let mut labeled = base.to_vec();
        labeled.push(("on-label", "[bug, enhancement]"));
        let outcome = run(
            &event,
            vec![candidate("plain", &base), candidate("labeled", &labeled)],
            ChangedFiles::default(),
        )
        .await;
        let names: Vec<_> = outcome.matched.iter().map(|m| m.candidate.name.as_str()).collect();
        assert_eq!(names, vec!["labeled"]);
    }

    #[tokio::test]
    async fn test_explicit_test_comment() {
        let mut event = pull_request();
        event.event_type = EventType::TestComment;
        event.target_test_pipeline_run = Some("pipeline".into());
        let outcome = run(
            &event,
            vec![
                candidate("pipeline", &[("on-event", "[push]"), ("on-target-branch", "[nope]")]),
                candidate("other", &[("on-event", "[pull_request]"), ("on-target-branch", "[main]")]),
            ],
            ChangedFiles::default(),
        )
        .await;
        let names: Vec<_> = outcome.matched.iter().map(|m| m.candidate.name.as_str()).collect();
        assert_eq!(names, vec!["pipeline"]);
    }

    #[tokio::test]
    async fn test_on_comment() {
        let mut event = pull_request();
        event.event_type = EventType::OnComment;
        event.trigger = TriggerType::OnComment;
        event.trigger_comment = Some("/deploy staging".into());
        let outcome = run(
            &event,
            vec![
                candidate("deploy", &[("on-comment", "^/deploy")]),
                candidate("lint", &[("on-comment", "^/lint")]),
                candidate("pr", &[("on-event", "[pull_request]"), ("on-target-branch", "[main]")]),
            ],
            ChangedFiles::default(),
        )
        .await;
        assert_eq!(outcome.matched.len(), 1);
        assert_eq!(outcome.matched[0].candidate.name, "deploy");
        assert!(outcome.matched[0].via_comment);
    }

    #[tokio::test]
    async fn test_comment_on_pull_request_checks_on_comment() {
        let mut event = pull_request();
        event.event_type = EventType::TestAllComment;
        event.trigger_comment = Some("/test".into());
        fn annotations(pattern: &str) -> [(&str, &str); 3] {
            [
                ("on-event", "[pull_request]"),
                ("on-target-branch", "[main]"),
                ("on-comment", pattern),
            ]
        }
        let outcome = run(
            &event,
            vec![
                candidate("tested", &annotations("^/test")),
                candidate("deploy", &annotations("^/deploy")),
                candidate("pr", &[("on-event", "[pull_request]"), ("on-target-branch", "[main]")]),
            ],
            ChangedFiles::default(),
        )
        .await;
        let matched: Vec<_> = outcome
            .matched
            .iter()
            .map(|m| (m.candidate.name.as_str(), m.via_comment))
            .collect();
        assert_eq!(matched, vec![("tested", true), ("pr", false)]);
    }

    #[tokio::test]
    async fn test_incoming_requires_name_and_event() {
        let mut event = Event::new(ProviderKind::GitHub, EventType::Incoming, TriggerType::Incoming);
        event.base_branch = "feature-1".into();
        event.target_test_pipeline_run = Some("deploy".into());
        let outcome = run(
            &event,
            vec![
                candidate("deploy", &[("on-event", "[incoming]"), ("on-target-branch", "[feature-*]")]),
                candidate("other", &[("on-event", "[incoming]"), ("on-target-branch", "[*]")]),
            ],
            ChangedFiles::default(),
        )
        .await;
        let names: Vec<_> = outcome.matched.iter().map(|m| m.candidate.name.as_str()).collect();
        assert_eq!(names, vec!["deploy"]);
    }

    #[tokio::test]
    async fn test_duplicates_keep_first() {
        let event = pull_request();
        let annotations = [("on-event", "[pull_request]"), ("on-target-branch", "[main]")];
        let mut first = candidate("pipeline", &annotations);
        first.path = ".tekton/a.yaml".into();
        let mut second = candidate("pipeline", &annotations);
        second.path = ".tekton/b.yaml".into();
        let outcome = run(&event, vec![first, second], ChangedFiles::default()).await;
        assert_eq!(outcome.matched.len(), 1);
        assert_eq!(outcome.matched[0].candidate.path, ".tekton/a.yaml");
    }

    #[tokio::test]
    async fn test_branch_argument_overrides_base() {
        let mut event = pull_request();
        event.target_branch = Some("release-1".into());
        let outcome = run(
            &event,
            vec![candidate(
                "release",
                &[("on-event", "[pull_request]"), ("on-target-branch", "[release-*]")],
            )],
            ChangedFiles::default(),
        )
        .await;
        assert_eq!(outcome.matched.len(), 1);
    }
}
