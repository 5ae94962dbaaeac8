//! GitOps command parser.
//!
//! Classifies `/test`, `/retest`, `/cancel` and `/ok-to-test` comments and
//! extracts their arguments. Only lines starting with `/` (after optional
//! indentation) are considered; a comment may contain other lines.

use std::collections::BTreeMap;

use regex_lite::Regex;

use crate::models::EventType;

/// Command kind of a slash comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentKind {
    Test,
    Retest,
    Cancel,
    OkToTest,
    /// A slash command that is not a built-in one; candidates may claim it
    /// through their `on-comment` regex.
    OnComment,
    NoOp,
}

/// A classified ops-comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsComment {
    pub kind: CommentKind,
    /// `/test NAME`, `/retest NAME`, `/cancel NAME`.
    pub target: Option<String>,
    /// `branch:X`.
    pub branch: Option<String>,
    /// `key=value` arguments.
    pub args: BTreeMap<String, String>,
}

impl OpsComment {
    fn noop() -> Self {
        Self {
            kind: CommentKind::NoOp,
            target: None,
            branch: None,
            args: BTreeMap::new(),
        }
    }

    /// Event sub-kind this comment turns into.
    pub fn event_type(&self) -> Option<EventType> {
        let single = self.target.is_some();
        match self.kind {
            CommentKind::Test if single => Some(EventType::TestComment),
            CommentKind::Test => Some(EventType::TestAllComment),
            CommentKind::Retest if single => Some(EventType::RetestComment),
            CommentKind::Retest => Some(EventType::RetestAllComment),
            CommentKind::Cancel if single => Some(EventType::CancelComment),
            CommentKind::Cancel => Some(EventType::CancelAllComment),
            CommentKind::OkToTest => Some(EventType::OkToTestComment),
            CommentKind::OnComment => Some(EventType::OnComment),
            CommentKind::NoOp => None,
        }
    }
}

fn command_regex(prefix: Option<&str>) -> Option<Regex> {
    let lead = match prefix {
        Some(p) => format!(r"/{}[ \t]+", regex_lite::escape(p.trim_start_matches('/'))),
        None => "/".to_string(),
    };
    let pattern = format!(
        r"(?m)^[ \t]*{}(test|retest|cancel|ok-to-test)(?:[ \t]+([^\r\n]*?))?[ \t]*\r?$",
        lead
    );
    Regex::new(&pattern).ok()
}

/// Classifies a comment. Anything that is not a recognized command is `NoOp`
/// unless it starts with `/`, in which case it is a candidate `OnComment`.
pub fn classify(comment: &str, prefix: Option<&str>) -> OpsComment {
    if let Some(caps) = command_regex(prefix).and_then(|re| re.captures(comment)) {
        let kind = match caps.get(1).map(|m| m.as_str()) {
            Some("test") => CommentKind::Test,
            Some("retest") => CommentKind::Retest,
            Some("cancel") => CommentKind::Cancel,
            Some("ok-to-test") => CommentKind::OkToTest,
            _ => return OpsComment::noop(),
        };
        let rest = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");

        if kind == CommentKind::OkToTest {
            if !rest.is_empty() {
                return OpsComment::noop();
            }
            return OpsComment {
                kind,
                ..OpsComment::noop()
            };
        }

        let mut target = None;
        let mut branch = None;
        for token in tokenize(rest) {
            if let Some(b) = token.strip_prefix("branch:") {
                if !b.is_empty() {
                    branch = Some(b.to_string());
                }
            } else if token.contains('=') {
                continue;
            } else if target.is_none() {
                target = Some(token);
            }
        }

        return OpsComment {
            kind,
            target,
            branch,
            args: parse_key_value(&format!("/cmd {}", rest)),
        };
    }

    if comment.trim_start().starts_with('/') {
        let first_line = comment.trim_start().lines().next().unwrap_or("");
        return OpsComment {
            kind: CommentKind::OnComment,
            target: None,
            branch: None,
            args: parse_key_value(first_line),
        };
    }

    OpsComment::noop()
}

/// Splits on whitespace, keeping double-quoted sections (with `\"` escapes) intact.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Extracts `key=value`, `key="quoted value"` and `key="escaped \"quotes\""`
/// arguments. Input that does not start with `/` yields an empty map.
pub fn parse_key_value(comment: &str) -> BTreeMap<String, String> {
    let mut args = BTreeMap::new();
    let trimmed = comment.trim_start();
    if !trimmed.starts_with('/') {
        return args;
    }

    let Ok(re) = Regex::new(r#"([A-Za-z0-9_.\-]+)=("(?:[^"\\]|\\.)*"|\S+)"#) else {
        return args;
    };
    for caps in re.captures_iter(trimmed) {
        let (Some(key), Some(raw)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let raw = raw.as_str();
        let value = if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
            unescape(&raw[1..raw.len() - 1])
        } else {
            raw.to_string()
        };
        args.insert(key.as_str().to_string(), value);
    }
    args
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Whether an `on-comment` regex claims this comment. The regex is matched
/// against each trimmed line of the comment.
pub fn matches_on_comment(comment: &str, pattern: &str) -> Result<bool, String> {
    let re = Regex::new(pattern).map_err(|e| format!("invalid on-comment regex {}: {}", pattern, e))?;
    Ok(comment
        .lines()
        .map(str::trim)
        .any(|line| !line.is_empty() && re.is_match(line)))
}
