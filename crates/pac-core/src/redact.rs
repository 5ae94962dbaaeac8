//! Secret redaction for log lines and forge comments.

/// Replacement written in place of a secret value.
pub const REDACTED: &str = "*****";

/// Values shorter than this are not redacted, they would mangle normal text.
const MIN_SECRET_LEN: usize = 4;

/// Collects secret values seen while handling an event and scrubs them from text.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a secret value.
    pub fn add(&mut self, secret: impl Into<String>) {
        let secret = secret.into();
        if secret.len() >= MIN_SECRET_LEN && !self.secrets.contains(&secret) {
            self.secrets.push(secret);
            // Longest first so a secret containing another is fully replaced.
            self.secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        }
    }

    /// Returns `text` with every registered secret replaced.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_registered_values() {
        let mut redactor = Redactor::new();
        redactor.add("hunter2-token");
        redactor.add("abc");
        let line = "cloning with hunter2-token failed (abc)";
        assert_eq!(redactor.redact(line), "cloning with ***** failed (abc)");
    }

    #[test]
    fn test_longest_secret_wins() {
        let mut redactor = Redactor::new();
        redactor.add("token");
        redactor.add("token-extended");
        assert_eq!(redactor.redact("x token-extended y"), "x ***** y");
    }
}
