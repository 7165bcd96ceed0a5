//! Secret and PII redaction for logs and audit messages.
//!
//! Applied to every gateway error body and request log line before it
//! reaches tracing output or the sync log.

use std::sync::LazyLock;

use regex::Regex;

static PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // Forge personal access tokens, classic and fine-grained.
        (
            Regex::new(r"github_pat_[A-Za-z0-9_]+").unwrap(),
            "github_pat_[REDACTED]",
        ),
        (Regex::new(r"\bghp_[A-Za-z0-9]{10,}\b").unwrap(), "ghp_[REDACTED]"),
        // Bearer headers.
        (
            Regex::new(r"(?i)authorization:\s*bearer\s+[A-Za-z0-9_\-.=]+").unwrap(),
            "Authorization: Bearer [REDACTED]",
        ),
        // API-style secret keys.
        (Regex::new(r"\bsk-[A-Za-z0-9]{10,}\b").unwrap(), "sk-[REDACTED]"),
        // Sheet open ids identify people; keep the prefix for debugging.
        (
            Regex::new(r"(?i)\bou_[a-z0-9]{6,}\b").unwrap(),
            "ou_[REDACTED]",
        ),
        // Emails.
        (
            Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap(),
            "[REDACTED_EMAIL]",
        ),
    ]
});

/// Scrubs known secret and PII shapes from a log line.
#[must_use]
pub fn redact(text: &str) -> String {
    let mut redacted = text.to_owned();
    for (pattern, replacement) in PATTERNS.iter() {
        redacted = pattern.replace_all(&redacted, *replacement).into_owned();
    }
    redacted
}

#[cfg(test)]
mod tests {
    use super::redact;

    #[test]
    fn scrubs_tokens_and_identifiers() {
        let input = "Authorization: Bearer ghp_abc123def456xyz for ou_92ab31cd (dev@example.com)";
        let output = redact(input);
        assert!(!output.contains("ghp_abc123def456xyz"));
        assert!(!output.contains("ou_92ab31cd"));
        assert!(!output.contains("dev@example.com"));
        assert!(output.contains("[REDACTED_EMAIL]"));
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(redact("issue #42 updated"), "issue #42 updated");
    }
}
