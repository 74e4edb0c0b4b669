//! Secret redaction for log and error text.
//!
//! Upstream error bodies and config dumps can carry credentials; anything
//! that might leave the process goes through `redact` first.

use regex::Regex;
use std::sync::OnceLock;

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            // Bearer tokens in headers or bodies.
            Regex::new(r"(?i)bearer\s+[a-z0-9._\-]{8,}").expect("static regex"),
            // Provider API keys (sk-..., or-...).
            Regex::new(r"\b(?:sk|or)-[A-Za-z0-9\-_]{16,}\b").expect("static regex"),
            // key=value style credentials.
            Regex::new(r#"(?i)(api[_-]?key|token|secret|password)["']?\s*[:=]\s*["']?[^\s"',}]{6,}"#)
                .expect("static regex"),
        ]
    })
}

/// Replace anything credential-shaped with a redaction marker.
pub fn redact(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in patterns() {
        out = pattern.replace_all(&out, "[REDACTED]").into_owned();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_redacted() {
        let text = "request failed: Authorization: Bearer abc123def456ghi789";
        let scrubbed = redact(text);
        assert!(!scrubbed.contains("abc123def456"));
        assert!(scrubbed.contains("[REDACTED]"));
    }

    #[test]
    fn test_api_key_shapes_redacted() {
        let scrubbed = redact("used key sk-or-v1-abcdefghijklmnop1234 for call");
        assert!(!scrubbed.contains("abcdefghijklmnop"));

        let scrubbed = redact(r#"{"api_key": "supersecretvalue"}"#);
        assert!(!scrubbed.contains("supersecretvalue"));
    }

    #[test]
    fn test_plain_text_untouched() {
        let text = "connection reset by peer (503)";
        assert_eq!(redact(text), text);
    }
}
