//! Message sanitizer applied before anything reaches a readable store

use once_cell::sync::Lazy;
use regex::Regex;

static URL_USERINFO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b([a-z][a-z0-9+.\-]*://)[^/\s:@]+(?::[^/\s@]*)?@").expect("valid regex")
});

static CREDENTIAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b((?:[a-z0-9_\-]*)(?:password|passwd|pwd|secret|token|api[_\-]?key|access[_\-]?key|authorization|credentials?|private[_\-]?key)(?:[a-z0-9_\-]*))\s*[=:]\s*("[^"]*"|'[^']*'|[^\s,;&]+)"#,
    )
    .expect("valid regex")
});

static BEARER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bbearer\s+[a-z0-9._\-]+").expect("valid regex"));

static IPV4: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}(?::\d{1,5})?\b").expect("valid regex")
});

static IPV6: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:[0-9a-fA-F]{1,4}:){3,7}[0-9a-fA-F]{1,4}\b").expect("valid regex")
});

static UNIX_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(^|[\s"'=(\[,])~?(?:/[\w.\-@]+)+/?"#).expect("valid regex")
});

static WINDOWS_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\b[A-Za-z]:\\[^\s"']*"#).expect("valid regex"));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

const TRUNCATION_MARKER: &str = "...";

/// Strip credentials, IP addresses and filesystem paths, flatten whitespace,
/// then cap the result at `max_len` characters
pub fn sanitize_message(message: &str, max_len: usize) -> String {
    let text = URL_USERINFO.replace_all(message, "${1}[REDACTED]@");
    let text = BEARER.replace_all(&text, "Bearer [REDACTED]");
    let text = CREDENTIAL.replace_all(&text, "${1}=[REDACTED]");
    let text = IPV4.replace_all(&text, "[IP]");
    let text = IPV6.replace_all(&text, "[IP]");
    let text = UNIX_PATH.replace_all(&text, "${1}[PATH]");
    let text = WINDOWS_PATH.replace_all(&text, "[PATH]");
    let text = WHITESPACE.replace_all(text.trim(), " ");
    truncate_chars(&text, max_len)
}

/// Cap at `max_len` characters on a char boundary, marking the cut
pub fn truncate_chars(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    if max_len <= TRUNCATION_MARKER.len() {
        return text.chars().take(max_len).collect();
    }
    let mut out: String = text
        .chars()
        .take(max_len - TRUNCATION_MARKER.len())
        .collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Message with volatile parts (numbers, paths, ids) dropped, for grouping
pub fn error_signature(error_type: &str, sanitized_message: &str) -> String {
    let simplified = sanitized_message
        .split_whitespace()
        .filter(|word| !word.contains('/') && !word.chars().any(|c| c.is_ascii_digit()))
        .take(10)
        .collect::<Vec<_>>()
        .join(" ");
    format!("{}::{}", error_type, simplified)
}
