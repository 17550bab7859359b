//! Denylist scan over the free-text parts of job settings

use serde_json::{Map, Value};

use crate::job::JobSettings;

const DANGEROUS_KEYS: &[&str] = &[
    "__proto__",
    "constructor",
    "prototype",
    "__class__",
    "__import__",
    "eval",
    "exec",
];

const DANGEROUS_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "eval(",
    "exec(",
    "__import__",
    "os.system",
    "subprocess",
    "${",
    "onerror=",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityFinding {
    pub path: String,
    pub reason: String,
}

/// Dangerous key names anywhere under the untyped settings, and script-like
/// substrings in any free-text value
pub fn scan_settings(settings: &JobSettings) -> Vec<SecurityFinding> {
    let mut findings = Vec::new();
    scan_keys("", &settings.extra, &mut findings);

    for (path, text) in settings.free_text() {
        let lowered = text.to_lowercase();
        if let Some(pattern) = DANGEROUS_PATTERNS.iter().find(|p| lowered.contains(*p)) {
            findings.push(SecurityFinding {
                path,
                reason: format!("contains forbidden pattern '{}'", pattern),
            });
        }
    }
    findings
}

fn scan_keys(prefix: &str, map: &Map<String, Value>, findings: &mut Vec<SecurityFinding>) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        if DANGEROUS_KEYS.contains(&key.to_lowercase().as_str()) {
            findings.push(SecurityFinding {
                path: path.clone(),
                reason: format!("forbidden key name '{}'", key),
            });
        }
        scan_value(&path, value, findings);
    }
}

fn scan_value(path: &str, value: &Value, findings: &mut Vec<SecurityFinding>) {
    match value {
        Value::Object(inner) => scan_keys(path, inner, findings),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                scan_value(&format!("{}[{}]", path, i), item, findings);
            }
        }
        _ => {}
    }
}
