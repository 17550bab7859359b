//! Structured view over the free-form settings map
//!
//! Known keys are typed; anything else lands in `extra` and is the only part
//! that gets the denylist scan.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const LANGUAGE_KEY: &str = "language";
pub const MAX_LENGTH_KEY: &str = "max_length";
pub const STYLE_KEY: &str = "style";
pub const PROMPT_KEY: &str = "prompt";

static LANGUAGE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z]{2}$").expect("valid regex"));

/// Two lowercase letters, ISO 639-1 style
pub fn is_language_code(code: &str) -> bool {
    LANGUAGE_CODE.is_match(code)
}

/// Typed job settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    /// ISO 639-1 code
    pub language: String,
    pub max_length: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            max_length: 280,
            style: None,
            prompt: None,
            extra: Map::new(),
        }
    }
}

impl JobSettings {
    /// Parse the raw settings map into the typed view
    pub fn parse(map: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(map.clone()))
    }

    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// The documented default for a single known key
    pub fn default_value(key: &str) -> Option<Value> {
        let defaults = JobSettings::default();
        match key {
            LANGUAGE_KEY => Some(Value::String(defaults.language)),
            MAX_LENGTH_KEY => Some(Value::from(defaults.max_length)),
            _ => None,
        }
    }

    /// Free-text values subject to the security scan, with their paths
    pub fn free_text(&self) -> Vec<(String, &str)> {
        let mut out = Vec::new();
        if let Some(style) = &self.style {
            out.push((STYLE_KEY.to_string(), style.as_str()));
        }
        if let Some(prompt) = &self.prompt {
            out.push((PROMPT_KEY.to_string(), prompt.as_str()));
        }
        for (key, value) in &self.extra {
            collect_strings(key, value, &mut out);
        }
        out
    }
}

fn collect_strings<'a>(path: &str, value: &'a Value, out: &mut Vec<(String, &'a str)>) {
    match value {
        Value::String(s) => out.push((path.to_string(), s.as_str())),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_strings(&format!("{}[{}]", path, i), item, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                collect_strings(&format!("{}.{}", path, key), item, out);
            }
        }
        _ => {}
    }
}
