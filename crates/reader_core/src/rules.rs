//! Source rule model: typed RuleSets over leniently stored rule data.
//!
//! A stored rule may be a JSON object, a pre-serialized JSON string, or a
//! single-element array wrapping either. [`RuleSlot`] keeps whatever was
//! stored and [`RuleSlot::decode`] normalizes it into a typed RuleSet on
//! every call. `null`, empty strings, `{}`, `[]` and decode failures are all
//! reported as absent.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use engine_logging::{engine_debug, engine_warn};

/// How deep a string/array wrapper may nest before the value is rejected.
const MAX_WRAPPING: usize = 2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleSlot {
    #[default]
    Absent,
    Structured(Map<String, Value>),
    Encoded(String),
    Wrapped(Vec<Value>),
    Other(Value),
}

impl RuleSlot {
    /// Stores an already-typed RuleSet.
    pub fn from_rule<T: Serialize>(rule: &T) -> Self {
        match serde_json::to_value(rule) {
            Ok(Value::Object(map)) => RuleSlot::Structured(map),
            Ok(_) | Err(_) => RuleSlot::Absent,
        }
    }

    /// Decodes the slot into `T`, or `None` when the slot is absent, empty
    /// or does not decode.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        let object = match self {
            RuleSlot::Absent | RuleSlot::Other(_) => None,
            RuleSlot::Structured(map) if map.is_empty() => None,
            RuleSlot::Structured(map) => Some(Value::Object(map.clone())),
            RuleSlot::Encoded(text) => normalize_text(text, MAX_WRAPPING),
            RuleSlot::Wrapped(items) => items
                .first()
                .and_then(|first| normalize(first.clone(), MAX_WRAPPING)),
        }?;

        match serde_json::from_value(object) {
            Ok(rule) => Some(rule),
            Err(err) => {
                engine_debug!("rule slot does not decode: {}", err);
                None
            }
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, RuleSlot::Absent)
    }
}

fn normalize(value: Value, depth: usize) -> Option<Value> {
    match value {
        Value::Object(map) if map.is_empty() => None,
        Value::Object(map) => Some(Value::Object(map)),
        Value::String(text) if depth > 0 => normalize_text(&text, depth - 1),
        Value::Array(items) if depth > 0 => items
            .into_iter()
            .next()
            .and_then(|first| normalize(first, depth - 1)),
        _ => None,
    }
}

fn normalize_text(text: &str, depth: usize) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "{}" || trimmed == "[]" {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(parsed) => normalize(parsed, depth),
        Err(err) => {
            engine_debug!("rule string is not JSON: {}", err);
            None
        }
    }
}

/// Returns the rule text of a RuleSet field, or `None` when the field is
/// absent or blank (meaning "do not populate").
pub fn field(rule: &Option<String>) -> Option<&str> {
    rule.as_deref().map(str::trim).filter(|r| !r.is_empty())
}

/// Rules for a page listing books (explore and search results).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookListRule {
    pub book_list: Option<String>,
    pub name: Option<String>,
    pub author: Option<String>,
    pub intro: Option<String>,
    pub kind: Option<String>,
    pub last_chapter: Option<String>,
    pub update_time: Option<String>,
    pub book_url: Option<String>,
    pub cover_url: Option<String>,
    pub word_count: Option<String>,
}

pub type ExploreRule = BookListRule;
pub type SearchRule = BookListRule;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookInfoRule {
    pub init: Option<String>,
    pub name: Option<String>,
    pub author: Option<String>,
    pub intro: Option<String>,
    pub kind: Option<String>,
    pub last_chapter: Option<String>,
    pub update_time: Option<String>,
    pub cover_url: Option<String>,
    pub toc_url: Option<String>,
    pub word_count: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TocRule {
    pub chapter_list: Option<String>,
    pub chapter_name: Option<String>,
    pub chapter_url: Option<String>,
    pub is_volume: Option<String>,
    pub is_vip: Option<String>,
    pub update_time: Option<String>,
    pub next_toc_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContentRule {
    pub content: Option<String>,
    pub next_content_url: Option<String>,
    /// `##pattern##replacement` pairs applied to extracted text.
    pub replace_regex: Option<String>,
}

impl ContentRule {
    /// Parses `replace_regex` into `(pattern, replacement)` pairs.
    pub fn replacements(&self) -> Vec<(String, String)> {
        let Some(raw) = field(&self.replace_regex) else {
            return Vec::new();
        };
        let mut parts = raw.split("##").skip_while(|p| p.is_empty());
        let mut pairs = Vec::new();
        while let Some(pattern) = parts.next() {
            let replacement = parts.next().unwrap_or("");
            if !pattern.is_empty() {
                pairs.push((pattern.to_string(), replacement.to_string()));
            }
        }
        pairs
    }

    /// Applies every valid replacement pair in order. Invalid patterns are
    /// skipped.
    pub fn apply_replacements(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (pattern, replacement) in self.replacements() {
            match Regex::new(&pattern) {
                Ok(re) => out = re.replace_all(&out, replacement.as_str()).into_owned(),
                Err(err) => engine_warn!("skipping invalid replaceRegex {:?}: {}", pattern, err),
            }
        }
        out
    }
}
