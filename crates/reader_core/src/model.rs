use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::rules::{BookInfoRule, ContentRule, ExploreRule, RuleSlot, SearchRule, TocRule};

/// A user-configured content provider. Identity is `book_source_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Source {
    pub book_source_url: String,
    pub book_source_name: String,
    pub book_source_group: Option<String>,
    pub book_source_type: i32,
    pub enabled: bool,
    pub enabled_explore: bool,
    /// JSON object of headers sent with every request to this source.
    pub header: Option<String>,
    pub custom_order: i32,
    pub weight: i32,
    pub explore_url: Option<String>,
    pub search_url: Option<String>,
    pub respond_time: u64,
    pub rule_explore: RuleSlot,
    pub rule_search: RuleSlot,
    pub rule_book_info: RuleSlot,
    pub rule_toc: RuleSlot,
    pub rule_content: RuleSlot,
}

impl Default for Source {
    fn default() -> Self {
        Self {
            book_source_url: String::new(),
            book_source_name: String::new(),
            book_source_group: None,
            book_source_type: 0,
            enabled: true,
            enabled_explore: true,
            header: None,
            custom_order: 0,
            weight: 0,
            explore_url: None,
            search_url: None,
            respond_time: 180_000,
            rule_explore: RuleSlot::Absent,
            rule_search: RuleSlot::Absent,
            rule_book_info: RuleSlot::Absent,
            rule_toc: RuleSlot::Absent,
            rule_content: RuleSlot::Absent,
        }
    }
}

impl Source {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            book_source_url: url.into(),
            book_source_name: name.into(),
            ..Self::default()
        }
    }

    // Rule slots are decoded on every call: the stored value may be swapped
    // out by the persistence layer between two reads.

    pub fn explore_rule(&self) -> Option<ExploreRule> {
        self.rule_explore.decode()
    }

    pub fn search_rule(&self) -> Option<SearchRule> {
        self.rule_search.decode()
    }

    pub fn book_info_rule(&self) -> Option<BookInfoRule> {
        self.rule_book_info.decode()
    }

    pub fn toc_rule(&self) -> Option<TocRule> {
        self.rule_toc.decode()
    }

    pub fn content_rule(&self) -> Option<ContentRule> {
        self.rule_content.decode()
    }

    /// Groups this source belongs to, from the comma-separated group field.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.book_source_group
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
    }

    pub fn in_group(&self, group: &str) -> bool {
        let group = group.trim();
        self.groups().any(|g| g == group)
    }

    /// Default request headers from the `header` field. Unparseable or
    /// non-object values yield an empty map.
    pub fn default_headers(&self) -> BTreeMap<String, String> {
        let Some(raw) = self.header.as_deref().map(str::trim).filter(|h| !h.is_empty()) else {
            return BTreeMap::new();
        };
        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(raw) {
            Ok(map) => map
                .into_iter()
                .map(|(k, v)| {
                    let value = match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, value)
                })
                .collect(),
            Err(err) => {
                engine_logging::engine_debug!(
                    "ignoring unparseable header for source {}: {}",
                    self.book_source_url,
                    err
                );
                BTreeMap::new()
            }
        }
    }
}

impl PartialEq for Source {
    fn eq(&self, other: &Self) -> bool {
        self.book_source_url == other.book_source_url
    }
}

impl Eq for Source {}

/// One book found on a source by explore or search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchResult {
    pub book_url: String,
    /// Identity (URL) of the source that produced this result.
    pub origin: String,
    pub origin_name: String,
    pub name: String,
    pub author: String,
    pub kind: String,
    pub intro: String,
    pub cover_url: String,
    pub word_count: String,
    pub latest_chapter_title: String,
    pub elapsed_time_ms: u64,
}

/// Cross-source identity of a book: the same title and author from two
/// sources is one logical book.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    pub name: String,
    pub author: String,
}

impl SearchResult {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            name: self.name.clone(),
            author: self.author.clone(),
        }
    }
}

/// Detail page of a book.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookInfo {
    pub book_url: String,
    pub origin: String,
    pub origin_name: String,
    pub name: String,
    pub author: String,
    pub kind: String,
    pub intro: String,
    pub cover_url: String,
    pub toc_url: String,
    pub word_count: String,
    pub latest_chapter_title: String,
}

impl BookInfo {
    /// URL of the table of contents, falling back to the book page.
    pub fn effective_toc_url(&self) -> &str {
        if self.toc_url.trim().is_empty() {
            &self.book_url
        } else {
            &self.toc_url
        }
    }
}

impl From<&SearchResult> for BookInfo {
    fn from(result: &SearchResult) -> Self {
        Self {
            book_url: result.book_url.clone(),
            origin: result.origin.clone(),
            origin_name: result.origin_name.clone(),
            name: result.name.clone(),
            author: result.author.clone(),
            kind: result.kind.clone(),
            intro: result.intro.clone(),
            cover_url: result.cover_url.clone(),
            toc_url: String::new(),
            word_count: result.word_count.clone(),
            latest_chapter_title: result.latest_chapter_title.clone(),
        }
    }
}

/// A table-of-contents entry. Identity is `url`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Chapter {
    pub url: String,
    pub title: String,
    pub index: usize,
    pub book_url: String,
}

impl PartialEq for Chapter {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for Chapter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_are_split_and_trimmed() {
        let mut source = Source::new("https://a.test", "A");
        source.book_source_group = Some(" web , novel,,".to_string());
        assert_eq!(source.groups().collect::<Vec<_>>(), vec!["web", "novel"]);
        assert!(source.in_group("novel"));
        assert!(!source.in_group("nov"));
    }

    #[test]
    fn default_headers_stringify_non_string_values() {
        let mut source = Source::new("https://a.test", "A");
        source.header = Some(r#"{"User-Agent":"x","X-Retry":3}"#.to_string());
        let headers = source.default_headers();
        assert_eq!(headers.get("User-Agent").map(String::as_str), Some("x"));
        assert_eq!(headers.get("X-Retry").map(String::as_str), Some("3"));
    }

    #[test]
    fn default_headers_ignore_garbage() {
        let mut source = Source::new("https://a.test", "A");
        source.header = Some("not json".to_string());
        assert!(source.default_headers().is_empty());
    }

    #[test]
    fn sources_compare_by_url() {
        let a = Source::new("https://a.test", "A");
        let b = Source::new("https://a.test", "Renamed");
        assert_eq!(a, b);
    }

    #[test]
    fn toc_url_falls_back_to_book_url() {
        let info = BookInfo {
            book_url: "https://a.test/b/1".to_string(),
            ..BookInfo::default()
        };
        assert_eq!(info.effective_toc_url(), "https://a.test/b/1");
    }
}
