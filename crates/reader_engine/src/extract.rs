//! Extraction rule interpreter.
//!
//! A rule is `[@css:|@json:|@xpath:|@regex:]<expr>`. Selector rules end with
//! an optional target marker: `@attr(name)`, `@text` (default) or `@html`,
//! or the shorthand `@name` for an attribute. Only a marker ending the rule
//! counts, so a selector may itself contain `@`.
//!
//! Evaluation never fails: unparseable selectors, paths, patterns or
//! documents yield an empty string or an empty list. `@xpath:` is evaluated
//! as a CSS selector.
//!
//! `scraper::Html` is not `Send`. A [`Page`] must be built and dropped
//! without crossing an `.await`.

use std::sync::LazyLock;

use ego_tree::NodeRef;
use regex::Regex;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

use engine_logging::{engine_debug, engine_warn};

use crate::jsonpath;

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)@(?:attr\(([^)]*)\)|text|html)\s*$").expect("static regex")
});
static SHORTHAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?)@([A-Za-z_][\w:.-]*)$").expect("static regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Css,
    Json,
    XPath,
    Regex,
}

/// What to read from a selected element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Text,
    Html,
    Attr(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRule<'a> {
    pub kind: RuleKind,
    pub expr: &'a str,
    pub target: Target,
}

impl<'a> ParsedRule<'a> {
    /// Splits the prefix and target marker off `rule`. Unprefixed rules use
    /// `default_kind`.
    pub fn parse(rule: &'a str, default_kind: RuleKind) -> Self {
        let rule = rule.trim();
        let (kind, body) = [
            ("@css:", RuleKind::Css),
            ("@json:", RuleKind::Json),
            ("@xpath:", RuleKind::XPath),
            ("@regex:", RuleKind::Regex),
        ]
        .into_iter()
        .find_map(|(prefix, kind)| strip_prefix_ignore_case(rule, prefix).map(|body| (kind, body)))
        .unwrap_or((default_kind, rule));

        match kind {
            RuleKind::Css | RuleKind::XPath => {
                let (expr, target) = split_target(body);
                Self { kind, expr, target }
            }
            RuleKind::Json | RuleKind::Regex => Self {
                kind,
                expr: body.trim(),
                target: Target::Text,
            },
        }
    }
}

fn strip_prefix_ignore_case<'a>(rule: &'a str, prefix: &str) -> Option<&'a str> {
    let head = rule.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &rule[prefix.len()..])
}

fn split_target(body: &str) -> (&str, Target) {
    if let Some(marker) = MARKER_RE.captures(body) {
        let whole = marker.get(0).map_or(0..0, |m| m.range());
        let target = match marker.get(1) {
            Some(name) => Target::Attr(name.as_str().trim().to_string()),
            None if body[whole.clone()].trim().eq_ignore_ascii_case("@html") => Target::Html,
            None => Target::Text,
        };
        return (body[..whole.start].trim(), target);
    }
    if let Some(caps) = SHORTHAND_RE.captures(body) {
        if let (Some(selector), Some(name)) = (caps.get(1), caps.get(2)) {
            return (selector.as_str().trim(), Target::Attr(name.as_str().to_string()));
        }
    }
    (body.trim(), Target::Text)
}

/// A parsed response body.
pub struct Page {
    raw: String,
    html: Html,
    json: Option<Value>,
}

impl Page {
    /// Bodies starting with `{` or `[` that parse as JSON are treated as
    /// JSON; everything else as HTML.
    pub fn parse(body: &str) -> Self {
        let trimmed = body.trim();
        let json = if trimmed.starts_with('{') || trimmed.starts_with('[') {
            serde_json::from_str(trimmed).ok()
        } else {
            None
        };
        let html = if json.is_some() {
            Html::new_document()
        } else {
            Html::parse_document(body)
        };
        Self {
            raw: body.to_string(),
            html,
            json,
        }
    }

    pub fn is_json(&self) -> bool {
        self.json.is_some()
    }

    pub fn root(&self) -> Scope<'_> {
        match &self.json {
            Some(value) => Scope::Json {
                value,
                raw: Some(&self.raw),
            },
            None => Scope::Document {
                html: &self.html,
                raw: &self.raw,
            },
        }
    }

    pub fn one(&self, rule: &str) -> String {
        self.root().one(rule)
    }

    pub fn list(&self, rule: &str) -> Vec<String> {
        self.root().list(rule)
    }

    pub fn items(&self, rule: &str) -> Vec<Scope<'_>> {
        self.root().items(rule)
    }
}

/// The context a rule is evaluated in: the whole document, one selected
/// element or one JSON value.
#[derive(Clone, Copy)]
pub enum Scope<'a> {
    Document { html: &'a Html, raw: &'a str },
    Element(ElementRef<'a>),
    /// `raw` is the fetched body for a whole JSON page and `None` for a
    /// value selected out of it.
    Json { value: &'a Value, raw: Option<&'a str> },
}

impl<'a> Scope<'a> {
    fn default_kind(&self) -> RuleKind {
        match self {
            Scope::Json { .. } => RuleKind::Json,
            _ => RuleKind::Css,
        }
    }

    /// First value selected by `rule`, or `""`.
    pub fn one(&self, rule: &str) -> String {
        if rule.trim().is_empty() {
            return String::new();
        }
        let parsed = ParsedRule::parse(rule, self.default_kind());
        match parsed.kind {
            RuleKind::Regex => regex_matches(&self.source_text(), parsed.expr, true)
                .into_iter()
                .next()
                .unwrap_or_default(),
            RuleKind::Json => self
                .with_json(|value| {
                    jsonpath::select(value, parsed.expr)
                        .first()
                        .map(|v| json_to_string(v))
                        .unwrap_or_default()
                })
                .unwrap_or_default(),
            RuleKind::Css | RuleKind::XPath => {
                warn_xpath(&parsed);
                self.css(&parsed, true).into_iter().next().unwrap_or_default()
            }
        }
    }

    /// Every value selected by `rule`.
    pub fn list(&self, rule: &str) -> Vec<String> {
        if rule.trim().is_empty() {
            return Vec::new();
        }
        let parsed = ParsedRule::parse(rule, self.default_kind());
        match parsed.kind {
            RuleKind::Regex => regex_matches(&self.source_text(), parsed.expr, false),
            RuleKind::Json => self
                .with_json(|value| {
                    flatten(jsonpath::select(value, parsed.expr))
                        .into_iter()
                        .map(json_to_string)
                        .collect()
                })
                .unwrap_or_default(),
            RuleKind::Css | RuleKind::XPath => {
                warn_xpath(&parsed);
                self.css(&parsed, false)
            }
        }
    }

    /// Like [`Scope::one`], but selector rules keep line structure: every
    /// selected element is converted to text with one line per block.
    pub fn block_text(&self, rule: &str) -> String {
        let parsed = ParsedRule::parse(rule, self.default_kind());
        match (parsed.kind, &parsed.target) {
            (RuleKind::Css | RuleKind::XPath, Target::Text | Target::Html) => {
                let as_html = ParsedRule {
                    target: Target::Html,
                    ..parsed.clone()
                };
                warn_xpath(&as_html);
                self.css(&as_html, false)
                    .iter()
                    .map(|fragment| html_to_text(fragment))
                    .filter(|text| !text.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            _ => self.one(rule),
        }
    }

    /// Child scopes for a repeating item rule (book list, chapter list).
    /// Only selector rules over HTML and path rules over JSON yield items.
    pub fn items(&self, rule: &str) -> Vec<Scope<'a>> {
        if rule.trim().is_empty() {
            return Vec::new();
        }
        let parsed = ParsedRule::parse(rule, self.default_kind());
        match (parsed.kind, *self) {
            (RuleKind::Json, Scope::Json { value, .. }) => {
                flatten(jsonpath::select(value, parsed.expr))
                    .into_iter()
                    .map(|value| Scope::Json { value, raw: None })
                    .collect()
            }
            (RuleKind::Css | RuleKind::XPath, Scope::Document { .. } | Scope::Element(_)) => {
                warn_xpath(&parsed);
                match compile_selector(parsed.expr) {
                    Some(selector) => self.select(&selector),
                    None => Vec::new(),
                }
            }
            (kind, _) => {
                engine_debug!("{:?} rule {:?} cannot select items here", kind, rule);
                Vec::new()
            }
        }
    }

    fn select(&self, selector: &Selector) -> Vec<Scope<'a>> {
        match *self {
            Scope::Document { html, .. } => html.select(selector).map(Scope::Element).collect(),
            Scope::Element(element) => element.select(selector).map(Scope::Element).collect(),
            Scope::Json { .. } => Vec::new(),
        }
    }

    fn css(&self, parsed: &ParsedRule<'_>, first_only: bool) -> Vec<String> {
        match *self {
            Scope::Json { value, .. } => {
                // Selector rules over JSON apply to string values holding HTML.
                let Value::String(fragment) = value else {
                    return Vec::new();
                };
                let html = Html::parse_fragment(fragment);
                css_in(Scope::Element(html.root_element()), parsed, first_only)
            }
            scope => css_in(scope, parsed, first_only),
        }
    }

    /// Text that regex and embedded JSON rules run against.
    fn source_text(&self) -> String {
        match *self {
            Scope::Document { raw, .. } => raw.to_string(),
            Scope::Element(element) => element.html(),
            Scope::Json { raw: Some(raw), .. } => raw.to_string(),
            Scope::Json { value, raw: None } => json_to_string(value),
        }
    }

    fn with_json<R>(&self, f: impl FnOnce(&Value) -> R) -> Option<R> {
        match *self {
            Scope::Json { value, .. } => Some(f(value)),
            Scope::Document { raw, .. } => parse_json(raw).map(|value| f(&value)),
            Scope::Element(element) => {
                parse_json(&element.text().collect::<String>()).map(|value| f(&value))
            }
        }
    }
}

fn css_in(scope: Scope<'_>, parsed: &ParsedRule<'_>, first_only: bool) -> Vec<String> {
    let elements: Vec<ElementRef<'_>> = if parsed.expr.is_empty() {
        match scope {
            Scope::Element(element) => vec![element],
            Scope::Document { html, .. } => vec![html.root_element()],
            Scope::Json { .. } => Vec::new(),
        }
    } else {
        let Some(selector) = compile_selector(parsed.expr) else {
            return Vec::new();
        };
        let selected = scope.select(&selector).into_iter().filter_map(|s| match s {
            Scope::Element(element) => Some(element),
            _ => None,
        });
        if first_only {
            selected.take(1).collect()
        } else {
            selected.collect()
        }
    };

    elements
        .into_iter()
        .map(|element| read_target(element, &parsed.target))
        .collect()
}

fn compile_selector(expr: &str) -> Option<Selector> {
    match Selector::parse(expr) {
        Ok(selector) => Some(selector),
        Err(err) => {
            engine_warn!("invalid selector {:?}: {}", expr, err);
            None
        }
    }
}

fn read_target(element: ElementRef<'_>, target: &Target) -> String {
    match target {
        Target::Text => normalize_whitespace(&element.text().collect::<String>()),
        Target::Html => element.inner_html().trim().to_string(),
        Target::Attr(name) => element.value().attr(name).unwrap_or("").trim().to_string(),
    }
}

fn warn_xpath(parsed: &ParsedRule<'_>) {
    if parsed.kind == RuleKind::XPath {
        engine_warn!("xpath rule {:?} evaluated as a css selector", parsed.expr);
    }
}

fn regex_matches(text: &str, pattern: &str, first_only: bool) -> Vec<String> {
    let re = match Regex::new(pattern) {
        Ok(re) => re,
        Err(err) => {
            engine_warn!("invalid regex rule {:?}: {}", pattern, err);
            return Vec::new();
        }
    };
    let group = usize::from(re.captures_len() > 1);
    let matches = re.captures_iter(text).map(|caps| {
        caps.get(group)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    });
    if first_only {
        matches.take(1).collect()
    } else {
        matches.collect()
    }
}

fn parse_json(text: &str) -> Option<Value> {
    match serde_json::from_str(text.trim()) {
        Ok(value) => Some(value),
        Err(err) => {
            engine_debug!("content is not json: {}", err);
            None
        }
    }
}

/// Matched arrays contribute their elements.
fn flatten(values: Vec<&Value>) -> Vec<&Value> {
    let mut out = Vec::new();
    for value in values {
        match value {
            Value::Array(items) => out.extend(items.iter()),
            other => out.push(other),
        }
    }
    out
}

fn json_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(json_to_string)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Converts an HTML fragment to plain text, one line per block element or
/// `<br>`, blank lines dropped.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::new();
    for child in fragment.root_element().children() {
        collect_text(child, &mut out);
    }
    out.lines()
        .map(normalize_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_text(node: NodeRef<'_, Node>, out: &mut String) {
    match node.value() {
        Node::Text(text) => out.push_str(text),
        Node::Element(element) => {
            let tag = element.name().to_ascii_lowercase();
            match tag.as_str() {
                "script" | "style" => {}
                "br" => out.push('\n'),
                "p" | "div" | "li" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "tr" => {
                    out.push('\n');
                    node.children().for_each(|child| collect_text(child, out));
                    out.push('\n');
                }
                _ => node.children().for_each(|child| collect_text(child, out)),
            }
        }
        _ => node.children().for_each(|child| collect_text(child, out)),
    }
}
