//! URL template resolution.
//!
//! Grammar: an optional `@Method:<VERB>` directive, zero or more
//! `@Header:{...}` blocks, a URL with `{{name}}` placeholders and an
//! optional `,<body>` suffix that turns the request into a POST.
//!
//! Resolution never fails. A malformed template yields a request that fails
//! downstream, where the failure is reported per task.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::form_urlencoded;
use url::Url;

use engine_logging::engine_debug;

static METHOD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)@Method:(GET|POST|PUT|DELETE)").expect("static regex"));
static HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@Header:\{(.*?)\}").expect("static regex"));
static VARIABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("static regex"));
static SCHEME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[a-z][a-z0-9+.-]*:").expect("static regex"));
// A base URL needs `scheme://`; `localhost:8080` is a host, not a scheme.
static BASE_SCHEME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[a-z][a-z0-9+.-]*://").expect("static regex"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    fn parse(verb: &str) -> Option<Self> {
        match verb.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "DELETE" => Some(HttpMethod::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully resolved HTTP request, ready for the fetcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl ResolvedRequest {
    /// A plain GET for an already absolute URL.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Adds headers that the template did not set itself.
    pub fn with_default_headers(mut self, defaults: &BTreeMap<String, String>) -> Self {
        for (name, value) in defaults {
            self.headers
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }
}

/// Variables available to `{{name}}` placeholders.
pub type Variables = HashMap<String, String>;

/// Resolves `template` into a request. Placeholders are replaced with the
/// form-urlencoded variable value (missing variables become empty). When
/// `base_url` is given, a relative URL is resolved against it.
pub fn resolve_template(
    template: &str,
    variables: &Variables,
    base_url: Option<&str>,
) -> ResolvedRequest {
    let mut rest = template.trim().to_string();

    let mut method = None;
    if let Some(caps) = METHOD_RE.captures(&rest) {
        method = HttpMethod::parse(&caps[1]);
        let directive = caps[0].to_string();
        rest = rest.replacen(&directive, "", 1).trim().to_string();
    }

    let mut headers = BTreeMap::new();
    let blocks: Vec<(String, String)> = HEADER_RE
        .captures_iter(&rest)
        .map(|caps| (caps[0].to_string(), caps[1].to_string()))
        .collect();
    for (directive, inner) in blocks {
        parse_header_block(&inner, &mut headers);
        rest = rest.replacen(&directive, "", 1);
    }
    let rest = rest.trim();

    let (raw_url, body) = match split_body(rest) {
        Some((url, body)) => {
            method.get_or_insert(HttpMethod::Post);
            (url, Some(body))
        }
        None => (rest, None),
    };

    let url = strip_wrappers(&substitute(raw_url, variables));
    let url = match base_url {
        Some(base) => absolutize(base, &url),
        None => url,
    };

    ResolvedRequest {
        method: method.unwrap_or_default(),
        url,
        headers,
        body: body.map(|b| substitute(b, variables)),
    }
}

fn parse_header_block(inner: &str, headers: &mut BTreeMap<String, String>) {
    let as_json = format!("{{{inner}}}");
    if let Ok(map) = serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&as_json) {
        for (name, value) in map {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            headers.insert(name, value);
        }
        return;
    }

    for pair in inner.split(',') {
        match pair.split_once(':') {
            Some((name, value)) => {
                let name = trim_quotes(name);
                if !name.is_empty() {
                    headers.insert(name.to_string(), trim_quotes(value).to_string());
                }
            }
            None => engine_debug!("skipping header fragment without ':': {:?}", pair),
        }
    }
}

fn trim_quotes(raw: &str) -> &str {
    raw.trim().trim_matches(|c| c == '"' || c == '\'').trim()
}

/// Splits `url,body` at the first top-level comma whose remainder looks like
/// a body (starts with `{` or contains `=`).
fn split_body(template: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    for (idx, ch) in template.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                let body = template[idx + 1..].trim();
                if body.starts_with('{') || body.contains('=') {
                    return Some((template[..idx].trim(), body));
                }
            }
            _ => {}
        }
    }
    None
}

fn substitute(text: &str, variables: &Variables) -> String {
    VARIABLE_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let name = caps[1].trim();
            let value = variables.get(name).map(String::as_str).unwrap_or("");
            form_urlencoded::byte_serialize(value.as_bytes()).collect::<String>()
        })
        .into_owned()
}

/// Removes backticks and one pair of matching surrounding quotes.
pub fn strip_wrappers(raw: &str) -> String {
    let cleaned = raw.trim().replace('`', "");
    let bytes = cleaned.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return cleaned[1..cleaned.len() - 1].trim().to_string();
        }
    }
    cleaned
}

/// True when `url` starts with a URL scheme (`https:`, `data:`, ...).
pub fn has_scheme(url: &str) -> bool {
    SCHEME_RE.is_match(url)
}

/// Makes `url` absolute against `base`. Absolute URLs are returned as-is.
/// A base without `scheme://` is treated as `https://`, and `//host/path`
/// inherits the scheme of the normalized base. Unresolvable input is returned unchanged.
pub fn absolutize(base: &str, url: &str) -> String {
    let url = strip_wrappers(url);
    if url.is_empty() || has_scheme(&url) {
        return url;
    }

    let base = strip_wrappers(base);
    let base = if base.is_empty() || BASE_SCHEME_RE.is_match(&base) {
        base
    } else {
        format!("https://{base}")
    };
    if let Some(rest) = url.strip_prefix("//") {
        let scheme = base.split_once("://").map_or("https", |(scheme, _)| scheme);
        return format!("{scheme}://{rest}");
    }

    if base.is_empty() {
        return url;
    }

    match Url::parse(&base).and_then(|b| b.join(&url)) {
        Ok(joined) => joined.to_string(),
        Err(err) => {
            engine_debug!("cannot resolve {:?} against {:?}: {}", url, base, err);
            url
        }
    }
}
