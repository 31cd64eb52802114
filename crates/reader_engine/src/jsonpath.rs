//! A small JSON path evaluator.
//!
//! Supported: `$`, `.key`, `['key']`, `[n]` (negative counts from the end),
//! `[*]`, `.*` and `..key`. A leading `$` is optional, so `data.list` and
//! `$.data.list` are the same path.

use serde_json::Value;

use engine_logging::engine_debug;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(i64),
    Wildcard,
    Descend(String),
    DescendAll,
}

/// Evaluates `path` against `root`. A malformed path selects nothing.
pub fn select<'a>(root: &'a Value, path: &str) -> Vec<&'a Value> {
    let segments = match parse(path) {
        Ok(segments) => segments,
        Err(reason) => {
            engine_debug!("bad json path {:?}: {}", path, reason);
            return Vec::new();
        }
    };

    let mut current = vec![root];
    for segment in &segments {
        let mut next = Vec::new();
        for value in current {
            apply(segment, value, &mut next);
        }
        current = next;
    }
    current
}

fn apply<'a>(segment: &Segment, value: &'a Value, out: &mut Vec<&'a Value>) {
    match segment {
        Segment::Key(key) => {
            if let Some(child) = value.get(key.as_str()) {
                out.push(child);
            }
        }
        Segment::Index(index) => {
            if let Value::Array(items) = value {
                let resolved = if *index < 0 {
                    items.len().checked_sub(index.unsigned_abs() as usize)
                } else {
                    Some(*index as usize)
                };
                if let Some(child) = resolved.and_then(|i| items.get(i)) {
                    out.push(child);
                }
            }
        }
        Segment::Wildcard => children(value, out),
        Segment::Descend(key) => {
            let mut all = Vec::new();
            descendants(value, &mut all);
            for node in all {
                if let Some(child) = node.get(key.as_str()) {
                    out.push(child);
                }
            }
        }
        Segment::DescendAll => {
            let mut all = Vec::new();
            descendants(value, &mut all);
            for node in all {
                children(node, out);
            }
        }
    }
}

fn children<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => out.extend(items.iter()),
        Value::Object(map) => out.extend(map.values()),
        _ => {}
    }
}

/// `value` and every nested value, depth first.
fn descendants<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    out.push(value);
    match value {
        Value::Array(items) => items.iter().for_each(|item| descendants(item, out)),
        Value::Object(map) => map.values().for_each(|item| descendants(item, out)),
        _ => {}
    }
}

fn parse(path: &str) -> Result<Vec<Segment>, String> {
    let path = path.trim();
    let rest = match path.strip_prefix('$') {
        Some(rest) => rest,
        None if path.starts_with('[') || path.starts_with('.') => path,
        None => return parse_rest(&format!(".{path}")),
    };
    parse_rest(rest)
}

fn parse_rest(mut rest: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("..") {
            let (name, tail) = take_name(after);
            segments.push(match name {
                "*" => Segment::DescendAll,
                "" => return Err("empty name after '..'".into()),
                key => Segment::Descend(key.to_string()),
            });
            rest = tail;
        } else if let Some(after) = rest.strip_prefix('.') {
            let (name, tail) = take_name(after);
            segments.push(match name {
                "*" => Segment::Wildcard,
                "" => return Err("empty name after '.'".into()),
                key => Segment::Key(key.to_string()),
            });
            rest = tail;
        } else if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']').ok_or("unclosed '['")?;
            segments.push(parse_bracket(after[..close].trim())?);
            rest = &after[close + 1..];
        } else {
            return Err(format!("unexpected {rest:?}"));
        }
    }
    Ok(segments)
}

fn take_name(input: &str) -> (&str, &str) {
    let end = input.find(['.', '[']).unwrap_or(input.len());
    (input[..end].trim(), &input[end..])
}

fn parse_bracket(inner: &str) -> Result<Segment, String> {
    if inner == "*" {
        return Ok(Segment::Wildcard);
    }
    let quoted = inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
    if let Some(key) = quoted {
        return Ok(Segment::Key(key.to_string()));
    }
    inner
        .parse::<i64>()
        .map(Segment::Index)
        .map_err(|_| format!("unsupported selector [{inner}]"))
}
