use pretty_assertions::assert_eq;
use reader_core::{absolutize, resolve_template, HttpMethod, ResolvedRequest, Variables};
use std::collections::BTreeMap;

fn vars(pairs: &[(&str, &str)]) -> Variables {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn get_template_substitutes_encoded_variables() {
    let request = resolve_template(
        "https://x.test/s?q={{key}}&p={{page}}",
        &vars(&[("key", "a b"), ("page", "2")]),
        None,
    );
    assert_eq!(request.method, HttpMethod::Get);
    assert_eq!(request.url, "https://x.test/s?q=a+b&p=2");
    assert_eq!(request.body, None);
    assert!(request.headers.is_empty());
}

#[test]
fn missing_variables_become_empty() {
    let request = resolve_template("https://x.test/s?q={{nope}}", &Variables::new(), None);
    assert_eq!(request.url, "https://x.test/s?q=");
}

#[test]
fn directives_are_stripped_and_applied() {
    let request = resolve_template(
        r#"@Method:post @Header:{"X-Token":"abc","X-Page":2} https://x.test/api,{"k":"{{key}}"}"#,
        &vars(&[("key", "dune")]),
        None,
    );
    assert_eq!(request.method, HttpMethod::Post);
    assert_eq!(request.url, "https://x.test/api");
    assert_eq!(request.body.as_deref(), Some(r#"{"k":"dune"}"#));
    assert_eq!(request.headers.get("X-Token").map(String::as_str), Some("abc"));
    assert_eq!(request.headers.get("X-Page").map(String::as_str), Some("2"));
}

#[test]
fn form_body_implies_post() {
    let request = resolve_template(
        "https://x.test/search,searchkey={{key}}&page={{page}}",
        &vars(&[("key", "三体"), ("page", "1")]),
        None,
    );
    assert_eq!(request.method, HttpMethod::Post);
    assert_eq!(request.url, "https://x.test/search");
    assert_eq!(
        request.body.as_deref(),
        Some("searchkey=%E4%B8%89%E4%BD%93&page=1")
    );
}

#[test]
fn explicit_method_wins_over_body() {
    let request = resolve_template("@Method:PUT https://x.test/a,q=1", &Variables::new(), None);
    assert_eq!(request.method, HttpMethod::Put);
    assert_eq!(request.body.as_deref(), Some("q=1"));
}

#[test]
fn lenient_header_block_is_accepted() {
    let request = resolve_template(
        "@Header:{User-Agent: Mozilla/5.0, 'Referer':'https://x.test'}https://x.test/",
        &Variables::new(),
        None,
    );
    assert_eq!(
        request.headers.get("User-Agent").map(String::as_str),
        Some("Mozilla/5.0")
    );
    assert_eq!(
        request.headers.get("Referer").map(String::as_str),
        Some("https://x.test")
    );
    assert_eq!(request.url, "https://x.test/");
}

#[test]
fn relative_urls_resolve_against_base() {
    let request = resolve_template(
        "/search?q={{key}}",
        &vars(&[("key", "x")]),
        Some("https://x.test/root/"),
    );
    assert_eq!(request.url, "https://x.test/search?q=x");
}

#[test]
fn absolutize_variants() {
    assert_eq!(
        absolutize("https://x.test/a/b", "c.html"),
        "https://x.test/a/c.html"
    );
    assert_eq!(
        absolutize("https://x.test", "//cdn.test/c.jpg"),
        "https://cdn.test/c.jpg"
    );
    assert_eq!(absolutize("x.test", "//cdn.test/c.jpg"), "https://cdn.test/c.jpg");
    assert_eq!(absolutize("localhost:8080", "//cdn.test/c.jpg"), "https://cdn.test/c.jpg");
    assert_eq!(absolutize("localhost:8080", "/book/1"), "https://localhost:8080/book/1");
    assert_eq!(absolutize("http://x.test", "//cdn.test/c.jpg"), "http://cdn.test/c.jpg");
    assert_eq!(absolutize("x.test", "book/1"), "https://x.test/book/1");
    assert_eq!(
        absolutize("https://x.test", "`https://y.test/z`"),
        "https://y.test/z"
    );
}

#[test]
fn template_headers_win_over_source_defaults() {
    let mut defaults = BTreeMap::new();
    defaults.insert("User-Agent".to_string(), "source-default".to_string());
    defaults.insert("Cookie".to_string(), "a=1".to_string());

    let mut request = ResolvedRequest::get("https://x.test/");
    request
        .headers
        .insert("User-Agent".to_string(), "template".to_string());
    let request = request.with_default_headers(&defaults);

    assert_eq!(
        request.headers.get("User-Agent").map(String::as_str),
        Some("template")
    );
    assert_eq!(request.headers.get("Cookie").map(String::as_str), Some("a=1"));
}
