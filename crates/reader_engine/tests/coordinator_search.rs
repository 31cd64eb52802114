use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use reader_core::{
    EndPayload, JobPhase, ResolvedRequest, SearchResult, Source, StreamEvent,
};
use reader_engine::{
    known_sources_key, read_json, BlobStore, Coordinator, CoordinatorSettings, EventSink,
    FetchError, FetchMetadata, FetchOutput, FetchSettings, Fetcher, FileBlobStore, JobHandle,
    RefreshRequest, ReqwestFetcher, SearchRequest, WebBook,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Serves one book per request, named after the requested URL, and records
/// how many requests were in flight at once.
#[derive(Default)]
struct StubFetcher {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl StubFetcher {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, request: &ResolvedRequest) -> Result<FetchOutput, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let body = format!(r#"<div class="book"><h3>{}</h3></div>"#, request.url);
        Ok(FetchOutput {
            metadata: FetchMetadata {
                original_url: request.url.clone(),
                final_url: request.url.clone(),
                status: 200,
                content_type: Some("text/html".to_string()),
                byte_len: body.len() as u64,
            },
            bytes: body.into_bytes(),
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<StreamEvent<SearchResult>>>,
}

impl EventSink<SearchResult> for RecordingSink {
    fn emit(&self, event: StreamEvent<SearchResult>) -> bool {
        self.events.lock().unwrap().push(event);
        true
    }
}

fn source(base: &str, search_url: &str) -> Source {
    serde_json::from_value(json!({
        "bookSourceUrl": base,
        "bookSourceName": base,
        "searchUrl": search_url,
        "ruleSearch": {"bookList": "div.book", "name": "h3", "author": ".author", "bookUrl": "a@href"}
    }))
    .expect("source json")
}

fn stub_sources(count: usize) -> Vec<Source> {
    (0..count)
        .map(|i| source(&format!("https://s{i}.test"), "/search?q={{key}}"))
        .collect()
}

fn coordinator(fetcher: Arc<dyn Fetcher>, store: Arc<dyn BlobStore>) -> Coordinator {
    Coordinator::new(WebBook::new(fetcher), store, CoordinatorSettings::default())
}

fn temp_store() -> (tempfile::TempDir, Arc<dyn BlobStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn BlobStore> = Arc::new(FileBlobStore::new(dir.path()));
    (dir, store)
}

async fn drain<T>(handle: &mut JobHandle<T>) -> Vec<StreamEvent<T>> {
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    events
}

fn names(events: &[StreamEvent<SearchResult>]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Message(batch) => Some(batch.data.iter().map(|r| r.name.clone())),
            _ => None,
        })
        .flatten()
        .collect()
}

async fn mount_books(server: &MockServer, at: &str, books: &[(&str, &str)]) {
    let body: String = books
        .iter()
        .enumerate()
        .map(|(i, (name, author))| {
            format!(r#"<div class="book"><h3>{name}</h3><span class="author">{author}</span><a href="{at}/{i}">x</a></div>"#)
        })
        .collect();
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/html"))
        .mount(server)
        .await;
}

#[tokio::test]
async fn failing_source_does_not_stop_the_search() {
    let server = MockServer::start().await;
    mount_books(&server, "/s1/search", &[("Dune", "Herbert")]).await;
    Mock::given(method("GET"))
        .and(path("/s2/search"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    mount_books(&server, "/s3/search", &[("Emma", "Austen")]).await;

    let sources: Vec<Source> = (1..=3)
        .map(|i| source(&format!("{}/s{i}", server.uri()), &format!("/s{i}/search?q={{{{key}}}}")))
        .collect();
    let fetcher = Arc::new(ReqwestFetcher::new(FetchSettings::default()).expect("client"));
    let (_dir, store) = temp_store();
    let request = SearchRequest {
        concurrency: Some(2),
        ..SearchRequest::new("book")
    };

    let mut handle = coordinator(fetcher, store).spawn_search(sources, request);
    let events = drain(&mut handle).await;

    assert_eq!(names(&events), vec!["Dune", "Emma"]);
    let cursors: Vec<i64> = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Message(batch) => Some(batch.last_index),
            _ => None,
        })
        .collect();
    assert_eq!(cursors, vec![1, 2]);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::End(EndPayload::Cursor { last_index: 2 }))
    );
    assert_eq!(handle.join().await, JobPhase::Completed);
}

#[tokio::test]
async fn duplicate_books_are_streamed_once() {
    let server = MockServer::start().await;
    mount_books(&server, "/a/search", &[("Dune", "Herbert"), ("Emma", "Austen")]).await;
    mount_books(&server, "/b/search", &[("Dune", "Herbert"), ("Dune", "Someone Else")]).await;

    let sources = vec![
        source(&format!("{}/a", server.uri()), "/a/search?q={{key}}"),
        source(&format!("{}/b", server.uri()), "/b/search?q={{key}}"),
    ];
    let fetcher = Arc::new(ReqwestFetcher::new(FetchSettings::default()).expect("client"));
    let (_dir, store) = temp_store();

    let mut handle = coordinator(fetcher, store).spawn_search(sources, SearchRequest::new("dune"));
    let events = drain(&mut handle).await;

    let mut found = names(&events);
    found.sort();
    assert_eq!(found, vec!["Dune", "Dune", "Emma"]);
    let authors: Vec<String> = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Message(batch) => Some(batch.data.clone()),
            _ => None,
        })
        .flatten()
        .filter(|r| r.name == "Dune")
        .map(|r| r.author)
        .collect();
    assert_eq!(authors.len(), 2);
    assert!(authors.contains(&"Herbert".to_string()));
    assert!(authors.contains(&"Someone Else".to_string()));
}

#[tokio::test]
async fn concurrency_bounds_in_flight_requests() {
    let fetcher = Arc::new(StubFetcher::with_delay(Duration::from_millis(20)));
    let (_dir, store) = temp_store();
    let request = SearchRequest {
        concurrency: Some(3),
        ..SearchRequest::new("book")
    };

    let mut handle = coordinator(fetcher.clone(), store).spawn_search(stub_sources(10), request);
    let events = drain(&mut handle).await;

    assert_eq!(names(&events).len(), 10);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 10);
    assert!(fetcher.peak.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn size_limit_stops_after_window() {
    let fetcher = Arc::new(StubFetcher::default());
    let (_dir, store) = temp_store();
    let request = SearchRequest {
        size: Some(1),
        concurrency: Some(2),
        ..SearchRequest::new("book")
    };

    let mut handle = coordinator(fetcher.clone(), store).spawn_search(stub_sources(6), request);
    let events = drain(&mut handle).await;

    assert_eq!(names(&events).len(), 2);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::End(EndPayload::Cursor { last_index: 1 }))
    );
}

#[tokio::test]
async fn resumed_search_starts_after_cursor() {
    let fetcher = Arc::new(StubFetcher::default());
    let (_dir, store) = temp_store();
    let request = SearchRequest {
        last_index: 3,
        ..SearchRequest::new("book")
    };

    let mut handle = coordinator(fetcher, store).spawn_search(stub_sources(5), request);
    let events = drain(&mut handle).await;

    assert_eq!(names(&events), vec!["https://s4.test/search?q=book"]);
}

#[tokio::test]
async fn search_without_sources_is_rejected() {
    let (_dir, store) = temp_store();
    let mut handle = coordinator(Arc::new(StubFetcher::default()), store)
        .spawn_search(Vec::new(), SearchRequest::new("dune"));
    let events = drain(&mut handle).await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Error(payload) => {
            assert!(!payload.is_success);
            assert_eq!(payload.error_code.as_deref(), Some("NO_SOURCES"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(handle.join().await, JobPhase::Failed);
}

#[tokio::test]
async fn exhausted_cursor_reports_no_more_sources() {
    let (_dir, store) = temp_store();
    let request = SearchRequest {
        last_index: 1,
        ..SearchRequest::new("dune")
    };
    let mut handle =
        coordinator(Arc::new(StubFetcher::default()), store).spawn_search(stub_sources(2), request);
    let events = drain(&mut handle).await;

    match &events[..] {
        [StreamEvent::Error(payload)] => {
            assert_eq!(payload.error_code.as_deref(), Some("NO_MORE_SOURCES"));
            assert_eq!(payload.data, Some(json!({"lastIndex": 1})));
        }
        other => panic!("unexpected events {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_search_emits_nothing() {
    let (_dir, store) = temp_store();
    let fetcher = Arc::new(StubFetcher::default());
    let sink = RecordingSink::default();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let phase = coordinator(fetcher.clone(), store)
        .run_search(&stub_sources(3), &SearchRequest::new("dune"), &sink, cancel)
        .await;

    assert_eq!(phase, JobPhase::Cancelled);
    assert!(sink.events.lock().unwrap().is_empty());
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancel_mid_job_ends_stream_without_end_event() {
    let (_dir, store) = temp_store();
    let fetcher = Arc::new(StubFetcher::with_delay(Duration::from_millis(100)));
    let request = SearchRequest {
        concurrency: Some(1),
        ..SearchRequest::new("dune")
    };
    let mut handle = coordinator(fetcher, store).spawn_search(stub_sources(4), request);

    let first = handle.next_event().await.expect("first batch");
    assert!(matches!(first, StreamEvent::Message(_)));
    handle.cancel();

    let rest = drain(&mut handle).await;
    assert!(rest.iter().all(|event| !matches!(event, StreamEvent::End(_))));
    assert_eq!(handle.join().await, JobPhase::Cancelled);
}

#[tokio::test]
async fn refresh_keeps_exact_matches_and_stores_them() {
    let server = MockServer::start().await;
    mount_books(&server, "/a/search", &[("Dune", "Herbert")]).await;
    mount_books(&server, "/b/search", &[("Dune", "Someone Else")]).await;
    mount_books(&server, "/c/search", &[(" Dune ", "Herbert"), ("Dune II", "Herbert")]).await;

    let sources = vec![
        source(&format!("{}/a", server.uri()), "/a/search?q={{key}}"),
        source(&format!("{}/b", server.uri()), "/b/search?q={{key}}"),
        source(&format!("{}/c", server.uri()), "/c/search?q={{key}}"),
    ];
    let fetcher = Arc::new(ReqwestFetcher::new(FetchSettings::default()).expect("client"));
    let (_dir, store) = temp_store();
    let coordinator = coordinator(fetcher, Arc::clone(&store));

    let mut handle =
        coordinator.spawn_refresh(sources.clone(), RefreshRequest::new("Dune", "Herbert"));
    let events = drain(&mut handle).await;
    assert_eq!(names(&events).len(), 2);
    assert_eq!(handle.join().await, JobPhase::Completed);

    let stored: Vec<SearchResult> = read_json(store.as_ref(), &known_sources_key("Dune", "Herbert"))
        .expect("readable")
        .expect("stored");
    let origins: Vec<String> = stored.iter().map(|r| r.origin.clone()).collect();
    assert_eq!(
        origins,
        vec![format!("{}/a", server.uri()), format!("{}/c", server.uri())]
    );

    // Without `refresh` the scan resumes after the last stored origin.
    let mut again = coordinator.spawn_refresh(sources.clone(), RefreshRequest::new("Dune", "Herbert"));
    match &drain(&mut again).await[..] {
        [StreamEvent::Error(payload)] => {
            assert_eq!(payload.error_code.as_deref(), Some("NO_MORE_SOURCES"))
        }
        other => panic!("unexpected events {other:?}"),
    }

    let request = RefreshRequest {
        refresh: true,
        ..RefreshRequest::new("Dune", "Herbert")
    };
    let mut rescan = coordinator.spawn_refresh(sources, request);
    assert_eq!(names(&drain(&mut rescan).await).len(), 2);
    let stored: Vec<SearchResult> = read_json(store.as_ref(), &known_sources_key("Dune", "Herbert"))
        .expect("readable")
        .expect("stored");
    assert_eq!(stored.len(), 2);
}

#[tokio::test]
async fn refresh_requires_book_name() {
    let (_dir, store) = temp_store();
    let mut handle = coordinator(Arc::new(StubFetcher::default()), store)
        .spawn_refresh(stub_sources(2), RefreshRequest::new("  ", "x"));
    match &drain(&mut handle).await[..] {
        [StreamEvent::Error(payload)] => {
            assert_eq!(payload.error_code.as_deref(), Some("MISSING_BOOK_NAME"))
        }
        other => panic!("unexpected events {other:?}"),
    }
}
