//! Concurrent multi-source and multi-chapter coordinator.
//!
//! A job walks its candidate list in windows. Each window runs as one
//! `JoinSet` whose tasks share a semaphore sized to the job's concurrency,
//! and the coordinator waits for the whole window before merging results
//! into the job state and streaming one batch event. Cancellation aborts the
//! running window and ends the stream without further events.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use engine_logging::{engine_debug, engine_error, engine_info, engine_warn};
use reader_core::{
    merge_known_sources, BookInfo, CacheJob, Chapter, ChapterOutcome, ErrorPayload, JobError,
    JobPhase, RefreshJob, RefreshParams, SearchJob, SearchResult, Source, StreamEvent,
};

use crate::store::{
    cached_chapter_indices, chapter_content_key, chapter_list_key, known_sources_key, read_json,
    write_json, BlobStore,
};
use crate::types::{FailureKind, FetchError};
use crate::webbook::WebBook;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub concurrency: usize,
    pub search_size: usize,
    pub refresh_size: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            concurrency: 24,
            search_size: 50,
            refresh_size: 30,
        }
    }
}

/// Receives the events of one job. Returns `false` once the consumer is
/// gone, which cancels the job.
pub trait EventSink<T>: Send + Sync {
    fn emit(&self, event: StreamEvent<T>) -> bool;
}

pub struct ChannelEventSink<T> {
    tx: mpsc::UnboundedSender<StreamEvent<T>>,
}

impl<T> ChannelEventSink<T> {
    pub fn new(tx: mpsc::UnboundedSender<StreamEvent<T>>) -> Self {
        Self { tx }
    }
}

impl<T: Send> EventSink<T> for ChannelEventSink<T> {
    fn emit(&self, event: StreamEvent<T>) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// A job running on the tokio runtime.
pub struct JobHandle<T> {
    events: mpsc::UnboundedReceiver<StreamEvent<T>>,
    cancel: CancellationToken,
    task: JoinHandle<JobPhase>,
}

impl<T> JobHandle<T> {
    /// Next streamed event, `None` once the job has finished.
    pub async fn next_event(&mut self) -> Option<StreamEvent<T>> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn join(self) -> JobPhase {
        self.task.await.unwrap_or(JobPhase::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub keyword: String,
    pub page: u32,
    /// Cursor from a previous response, `-1` to start from the first source.
    pub last_index: i64,
    pub size: Option<usize>,
    pub concurrency: Option<usize>,
}

impl SearchRequest {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            page: 1,
            last_index: -1,
            size: None,
            concurrency: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshRequest {
    pub name: String,
    pub author: String,
    pub last_index: i64,
    pub refresh: bool,
    pub size: Option<usize>,
    pub concurrency: Option<usize>,
}

impl RefreshRequest {
    pub fn new(name: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            author: author.into(),
            last_index: -1,
            refresh: false,
            size: None,
            concurrency: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheRequest {
    pub book: BookInfo,
    /// Refetch the chapter list and every chapter, ignoring stored copies.
    pub refresh: bool,
    pub concurrency: Option<usize>,
}

#[derive(Clone)]
pub struct Coordinator {
    webbook: WebBook,
    store: Arc<dyn BlobStore>,
    settings: CoordinatorSettings,
}

impl Coordinator {
    pub fn new(webbook: WebBook, store: Arc<dyn BlobStore>, settings: CoordinatorSettings) -> Self {
        Self {
            webbook,
            store,
            settings,
        }
    }

    pub fn webbook(&self) -> &WebBook {
        &self.webbook
    }

    pub fn settings(&self) -> CoordinatorSettings {
        self.settings
    }

    fn concurrency(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.settings.concurrency).max(1)
    }

    /// Searches `sources` for a keyword. Failing sources contribute nothing;
    /// books already streamed under the same name and author are dropped.
    pub async fn run_search(
        &self,
        sources: &[Source],
        request: &SearchRequest,
        sink: &dyn EventSink<SearchResult>,
        cancel: CancellationToken,
    ) -> JobPhase {
        let concurrency = self.concurrency(request.concurrency);
        let size = request.size.unwrap_or(self.settings.search_size);
        let mut job = match SearchJob::start(
            &request.keyword,
            sources.len(),
            request.last_index,
            size,
            concurrency,
        ) {
            Ok(job) => job,
            Err(err) => return reject(err, sink),
        };

        while let Some(window) = job.next_window() {
            if cancel.is_cancelled() {
                job.cancel();
                break;
            }
            engine_debug!("search window {:?}", window);
            let webbook = self.webbook.clone();
            let keyword = request.keyword.clone();
            let page = request.page.max(1);
            let outputs = run_window(
                sources[window.clone()].to_vec(),
                concurrency,
                &cancel,
                move |source| {
                    let webbook = webbook.clone();
                    let keyword = keyword.clone();
                    async move { search_tolerant(&webbook, &source, &keyword, page).await }
                },
            )
            .await;
            let Some(outputs) = outputs else {
                job.cancel();
                break;
            };

            let event = job.complete_window(window, outputs.into_iter().flatten());
            if !sink.emit(event) {
                cancel.cancel();
                job.cancel();
            }
        }

        if let Some(end) = job.finish() {
            engine_info!(
                "search {:?} done: {} books, lastIndex {}",
                request.keyword,
                job.found(),
                job.last_index()
            );
            sink.emit(end);
        }
        job.phase()
    }

    /// Looks for other sources of one book and merges them into the stored
    /// known-source list.
    pub async fn run_refresh(
        &self,
        sources: &[Source],
        request: &RefreshRequest,
        sink: &dyn EventSink<SearchResult>,
        cancel: CancellationToken,
    ) -> JobPhase {
        let key = known_sources_key(request.name.trim(), request.author.trim());
        let known: Vec<SearchResult> = match read_json(self.store.as_ref(), &key) {
            Ok(known) => known.unwrap_or_default(),
            Err(err) => {
                engine_warn!("ignoring stored sources under {}: {}", key, err);
                Vec::new()
            }
        };

        let concurrency = self.concurrency(request.concurrency);
        let params = RefreshParams {
            name: &request.name,
            author: &request.author,
            last_index: request.last_index,
            refresh: request.refresh,
            size_limit: request.size.unwrap_or(self.settings.refresh_size),
            concurrency,
        };
        let mut job = match RefreshJob::start(params, sources, &known) {
            Ok(job) => job,
            Err(err) => return reject(err, sink),
        };

        while let Some(window) = job.next_window() {
            if cancel.is_cancelled() {
                job.cancel();
                break;
            }
            engine_debug!("refresh window {:?}", window);
            let webbook = self.webbook.clone();
            let keyword = request.name.trim().to_string();
            let outputs = run_window(
                sources[window.clone()].to_vec(),
                concurrency,
                &cancel,
                move |source| {
                    let webbook = webbook.clone();
                    let keyword = keyword.clone();
                    async move { search_tolerant(&webbook, &source, &keyword, 1).await }
                },
            )
            .await;
            let Some(outputs) = outputs else {
                job.cancel();
                break;
            };

            let event = job.complete_window(window, outputs.into_iter().flatten());
            if !sink.emit(event) {
                cancel.cancel();
                job.cancel();
            }
        }

        if !job.collected().is_empty() {
            let merged = merge_known_sources(&known, job.collected());
            if let Err(err) = write_json(self.store.as_ref(), &key, &merged) {
                engine_warn!("could not store known sources under {}: {}", key, err);
            }
        }
        if let Some(end) = job.finish() {
            sink.emit(end);
        }
        job.phase()
    }

    /// Caches every chapter of a book, skipping chapters already stored.
    /// The first failing chapter stops the job.
    pub async fn run_cache(
        &self,
        source: &Source,
        request: &CacheRequest,
        sink: &dyn EventSink<Chapter>,
        cancel: CancellationToken,
    ) -> JobPhase {
        let book = &request.book;
        if book.book_url.trim().is_empty() {
            return reject(JobError::MissingBookUrl, sink);
        }

        let chapters = tokio::select! {
            _ = cancel.cancelled() => return JobPhase::Cancelled,
            chapters = self.load_chapters(source, book, request.refresh) => chapters,
        };
        let chapters = match chapters {
            Ok(chapters) => chapters,
            Err(message) => {
                engine_error!("chapter list for {} failed: {}", book.book_url, message);
                sink.emit(StreamEvent::Error(
                    ErrorPayload::new(message).with_code("CHAPTER_LIST_FAILED"),
                ));
                return JobPhase::Failed;
            }
        };

        let cached = match cached_chapter_indices(self.store.as_ref(), &book.book_url, &chapters) {
            Ok(cached) => cached,
            Err(err) => {
                engine_warn!("cannot inspect chapter cache: {}", err);
                Vec::new()
            }
        };
        let concurrency = self.concurrency(request.concurrency);
        let mut job = match CacheJob::start(chapters, cached, request.refresh, concurrency) {
            Ok(job) => job,
            Err(err) => return reject(err, sink),
        };

        let failed = Arc::new(AtomicBool::new(false));
        while let Some((window, batch)) = job.next_window() {
            if cancel.is_cancelled() {
                job.cancel();
                break;
            }
            engine_debug!("cache window {:?} ({} chapters)", window, batch.len());
            let webbook = self.webbook.clone();
            let store = Arc::clone(&self.store);
            let source = source.clone();
            let book_url = book.book_url.clone();
            let window_failed = Arc::clone(&failed);
            let outcomes = run_window(batch, concurrency, &cancel, move |chapter| {
                let webbook = webbook.clone();
                let store = Arc::clone(&store);
                let source = source.clone();
                let book_url = book_url.clone();
                let failed = Arc::clone(&window_failed);
                async move {
                    cache_chapter(&webbook, store.as_ref(), &source, &book_url, chapter, &failed)
                        .await
                }
            })
            .await;
            let Some(outcomes) = outcomes else {
                job.cancel();
                break;
            };

            for event in job.complete_window(window, outcomes) {
                if !sink.emit(event) {
                    cancel.cancel();
                    job.cancel();
                    break;
                }
            }
        }

        if let Some(end) = job.finish() {
            engine_info!("cache of {} done: {:?}", book.book_url, job.summary());
            sink.emit(end);
        }
        job.phase()
    }

    async fn load_chapters(
        &self,
        source: &Source,
        book: &BookInfo,
        refresh: bool,
    ) -> Result<Vec<Chapter>, String> {
        let key = chapter_list_key(&book.book_url);
        if !refresh {
            match read_json::<Vec<Chapter>>(self.store.as_ref(), &key) {
                Ok(Some(chapters)) if !chapters.is_empty() => return Ok(chapters),
                Ok(_) => {}
                Err(err) => engine_warn!("stored chapter list unreadable: {}", err),
            }
        }

        let chapters = self
            .webbook
            .chapter_list(source, book)
            .await
            .map_err(|err| err.to_string())?;
        if !chapters.is_empty() {
            if let Err(err) = write_json(self.store.as_ref(), &key, &chapters) {
                engine_warn!("could not store chapter list: {}", err);
            }
        }
        Ok(chapters)
    }

    pub fn spawn_search(&self, sources: Vec<Source>, request: SearchRequest) -> JobHandle<SearchResult> {
        let this = self.clone();
        spawn_job(move |sink: ChannelEventSink<SearchResult>, cancel| async move {
            this.run_search(&sources, &request, &sink, cancel).await
        })
    }

    pub fn spawn_refresh(
        &self,
        sources: Vec<Source>,
        request: RefreshRequest,
    ) -> JobHandle<SearchResult> {
        let this = self.clone();
        spawn_job(move |sink: ChannelEventSink<SearchResult>, cancel| async move {
            this.run_refresh(&sources, &request, &sink, cancel).await
        })
    }

    pub fn spawn_cache(&self, source: Source, request: CacheRequest) -> JobHandle<Chapter> {
        let this = self.clone();
        spawn_job(move |sink: ChannelEventSink<Chapter>, cancel| async move {
            this.run_cache(&source, &request, &sink, cancel).await
        })
    }
}

fn spawn_job<T, F, Fut>(job: F) -> JobHandle<T>
where
    T: Send + 'static,
    F: FnOnce(ChannelEventSink<T>, CancellationToken) -> Fut,
    Fut: Future<Output = JobPhase> + Send + 'static,
{
    let (tx, events) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(job(ChannelEventSink::new(tx), cancel.clone()));
    JobHandle {
        events,
        cancel,
        task,
    }
}

fn reject<T>(err: JobError, sink: &dyn EventSink<T>) -> JobPhase {
    engine_warn!("job rejected: {}", err);
    sink.emit(err.to_event());
    JobPhase::Failed
}

async fn search_tolerant(
    webbook: &WebBook,
    source: &Source,
    keyword: &str,
    page: u32,
) -> Vec<SearchResult> {
    match webbook.search(source, keyword, page).await {
        Ok(results) => results,
        Err(err) => {
            engine_warn!("search on {} failed: {}", source.book_source_name, err);
            Vec::new()
        }
    }
}

async fn cache_chapter(
    webbook: &WebBook,
    store: &dyn BlobStore,
    source: &Source,
    book_url: &str,
    chapter: Chapter,
    failed: &AtomicBool,
) -> ChapterOutcome {
    if failed.load(Ordering::SeqCst) {
        return ChapterOutcome::Skipped(chapter);
    }
    let result = match webbook.chapter_content(source, &chapter).await {
        Ok(text) => store
            .write(&chapter_content_key(book_url, chapter.index), text.as_bytes())
            .map_err(|err| FetchError::new(FailureKind::Storage, err.to_string())),
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => ChapterOutcome::Cached(chapter),
        Err(err) => {
            let reason = err.to_string();
            failed.store(true, Ordering::SeqCst);
            engine_error!("chapter {} ({}) failed: {}", chapter.index, chapter.url, reason);
            ChapterOutcome::Failed { chapter, reason }
        }
    }
}

/// Runs one task per item with at most `concurrency` in flight. Outputs come
/// back in item order. `None` when the job was cancelled; the window's
/// remaining tasks are aborted.
async fn run_window<I, O, F, Fut>(
    items: Vec<I>,
    concurrency: usize,
    cancel: &CancellationToken,
    task: F,
) -> Option<Vec<O>>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();
    for (slot, item) in items.into_iter().enumerate() {
        let permits = Arc::clone(&permits);
        let cancel = cancel.clone();
        let work = task(item);
        set.spawn(async move {
            let _permit = permits.acquire_owned().await.ok()?;
            if cancel.is_cancelled() {
                return None;
            }
            Some((slot, work.await))
        });
    }

    let mut outputs = Vec::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                set.abort_all();
                return None;
            }
            joined = set.join_next() => match joined {
                None => break,
                Some(Ok(Some(output))) => outputs.push(output),
                Some(Ok(None)) => {}
                Some(Err(err)) => engine_warn!("window task did not finish: {}", err),
            },
        }
    }
    outputs.sort_by_key(|(slot, _)| *slot);
    Some(outputs.into_iter().map(|(_, output)| output).collect())
}
