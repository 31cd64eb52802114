//! Batch job state machines.
//!
//! Jobs are pure: the coordinator asks for the next window, runs it, and
//! feeds the collected outcomes back. Each completed window yields the
//! events to stream. Merging happens here, single-threaded, so dedup and
//! counters need no locking.

use std::collections::{BTreeSet, HashSet};
use std::ops::Range;

use engine_logging::{engine_debug, engine_info};

use crate::error::JobError;
use crate::event::{BatchPayload, CacheSummary, EndPayload, ErrorPayload, StreamEvent};
use crate::model::{Chapter, DedupKey, SearchResult, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Position in an ordered candidate list walked in fixed-size windows.
///
/// The wire cursor `lastIndex` is the index of the last processed candidate,
/// `-1` when nothing has been processed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCursor {
    next: usize,
    total: usize,
    window: usize,
}

impl BatchCursor {
    pub fn resume(last_index: i64, total: usize, window: usize) -> Self {
        let next = usize::try_from(last_index.saturating_add(1)).unwrap_or(0);
        Self {
            next,
            total,
            window: window.max(1),
        }
    }

    pub fn last_index(&self) -> i64 {
        self.next as i64 - 1
    }

    pub fn is_exhausted(&self) -> bool {
        self.next >= self.total
    }

    /// The next window of candidate indices, or `None` when exhausted.
    pub fn peek(&self) -> Option<Range<usize>> {
        if self.is_exhausted() {
            return None;
        }
        Some(self.next..(self.next + self.window).min(self.total))
    }

    pub fn advance(&mut self, window: &Range<usize>) {
        self.next = self.next.max(window.end.min(self.total));
    }
}

/// Multi-source search with cross-source dedup by `(name, author)`.
#[derive(Debug, Clone)]
pub struct SearchJob {
    cursor: BatchCursor,
    seen: HashSet<DedupKey>,
    found: usize,
    size_limit: usize,
    phase: JobPhase,
}

impl SearchJob {
    pub fn start(
        keyword: &str,
        source_count: usize,
        last_index: i64,
        size_limit: usize,
        concurrency: usize,
    ) -> Result<Self, JobError> {
        if source_count == 0 {
            return Err(JobError::NoSources);
        }
        if keyword.trim().is_empty() {
            return Err(JobError::EmptyKeyword);
        }
        let cursor = BatchCursor::resume(last_index, source_count, concurrency);
        if cursor.is_exhausted() {
            return Err(JobError::NoMoreSources { last_index });
        }
        engine_info!(
            "search {:?}: {} sources from index {}",
            keyword,
            source_count,
            cursor.last_index() + 1
        );
        Ok(Self {
            cursor,
            seen: HashSet::new(),
            found: 0,
            size_limit: size_limit.max(1),
            phase: JobPhase::Running,
        })
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn last_index(&self) -> i64 {
        self.cursor.last_index()
    }

    /// Number of distinct books streamed so far.
    pub fn found(&self) -> usize {
        self.found
    }

    pub fn next_window(&self) -> Option<Range<usize>> {
        if self.phase != JobPhase::Running || self.found >= self.size_limit {
            return None;
        }
        self.cursor.peek()
    }

    /// Merges one window's results. Books whose key was already streamed are
    /// dropped.
    pub fn complete_window(
        &mut self,
        window: Range<usize>,
        results: impl IntoIterator<Item = SearchResult>,
    ) -> StreamEvent<SearchResult> {
        self.cursor.advance(&window);
        let mut fresh = Vec::new();
        for result in results {
            if result.name.trim().is_empty() {
                continue;
            }
            if self.seen.insert(result.dedup_key()) {
                fresh.push(result);
            } else {
                engine_debug!("dropping duplicate {:?} by {:?}", result.name, result.author);
            }
        }
        self.found += fresh.len();
        StreamEvent::Message(BatchPayload {
            last_index: self.cursor.last_index(),
            data: fresh,
            cached_count: None,
        })
    }

    pub fn cancel(&mut self) {
        if self.phase == JobPhase::Running {
            self.phase = JobPhase::Cancelled;
        }
    }

    /// The terminal `end` event, or `None` once cancelled.
    pub fn finish(&mut self) -> Option<StreamEvent<SearchResult>> {
        if self.phase != JobPhase::Running {
            return None;
        }
        self.phase = JobPhase::Completed;
        Some(StreamEvent::End(EndPayload::Cursor {
            last_index: self.cursor.last_index(),
        }))
    }
}

/// Inputs of a source refresh for one book.
#[derive(Debug, Clone, Copy)]
pub struct RefreshParams<'a> {
    pub name: &'a str,
    pub author: &'a str,
    pub last_index: i64,
    /// Restart the scan instead of resuming after the stored sources.
    pub refresh: bool,
    pub size_limit: usize,
    pub concurrency: usize,
}

/// Finds other sources carrying exactly the same book.
#[derive(Debug, Clone)]
pub struct RefreshJob {
    cursor: BatchCursor,
    target: DedupKey,
    collected: Vec<SearchResult>,
    size_limit: usize,
    phase: JobPhase,
}

impl RefreshJob {
    pub fn start(
        params: RefreshParams<'_>,
        sources: &[Source],
        known: &[SearchResult],
    ) -> Result<Self, JobError> {
        let name = params.name.trim();
        if name.is_empty() {
            return Err(JobError::MissingBookName);
        }
        if sources.is_empty() {
            return Err(JobError::NoSources);
        }

        let mut last_index = params.last_index;
        if !params.refresh {
            let resume_after = known.last().and_then(|last| {
                sources
                    .iter()
                    .position(|s| s.book_source_url == last.origin)
            });
            if let Some(position) = resume_after {
                last_index = last_index.max(position as i64);
            }
        }

        let size_limit = params.size_limit.max(1);
        let window = (size_limit * 2).max(params.concurrency);
        let cursor = BatchCursor::resume(last_index, sources.len(), window);
        if cursor.is_exhausted() {
            return Err(JobError::NoMoreSources { last_index });
        }
        Ok(Self {
            cursor,
            target: DedupKey {
                name: name.to_string(),
                author: params.author.trim().to_string(),
            },
            collected: Vec::new(),
            size_limit,
            phase: JobPhase::Running,
        })
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn last_index(&self) -> i64 {
        self.cursor.last_index()
    }

    /// Every matching result streamed so far.
    pub fn collected(&self) -> &[SearchResult] {
        &self.collected
    }

    pub fn next_window(&self) -> Option<Range<usize>> {
        if self.phase != JobPhase::Running || self.collected.len() >= self.size_limit {
            return None;
        }
        self.cursor.peek()
    }

    /// Keeps only results whose name and author both match the book.
    pub fn complete_window(
        &mut self,
        window: Range<usize>,
        results: impl IntoIterator<Item = SearchResult>,
    ) -> StreamEvent<SearchResult> {
        self.cursor.advance(&window);
        let matching: Vec<SearchResult> = results
            .into_iter()
            .filter(|r| r.name.trim() == self.target.name && r.author.trim() == self.target.author)
            .collect();
        self.collected.extend(matching.iter().cloned());
        StreamEvent::Message(BatchPayload {
            last_index: self.cursor.last_index(),
            data: matching,
            cached_count: None,
        })
    }

    pub fn cancel(&mut self) {
        if self.phase == JobPhase::Running {
            self.phase = JobPhase::Cancelled;
        }
    }

    pub fn finish(&mut self) -> Option<StreamEvent<SearchResult>> {
        if self.phase != JobPhase::Running {
            return None;
        }
        self.phase = JobPhase::Completed;
        Some(StreamEvent::End(EndPayload::Cursor {
            last_index: self.cursor.last_index(),
        }))
    }
}

/// Merges refreshed sources into the stored list: an entry with the same
/// book URL (or, without one, the same origin) is replaced in place, new
/// entries are appended.
pub fn merge_known_sources(existing: &[SearchResult], found: &[SearchResult]) -> Vec<SearchResult> {
    let mut merged = existing.to_vec();
    for result in found {
        // Results without a book url are told apart by their source.
        let same = |known: &&mut SearchResult| {
            known.book_url == result.book_url
                && (!result.book_url.is_empty() || known.origin == result.origin)
        };
        match merged.iter_mut().find(same) {
            Some(slot) => *slot = result.clone(),
            None => merged.push(result.clone()),
        }
    }
    merged
}

/// What happened to one chapter of a cache window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterOutcome {
    Cached(Chapter),
    Failed { chapter: Chapter, reason: String },
    /// The task observed the failure flag or cancellation and never fetched.
    Skipped(Chapter),
}

/// Fail-fast caching of a book's chapters.
#[derive(Debug, Clone)]
pub struct CacheJob {
    chapters: Vec<Chapter>,
    /// Positions in `chapters` still to fetch, in chapter order.
    pending: Vec<usize>,
    cursor: BatchCursor,
    cached: BTreeSet<usize>,
    success: usize,
    failed: usize,
    phase: JobPhase,
}

impl CacheJob {
    /// `already_cached` holds chapter indices found in storage; they are
    /// skipped unless `refresh` is set.
    pub fn start(
        chapters: Vec<Chapter>,
        already_cached: impl IntoIterator<Item = usize>,
        refresh: bool,
        concurrency: usize,
    ) -> Result<Self, JobError> {
        if chapters.is_empty() {
            return Err(JobError::EmptyChapterList);
        }
        let cached: BTreeSet<usize> = if refresh {
            BTreeSet::new()
        } else {
            let known: HashSet<usize> = chapters.iter().map(|c| c.index).collect();
            already_cached
                .into_iter()
                .filter(|index| known.contains(index))
                .collect()
        };
        let pending: Vec<usize> = chapters
            .iter()
            .enumerate()
            .filter(|(_, chapter)| !cached.contains(&chapter.index))
            .map(|(position, _)| position)
            .collect();
        engine_info!(
            "caching {} of {} chapters",
            pending.len(),
            chapters.len()
        );
        let cursor = BatchCursor::resume(-1, pending.len(), concurrency);
        Ok(Self {
            chapters,
            pending,
            cursor,
            cached,
            success: 0,
            failed: 0,
            phase: JobPhase::Running,
        })
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn summary(&self) -> CacheSummary {
        CacheSummary {
            cached_count: self.cached.len(),
            success_count: self.success,
            failed_count: self.failed,
        }
    }

    /// Chapters of the next window, in chapter order.
    pub fn next_window(&self) -> Option<(Range<usize>, Vec<Chapter>)> {
        if self.phase != JobPhase::Running {
            return None;
        }
        let range = self.cursor.peek()?;
        let chapters = self.pending[range.clone()]
            .iter()
            .map(|&position| self.chapters[position].clone())
            .collect();
        Some((range, chapters))
    }

    /// Records a window's outcomes. Returns the batch event, followed by the
    /// terminal error event when any chapter failed.
    pub fn complete_window(
        &mut self,
        window: Range<usize>,
        outcomes: impl IntoIterator<Item = ChapterOutcome>,
    ) -> Vec<StreamEvent<Chapter>> {
        let last_index = window
            .end
            .checked_sub(1)
            .and_then(|last| self.pending.get(last))
            .map(|&position| self.chapters[position].index as i64)
            .unwrap_or(-1);
        self.cursor.advance(&window);

        let mut stored = Vec::new();
        let mut first_failure = None;
        for outcome in outcomes {
            match outcome {
                ChapterOutcome::Cached(chapter) => {
                    self.success += 1;
                    self.cached.insert(chapter.index);
                    stored.push(chapter);
                }
                ChapterOutcome::Failed { chapter, reason } => {
                    self.failed += 1;
                    first_failure.get_or_insert(format!(
                        "chapter {} ({}) failed: {}",
                        chapter.index, chapter.title, reason
                    ));
                }
                ChapterOutcome::Skipped(_) => {}
            }
        }
        stored.sort_by_key(|chapter| chapter.index);

        let mut events = vec![StreamEvent::Message(BatchPayload {
            last_index,
            data: stored,
            cached_count: Some(self.cached.len()),
        })];
        if let Some(message) = first_failure {
            self.phase = JobPhase::Failed;
            let summary = serde_json::to_value(self.summary()).unwrap_or_default();
            events.push(StreamEvent::Error(
                ErrorPayload::new(message)
                    .with_code("CHAPTER_FAILED")
                    .with_data(summary),
            ));
        }
        events
    }

    pub fn cancel(&mut self) {
        if self.phase == JobPhase::Running {
            self.phase = JobPhase::Cancelled;
        }
    }

    /// The terminal `end` event with the final counters. `None` after a
    /// failure or cancellation.
    pub fn finish(&mut self) -> Option<StreamEvent<Chapter>> {
        if self.phase != JobPhase::Running {
            return None;
        }
        self.phase = JobPhase::Completed;
        Some(StreamEvent::End(EndPayload::Cache(self.summary())))
    }
}
