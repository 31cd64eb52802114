//! Content fetch orchestrator: one fetch and extract cycle per source and
//! operation.
//!
//! Parsing happens in the synchronous `parse_*` helpers so that no parsed
//! document lives across an `.await`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use engine_logging::{engine_debug, engine_info};
use reader_core::{
    absolutize, field, resolve_template, BookInfo, BookInfoRule, BookListRule, Chapter,
    ContentRule, ResolvedRequest, SearchResult, Source, TocRule, Variables,
};

use crate::extract::{Page, Scope};
use crate::{FailureKind, FetchError, Fetcher};

pub const DEFAULT_MAX_PAGES: usize = 10;

/// Runs the four source operations (explore/search, book info, chapter
/// list, chapter content) against a shared fetcher.
#[derive(Clone)]
pub struct WebBook {
    fetcher: Arc<dyn Fetcher>,
    max_pages: usize,
}

/// A fetched page: the URL it was served from and the decoded body.
struct Fetched {
    url: String,
    body: String,
}

impl WebBook {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    /// Caps how many `nextTocUrl`/`nextContentUrl` pages are followed.
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    async fn fetch(&self, source: &Source, request: ResolvedRequest) -> Result<Fetched, FetchError> {
        let request = request.with_default_headers(&source.default_headers());
        let output = self.fetcher.fetch(&request).await?;
        Ok(Fetched {
            url: output.metadata.final_url.clone(),
            body: output.text(),
        })
    }

    pub async fn explore(
        &self,
        source: &Source,
        explore_url: &str,
        page: u32,
    ) -> Result<Vec<SearchResult>, FetchError> {
        if explore_url.trim().is_empty() {
            return Err(FetchError::missing_rule("exploreUrl", &source.book_source_url));
        }
        let rule = source
            .explore_rule()
            .ok_or_else(|| FetchError::missing_rule("explore", &source.book_source_url))?;

        let mut variables = Variables::new();
        variables.insert("page".to_string(), page.to_string());
        let request = resolve_template(explore_url, &variables, Some(&source.book_source_url));
        engine_info!("explore {}: {}", source.book_source_name, request.url);

        let started = Instant::now();
        let fetched = self.fetch(source, request).await?;
        let results = parse_book_list(source, &rule, &fetched, elapsed_ms(started));
        engine_info!(
            "explore {} found {} books",
            source.book_source_name,
            results.len()
        );
        Ok(results)
    }

    pub async fn search(
        &self,
        source: &Source,
        keyword: &str,
        page: u32,
    ) -> Result<Vec<SearchResult>, FetchError> {
        let template = field(&source.search_url)
            .ok_or_else(|| FetchError::missing_rule("searchUrl", &source.book_source_url))?;
        let rule = source
            .search_rule()
            .ok_or_else(|| FetchError::missing_rule("search", &source.book_source_url))?;

        let mut variables = Variables::new();
        variables.insert("key".to_string(), keyword.to_string());
        variables.insert("searchKey".to_string(), keyword.to_string());
        variables.insert("page".to_string(), page.to_string());
        let request = resolve_template(template, &variables, Some(&source.book_source_url));
        engine_info!("search {}: {}", source.book_source_name, request.url);

        let started = Instant::now();
        let fetched = self.fetch(source, request).await?;
        let results = parse_book_list(source, &rule, &fetched, elapsed_ms(started));
        engine_info!(
            "search {} found {} books",
            source.book_source_name,
            results.len()
        );
        Ok(results)
    }

    pub async fn book_info(&self, source: &Source, book_url: &str) -> Result<BookInfo, FetchError> {
        let url = absolutize(&source.book_source_url, book_url);
        if url.is_empty() {
            return Err(FetchError::new(FailureKind::InvalidUrl, "book url is empty"));
        }
        engine_info!("book info {}: {}", source.book_source_name, url);

        let fetched = self.fetch(source, ResolvedRequest::get(url.clone())).await?;
        let mut info = BookInfo {
            book_url: url,
            origin: source.book_source_url.clone(),
            origin_name: source.book_source_name.clone(),
            ..BookInfo::default()
        };
        if let Some(rule) = source.book_info_rule() {
            parse_book_info(&rule, &fetched, &source.book_source_url, &mut info);
        }
        Ok(info)
    }

    pub async fn chapter_list(
        &self,
        source: &Source,
        book: &BookInfo,
    ) -> Result<Vec<Chapter>, FetchError> {
        let rule = source
            .toc_rule()
            .ok_or_else(|| FetchError::missing_rule("toc", &source.book_source_url))?;
        let mut next = Some(absolutize(&source.book_source_url, book.effective_toc_url()))
            .filter(|url| !url.is_empty())
            .ok_or_else(|| FetchError::new(FailureKind::InvalidUrl, "toc url is empty"))?;

        let mut chapters: Vec<Chapter> = Vec::new();
        let mut seen_urls = HashSet::new();
        let mut visited = HashSet::new();
        for _ in 0..self.max_pages {
            visited.insert(next.clone());
            engine_debug!("toc page {}", next);
            let fetched = self.fetch(source, ResolvedRequest::get(next.clone())).await?;
            let (page_chapters, next_url) = parse_toc_page(&rule, &fetched, &source.book_source_url, &book.book_url);

            for mut chapter in page_chapters {
                if !chapter.url.is_empty() && !seen_urls.insert(chapter.url.clone()) {
                    continue;
                }
                chapter.index = chapters.len();
                chapters.push(chapter);
            }

            match next_url.filter(|url| !visited.contains(url)) {
                Some(url) => next = url,
                None => break,
            }
        }

        engine_info!("{} chapters for {}", chapters.len(), book.book_url);
        Ok(chapters)
    }

    /// Chapter text after `replaceRegex`, following `nextContentUrl` pages.
    /// Empty text is an [`FailureKind::EmptyContent`] failure.
    pub async fn chapter_content(
        &self,
        source: &Source,
        chapter: &Chapter,
    ) -> Result<String, FetchError> {
        let rule = source
            .content_rule()
            .filter(|rule| field(&rule.content).is_some())
            .ok_or_else(|| FetchError::missing_rule("content", &source.book_source_url))?;
        let mut next = absolutize(&source.book_source_url, &chapter.url);
        if next.is_empty() {
            return Err(FetchError::new(FailureKind::InvalidUrl, "chapter url is empty"));
        }

        let mut parts = Vec::new();
        let mut visited = HashSet::new();
        for _ in 0..self.max_pages {
            visited.insert(next.clone());
            let fetched = self.fetch(source, ResolvedRequest::get(next.clone())).await?;
            let (text, next_url) = parse_content_page(&rule, &fetched, &source.book_source_url);
            if !text.is_empty() {
                parts.push(text);
            }
            match next_url.filter(|url| !visited.contains(url)) {
                Some(url) => next = url,
                None => break,
            }
        }

        let content = rule.apply_replacements(&parts.join("\n"));
        let content = content.trim();
        if content.is_empty() {
            return Err(FetchError::new(
                FailureKind::EmptyContent,
                format!("no content for chapter {} ({})", chapter.index, chapter.title),
            ));
        }
        Ok(content.to_string())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn read(scope: &Scope<'_>, rule: &Option<String>) -> String {
    field(rule).map(|rule| scope.one(rule)).unwrap_or_default()
}

fn read_url(scope: &Scope<'_>, rule: &Option<String>, base: &str) -> String {
    let raw = read(scope, rule);
    if raw.is_empty() {
        raw
    } else {
        absolutize(base, &raw)
    }
}

fn parse_book_list(
    source: &Source,
    rule: &BookListRule,
    fetched: &Fetched,
    elapsed_time_ms: u64,
) -> Vec<SearchResult> {
    let Some(list_rule) = field(&rule.book_list) else {
        engine_debug!("source {} has no bookList rule", source.book_source_url);
        return Vec::new();
    };
    let page = Page::parse(&fetched.body);
    let base = source.book_source_url.as_str();

    page.items(list_rule)
        .iter()
        .filter_map(|item| {
            let name = read(item, &rule.name);
            if name.is_empty() {
                return None;
            }
            Some(SearchResult {
                book_url: read_url(item, &rule.book_url, base),
                origin: source.book_source_url.clone(),
                origin_name: source.book_source_name.clone(),
                name,
                author: read(item, &rule.author),
                kind: read(item, &rule.kind),
                intro: read(item, &rule.intro),
                cover_url: read_url(item, &rule.cover_url, base),
                word_count: read(item, &rule.word_count),
                latest_chapter_title: read(item, &rule.last_chapter),
                elapsed_time_ms,
            })
        })
        .collect()
}

fn parse_book_info(rule: &BookInfoRule, fetched: &Fetched, base: &str, info: &mut BookInfo) {
    let page = Page::parse(&fetched.body);
    let root = match field(&rule.init) {
        Some(init) => page.items(init).into_iter().next().unwrap_or(page.root()),
        None => page.root(),
    };

    let set = |target: &mut String, value: String| {
        if !value.is_empty() {
            *target = value;
        }
    };
    set(&mut info.name, read(&root, &rule.name));
    set(&mut info.author, read(&root, &rule.author));
    set(&mut info.intro, read(&root, &rule.intro));
    set(&mut info.kind, read(&root, &rule.kind));
    set(&mut info.word_count, read(&root, &rule.word_count));
    set(&mut info.latest_chapter_title, read(&root, &rule.last_chapter));
    set(&mut info.cover_url, read_url(&root, &rule.cover_url, base));
    set(&mut info.toc_url, read_url(&root, &rule.toc_url, base));
}

fn parse_toc_page(
    rule: &TocRule,
    fetched: &Fetched,
    base: &str,
    book_url: &str,
) -> (Vec<Chapter>, Option<String>) {
    let page = Page::parse(&fetched.body);
    let chapters = field(&rule.chapter_list)
        .map(|list_rule| {
            page.items(list_rule)
                .iter()
                .filter_map(|item| {
                    let title = read(item, &rule.chapter_name);
                    if title.is_empty() {
                        return None;
                    }
                    Some(Chapter {
                        url: read_url(item, &rule.chapter_url, base),
                        title,
                        index: 0,
                        book_url: book_url.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let next = Some(read_url(&page.root(), &rule.next_toc_url, base))
        .filter(|url| !url.is_empty() && *url != fetched.url);
    (chapters, next)
}

fn parse_content_page(rule: &ContentRule, fetched: &Fetched, base: &str) -> (String, Option<String>) {
    let page = Page::parse(&fetched.body);
    let root = page.root();
    let text = field(&rule.content)
        .map(|content_rule| root.block_text(content_rule))
        .unwrap_or_default();
    let next = Some(read_url(&root, &rule.next_content_url, base))
        .filter(|url| !url.is_empty() && *url != fetched.url);
    (text, next)
}
