//! Subcommand handlers. Streaming jobs print their events in `event:`/`data:`
//! framing; single operations print pretty JSON or plain text.

use std::fs;
use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use serde::Serialize;

use engine_logging::{engine_info, engine_warn};
use reader_core::{BookInfo, Chapter, JobError, JobPhase, Source};
use reader_engine::{
    ensure_storage_dir, BlobStore, CacheRequest, Coordinator, EngineConfig, FileBlobStore,
    JobHandle, RefreshRequest, ReqwestFetcher, SearchRequest, SourceCatalog, WebBook,
};

use crate::cli::{BookArgs, CacheArgs, ContentArgs, ExploreArgs, RefreshArgs, SearchArgs};

/// Engine wiring shared by every subcommand.
pub struct App {
    coordinator: Coordinator,
    catalog: SourceCatalog,
    group: Option<String>,
}

impl App {
    pub fn new(
        config: &EngineConfig,
        sources_file: Option<&std::path::Path>,
        group: Option<String>,
    ) -> anyhow::Result<Self> {
        ensure_storage_dir(&config.storage_dir)
            .with_context(|| format!("storage dir {}", config.storage_dir.display()))?;
        let store: Arc<dyn BlobStore> = Arc::new(FileBlobStore::new(&config.storage_dir));

        let catalog = match sources_file {
            Some(path) => {
                let bytes =
                    fs::read(path).with_context(|| format!("read sources {}", path.display()))?;
                SourceCatalog::from_json(&bytes)?
            }
            None => SourceCatalog::load(store.as_ref())?,
        };
        engine_info!("{} sources in catalog", catalog.len());

        let fetcher = ReqwestFetcher::new(config.fetch_settings())?;
        let webbook = WebBook::new(Arc::new(fetcher)).with_max_pages(config.max_content_pages);
        let coordinator = Coordinator::new(webbook, store, config.coordinator_settings());
        Ok(Self {
            coordinator,
            catalog,
            group,
        })
    }

    fn sources(&self) -> Vec<Source> {
        self.catalog.enabled_in_group(self.group.as_deref())
    }

    fn source(&self, url: &str) -> anyhow::Result<Source> {
        self.catalog
            .by_url(url.trim())
            .cloned()
            .ok_or_else(|| JobError::UnknownSource(url.to_string()).into())
    }

    pub async fn search(&self, args: SearchArgs) -> anyhow::Result<()> {
        let request = SearchRequest {
            keyword: args.keyword,
            page: args.page,
            last_index: args.last_index,
            size: args.size,
            concurrency: args.concurrency,
        };
        let handle = self.coordinator.spawn_search(self.sources(), request);
        finish_stream("search", handle).await
    }

    pub async fn refresh(&self, args: RefreshArgs) -> anyhow::Result<()> {
        let request = RefreshRequest {
            name: args.name,
            author: args.author,
            last_index: args.last_index,
            refresh: args.refresh,
            size: args.size,
            concurrency: args.concurrency,
        };
        let handle = self.coordinator.spawn_refresh(self.sources(), request);
        finish_stream("refresh", handle).await
    }

    pub async fn explore(&self, args: ExploreArgs) -> anyhow::Result<()> {
        let source = self.source(&args.source)?;
        let url = args
            .url
            .or_else(|| source.explore_url.clone())
            .unwrap_or_default();
        let books = interruptible(self.coordinator.webbook().explore(&source, &url, args.page))
            .await?
            .context("explore")?;
        print_json(&books)
    }

    pub async fn info(&self, args: BookArgs) -> anyhow::Result<()> {
        let source = self.source(&args.source)?;
        let info = self.book_info(&source, &args.book_url).await?;
        print_json(&info)
    }

    pub async fn toc(&self, args: BookArgs) -> anyhow::Result<()> {
        let source = self.source(&args.source)?;
        let info = self.book_info(&source, &args.book_url).await?;
        let chapters = interruptible(self.coordinator.webbook().chapter_list(&source, &info))
            .await?
            .context("chapter list")?;
        print_json(&chapters)
    }

    pub async fn content(&self, args: ContentArgs) -> anyhow::Result<()> {
        let source = self.source(&args.source)?;
        let chapter = Chapter {
            url: args.url,
            title: args.title,
            ..Chapter::default()
        };
        let text = interruptible(self.coordinator.webbook().chapter_content(&source, &chapter))
            .await?
            .context("chapter content")?;
        println!("{text}");
        Ok(())
    }

    pub async fn cache(&self, args: CacheArgs) -> anyhow::Result<()> {
        let source = self.source(&args.source)?;
        let book = self.book_info(&source, &args.book_url).await?;
        let request = CacheRequest {
            book,
            refresh: args.refresh,
            concurrency: args.concurrency,
        };
        let handle = self.coordinator.spawn_cache(source, request);
        finish_stream("cache", handle).await
    }

    async fn book_info(&self, source: &Source, book_url: &str) -> anyhow::Result<BookInfo> {
        let info = interruptible(self.coordinator.webbook().book_info(source, book_url))
            .await?
            .context("book info")?;
        Ok(info)
    }
}

/// Prints every event of `handle` until the job ends. Ctrl-C cancels the
/// job; the stream then ends without an `end` event.
async fn finish_stream<T: Serialize>(label: &str, mut handle: JobHandle<T>) -> anyhow::Result<()> {
    let cancel = handle.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            engine_warn!("interrupted, cancelling job");
            cancel.cancel();
        }
    });

    while let Some(event) = handle.next_event().await {
        print!("{}", event.to_sse());
    }
    interrupt.abort();

    match handle.join().await {
        JobPhase::Completed => Ok(()),
        JobPhase::Cancelled => {
            engine_warn!("{} cancelled", label);
            Ok(())
        }
        phase => bail!("{label} ended {phase:?}"),
    }
}

/// Runs a single operation, giving up on Ctrl-C.
async fn interruptible<F: Future>(operation: F) -> anyhow::Result<F::Output> {
    tokio::select! {
        output = operation => Ok(output),
        _ = tokio::signal::ctrl_c() => bail!("interrupted"),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
