//! Reader engine: HTTP fetching, rule extraction, source operations and the
//! concurrent job coordinator.
mod config;
mod coordinator;
mod decode;
mod extract;
mod fetch;
mod jsonpath;
mod store;
mod types;
mod webbook;

pub use config::EngineConfig;
pub use coordinator::{
    CacheRequest, ChannelEventSink, Coordinator, CoordinatorSettings, EventSink, JobHandle,
    RefreshRequest, SearchRequest,
};
pub use decode::{decode_body, detect_encoding};
pub use extract::{html_to_text, normalize_whitespace, Page, ParsedRule, RuleKind, Scope, Target};
pub use fetch::{FetchSettings, Fetcher, ReqwestFetcher, DEFAULT_USER_AGENT};
pub use jsonpath::select as select_json;
pub use store::{
    cached_chapter_indices, chapter_content_key, chapter_list_key, ensure_storage_dir,
    known_sources_key, read_json, short_hash, write_json, BlobStore, FileBlobStore, SourceCatalog,
    StoreError, SOURCES_KEY,
};
pub use types::{FailureKind, FetchError, FetchMetadata, FetchOutput};
pub use webbook::{WebBook, DEFAULT_MAX_PAGES};
