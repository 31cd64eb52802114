//! Reader core: data model, rule model, URL templates and the pure batch job
//! state machines driven by the engine.
mod error;
mod event;
mod job;
mod model;
mod rules;
mod template;

pub use error::JobError;
pub use event::{BatchPayload, CacheSummary, EndPayload, ErrorPayload, StreamEvent};
pub use job::{
    merge_known_sources, BatchCursor, CacheJob, ChapterOutcome, JobPhase, RefreshJob,
    RefreshParams, SearchJob,
};
pub use model::{BookInfo, Chapter, DedupKey, SearchResult, Source};
pub use rules::{
    field, BookInfoRule, BookListRule, ContentRule, ExploreRule, RuleSlot, SearchRule, TocRule,
};
pub use template::{
    absolutize, has_scheme, resolve_template, strip_wrappers, HttpMethod, ResolvedRequest,
    Variables,
};
