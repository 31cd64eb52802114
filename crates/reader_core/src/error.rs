use thiserror::Error;

use crate::event::{ErrorPayload, StreamEvent};

/// Reasons a batch job refuses to start or stops early.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("no sources available")]
    NoSources,
    #[error("search keyword is empty")]
    EmptyKeyword,
    #[error("no more sources")]
    NoMoreSources { last_index: i64 },
    #[error("book url is empty")]
    MissingBookUrl,
    #[error("book name is empty")]
    MissingBookName,
    #[error("unknown source: {0}")]
    UnknownSource(String),
    #[error("chapter list is empty")]
    EmptyChapterList,
}

impl JobError {
    /// Stable machine-readable code carried in the error payload.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::NoSources => "NO_SOURCES",
            JobError::EmptyKeyword => "EMPTY_KEYWORD",
            JobError::NoMoreSources { .. } => "NO_MORE_SOURCES",
            JobError::MissingBookUrl => "MISSING_BOOK_URL",
            JobError::MissingBookName => "MISSING_BOOK_NAME",
            JobError::UnknownSource(_) => "UNKNOWN_SOURCE",
            JobError::EmptyChapterList => "EMPTY_CHAPTER_LIST",
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        let payload = ErrorPayload::new(self.to_string()).with_code(self.code());
        match self {
            JobError::NoMoreSources { last_index } => {
                payload.with_data(serde_json::json!({ "lastIndex": last_index }))
            }
            _ => payload,
        }
    }

    pub fn to_event<T>(&self) -> StreamEvent<T> {
        StreamEvent::Error(self.to_payload())
    }
}
