//! Key/value blob storage and the keys this engine stores under.
//!
//! Keys are `/`-separated relative paths. The file-backed store maps them
//! below a root directory and rejects anything that could escape it.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;

use engine_logging::engine_debug;
use reader_core::{Chapter, Source};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage directory missing or not writable: {0}")]
    StorageDir(String),
    #[error("invalid storage key {0:?}")]
    InvalidKey(String),
    #[error("value stored under {key} is malformed: {message}")]
    Malformed { key: String, message: String },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Creates `dir` when missing. An existing non-directory is an error.
pub fn ensure_storage_dir(dir: &Path) -> Result<(), StoreError> {
    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(StoreError::StorageDir(format!(
            "{} is not a directory",
            dir.display()
        ))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(dir).map_err(|e| StoreError::StorageDir(e.to_string()))
        }
        Err(err) => Err(StoreError::StorageDir(err.to_string())),
    }
}

/// Writes `value` next to `target` and renames it into place, so readers see
/// either the old blob or the new one.
fn replace_file(target: &Path, value: &[u8]) -> Result<(), StoreError> {
    let dir = target
        .parent()
        .ok_or_else(|| StoreError::StorageDir(format!("{} has no parent", target.display())))?;
    ensure_storage_dir(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(value)?;
    tmp.flush()?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(target).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

/// Blob key of the source catalog.
pub const SOURCES_KEY: &str = "bookSource.json";

pub trait BlobStore: Send + Sync {
    /// The stored bytes, or `None` when nothing is stored under `key`.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.read(key)?.is_some())
    }
}

#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn segments(key: &str) -> Result<Vec<&str>, StoreError> {
        let segments: Vec<&str> = key.split('/').collect();
        let valid = !segments.is_empty()
            && segments.iter().all(|segment| {
                !segment.is_empty()
                    && *segment != "."
                    && *segment != ".."
                    && !segment.contains(['\\', ':', '\0'])
            });
        if valid {
            Ok(segments)
        } else {
            Err(StoreError::InvalidKey(key.to_string()))
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        Ok(Self::segments(key)?
            .into_iter()
            .fold(self.root.clone(), |path, segment| path.join(segment)))
    }
}

impl BlobStore for FileBlobStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        replace_file(&path, value)?;
        engine_debug!("stored {} bytes at {}", value.len(), path.display());
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.path_for(key)?.is_file())
    }
}

pub fn read_json<T: DeserializeOwned>(
    store: &dyn BlobStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let Some(bytes) = store.read(key)? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| StoreError::Malformed {
            key: key.to_string(),
            message: err.to_string(),
        })
}

pub fn write_json<T: Serialize + ?Sized>(
    store: &dyn BlobStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|err| StoreError::Malformed {
        key: key.to_string(),
        message: err.to_string(),
    })?;
    store.write(key, &bytes)
}

/// 16 hex chars of the SHA-256 of `input`.
pub fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|byte| format!("{byte:02x}")).collect()
}

pub fn chapter_list_key(book_url: &str) -> String {
    format!("shelf/{}/chapters.json", short_hash(book_url))
}

pub fn chapter_content_key(book_url: &str, index: usize) -> String {
    format!("shelf/{}/content_{index}.txt", short_hash(book_url))
}

/// Key of the known-source list kept for one book.
pub fn known_sources_key(name: &str, author: &str) -> String {
    format!("books/{}/bookSource.json", short_hash(&format!("{name}_{author}")))
}

/// Indices of `chapters` whose content is already stored.
pub fn cached_chapter_indices(
    store: &dyn BlobStore,
    book_url: &str,
    chapters: &[Chapter],
) -> Result<Vec<usize>, StoreError> {
    let mut cached = Vec::new();
    for chapter in chapters {
        if store.exists(&chapter_content_key(book_url, chapter.index))? {
            cached.push(chapter.index);
        }
    }
    Ok(cached)
}

/// The configured sources, in stored order.
#[derive(Debug, Clone, Default)]
pub struct SourceCatalog {
    sources: Vec<Source>,
}

impl SourceCatalog {
    pub fn new(sources: Vec<Source>) -> Self {
        Self { sources }
    }

    /// Loads the catalog from [`SOURCES_KEY`]; a missing blob is an empty
    /// catalog.
    pub fn load(store: &dyn BlobStore) -> Result<Self, StoreError> {
        let sources: Vec<Source> = read_json(store, SOURCES_KEY)?.unwrap_or_default();
        Ok(Self::new(sources))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes)
            .map(Self::new)
            .map_err(|err| StoreError::Malformed {
                key: SOURCES_KEY.to_string(),
                message: err.to_string(),
            })
    }

    pub fn save(&self, store: &dyn BlobStore) -> Result<(), StoreError> {
        write_json(store, SOURCES_KEY, &self.sources)
    }

    pub fn all(&self) -> &[Source] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn by_url(&self, url: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.book_source_url == url)
    }

    /// Enabled sources, restricted to `group` when one is given.
    pub fn enabled_in_group(&self, group: Option<&str>) -> Vec<Source> {
        let group = group.map(str::trim).filter(|g| !g.is_empty());
        self.sources
            .iter()
            .filter(|source| source.enabled)
            .filter(|source| group.is_none_or(|g| source.in_group(g)))
            .cloned()
            .collect()
    }
}
