use std::fs;

use pretty_assertions::assert_eq;
use reader_core::{Chapter, Source};
use reader_engine::{
    cached_chapter_indices, chapter_content_key, ensure_storage_dir, BlobStore, FileBlobStore,
    SourceCatalog, StoreError, SOURCES_KEY,
};
use tempfile::TempDir;

#[test]
fn creates_missing_storage_dir() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("storage");
    assert!(!dir.exists());
    ensure_storage_dir(&dir).unwrap();
    assert!(dir.is_dir());
}

#[test]
fn file_in_place_of_storage_dir_is_an_error() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("not_a_dir");
    fs::write(&file, "x").unwrap();
    assert!(matches!(
        ensure_storage_dir(&file),
        Err(StoreError::StorageDir(_))
    ));
}

#[test]
fn write_creates_parents_and_replaces() {
    let temp = TempDir::new().unwrap();
    let store = FileBlobStore::new(temp.path());

    assert_eq!(store.read("shelf/abc/content_0.txt").unwrap(), None);
    assert!(!store.exists("shelf/abc/content_0.txt").unwrap());

    store.write("shelf/abc/content_0.txt", b"first").unwrap();
    store.write("shelf/abc/content_0.txt", b"second").unwrap();

    assert!(store.exists("shelf/abc/content_0.txt").unwrap());
    assert_eq!(
        store.read("shelf/abc/content_0.txt").unwrap(),
        Some(b"second".to_vec())
    );
    // Only the blob itself is left behind, no temporary files.
    let entries = fs::read_dir(temp.path().join("shelf/abc")).unwrap().count();
    assert_eq!(entries, 1);
}

#[test]
fn escaping_keys_are_rejected() {
    let temp = TempDir::new().unwrap();
    let store = FileBlobStore::new(temp.path().join("root"));
    assert!(matches!(
        store.write("../outside.txt", b"x"),
        Err(StoreError::InvalidKey(_))
    ));
    assert!(!temp.path().join("outside.txt").exists());
}

#[test]
fn cached_indices_reflect_stored_contents() {
    let temp = TempDir::new().unwrap();
    let store = FileBlobStore::new(temp.path());
    let book_url = "https://a.test/book/1";
    let chapters: Vec<Chapter> = (0..4)
        .map(|index| Chapter {
            url: format!("https://a.test/c/{index}"),
            title: format!("Chapter {index}"),
            index,
            book_url: book_url.to_string(),
        })
        .collect();

    store.write(&chapter_content_key(book_url, 1), b"one").unwrap();
    store.write(&chapter_content_key(book_url, 3), b"three").unwrap();
    store
        .write(&chapter_content_key("https://a.test/book/2", 0), b"other book")
        .unwrap();

    assert_eq!(
        cached_chapter_indices(&store, book_url, &chapters).unwrap(),
        vec![1, 3]
    );
}

#[test]
fn catalog_round_trips_and_filters_by_group() {
    let temp = TempDir::new().unwrap();
    let store = FileBlobStore::new(temp.path());
    assert!(SourceCatalog::load(&store).unwrap().is_empty());

    let mut disabled = Source::new("https://c.test", "C");
    disabled.enabled = false;
    disabled.book_source_group = Some("fast".to_string());
    let mut grouped = Source::new("https://b.test", "B");
    grouped.book_source_group = Some("slow, fast".to_string());
    let catalog = SourceCatalog::new(vec![
        Source::new("https://a.test", "A"),
        grouped,
        disabled,
    ]);
    catalog.save(&store).unwrap();
    assert!(store.exists(SOURCES_KEY).unwrap());

    let loaded = SourceCatalog::load(&store).unwrap();
    assert_eq!(loaded.len(), 3);
    assert_eq!(
        loaded.by_url("https://b.test").map(|s| s.book_source_name.as_str()),
        Some("B")
    );

    let urls = |sources: Vec<Source>| -> Vec<String> {
        sources.into_iter().map(|s| s.book_source_url).collect()
    };
    assert_eq!(
        urls(loaded.enabled_in_group(None)),
        vec!["https://a.test", "https://b.test"]
    );
    assert_eq!(urls(loaded.enabled_in_group(Some("fast"))), vec!["https://b.test"]);
    assert_eq!(urls(loaded.enabled_in_group(Some(" "))).len(), 2);
}

#[test]
fn malformed_catalog_is_reported() {
    let temp = TempDir::new().unwrap();
    let store = FileBlobStore::new(temp.path());
    store.write(SOURCES_KEY, b"{not json").unwrap();
    assert!(matches!(
        SourceCatalog::load(&store),
        Err(StoreError::Malformed { .. })
    ));
}
