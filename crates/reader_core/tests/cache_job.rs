use pretty_assertions::assert_eq;
use reader_core::{
    CacheJob, CacheSummary, Chapter, ChapterOutcome, EndPayload, JobError, JobPhase, StreamEvent,
};

fn chapters(count: usize) -> Vec<Chapter> {
    (0..count)
        .map(|index| Chapter {
            url: format!("https://a.test/c/{index}"),
            title: format!("Chapter {index}"),
            index,
            book_url: "https://a.test/b".to_string(),
        })
        .collect()
}

#[test]
fn empty_chapter_list_is_rejected() {
    assert_eq!(
        CacheJob::start(Vec::new(), [], false, 4).unwrap_err(),
        JobError::EmptyChapterList
    );
}

#[test]
fn cached_chapters_are_skipped() {
    let mut job = CacheJob::start(chapters(5), [0, 2, 99], false, 10).expect("job");
    let (range, pending) = job.next_window().expect("window");
    assert_eq!(
        pending.iter().map(|c| c.index).collect::<Vec<_>>(),
        vec![1, 3, 4]
    );

    let outcomes: Vec<_> = pending.into_iter().map(ChapterOutcome::Cached).collect();
    let events = job.complete_window(range, outcomes);
    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Message(batch) => {
            assert_eq!(batch.last_index, 4);
            assert_eq!(batch.cached_count, Some(5));
            assert_eq!(batch.data.len(), 3);
        }
        other => panic!("expected message, got {other:?}"),
    }

    assert!(job.next_window().is_none());
    assert_eq!(
        job.finish(),
        Some(StreamEvent::End(EndPayload::Cache(CacheSummary {
            cached_count: 5,
            success_count: 3,
            failed_count: 0,
        })))
    );
}

#[test]
fn fully_cached_book_ends_immediately() {
    let mut job = CacheJob::start(chapters(3), [0, 1, 2], false, 2).expect("job");
    assert!(job.next_window().is_none());
    assert_eq!(
        job.finish(),
        Some(StreamEvent::End(EndPayload::Cache(CacheSummary {
            cached_count: 3,
            success_count: 0,
            failed_count: 0,
        })))
    );
}

#[test]
fn refresh_recaches_everything() {
    let job = CacheJob::start(chapters(3), [0, 1, 2], true, 5).expect("job");
    let (_, pending) = job.next_window().expect("window");
    assert_eq!(pending.len(), 3);
    assert_eq!(job.summary().cached_count, 0);
}

#[test]
fn failure_stops_the_job() {
    let mut job = CacheJob::start(chapters(5), [], false, 5).expect("job");
    let (range, pending) = job.next_window().expect("window");

    let outcomes: Vec<_> = pending
        .into_iter()
        .map(|chapter| match chapter.index {
            3 => ChapterOutcome::Failed {
                chapter,
                reason: "HTTP 500".to_string(),
            },
            4 => ChapterOutcome::Skipped(chapter),
            _ => ChapterOutcome::Cached(chapter),
        })
        .collect();
    let events = job.complete_window(range, outcomes);

    assert_eq!(events.len(), 2);
    match &events[1] {
        StreamEvent::Error(payload) => {
            assert!(!payload.is_success);
            assert_eq!(payload.error_code.as_deref(), Some("CHAPTER_FAILED"));
            assert!(payload.error_msg.contains("HTTP 500"));
            assert_eq!(
                payload.data,
                Some(serde_json::json!({
                    "cachedCount": 3,
                    "successCount": 3,
                    "failedCount": 1
                }))
            );
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(job.phase(), JobPhase::Failed);
    assert!(job.next_window().is_none());
    assert_eq!(job.finish(), None);
}

#[test]
fn rerun_after_partial_cache_only_fetches_the_rest() {
    let mut first = CacheJob::start(chapters(4), [], false, 2).expect("job");
    let (range, pending) = first.next_window().expect("window");
    first.complete_window(range, pending.into_iter().map(ChapterOutcome::Cached));
    first.cancel();

    let second = CacheJob::start(chapters(4), [0, 1], false, 2).expect("job");
    let (_, pending) = second.next_window().expect("window");
    assert_eq!(
        pending.iter().map(|c| c.index).collect::<Vec<_>>(),
        vec![2, 3]
    );
}
