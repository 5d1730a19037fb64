mod common;

use common::*;
use metabase::{
    models::{ObjectKey, ObjectStatus},
    services::{
        Metabase,
        iterate::{
            IterateCursor, IterateObjectsWithStatus, IteratePendingObjectsByKey, ObjectEntry,
        },
        loop_iter::{IterateLoopOptions, LoopSegmentEntry},
        observer::{
            SegmentLoopOptions, SegmentObserver, SegmentTally, StatsRegistry, run_segment_loop,
        },
    },
};
use uuid::Uuid;

async fn collect(metabase: &Metabase, opts: IterateObjectsWithStatus) -> Vec<ObjectEntry> {
    let mut iterator = metabase
        .iterate_objects_all_versions_with_status(opts)
        .expect("valid listing");
    let mut entries = Vec::new();
    while let Some(entry) = iterator.next().await.expect("next entry") {
        entries.push(entry);
    }
    entries
}

fn keys(entries: &[ObjectEntry]) -> Vec<String> {
    entries.iter().map(|e| e.object_key.to_string()).collect()
}

async fn populate(metabase: &Metabase, project_id: Uuid) {
    for key in ["a", "b/1", "b/2", "b/c/3", "c", "d/4"] {
        create_object(metabase, project_id, key, 1).await;
    }
}

#[tokio::test]
async fn recursive_listing_returns_every_key_in_order() {
    let metabase = setup().await;
    let project_id = Uuid::new_v4();
    populate(&metabase, project_id).await;

    let mut opts = IterateObjectsWithStatus::new(project_id, BUCKET, ObjectStatus::Committed);
    opts.batch_size = 2;
    let entries = collect(&metabase, opts).await;
    assert_eq!(keys(&entries), vec!["a", "b/1", "b/2", "b/c/3", "c", "d/4"]);
    assert!(entries.iter().all(|e| !e.is_prefix && e.segment_count == 1));
}

#[tokio::test]
async fn non_recursive_listing_collapses_prefixes() {
    let metabase = setup().await;
    let project_id = Uuid::new_v4();
    populate(&metabase, project_id).await;

    let mut opts = IterateObjectsWithStatus::new(project_id, BUCKET, ObjectStatus::Committed);
    opts.recursive = false;
    opts.batch_size = 2;
    let entries = collect(&metabase, opts).await;
    assert_eq!(keys(&entries), vec!["a", "b/", "c", "d/"]);
    let prefixes: Vec<bool> = entries.iter().map(|e| e.is_prefix).collect();
    assert_eq!(prefixes, vec![false, true, false, true]);
}

#[tokio::test]
async fn prefixed_listing_returns_relative_keys() {
    let metabase = setup().await;
    let project_id = Uuid::new_v4();
    populate(&metabase, project_id).await;

    let mut opts = IterateObjectsWithStatus::new(project_id, BUCKET, ObjectStatus::Committed);
    opts.prefix = ObjectKey::from("b/");
    opts.recursive = false;
    let entries = collect(&metabase, opts).await;
    assert_eq!(keys(&entries), vec!["1", "2", "c/"]);
}

#[tokio::test]
async fn listing_cursor_is_exclusive() {
    let metabase = setup().await;
    let project_id = Uuid::new_v4();
    populate(&metabase, project_id).await;

    let mut opts = IterateObjectsWithStatus::new(project_id, BUCKET, ObjectStatus::Committed);
    opts.cursor = IterateCursor {
        key: ObjectKey::from("b/2"),
        version: 1,
    };
    let entries = collect(&metabase, opts).await;
    assert_eq!(keys(&entries), vec!["b/c/3", "c", "d/4"]);
}

#[tokio::test]
async fn non_recursive_resume_skips_returned_prefix() {
    let metabase = setup().await;
    let project_id = Uuid::new_v4();
    populate(&metabase, project_id).await;

    let listing = |prefix: &str, cursor: &str, version: i64| {
        let mut opts = IterateObjectsWithStatus::new(project_id, BUCKET, ObjectStatus::Committed);
        opts.recursive = false;
        opts.prefix = ObjectKey::from(prefix);
        opts.cursor = IterateCursor {
            key: ObjectKey::from(cursor),
            version,
        };
        opts
    };

    let entries = collect(&metabase, listing("", "b/", i64::MAX)).await;
    assert_eq!(keys(&entries), vec!["c", "d/"]);

    // a cursor inside the prefix resumes after it as well
    let entries = collect(&metabase, listing("", "b/1", 1)).await;
    assert_eq!(keys(&entries), vec!["c", "d/"]);

    let entries = collect(&metabase, listing("b/", "b/1", 1)).await;
    assert_eq!(keys(&entries), vec!["2", "c/"]);

    let entries = collect(&metabase, listing("b/", "b/c/", i64::MAX)).await;
    assert!(entries.is_empty());
}

#[tokio::test]
async fn listing_can_skip_metadata() {
    let metabase = setup().await;
    let project_id = Uuid::new_v4();
    create_object(&metabase, project_id, "k", 2).await;

    let mut opts = IterateObjectsWithStatus::new(project_id, BUCKET, ObjectStatus::Committed);
    opts.include_system_metadata = false;
    opts.include_custom_metadata = false;
    let entries = collect(&metabase, opts).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].created_at, None);
    assert_eq!(entries[0].segment_count, 0);
    assert_eq!(entries[0].version, 1);
}

#[tokio::test]
async fn pending_objects_by_key() {
    let metabase = setup().await;
    let project_id = Uuid::new_v4();
    for version in 1..=3 {
        begin_exact(&metabase, &object_stream(project_id, "upload", version)).await;
    }
    create_object(&metabase, project_id, "other", 0).await;

    let mut iterator = metabase
        .iterate_pending_objects_by_key(IteratePendingObjectsByKey {
            location: location(project_id, "upload"),
            batch_size: 2,
            ..Default::default()
        })
        .unwrap();
    let mut stream_ids = Vec::new();
    while let Some(entry) = iterator.next().await.unwrap() {
        assert_eq!(entry.status, ObjectStatus::Pending);
        stream_ids.push(entry.stream_id);
    }
    assert_eq!(stream_ids.len(), 3);
    assert!(stream_ids.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn loop_sees_a_consistent_snapshot() {
    let metabase = setup().await;
    let project_id = Uuid::new_v4();
    create_object(&metabase, project_id, "x", 2).await;
    create_object(&metabase, project_id, "y", 1).await;

    let mut objects = metabase
        .iterate_loop_objects(IterateLoopOptions {
            batch_size: 1,
            as_of_system_time: None,
        })
        .await
        .unwrap();
    let mut seen = Vec::new();
    loop {
        let batch = objects.next_batch().await.unwrap();
        if batch.is_empty() {
            break;
        }
        seen.extend(batch);
    }
    objects.finish().await.unwrap();
    assert_eq!(seen.len(), 2);

    let before = chrono::Utc::now() - chrono::Duration::hours(1);
    let mut segments = metabase
        .iterate_loop_segments(IterateLoopOptions {
            batch_size: 10,
            as_of_system_time: Some(before),
        })
        .await
        .unwrap();
    assert!(segments.next_batch().await.unwrap().is_empty());
    segments.finish().await.unwrap();
}

#[tokio::test]
async fn segment_loop_feeds_observers_and_records_stats() {
    let metabase = setup().await;
    let project_id = Uuid::new_v4();
    let original = create_object(&metabase, project_id, "x", 3).await;
    copy_object(&metabase, &original, "x-copy").await;

    let stream = object_stream(project_id, "inline", 1);
    begin_exact(&metabase, &stream).await;
    metabase
        .commit_inline_segment(inline_segment(&stream, Default::default(), b"tiny"))
        .await
        .unwrap();
    commit(&metabase, &stream).await;

    let stats = StatsRegistry::new();
    let mut observers: Vec<Box<dyn SegmentObserver>> = vec![Box::new(SegmentTally::default())];
    let summary = run_segment_loop(
        &metabase,
        SegmentLoopOptions {
            iterate: IterateLoopOptions {
                batch_size: 2,
                as_of_system_time: None,
            },
            batch_pause: None,
        },
        &mut observers,
        &stats,
    )
    .await
    .unwrap();
    assert_eq!(summary.segments, 7);
    assert_eq!(summary.batches, 4);

    let tally = stats.get("segment_tally").expect("tally recorded");
    assert_eq!(tally.runs, 1);
    assert_eq!(tally.errors, 0);
    assert_eq!(tally.report["remote_segments"], 6);
    assert_eq!(tally.report["inline_segments"], 1);
    assert_eq!(tally.report["inline_bytes"], 4);
}

struct Failing;

impl SegmentObserver for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn process(&mut self, _: &[LoopSegmentEntry]) -> anyhow::Result<()> {
        anyhow::bail!("observer broke")
    }
}

#[tokio::test]
async fn failing_observer_does_not_stop_the_loop() {
    let metabase = setup().await;
    create_object(&metabase, Uuid::new_v4(), "x", 2).await;

    let stats = StatsRegistry::new();
    let mut observers: Vec<Box<dyn SegmentObserver>> =
        vec![Box::new(Failing), Box::new(SegmentTally::default())];
    run_segment_loop(
        &metabase,
        SegmentLoopOptions {
            iterate: IterateLoopOptions {
                batch_size: 1,
                as_of_system_time: None,
            },
            batch_pause: Some(std::time::Duration::from_millis(1)),
        },
        &mut observers,
        &stats,
    )
    .await
    .unwrap();

    assert_eq!(stats.get("failing").unwrap().errors, 2);
    assert_eq!(stats.get("segment_tally").unwrap().report["remote_segments"], 2);
}
