mod common;

use common::*;
use metabase::{
    MetabaseError,
    config::MetabaseConfig,
    models::{Object, ObjectKey, ObjectLocation, Segment, SegmentPosition, StreamId},
    services::{
        Metabase,
        begin::BeginObject,
        copy::{BeginCopyObject, FinishCopyObject},
        delete::{
            DeleteBucketObjects, DeleteExpiredObjects, DeleteObjectAnyStatusAllVersions,
            DeleteObjectExactVersion, DeleteObjectResult, DeleteObjectsAllVersions,
            DeletePendingObject, DeleteZombieObjects,
        },
        get::ListSegments,
    },
};
use uuid::Uuid;

async fn segments_of(metabase: &Metabase, stream_id: StreamId) -> Vec<Segment> {
    metabase
        .list_segments(ListSegments {
            stream_id,
            ..Default::default()
        })
        .await
        .expect("list segments")
        .segments
}

async fn copy_relation(metabase: &Metabase, stream_id: StreamId) -> Option<StreamId> {
    sqlx::query_scalar("SELECT ancestor_stream_id FROM segment_copies WHERE stream_id = ?")
        .bind(stream_id)
        .fetch_optional(&*metabase.db)
        .await
        .expect("query copy relation")
}

async fn has_local_pieces(metabase: &Metabase, stream_id: StreamId) -> bool {
    let stored: Vec<Option<Vec<u8>>> =
        sqlx::query_scalar("SELECT remote_alias_pieces FROM segments WHERE stream_id = ?")
            .bind(stream_id)
            .fetch_all(&*metabase.db)
            .await
            .expect("query pieces");
    stored.iter().all(|pieces| pieces.as_ref().is_some_and(|p| p.len() > 1))
}

async fn delete_exact(metabase: &Metabase, object: &Object) -> DeleteObjectResult {
    metabase
        .delete_object_exact_version(DeleteObjectExactVersion {
            location: object.stream.location(),
            version: object.stream.version,
        })
        .await
        .expect("delete object")
}

#[tokio::test]
async fn copy_reads_resolve_through_ancestor() {
    let metabase = setup().await;
    let original = create_object(&metabase, Uuid::new_v4(), "original", 2).await;
    let copy = copy_object(&metabase, &original, "copy").await;

    assert_eq!(copy.segment_count, 2);
    assert_eq!(copy.total_plain_size, original.total_plain_size);
    assert_eq!(copy.stream.version, 1);
    assert_eq!(
        copy_relation(&metabase, copy.stream.stream_id).await,
        Some(original.stream.stream_id)
    );
    assert!(!has_local_pieces(&metabase, copy.stream.stream_id).await);

    let from_original = segments_of(&metabase, original.stream.stream_id).await;
    let from_copy = segments_of(&metabase, copy.stream.stream_id).await;
    for (a, b) in from_original.iter().zip(&from_copy) {
        assert_eq!(a.root_piece_id, b.root_piece_id);
        assert_eq!(a.pieces, b.pieces);
        assert_ne!(a.encrypted_key, b.encrypted_key);
    }
}

#[tokio::test]
async fn copy_reads_skip_ancestor_without_server_side_copy() {
    let metabase = setup_with(MetabaseConfig {
        server_side_copy: false,
        ..Default::default()
    })
    .await;
    let original = create_object(&metabase, Uuid::new_v4(), "original", 2).await;
    let copy = copy_object(&metabase, &original, "copy").await;
    let position = SegmentPosition::new(0, 1);

    let from_original = metabase
        .get_segment_by_position(original.stream.stream_id, position)
        .await
        .unwrap();
    assert_eq!(from_original.pieces.len(), 3);

    // the copy row is returned as stored: keys and sizes, no pieces
    let from_copy = metabase
        .get_segment_by_position(copy.stream.stream_id, position)
        .await
        .unwrap();
    assert_eq!(from_copy.position, position);
    assert!(from_copy.pieces.is_empty());
    assert!(from_copy.root_piece_id.is_zero());
    assert_eq!(from_copy.encrypted_size, from_original.encrypted_size);
    assert_eq!(from_copy.encrypted_key, vec![8; 32]);
}

#[tokio::test]
async fn begin_copy_returns_keys_of_the_read_version() {
    let metabase = setup().await;
    let project_id = Uuid::new_v4();
    let first = create_object(&metabase, project_id, "versioned", 2).await;

    let second = first.stream.location().with_version(2, Uuid::new_v4());
    begin_exact(&metabase, &second).await;
    metabase
        .commit_inline_segment(inline_segment(&second, SegmentPosition::new(0, 0), b"v2"))
        .await
        .unwrap();
    commit(&metabase, &second).await;

    let latest = metabase
        .begin_copy_object(BeginCopyObject {
            location: first.stream.location(),
            version: None,
        })
        .await
        .unwrap();
    assert_eq!(latest.stream_id, second.stream_id);
    assert_eq!(latest.encrypted_keys_nonces.len(), 1);

    let exact = metabase
        .begin_copy_object(BeginCopyObject {
            location: first.stream.location(),
            version: Some(1),
        })
        .await
        .unwrap();
    assert_eq!(exact.stream_id, first.stream.stream_id);
    assert_eq!(exact.encrypted_keys_nonces.len(), 2);

    let err = metabase
        .begin_copy_object(BeginCopyObject {
            location: first.stream.location(),
            version: Some(7),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MetabaseError::ObjectNotFound(_)));
}

#[tokio::test]
async fn copy_requires_matching_segment_keys() {
    let metabase = setup().await;
    let original = create_object(&metabase, Uuid::new_v4(), "original", 2).await;

    let err = metabase
        .finish_copy_object(FinishCopyObject {
            object_stream: original.stream.clone(),
            new_bucket: BUCKET.into(),
            new_encrypted_object_key: "copy".into(),
            new_stream_id: Uuid::new_v4(),
            new_segment_keys: Vec::new(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalid request: wrong number of segments keys received (received 0, need 2)"
    );
}

#[tokio::test]
async fn inline_copy_duplicates_payload() {
    let metabase = setup().await;
    let stream = object_stream(Uuid::new_v4(), "small", 1);
    begin_exact(&metabase, &stream).await;
    metabase
        .commit_inline_segment(inline_segment(&stream, SegmentPosition::new(0, 0), b"hello"))
        .await
        .unwrap();
    let original = commit(&metabase, &stream).await;

    let copy = copy_object(&metabase, &original, "small-copy").await;
    assert_eq!(copy_relation(&metabase, copy.stream.stream_id).await, None);

    let result = delete_exact(&metabase, &original).await;
    assert!(result.segments.is_empty());
    let segments = segments_of(&metabase, copy.stream.stream_id).await;
    assert_eq!(segments[0].inline_data.as_ref(), b"hello");
}

#[tokio::test]
async fn deleting_a_copy_keeps_ancestor_and_sibling() {
    let metabase = setup().await;
    let original = create_object(&metabase, Uuid::new_v4(), "original", 2).await;
    let first = copy_object(&metabase, &original, "first").await;
    let second = copy_object(&metabase, &original, "second").await;

    let result = delete_exact(&metabase, &first).await;
    assert_eq!(result.objects.len(), 1);
    assert!(result.segments.is_empty());

    assert_eq!(copy_relation(&metabase, first.stream.stream_id).await, None);
    assert_eq!(
        copy_relation(&metabase, second.stream.stream_id).await,
        Some(original.stream.stream_id)
    );
    assert!(!has_local_pieces(&metabase, second.stream.stream_id).await);
    assert_eq!(segments_of(&metabase, second.stream.stream_id).await.len(), 2);
    assert!(has_local_pieces(&metabase, original.stream.stream_id).await);
}

#[tokio::test]
async fn deleting_ancestor_promotes_one_copy() {
    let metabase = setup().await;
    let original = create_object(&metabase, Uuid::new_v4(), "original", 2).await;
    let original_segments = segments_of(&metabase, original.stream.stream_id).await;
    let a = copy_object(&metabase, &original, "a").await;
    let b = copy_object(&metabase, &original, "b").await;

    let result = delete_exact(&metabase, &original).await;
    assert_eq!(result.objects.len(), 1);
    assert!(result.segments.is_empty(), "promoted pieces must not be reported");

    let (promoted, other) = if a.stream.stream_id < b.stream.stream_id {
        (a, b)
    } else {
        (b, a)
    };
    assert_eq!(copy_relation(&metabase, promoted.stream.stream_id).await, None);
    assert!(has_local_pieces(&metabase, promoted.stream.stream_id).await);
    assert_eq!(
        copy_relation(&metabase, other.stream.stream_id).await,
        Some(promoted.stream.stream_id)
    );

    let promoted_segments = segments_of(&metabase, promoted.stream.stream_id).await;
    let other_segments = segments_of(&metabase, other.stream.stream_id).await;
    let pairs = original_segments.iter().zip(&promoted_segments).zip(&other_segments);
    for ((before, promoted), other) in pairs {
        assert_eq!(before.root_piece_id, promoted.root_piece_id);
        assert_eq!(before.pieces, promoted.pieces);
        assert_eq!(before.pieces, other.pieces);
    }

    // with no copies left, the pieces are finally reported
    delete_exact(&metabase, &other).await;
    let result = delete_exact(&metabase, &promoted).await;
    assert_eq!(result.segments.len(), 2);
    assert_eq!(result.segments[0].pieces.len(), 3);
}

#[tokio::test]
async fn deleting_ancestor_and_copy_together_reports_pieces() {
    let metabase = setup().await;
    let project_id = Uuid::new_v4();
    let original = create_object(&metabase, project_id, "original", 1).await;
    copy_object(&metabase, &original, "copy").await;

    let result = metabase
        .delete_objects_all_versions(DeleteObjectsAllVersions {
            locations: vec![location(project_id, "original"), location(project_id, "copy")],
        })
        .await
        .unwrap();
    assert_eq!(result.objects.len(), 2);
    assert_eq!(result.segments.len(), 1);
    let leftover: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM segment_copies")
        .fetch_one(&*metabase.db)
        .await
        .unwrap();
    assert_eq!(leftover, 0);
}

#[tokio::test]
async fn copy_of_copy_points_at_ultimate_ancestor() {
    let metabase = setup().await;
    let a = create_object(&metabase, Uuid::new_v4(), "a", 1).await;
    let b = copy_object(&metabase, &a, "b").await;
    let c = copy_object(&metabase, &b, "c").await;

    assert_eq!(copy_relation(&metabase, c.stream.stream_id).await, Some(a.stream.stream_id));

    // deleting the intermediate copy leaves the chain untouched
    delete_exact(&metabase, &b).await;
    assert_eq!(copy_relation(&metabase, c.stream.stream_id).await, Some(a.stream.stream_id));
    let segments = segments_of(&metabase, c.stream.stream_id).await;
    assert_eq!(segments[0].pieces.len(), 3);
}

#[tokio::test]
async fn copy_after_ancestor_deletion_points_at_promoted_stream() {
    let metabase = setup().await;
    let a = create_object(&metabase, Uuid::new_v4(), "a", 1).await;
    let b = copy_object(&metabase, &a, "b").await;

    delete_exact(&metabase, &a).await;
    assert_eq!(copy_relation(&metabase, b.stream.stream_id).await, None);

    let c = copy_object(&metabase, &b, "c").await;
    assert_eq!(copy_relation(&metabase, c.stream.stream_id).await, Some(b.stream.stream_id));
    let from_b = segments_of(&metabase, b.stream.stream_id).await;
    let from_c = segments_of(&metabase, c.stream.stream_id).await;
    assert_eq!(from_b[0].pieces, from_c[0].pieces);
}

#[tokio::test]
async fn deleting_pending_objects_reports_their_segments() {
    let metabase = setup().await;
    let project_id = Uuid::new_v4();

    let empty = object_stream(project_id, "empty", 1);
    begin_exact(&metabase, &empty).await;
    let result = metabase
        .delete_pending_object(DeletePendingObject {
            object_stream: empty.clone(),
        })
        .await
        .unwrap();
    assert_eq!(result.objects.len(), 1);
    assert!(result.segments.is_empty());

    let err = metabase
        .delete_pending_object(DeletePendingObject { object_stream: empty })
        .await
        .unwrap_err();
    assert!(matches!(err, MetabaseError::ObjectNotFound(_)));

    let upload = object_stream(project_id, "upload", 1);
    begin_exact(&metabase, &upload).await;
    for index in 0..3 {
        metabase
            .commit_segment(remote_segment(&upload, SegmentPosition::new(0, index), 64))
            .await
            .unwrap();
    }
    let result = metabase
        .delete_pending_object(DeletePendingObject { object_stream: upload })
        .await
        .unwrap();
    assert_eq!(result.segments.len(), 3);
}

#[tokio::test]
async fn delete_all_versions_requires_one_bucket() {
    let metabase = setup().await;
    let project_id = Uuid::new_v4();
    let other_bucket = ObjectLocation {
        bucket_name: "other".into(),
        ..location(project_id, "k")
    };
    let err = metabase
        .delete_objects_all_versions(DeleteObjectsAllVersions {
            locations: vec![location(project_id, "k"), other_bucket],
        })
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalid request: all objects must be in the same bucket"
    );
}

#[tokio::test]
async fn delete_any_status_removes_every_version() {
    let metabase = setup().await;
    let project_id = Uuid::new_v4();
    create_object(&metabase, project_id, "k", 1).await;
    begin_exact(&metabase, &object_stream(project_id, "k", 2)).await;

    let result = metabase
        .delete_object_any_status_all_versions(DeleteObjectAnyStatusAllVersions {
            location: location(project_id, "k"),
        })
        .await
        .unwrap();
    let versions: Vec<i64> = result.objects.iter().map(|o| o.stream.version).collect();
    assert_eq!(versions, vec![1, 2]);
    assert_eq!(result.segments.len(), 1);
}

#[tokio::test]
async fn sweeps_remove_expired_zombie_and_bucket_objects() {
    let metabase = setup().await;
    let project_id = Uuid::new_v4();
    let past = chrono::Utc::now() - chrono::Duration::hours(1);

    let expired = object_stream(project_id, "expired", 1);
    metabase
        .begin_object_exact_version(BeginObject {
            object_stream: expired.clone(),
            encryption: encryption(),
            expires_at: Some(past),
            ..Default::default()
        })
        .await
        .unwrap();
    commit(&metabase, &expired).await;

    let zombie = object_stream(project_id, "zombie", 1);
    metabase
        .begin_object_exact_version(BeginObject {
            object_stream: zombie,
            encryption: encryption(),
            zombie_deletion_deadline: Some(past),
            ..Default::default()
        })
        .await
        .unwrap();

    create_object(&metabase, project_id, "kept", 1).await;

    let now = chrono::Utc::now();
    let result = metabase
        .delete_expired_objects(DeleteExpiredObjects {
            expired_before: now,
            batch_size: 1,
        })
        .await
        .unwrap();
    assert_eq!(result.objects.len(), 1);

    let result = metabase
        .delete_zombie_objects(DeleteZombieObjects {
            deadline_before: now,
            inactive_deadline: None,
            batch_size: 1,
        })
        .await
        .unwrap();
    assert_eq!(result.objects.len(), 1);
    assert_eq!(result.objects[0].stream.object_key, ObjectKey::from("zombie"));

    let result = metabase
        .delete_bucket_objects(DeleteBucketObjects {
            project_id,
            bucket_name: BUCKET.into(),
            batch_size: 10,
        })
        .await
        .unwrap();
    assert_eq!(result.objects.len(), 1);
    assert_eq!(result.segments.len(), 1);
}
