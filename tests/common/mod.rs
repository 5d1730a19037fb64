#![allow(dead_code)]

use metabase::{
    Metabase,
    config::MetabaseConfig,
    db,
    models::{
        EncryptionParameters, NodeId, Object, ObjectKey, ObjectLocation, ObjectStream, Piece,
        PieceId, Pieces, RedundancyScheme, SegmentPosition,
    },
    services::{
        begin::BeginObject,
        commit::{CommitInlineSegment, CommitObject, CommitSegment},
        copy::{BeginCopyObject, EncryptedKeyAndNonce, FinishCopyObject},
    },
};
use std::sync::Arc;
use uuid::Uuid;

pub const BUCKET: &str = "bucket";

pub async fn setup() -> Metabase {
    setup_with(MetabaseConfig::default()).await
}

pub async fn setup_with(config: MetabaseConfig) -> Metabase {
    let pool = db::connect("sqlite::memory:", 1).await.expect("connect");
    db::run_migrations(&pool).await.expect("migrate");
    Metabase::new(Arc::new(pool), config)
}

/// Metabase over a WAL file database with a multi-connection pool, for
/// tests that exercise concurrent writers. Keep the directory alive.
pub async fn setup_file_backed() -> (Metabase, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = format!("sqlite://{}", dir.path().join("metabase.db").display());
    let pool = db::connect(&url, 5).await.expect("connect");
    db::run_migrations(&pool).await.expect("migrate");
    (Metabase::new(Arc::new(pool), MetabaseConfig::default()), dir)
}

pub fn random_node() -> NodeId {
    NodeId(rand::random())
}

pub fn random_piece_id() -> PieceId {
    PieceId(rand::random())
}

pub fn encryption() -> EncryptionParameters {
    EncryptionParameters {
        cipher_suite: 1,
        block_size: 256,
    }
}

pub fn redundancy() -> RedundancyScheme {
    RedundancyScheme {
        algorithm: 1,
        share_size: 256,
        required_shares: 1,
        repair_shares: 1,
        optimal_shares: 2,
        total_shares: 3,
    }
}

pub fn pieces(count: u16) -> Pieces {
    Pieces(
        (0..count)
            .map(|number| Piece {
                number,
                storage_node: random_node(),
            })
            .collect(),
    )
}

pub fn location(project_id: Uuid, key: &str) -> ObjectLocation {
    ObjectLocation {
        project_id,
        bucket_name: BUCKET.into(),
        object_key: ObjectKey::from(key),
    }
}

pub fn object_stream(project_id: Uuid, key: &str, version: i64) -> ObjectStream {
    location(project_id, key).with_version(version, Uuid::new_v4())
}

pub async fn begin_exact(metabase: &Metabase, stream: &ObjectStream) -> Object {
    metabase
        .begin_object_exact_version(BeginObject {
            object_stream: stream.clone(),
            encryption: encryption(),
            ..Default::default()
        })
        .await
        .expect("begin object")
}

pub fn remote_segment(
    stream: &ObjectStream,
    position: SegmentPosition,
    plain_size: i32,
) -> CommitSegment {
    CommitSegment {
        object_stream: stream.clone(),
        position,
        root_piece_id: random_piece_id(),
        encrypted_key_nonce: vec![1; 24],
        encrypted_key: vec![2; 32],
        plain_offset: 0,
        plain_size,
        encrypted_size: plain_size + 64,
        encrypted_etag: None,
        redundancy: redundancy(),
        pieces: pieces(3),
    }
}

pub fn inline_segment(
    stream: &ObjectStream,
    position: SegmentPosition,
    data: &[u8],
) -> CommitInlineSegment {
    CommitInlineSegment {
        object_stream: stream.clone(),
        position,
        encrypted_key_nonce: vec![1; 24],
        encrypted_key: vec![2; 32],
        plain_offset: 0,
        plain_size: data.len() as i32,
        encrypted_etag: None,
        inline_data: bytes::Bytes::copy_from_slice(data),
    }
}

pub async fn commit(metabase: &Metabase, stream: &ObjectStream) -> Object {
    metabase
        .commit_object(CommitObject {
            object_stream: stream.clone(),
            ..Default::default()
        })
        .await
        .expect("commit object")
}

/// Committed object at version 1 with `segments` remote segments in part 0.
pub async fn create_object(
    metabase: &Metabase,
    project_id: Uuid,
    key: &str,
    segments: u32,
) -> Object {
    let stream = object_stream(project_id, key, 1);
    begin_exact(metabase, &stream).await;
    for index in 0..segments {
        metabase
            .commit_segment(remote_segment(&stream, SegmentPosition::new(0, index), 1024))
            .await
            .expect("commit segment");
    }
    commit(metabase, &stream).await
}

/// Server-side copy of `original` to `new_key` in the same bucket.
pub async fn copy_object(metabase: &Metabase, original: &Object, new_key: &str) -> Object {
    let begin = metabase
        .begin_copy_object(BeginCopyObject {
            location: original.stream.location(),
            version: Some(original.stream.version),
        })
        .await
        .expect("begin copy");

    let new_segment_keys = begin
        .encrypted_keys_nonces
        .iter()
        .map(|key| EncryptedKeyAndNonce {
            position: key.position,
            encrypted_key_nonce: vec![7; 24],
            encrypted_key: vec![8; 32],
        })
        .collect();

    metabase
        .finish_copy_object(FinishCopyObject {
            object_stream: original.stream.clone(),
            new_bucket: BUCKET.into(),
            new_encrypted_object_key: ObjectKey::from(new_key),
            new_stream_id: Uuid::new_v4(),
            new_segment_keys,
            ..Default::default()
        })
        .await
        .expect("finish copy")
}
