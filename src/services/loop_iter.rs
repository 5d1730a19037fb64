//! Whole-database scans for batch jobs.
//!
//! A loop iterator holds one read transaction for its whole lifetime, so
//! every batch sees the same snapshot. Rows created after
//! `as_of_system_time` are skipped. Iteration restarts from scratch after a
//! process restart; nothing is persisted.

use crate::{
    errors::{MetabaseError, MetabaseResult, StorageContext},
    models::{
        ObjectStatus, ObjectStream, Pieces, PieceId, RedundancyScheme, Segment, SegmentPosition,
        StreamId,
        object::{OBJECT_COLUMNS, ObjectRow},
        segment::{SEGMENT_COLUMNS, SegmentRow},
    },
    services::metabase::{Metabase, now},
};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use sqlx::{Transaction, sqlite::Sqlite};
use uuid::Uuid;

pub const DEFAULT_LOOP_BATCH_SIZE: usize = 2500;

#[derive(Clone, Debug, Default)]
pub struct IterateLoopOptions {
    pub batch_size: usize,
    /// Snapshot time; defaults to the moment the iterator is opened.
    pub as_of_system_time: Option<DateTime<Utc>>,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct LoopObjectEntry {
    pub object_stream: ObjectStream,
    pub status: ObjectStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub segment_count: i32,
    pub total_encrypted_size: i64,
    pub encrypted_metadata_size: usize,
}

impl From<ObjectRow> for LoopObjectEntry {
    fn from(row: ObjectRow) -> Self {
        LoopObjectEntry {
            encrypted_metadata_size: row.encrypted_metadata.as_ref().map_or(0, Vec::len),
            object_stream: ObjectStream {
                project_id: row.project_id,
                bucket_name: row.bucket_name,
                object_key: row.object_key,
                version: row.version,
                stream_id: row.stream_id,
            },
            status: row.status,
            created_at: row.created_at,
            expires_at: row.expires_at,
            segment_count: row.segment_count,
            total_encrypted_size: row.total_encrypted_size,
        }
    }
}

/// Segment as seen by batch jobs: no key material, pieces resolved.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct LoopSegmentEntry {
    pub stream_id: StreamId,
    pub position: SegmentPosition,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub repaired_at: Option<DateTime<Utc>>,
    pub root_piece_id: PieceId,
    pub encrypted_size: i32,
    pub plain_offset: i64,
    pub plain_size: i32,
    pub redundancy: RedundancyScheme,
    pub pieces: Pieces,
}

impl LoopSegmentEntry {
    pub fn inline(&self) -> bool {
        self.redundancy.is_zero() && self.pieces.is_empty()
    }
}

impl From<Segment> for LoopSegmentEntry {
    fn from(segment: Segment) -> Self {
        LoopSegmentEntry {
            stream_id: segment.stream_id,
            position: segment.position,
            created_at: segment.created_at,
            expires_at: segment.expires_at,
            repaired_at: segment.repaired_at,
            root_piece_id: segment.root_piece_id,
            encrypted_size: segment.encrypted_size,
            plain_offset: segment.plain_offset,
            plain_size: segment.plain_size,
            redundancy: segment.redundancy,
            pieces: segment.pieces,
        }
    }
}

fn normalize(opts: &IterateLoopOptions) -> (usize, DateTime<Utc>) {
    let batch_size = if opts.batch_size == 0 {
        DEFAULT_LOOP_BATCH_SIZE
    } else {
        opts.batch_size
    };
    (batch_size, opts.as_of_system_time.unwrap_or_else(now))
}

/// Objects of every bucket ordered by full identity.
pub struct LoopObjectsIterator {
    tx: Transaction<'static, Sqlite>,
    batch_size: usize,
    as_of: DateTime<Utc>,
    cursor: Option<ObjectStream>,
    done: bool,
}

impl LoopObjectsIterator {
    /// Next batch of objects; an empty batch ends the iteration.
    pub async fn next_batch(&mut self) -> MetabaseResult<Vec<LoopObjectEntry>> {
        if self.done {
            return Ok(Vec::new());
        }
        let start = self.cursor.clone().unwrap_or_default();
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE created_at <= ?
               AND (project_id, bucket_name, object_key, version) > (?, ?, ?, ?)
             ORDER BY project_id, bucket_name, object_key, version
             LIMIT ?"
        );
        let rows = sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(self.as_of)
            .bind(start.project_id)
            .bind(&start.bucket_name)
            .bind(&start.object_key)
            .bind(start.version)
            .bind(self.batch_size as i64)
            .fetch_all(&mut *self.tx)
            .await
            .op("iterate loop objects")
            .inspect_err(|err| err.log_internal("iterate loop objects", None))?;

        self.done = rows.len() < self.batch_size;
        let entries: Vec<LoopObjectEntry> = rows.into_iter().map(LoopObjectEntry::from).collect();
        if let Some(last) = entries.last() {
            self.cursor = Some(last.object_stream.clone());
        }
        Ok(entries)
    }

    /// Release the snapshot.
    pub async fn finish(self) -> MetabaseResult<()> {
        self.tx.rollback().await.op("finish loop")
    }
}

/// Segments of every stream ordered by (stream id, position).
pub struct LoopSegmentsIterator {
    metabase: Metabase,
    tx: Transaction<'static, Sqlite>,
    batch_size: usize,
    as_of: DateTime<Utc>,
    cursor: (StreamId, i64),
    done: bool,
}

impl LoopSegmentsIterator {
    /// Next batch of segments; an empty batch ends the iteration.
    pub async fn next_batch(&mut self) -> MetabaseResult<Vec<LoopSegmentEntry>> {
        if self.done {
            return Ok(Vec::new());
        }

        async {
            let sql = format!(
                "SELECT {SEGMENT_COLUMNS} FROM segments
                 WHERE created_at <= ? AND (stream_id, position) > (?, ?)
                 ORDER BY stream_id, position
                 LIMIT ?"
            );
            let mut rows = Vec::with_capacity(self.batch_size);
            {
                let mut stream = sqlx::query_as::<_, SegmentRow>(&sql)
                    .bind(self.as_of)
                    .bind(self.cursor.0)
                    .bind(self.cursor.1)
                    .bind(self.batch_size as i64)
                    .fetch(&mut *self.tx);
                while let Some(row) = stream.try_next().await.op("iterate loop segments")? {
                    rows.push(row);
                }
            }

            self.done = rows.len() < self.batch_size;
            if let Some(last) = rows.last() {
                self.cursor = (last.stream_id, last.position);
            }
            let segments = self.metabase.resolve_segments(&mut self.tx, rows).await?;
            Ok::<_, MetabaseError>(segments.into_iter().map(LoopSegmentEntry::from).collect())
        }
        .await
        .inspect_err(|err| err.log_internal("iterate loop segments", None))
    }

    pub async fn finish(self) -> MetabaseResult<()> {
        self.tx.rollback().await.op("finish loop")
    }
}

impl Metabase {
    pub async fn iterate_loop_objects(
        &self,
        opts: IterateLoopOptions,
    ) -> MetabaseResult<LoopObjectsIterator> {
        let (batch_size, as_of) = normalize(&opts);
        let tx = self.db.begin().await.op("begin loop")?;
        Ok(LoopObjectsIterator {
            tx,
            batch_size,
            as_of,
            cursor: None,
            done: false,
        })
    }

    pub async fn iterate_loop_segments(
        &self,
        opts: IterateLoopOptions,
    ) -> MetabaseResult<LoopSegmentsIterator> {
        let (batch_size, as_of) = normalize(&opts);
        let tx = self.db.begin().await.op("begin loop")?;
        Ok(LoopSegmentsIterator {
            metabase: self.clone(),
            tx,
            batch_size,
            as_of,
            // nil stream at the lowest position sorts before every real row
            cursor: (Uuid::nil(), i64::MIN),
            done: false,
        })
    }
}
