//! Point reads of objects and segments.

use crate::{
    errors::{MetabaseError, MetabaseResult, StorageContext},
    models::{
        Object, ObjectLocation, ObjectStatus, Segment, SegmentPosition, StreamId, Version,
        object::{OBJECT_COLUMNS, ObjectRow},
        segment::{SEGMENT_COLUMNS, SegmentRow},
    },
    services::metabase::Metabase,
};

/// Page through the segments of one stream.
#[derive(Clone, Debug, Default)]
pub struct ListSegments {
    pub stream_id: StreamId,
    /// Exclusive lower bound.
    pub cursor: Option<SegmentPosition>,
    pub limit: usize,
}

#[derive(Debug, Default)]
pub struct ListSegmentsResult {
    pub segments: Vec<Segment>,
    pub more: bool,
}

const DEFAULT_LIST_LIMIT: usize = 1000;

impl Metabase {
    /// Committed object at exactly `version`.
    pub async fn get_object_exact_version(
        &self,
        location: &ObjectLocation,
        version: Version,
    ) -> MetabaseResult<Object> {
        location.verify()?;
        if version <= 0 {
            return Err(MetabaseError::invalid("Version invalid"));
        }

        let mut conn = self.acquire().await?;
        Self::fetch_exact_committed(&mut conn, location, version)
            .await
            .inspect_err(|err| err.log_internal("get object exact version", None))
            .map(Object::from)
    }

    pub(crate) async fn fetch_exact_committed(
        conn: &mut sqlx::SqliteConnection,
        location: &ObjectLocation,
        version: Version,
    ) -> MetabaseResult<ObjectRow> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE project_id = ? AND bucket_name = ? AND object_key = ? AND version = ?
               AND status = ?"
        );
        sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(location.project_id)
            .bind(&location.bucket_name)
            .bind(&location.object_key)
            .bind(version)
            .bind(ObjectStatus::Committed)
            .fetch_optional(&mut *conn)
            .await
            .op("get object exact version")?
            .ok_or_else(|| {
                MetabaseError::ObjectNotFound(format!(
                    "{} version {}",
                    location.object_key, version
                ))
            })
    }

    /// Committed object with the highest version of its key.
    pub async fn get_object_latest_version(
        &self,
        location: &ObjectLocation,
    ) -> MetabaseResult<Object> {
        location.verify()?;
        let mut conn = self.acquire().await?;
        Self::fetch_latest_committed(&mut conn, location)
            .await
            .inspect_err(|err| err.log_internal("get object latest version", None))?
            .map(Object::from)
            .ok_or_else(|| MetabaseError::ObjectNotFound(location.object_key.to_string()))
    }

    pub(crate) async fn fetch_latest_committed(
        conn: &mut sqlx::SqliteConnection,
        location: &ObjectLocation,
    ) -> MetabaseResult<Option<ObjectRow>> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE project_id = ? AND bucket_name = ? AND object_key = ? AND status = ?
             ORDER BY version DESC LIMIT 1"
        );
        sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(location.project_id)
            .bind(&location.bucket_name)
            .bind(&location.object_key)
            .bind(ObjectStatus::Committed)
            .fetch_optional(&mut *conn)
            .await
            .op("get object latest version")
    }

    /// Segment of a stream at `position`, with pieces resolved through the
    /// ancestor when the stream is a copy.
    pub async fn get_segment_by_position(
        &self,
        stream_id: StreamId,
        position: SegmentPosition,
    ) -> MetabaseResult<Segment> {
        if stream_id.is_nil() {
            return Err(MetabaseError::invalid("StreamID missing"));
        }

        async {
            // one read transaction so the ancestor read sees the same snapshot
            let mut tx = self.db.begin().await.op("begin transaction")?;
            let sql = format!(
                "SELECT {SEGMENT_COLUMNS} FROM segments WHERE stream_id = ? AND position = ?"
            );
            let row = sqlx::query_as::<_, SegmentRow>(&sql)
                .bind(stream_id)
                .bind(position.to_db())
                .fetch_optional(&mut *tx)
                .await
                .op("get segment by position")?
                .ok_or_else(|| {
                    MetabaseError::SegmentNotFound(format!(
                        "stream {} position {}",
                        stream_id, position
                    ))
                })?;

            let mut segments = self.resolve_segments(&mut tx, vec![row]).await?;
            tx.rollback().await.op("get segment by position")?;
            segments
                .pop()
                .ok_or_else(|| MetabaseError::Corrupted("segment lost during resolution".into()))
        }
        .await
        .inspect_err(|err| err.log_internal("get segment by position", Some(stream_id)))
    }

    /// Last segment (highest position) of the latest committed version.
    pub async fn get_latest_object_last_segment(
        &self,
        location: &ObjectLocation,
    ) -> MetabaseResult<Segment> {
        location.verify()?;

        async {
            let mut tx = self.db.begin().await.op("begin transaction")?;
            let object = Self::fetch_latest_committed(&mut tx, location)
                .await?
                .ok_or_else(|| MetabaseError::ObjectNotFound(location.object_key.to_string()))?;

            let sql = format!(
                "SELECT {SEGMENT_COLUMNS} FROM segments WHERE stream_id = ?
                 ORDER BY position DESC LIMIT 1"
            );
            let row = sqlx::query_as::<_, SegmentRow>(&sql)
                .bind(object.stream_id)
                .fetch_optional(&mut *tx)
                .await
                .op("get latest object last segment")?
                .ok_or_else(|| {
                    MetabaseError::SegmentNotFound(format!(
                        "stream {} has no segments",
                        object.stream_id
                    ))
                })?;

            let mut segments = self.resolve_segments(&mut tx, vec![row]).await?;
            tx.rollback().await.op("get latest object last segment")?;
            segments
                .pop()
                .ok_or_else(|| MetabaseError::Corrupted("segment lost during resolution".into()))
        }
        .await
        .inspect_err(|err| err.log_internal("get latest object last segment", None))
    }

    /// Segments of one stream ordered by position.
    pub async fn list_segments(&self, opts: ListSegments) -> MetabaseResult<ListSegmentsResult> {
        if opts.stream_id.is_nil() {
            return Err(MetabaseError::invalid("StreamID missing"));
        }
        let limit = if opts.limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            opts.limit.min(DEFAULT_LIST_LIMIT)
        };

        async {
            let mut tx = self.db.begin().await.op("begin transaction")?;
            let sql = format!(
                "SELECT {SEGMENT_COLUMNS} FROM segments
                 WHERE stream_id = ? AND (? IS NULL OR position > ?)
                 ORDER BY position LIMIT ?"
            );
            let cursor = opts.cursor.map(SegmentPosition::to_db);
            let mut rows = sqlx::query_as::<_, SegmentRow>(&sql)
                .bind(opts.stream_id)
                .bind(cursor)
                .bind(cursor)
                .bind((limit + 1) as i64)
                .fetch_all(&mut *tx)
                .await
                .op("list segments")?;

            let more = rows.len() > limit;
            rows.truncate(limit);
            let segments = self.resolve_segments(&mut tx, rows).await?;
            tx.rollback().await.op("list segments")?;
            Ok::<_, MetabaseError>(ListSegmentsResult { segments, more })
        }
        .await
        .inspect_err(|err| err.log_internal("list segments", Some(opts.stream_id)))
    }
}
