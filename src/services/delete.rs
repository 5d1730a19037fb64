//! Deleting objects and their segments, with ancestor promotion.
//!
//! All variants follow the same steps inside one transaction: remove the
//! object rows, remove their segments, drop the copy relation of deleted
//! copies, and for every deleted ancestor that still has live copies hand
//! its pieces to exactly one of them. Pieces are reported back only when
//! nothing references them anymore.

use crate::{
    errors::{MetabaseError, MetabaseResult, StorageContext},
    models::{
        AliasPieces, DeletedSegmentInfo, Object, ObjectLocation, ObjectStatus, ObjectStream,
        PieceId, ProjectId, SegmentPosition, StreamId, Version,
        object::{OBJECT_COLUMNS, ObjectRow},
    },
    services::metabase::Metabase,
};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, SqliteConnection, sqlite::Sqlite};
use std::collections::BTreeSet;

/// Objects and unreferenced pieces removed by one deletion call.
#[derive(Debug, Default, Clone)]
pub struct DeleteObjectResult {
    pub objects: Vec<Object>,
    pub segments: Vec<DeletedSegmentInfo>,
}

impl DeleteObjectResult {
    fn extend(&mut self, other: DeleteObjectResult) {
        self.objects.extend(other.objects);
        self.segments.extend(other.segments);
    }
}

#[derive(Clone, Debug, Default)]
pub struct DeletePendingObject {
    pub object_stream: ObjectStream,
}

#[derive(Clone, Debug, Default)]
pub struct DeleteObjectExactVersion {
    pub location: ObjectLocation,
    pub version: Version,
}

#[derive(Clone, Debug, Default)]
pub struct DeleteObjectAnyStatusAllVersions {
    pub location: ObjectLocation,
}

/// Committed versions of many keys of one bucket.
#[derive(Clone, Debug, Default)]
pub struct DeleteObjectsAllVersions {
    pub locations: Vec<ObjectLocation>,
}

#[derive(Clone, Debug)]
pub struct DeleteExpiredObjects {
    pub expired_before: DateTime<Utc>,
    pub batch_size: usize,
}

#[derive(Clone, Debug)]
pub struct DeleteZombieObjects {
    pub deadline_before: DateTime<Utc>,
    /// Skip uploads with a segment committed at or after this instant.
    pub inactive_deadline: Option<DateTime<Utc>>,
    pub batch_size: usize,
}

#[derive(Clone, Debug, Default)]
pub struct DeleteBucketObjects {
    pub project_id: ProjectId,
    pub bucket_name: String,
    pub batch_size: usize,
}

const DEFAULT_DELETE_BATCH: usize = 100;

/// Segment columns needed to hand pieces over or report them.
#[derive(FromRow, Debug)]
struct DeletedSegmentRow {
    position: i64,
    root_piece_id: PieceId,
    repaired_at: Option<DateTime<Utc>>,
    remote_alias_pieces: Option<Vec<u8>>,
}

impl DeletedSegmentRow {
    fn has_pieces(&self) -> bool {
        self.remote_alias_pieces
            .as_ref()
            .is_some_and(|data| data.len() > 1)
    }
}

impl Metabase {
    /// Delete a pending object matched by version and stream.
    pub async fn delete_pending_object(
        &self,
        opts: DeletePendingObject,
    ) -> MetabaseResult<DeleteObjectResult> {
        opts.object_stream.verify()?;
        let stream = &opts.object_stream;

        let sql = format!(
            "DELETE FROM objects
             WHERE project_id = ? AND bucket_name = ? AND object_key = ? AND version = ?
               AND stream_id = ? AND status = ?
             RETURNING {OBJECT_COLUMNS}"
        );
        let query = sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(stream.project_id)
            .bind(&stream.bucket_name)
            .bind(&stream.object_key)
            .bind(stream.version)
            .bind(stream.stream_id)
            .bind(ObjectStatus::Pending);

        async {
            let mut tx = self.begin_write().await?;
            let rows = query.fetch_all(&mut *tx).await.op("delete pending object")?;
            let result = self.finish_deletion(&mut tx, rows, true).await?;
            tx.commit().await.op("delete pending object")?;
            Ok::<_, MetabaseError>(result)
        }
        .await
        .inspect_err(|err| err.log_internal("delete pending object", Some(stream.stream_id)))
    }

    /// Delete the object at one version, pending or committed.
    pub async fn delete_object_exact_version(
        &self,
        opts: DeleteObjectExactVersion,
    ) -> MetabaseResult<DeleteObjectResult> {
        opts.location.verify()?;
        if opts.version <= 0 {
            return Err(MetabaseError::invalid("Version invalid"));
        }
        let location = &opts.location;

        let sql = format!(
            "DELETE FROM objects
             WHERE project_id = ? AND bucket_name = ? AND object_key = ? AND version = ?
             RETURNING {OBJECT_COLUMNS}"
        );
        let query = sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(location.project_id)
            .bind(&location.bucket_name)
            .bind(&location.object_key)
            .bind(opts.version);

        async {
            let mut tx = self.begin_write().await?;
            let rows = query.fetch_all(&mut *tx).await.op("delete object exact version")?;
            let result = self.finish_deletion(&mut tx, rows, true).await?;
            tx.commit().await.op("delete object exact version")?;
            Ok::<_, MetabaseError>(result)
        }
        .await
        .inspect_err(|err| err.log_internal("delete object exact version", None))
    }

    /// Delete every version of a key regardless of status.
    pub async fn delete_object_any_status_all_versions(
        &self,
        opts: DeleteObjectAnyStatusAllVersions,
    ) -> MetabaseResult<DeleteObjectResult> {
        opts.location.verify()?;
        let location = &opts.location;

        let sql = format!(
            "DELETE FROM objects
             WHERE project_id = ? AND bucket_name = ? AND object_key = ?
             RETURNING {OBJECT_COLUMNS}"
        );
        let query = sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(location.project_id)
            .bind(&location.bucket_name)
            .bind(&location.object_key);

        async {
            let mut tx = self.begin_write().await?;
            let rows = query.fetch_all(&mut *tx).await.op("delete object any status all versions")?;
            let result = self.finish_deletion(&mut tx, rows, true).await?;
            tx.commit().await.op("delete object any status all versions")?;
            Ok::<_, MetabaseError>(result)
        }
        .await
        .inspect_err(|err| err.log_internal("delete object any status all versions", None))
    }

    /// Delete every committed version of several keys in one bucket.
    pub async fn delete_objects_all_versions(
        &self,
        opts: DeleteObjectsAllVersions,
    ) -> MetabaseResult<DeleteObjectResult> {
        let Some(first) = opts.locations.first() else {
            return Ok(DeleteObjectResult::default());
        };
        for location in &opts.locations {
            location.verify()?;
            if location.project_id != first.project_id || location.bucket_name != first.bucket_name
            {
                return Err(MetabaseError::invalid("all objects must be in the same bucket"));
            }
        }

        let keys: BTreeSet<_> = opts.locations.iter().map(|l| l.object_key.clone()).collect();
        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM objects WHERE project_id = ");
        builder.push_bind(first.project_id);
        builder.push(" AND bucket_name = ");
        builder.push_bind(first.bucket_name.clone());
        builder.push(" AND status = ");
        builder.push_bind(ObjectStatus::Committed);
        builder.push(" AND object_key IN (");
        let mut separated = builder.separated(", ");
        for key in keys {
            separated.push_bind(key);
        }
        separated.push_unseparated(")");
        builder.push(" RETURNING ");
        builder.push(OBJECT_COLUMNS);

        async {
            let mut tx = self.begin_write().await?;
            let rows = builder
                .build_query_as::<ObjectRow>()
                .fetch_all(&mut *tx)
                .await
                .op("delete objects all versions")?;
            let result = self.finish_deletion(&mut tx, rows, false).await?;
            tx.commit().await.op("delete objects all versions")?;
            Ok::<_, MetabaseError>(result)
        }
        .await
        .inspect_err(|err| err.log_internal("delete objects all versions", None))
    }

    /// Sweep objects whose expiration passed, one transaction per batch.
    pub async fn delete_expired_objects(
        &self,
        opts: DeleteExpiredObjects,
    ) -> MetabaseResult<DeleteObjectResult> {
        let batch_size = batch_size_or_default(opts.batch_size);
        let sql = format!(
            "DELETE FROM objects WHERE rowid IN (
                SELECT rowid FROM objects
                WHERE expires_at IS NOT NULL AND expires_at < ?
                LIMIT ?
             )
             RETURNING {OBJECT_COLUMNS}"
        );

        let mut total = DeleteObjectResult::default();
        loop {
            let query = sqlx::query_as::<_, ObjectRow>(&sql)
                .bind(opts.expired_before)
                .bind(batch_size as i64);
            let batch = async {
                let mut tx = self.begin_write().await?;
                let rows = query.fetch_all(&mut *tx).await.op("delete expired objects")?;
                let result = self.finish_deletion(&mut tx, rows, false).await?;
                tx.commit().await.op("delete expired objects")?;
                Ok::<_, MetabaseError>(result)
            }
            .await
            .inspect_err(|err| err.log_internal("delete expired objects", None))?;
            let done = batch.objects.len() < batch_size;
            total.extend(batch);
            if done {
                break;
            }
        }

        tracing::info!(
            objects = total.objects.len(),
            segments = total.segments.len(),
            "deleted expired objects"
        );
        Ok(total)
    }

    /// Sweep pending uploads past their zombie deadline.
    pub async fn delete_zombie_objects(
        &self,
        opts: DeleteZombieObjects,
    ) -> MetabaseResult<DeleteObjectResult> {
        let batch_size = batch_size_or_default(opts.batch_size);
        let sql = format!(
            "DELETE FROM objects WHERE rowid IN (
                SELECT rowid FROM objects o
                WHERE o.status = ?
                  AND o.zombie_deletion_deadline IS NOT NULL
                  AND o.zombie_deletion_deadline < ?
                  AND (? IS NULL OR NOT EXISTS (
                        SELECT 1 FROM segments s
                        WHERE s.stream_id = o.stream_id AND s.created_at >= ?
                  ))
                LIMIT ?
             )
             RETURNING {OBJECT_COLUMNS}"
        );

        let mut total = DeleteObjectResult::default();
        loop {
            let query = sqlx::query_as::<_, ObjectRow>(&sql)
                .bind(ObjectStatus::Pending)
                .bind(opts.deadline_before)
                .bind(opts.inactive_deadline)
                .bind(opts.inactive_deadline)
                .bind(batch_size as i64);
            let batch = async {
                let mut tx = self.begin_write().await?;
                let rows = query.fetch_all(&mut *tx).await.op("delete zombie objects")?;
                let result = self.finish_deletion(&mut tx, rows, false).await?;
                tx.commit().await.op("delete zombie objects")?;
                Ok::<_, MetabaseError>(result)
            }
            .await
            .inspect_err(|err| err.log_internal("delete zombie objects", None))?;
            let done = batch.objects.len() < batch_size;
            total.extend(batch);
            if done {
                break;
            }
        }

        tracing::info!(
            objects = total.objects.len(),
            segments = total.segments.len(),
            "deleted zombie objects"
        );
        Ok(total)
    }

    /// Remove every object of a bucket in batches.
    pub async fn delete_bucket_objects(
        &self,
        opts: DeleteBucketObjects,
    ) -> MetabaseResult<DeleteObjectResult> {
        if opts.project_id.is_nil() {
            return Err(MetabaseError::invalid("ProjectID missing"));
        }
        if opts.bucket_name.is_empty() {
            return Err(MetabaseError::invalid("BucketName missing"));
        }
        let batch_size = batch_size_or_default(opts.batch_size);
        let sql = format!(
            "DELETE FROM objects WHERE rowid IN (
                SELECT rowid FROM objects WHERE project_id = ? AND bucket_name = ? LIMIT ?
             )
             RETURNING {OBJECT_COLUMNS}"
        );

        let mut total = DeleteObjectResult::default();
        loop {
            let query = sqlx::query_as::<_, ObjectRow>(&sql)
                .bind(opts.project_id)
                .bind(&opts.bucket_name)
                .bind(batch_size as i64);
            let batch = async {
                let mut tx = self.begin_write().await?;
                let rows = query.fetch_all(&mut *tx).await.op("delete bucket objects")?;
                let result = self.finish_deletion(&mut tx, rows, false).await?;
                tx.commit().await.op("delete bucket objects")?;
                Ok::<_, MetabaseError>(result)
            }
            .await
            .inspect_err(|err| err.log_internal("delete bucket objects", None))?;
            let done = batch.objects.len() < batch_size;
            total.extend(batch);
            if done {
                break;
            }
        }
        Ok(total)
    }

    /// Clean up after object rows were removed inside `conn`'s transaction.
    /// With `require_match` an empty deletion is reported as `ObjectNotFound`.
    async fn finish_deletion(
        &self,
        conn: &mut SqliteConnection,
        rows: Vec<ObjectRow>,
        require_match: bool,
    ) -> MetabaseResult<DeleteObjectResult> {
        if rows.is_empty() {
            if require_match {
                return Err(MetabaseError::ObjectNotFound("no rows deleted".into()));
            }
            return Ok(DeleteObjectResult::default());
        }

        let streams: Vec<StreamId> = rows.iter().map(|row| row.stream_id).collect();
        let segments = self.delete_streams(conn, &streams).await?;

        let mut objects: Vec<Object> = rows.into_iter().map(Object::from).collect();
        objects.sort_by(|a, b| {
            (&a.stream.object_key, a.stream.version).cmp(&(&b.stream.object_key, b.stream.version))
        });

        tracing::debug!(objects = objects.len(), segments = segments.len(), "deleted objects");
        Ok(DeleteObjectResult { objects, segments })
    }

    /// Delete the segments of removed streams and settle copy relations.
    async fn delete_streams(
        &self,
        conn: &mut SqliteConnection,
        streams: &[StreamId],
    ) -> MetabaseResult<Vec<DeletedSegmentInfo>> {
        let mut removed = Vec::with_capacity(streams.len());
        for stream_id in streams {
            let segments = sqlx::query_as::<_, DeletedSegmentRow>(
                "DELETE FROM segments WHERE stream_id = ?
                 RETURNING position, root_piece_id, repaired_at, remote_alias_pieces",
            )
            .bind(stream_id)
            .fetch_all(&mut *conn)
            .await
            .op("delete segments")?;
            removed.push((*stream_id, segments));
        }

        // Drop relations of deleted copies first so that an ancestor deleted in
        // the same call is never promoted into a copy that is going away.
        for stream_id in streams {
            sqlx::query("DELETE FROM segment_copies WHERE stream_id = ?")
                .bind(stream_id)
                .execute(&mut *conn)
                .await
                .op("delete copy relation")?;
        }

        let mut unreferenced = Vec::new();
        for (stream_id, mut segments) in removed {
            segments.sort_by_key(|segment| segment.position);
            let copies: Vec<StreamId> = sqlx::query_scalar(
                "SELECT stream_id FROM segment_copies
                 WHERE ancestor_stream_id = ? ORDER BY stream_id",
            )
            .bind(stream_id)
            .fetch_all(&mut *conn)
            .await
            .op("fetch copies")?;

            let orphaned = match copies.first() {
                Some(promoted) => self.promote_copy(conn, stream_id, *promoted, segments).await?,
                None => segments,
            };

            for segment in orphaned.into_iter().filter(DeletedSegmentRow::has_pieces) {
                let aliases = AliasPieces::decode(
                    segment.remote_alias_pieces.as_deref().unwrap_or_default(),
                )?;
                let pieces = self.aliases().convert_aliases_to_pieces(conn, &aliases).await?;
                unreferenced.push(DeletedSegmentInfo {
                    root_piece_id: segment.root_piece_id,
                    pieces,
                });
            }
        }
        Ok(unreferenced)
    }

    /// Move the pieces of a deleted ancestor into `promoted` and make it the
    /// ancestor of the remaining copies. Returns segments that found no
    /// counterpart in the promoted copy, whose pieces are now unreferenced.
    async fn promote_copy(
        &self,
        conn: &mut SqliteConnection,
        ancestor: StreamId,
        promoted: StreamId,
        segments: Vec<DeletedSegmentRow>,
    ) -> MetabaseResult<Vec<DeletedSegmentRow>> {
        let mut orphaned = Vec::new();
        for segment in segments {
            if !segment.has_pieces() {
                continue;
            }
            let result = sqlx::query(
                "UPDATE segments SET root_piece_id = ?, repaired_at = ?, remote_alias_pieces = ?
                 WHERE stream_id = ? AND position = ?",
            )
            .bind(segment.root_piece_id)
            .bind(segment.repaired_at)
            .bind(&segment.remote_alias_pieces)
            .bind(promoted)
            .bind(segment.position)
            .execute(&mut *conn)
            .await
            .op("promote copy segment")?;

            if result.rows_affected() == 0 {
                tracing::warn!(
                    %ancestor,
                    %promoted,
                    position = %SegmentPosition::from_db(segment.position),
                    "promoted copy lacks segment; reporting pieces as deleted"
                );
                orphaned.push(segment);
            }
        }

        sqlx::query("DELETE FROM segment_copies WHERE stream_id = ?")
            .bind(promoted)
            .execute(&mut *conn)
            .await
            .op("promote copy")?;
        let repointed = sqlx::query(
            "UPDATE segment_copies SET ancestor_stream_id = ? WHERE ancestor_stream_id = ?",
        )
        .bind(promoted)
        .bind(ancestor)
        .execute(&mut *conn)
        .await
        .op("promote copy")?;

        tracing::info!(
            %ancestor,
            %promoted,
            remaining_copies = repointed.rows_affected(),
            "promoted copy to ancestor"
        );
        Ok(orphaned)
    }
}

fn batch_size_or_default(batch_size: usize) -> usize {
    if batch_size == 0 {
        DEFAULT_DELETE_BATCH
    } else {
        batch_size
    }
}
