//! Committing segments and objects.

use crate::{
    errors::{MetabaseError, MetabaseResult, StorageContext},
    models::{
        DeletedSegmentInfo, EncryptedMetadata, EncryptionParameters, Object, ObjectStatus,
        ObjectStream, PieceId, Pieces, RedundancyScheme, SegmentPosition,
        object::{OBJECT_COLUMNS, ObjectRow},
        segment::{SEGMENT_COLUMNS, SegmentRow},
    },
    services::metabase::{Metabase, now},
};
use bytes::Bytes;
use sqlx::{FromRow, SqliteConnection};
use std::collections::BTreeSet;

/// Store a remote segment of a pending object.
#[derive(Clone, Debug, Default)]
pub struct CommitSegment {
    pub object_stream: ObjectStream,
    pub position: SegmentPosition,
    pub root_piece_id: PieceId,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub plain_offset: i64,
    pub plain_size: i32,
    pub encrypted_size: i32,
    pub encrypted_etag: Option<Vec<u8>>,
    pub redundancy: RedundancyScheme,
    pub pieces: Pieces,
}

/// Store a segment whose encrypted payload lives in the metadata row.
#[derive(Clone, Debug, Default)]
pub struct CommitInlineSegment {
    pub object_stream: ObjectStream,
    pub position: SegmentPosition,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub plain_offset: i64,
    pub plain_size: i32,
    pub encrypted_etag: Option<Vec<u8>>,
    pub inline_data: Bytes,
}

/// Finalize a pending object.
#[derive(Clone, Debug, Default)]
pub struct CommitObject {
    pub object_stream: ObjectStream,
    /// Replaces the encryption given at begin when non-zero.
    pub encryption: EncryptionParameters,
    /// Replace the metadata triple with the fields below (possibly clearing it).
    pub override_encrypted_metadata: bool,
    pub encrypted_metadata: Option<Vec<u8>>,
    pub encrypted_metadata_nonce: Option<Vec<u8>>,
    pub encrypted_metadata_encrypted_key: Option<Vec<u8>>,
}

/// Finalize a pending object keeping exactly the listed segments.
#[derive(Clone, Debug, Default)]
pub struct CommitObjectWithSegments {
    pub commit: CommitObject,
    /// Positions that make up the final object, strictly ascending.
    pub segments: Vec<SegmentPosition>,
}

#[derive(Debug)]
pub struct CommitObjectWithSegmentsResult {
    pub object: Object,
    /// Pieces of segments dropped because they were not listed.
    pub deleted_segments: Vec<DeletedSegmentInfo>,
}

/// Overwrite the metadata of a committed object.
#[derive(Clone, Debug, Default)]
pub struct UpdateObjectMetadata {
    pub object_stream: ObjectStream,
    pub encrypted_metadata: Option<Vec<u8>>,
    pub encrypted_metadata_nonce: Option<Vec<u8>>,
    pub encrypted_metadata_encrypted_key: Option<Vec<u8>>,
}

#[derive(FromRow, Debug, Clone, Copy)]
struct SegmentSizes {
    position: i64,
    plain_offset: i64,
    plain_size: i32,
    encrypted_size: i32,
}

impl CommitSegment {
    fn verify(&self, validate_plain_size: bool) -> MetabaseResult<()> {
        self.object_stream.verify()?;
        self.position.verify()?;
        if self.root_piece_id.is_zero() {
            return Err(MetabaseError::invalid("RootPieceID missing"));
        }
        self.pieces.verify()?;
        verify_key_material(&self.encrypted_key, &self.encrypted_key_nonce)?;
        if self.encrypted_size <= 0 {
            return Err(MetabaseError::invalid("EncryptedSize negative or zero"));
        }
        if validate_plain_size {
            if self.plain_size <= 0 {
                return Err(MetabaseError::invalid("PlainSize negative or zero"));
            }
        } else if self.plain_size < 0 {
            return Err(MetabaseError::invalid("PlainSize negative"));
        }
        if self.plain_offset < 0 {
            return Err(MetabaseError::invalid("PlainOffset negative"));
        }
        if self.redundancy.is_zero() {
            return Err(MetabaseError::invalid("Redundancy zero"));
        }
        if self.pieces.len() < self.redundancy.optimal_shares as usize {
            return Err(MetabaseError::invalid(
                "number of pieces is less than redundancy optimal shares value",
            ));
        }
        Ok(())
    }
}

impl CommitInlineSegment {
    fn verify(&self) -> MetabaseResult<()> {
        self.object_stream.verify()?;
        self.position.verify()?;
        verify_key_material(&self.encrypted_key, &self.encrypted_key_nonce)?;
        if self.plain_size < 0 {
            return Err(MetabaseError::invalid("PlainSize negative"));
        }
        if self.plain_offset < 0 {
            return Err(MetabaseError::invalid("PlainOffset negative"));
        }
        Ok(())
    }
}

impl CommitObject {
    fn verify(&self) -> MetabaseResult<Option<EncryptedMetadata>> {
        self.object_stream.verify()?;
        if self.override_encrypted_metadata {
            EncryptedMetadata::from_parts(
                self.encrypted_metadata.clone(),
                self.encrypted_metadata_nonce.clone(),
                self.encrypted_metadata_encrypted_key.clone(),
            )
        } else {
            Ok(None)
        }
    }
}

fn verify_key_material(key: &[u8], nonce: &[u8]) -> MetabaseResult<()> {
    if key.is_empty() {
        return Err(MetabaseError::invalid("EncryptedKey missing"));
    }
    if nonce.is_empty() {
        return Err(MetabaseError::invalid("EncryptedKeyNonce missing"));
    }
    Ok(())
}

impl Metabase {
    /// Replace segment at position: store a remote segment of a pending
    /// object, overwriting whatever occupied the position before.
    ///
    /// Last write wins so a client can retry a failed segment upload at the
    /// same position; retrying is idempotent.
    pub async fn commit_segment(&self, opts: CommitSegment) -> MetabaseResult<()> {
        opts.verify(self.config().validate_plain_size)?;
        let stream_id = opts.object_stream.stream_id;

        let result = async {
            let alias_pieces = self.aliases().convert_pieces_to_aliases(&opts.pieces).await?;

            let mut tx = self.begin_write().await?;
            let pending = Self::fetch_object_row(
                &mut tx,
                &opts.object_stream,
                Some(ObjectStatus::Pending),
            )
            .await?
            .ok_or_else(|| MetabaseError::PendingObjectMissing(format!("stream {}", stream_id)))?;

            sqlx::query(
                "INSERT INTO segments (
                    stream_id, position, created_at, expires_at, repaired_at, root_piece_id,
                    encrypted_key_nonce, encrypted_key, encrypted_size, plain_offset, plain_size,
                    encrypted_etag, redundancy, inline_data, remote_alias_pieces
                ) VALUES (?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)
                ON CONFLICT (stream_id, position) DO UPDATE SET
                    created_at = excluded.created_at,
                    expires_at = excluded.expires_at,
                    repaired_at = NULL,
                    root_piece_id = excluded.root_piece_id,
                    encrypted_key_nonce = excluded.encrypted_key_nonce,
                    encrypted_key = excluded.encrypted_key,
                    encrypted_size = excluded.encrypted_size,
                    plain_offset = excluded.plain_offset,
                    plain_size = excluded.plain_size,
                    encrypted_etag = excluded.encrypted_etag,
                    redundancy = excluded.redundancy,
                    inline_data = NULL,
                    remote_alias_pieces = excluded.remote_alias_pieces",
            )
            .bind(stream_id)
            .bind(opts.position.to_db())
            .bind(now())
            .bind(pending.expires_at)
            .bind(opts.root_piece_id)
            .bind(&opts.encrypted_key_nonce)
            .bind(&opts.encrypted_key)
            .bind(opts.encrypted_size)
            .bind(opts.plain_offset)
            .bind(opts.plain_size)
            .bind(&opts.encrypted_etag)
            .bind(opts.redundancy.pack())
            .bind(alias_pieces.encode())
            .execute(&mut *tx)
            .await
            .op("commit segment")?;

            tx.commit().await.op("commit segment")
        }
        .await
        .inspect_err(|err| err.log_internal("commit segment", Some(stream_id)));

        if result.is_ok() {
            tracing::debug!(%stream_id, position = %opts.position, "committed remote segment");
        }
        result
    }

    /// Replace segment at position with an inline segment. An empty payload
    /// is a valid zero-length segment.
    pub async fn commit_inline_segment(&self, opts: CommitInlineSegment) -> MetabaseResult<()> {
        opts.verify()?;
        let stream_id = opts.object_stream.stream_id;

        let result = async {
            let mut tx = self.begin_write().await?;
            let pending = Self::fetch_object_row(
                &mut tx,
                &opts.object_stream,
                Some(ObjectStatus::Pending),
            )
            .await?
            .ok_or_else(|| MetabaseError::PendingObjectMissing(format!("stream {}", stream_id)))?;

            sqlx::query(
                "INSERT INTO segments (
                    stream_id, position, created_at, expires_at, repaired_at, root_piece_id,
                    encrypted_key_nonce, encrypted_key, encrypted_size, plain_offset, plain_size,
                    encrypted_etag, redundancy, inline_data, remote_alias_pieces
                ) VALUES (?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, ?, ?, 0, ?, NULL)
                ON CONFLICT (stream_id, position) DO UPDATE SET
                    created_at = excluded.created_at,
                    expires_at = excluded.expires_at,
                    repaired_at = NULL,
                    root_piece_id = excluded.root_piece_id,
                    encrypted_key_nonce = excluded.encrypted_key_nonce,
                    encrypted_key = excluded.encrypted_key,
                    encrypted_size = excluded.encrypted_size,
                    plain_offset = excluded.plain_offset,
                    plain_size = excluded.plain_size,
                    encrypted_etag = excluded.encrypted_etag,
                    redundancy = 0,
                    inline_data = excluded.inline_data,
                    remote_alias_pieces = NULL",
            )
            .bind(stream_id)
            .bind(opts.position.to_db())
            .bind(now())
            .bind(pending.expires_at)
            .bind(PieceId::default())
            .bind(&opts.encrypted_key_nonce)
            .bind(&opts.encrypted_key)
            .bind(opts.inline_data.len() as i32)
            .bind(opts.plain_offset)
            .bind(opts.plain_size)
            .bind(&opts.encrypted_etag)
            .bind(opts.inline_data.to_vec())
            .execute(&mut *tx)
            .await
            .op("commit inline segment")?;

            tx.commit().await.op("commit inline segment")
        }
        .await
        .inspect_err(|err| err.log_internal("commit inline segment", Some(stream_id)));

        if result.is_ok() {
            tracing::debug!(%stream_id, position = %opts.position, "committed inline segment");
        }
        result
    }

    /// Finalize a pending object from its committed segments.
    ///
    /// Sizes and segment count are recomputed from the segments, plain
    /// offsets are rewritten in position order, and part limits are checked.
    /// On any failure the object stays pending.
    pub async fn commit_object(&self, opts: CommitObject) -> MetabaseResult<Object> {
        let metadata = opts.verify()?;
        let stream_id = opts.object_stream.stream_id;

        async {
            let mut tx = self.begin_write().await?;
            Self::fetch_pending_for_commit(&mut tx, &opts.object_stream).await?;

            let segments = sqlx::query_as::<_, SegmentSizes>(
                "SELECT position, plain_offset, plain_size, encrypted_size
                 FROM segments WHERE stream_id = ? ORDER BY position",
            )
            .bind(stream_id)
            .fetch_all(&mut *tx)
            .await
            .op("commit object")?;

            let object = self
                .finalize_commit(&mut tx, &opts, metadata, &segments)
                .await?;
            tx.commit().await.op("commit object")?;

            tracing::info!(
                %stream_id,
                version = object.stream.version,
                segments = object.segment_count,
                "committed object"
            );
            Ok::<_, MetabaseError>(object)
        }
        .await
        .inspect_err(|err| err.log_internal("commit object", Some(stream_id)))
    }

    /// Finalize a pending object keeping only `opts.segments`; every other
    /// segment of the stream is removed and its pieces reported.
    pub async fn commit_object_with_segments(
        &self,
        opts: CommitObjectWithSegments,
    ) -> MetabaseResult<CommitObjectWithSegmentsResult> {
        let metadata = opts.commit.verify()?;
        for pair in opts.segments.windows(2) {
            if pair[0] == pair[1] {
                return Err(MetabaseError::invalid(format!(
                    "segment is duplicated: {}",
                    pair[0]
                )));
            }
            if pair[0] > pair[1] {
                return Err(MetabaseError::invalid("segments not in ascending order"));
            }
        }
        let stream_id = opts.commit.object_stream.stream_id;

        async {
            let mut tx = self.begin_write().await?;
            Self::fetch_pending_for_commit(&mut tx, &opts.commit.object_stream).await?;

            let sql = format!(
                "SELECT {SEGMENT_COLUMNS} FROM segments WHERE stream_id = ? ORDER BY position"
            );
            let rows = sqlx::query_as::<_, SegmentRow>(&sql)
                .bind(stream_id)
                .fetch_all(&mut *tx)
                .await
                .op("commit object with segments")?;

            let stored: BTreeSet<SegmentPosition> = rows.iter().map(SegmentRow::position).collect();
            if let Some(missing) = opts.segments.iter().find(|pos| !stored.contains(pos)) {
                return Err(MetabaseError::invalid(format!(
                    "segment {} does not exist",
                    missing
                )));
            }

            let wanted: BTreeSet<SegmentPosition> = opts.segments.iter().copied().collect();
            let mut kept = Vec::with_capacity(wanted.len());
            let mut deleted_segments = Vec::new();
            for row in rows {
                if wanted.contains(&row.position()) {
                    kept.push(SegmentSizes {
                        position: row.position,
                        plain_offset: row.plain_offset,
                        plain_size: row.plain_size,
                        encrypted_size: row.encrypted_size,
                    });
                    continue;
                }

                sqlx::query("DELETE FROM segments WHERE stream_id = ? AND position = ?")
                    .bind(stream_id)
                    .bind(row.position)
                    .execute(&mut *tx)
                    .await
                    .op("commit object with segments")?;

                if row.has_local_pieces() {
                    let pieces = self.alias_pieces_of(&mut tx, &row).await?;
                    deleted_segments.push(DeletedSegmentInfo {
                        root_piece_id: row.root_piece_id,
                        pieces,
                    });
                }
            }

            let object = self
                .finalize_commit(&mut tx, &opts.commit, metadata, &kept)
                .await?;
            tx.commit().await.op("commit object with segments")?;

            tracing::info!(
                %stream_id,
                kept = object.segment_count,
                deleted = deleted_segments.len(),
                "committed object with segments"
            );
            Ok::<_, MetabaseError>(CommitObjectWithSegmentsResult {
                object,
                deleted_segments,
            })
        }
        .await
        .inspect_err(|err| {
            err.log_internal("commit object with segments", Some(stream_id))
        })
    }

    /// Overwrite the metadata triple of a committed object.
    pub async fn update_object_metadata(&self, opts: UpdateObjectMetadata) -> MetabaseResult<()> {
        opts.object_stream.verify()?;
        let metadata = EncryptedMetadata::from_parts(
            opts.encrypted_metadata,
            opts.encrypted_metadata_nonce,
            opts.encrypted_metadata_encrypted_key,
        )?;
        let stream = &opts.object_stream;

        let result = sqlx::query(
            "UPDATE objects SET
                encrypted_metadata = ?,
                encrypted_metadata_nonce = ?,
                encrypted_metadata_encrypted_key = ?
             WHERE project_id = ? AND bucket_name = ? AND object_key = ? AND version = ?
               AND stream_id = ? AND status = ?",
        )
        .bind(metadata.as_ref().map(|m| m.encrypted_metadata.clone()))
        .bind(metadata.as_ref().map(|m| m.nonce.clone()))
        .bind(metadata.as_ref().map(|m| m.encrypted_key.clone()))
        .bind(stream.project_id)
        .bind(&stream.bucket_name)
        .bind(&stream.object_key)
        .bind(stream.version)
        .bind(stream.stream_id)
        .bind(ObjectStatus::Committed)
        .execute(&*self.db)
        .await
        .op("update object metadata")
        .inspect_err(|err| err.log_internal("update object metadata", Some(stream.stream_id)))?;

        if result.rows_affected() == 0 {
            return Err(MetabaseError::ObjectNotFound(format!(
                "committed object {} version {} with stream {}",
                stream.object_key, stream.version, stream.stream_id
            )));
        }
        Ok(())
    }

    async fn fetch_pending_for_commit(
        conn: &mut SqliteConnection,
        stream: &ObjectStream,
    ) -> MetabaseResult<ObjectRow> {
        Self::fetch_object_row(conn, stream, Some(ObjectStatus::Pending))
            .await?
            .ok_or_else(|| {
                MetabaseError::ObjectNotFound(
                    "object with specified version and pending status is missing".into(),
                )
            })
    }

    /// Validate parts, rewrite offsets and flip the object to committed.
    async fn finalize_commit(
        &self,
        conn: &mut SqliteConnection,
        opts: &CommitObject,
        metadata: Option<EncryptedMetadata>,
        segments: &[SegmentSizes],
    ) -> MetabaseResult<Object> {
        validate_parts(
            segments,
            self.config().min_part_size,
            self.config().max_number_of_parts,
        )?;

        let stream_id = opts.object_stream.stream_id;
        let mut offset = 0i64;
        let mut total_plain_size = 0i64;
        let mut total_encrypted_size = 0i64;
        for segment in segments {
            if segment.plain_offset != offset {
                sqlx::query(
                    "UPDATE segments SET plain_offset = ? WHERE stream_id = ? AND position = ?",
                )
                .bind(offset)
                .bind(stream_id)
                .bind(segment.position)
                .execute(&mut *conn)
                .await
                .op("update segment offsets")?;
            }
            offset += i64::from(segment.plain_size);
            total_plain_size += i64::from(segment.plain_size);
            total_encrypted_size += i64::from(segment.encrypted_size);
        }

        let sql = format!(
            "UPDATE objects SET
                status = ?,
                segment_count = ?,
                total_plain_size = ?,
                total_encrypted_size = ?,
                fixed_segment_size = ?,
                zombie_deletion_deadline = NULL,
                encryption = CASE WHEN ? = 0 THEN encryption ELSE ? END,
                encrypted_metadata = CASE WHEN ? THEN ? ELSE encrypted_metadata END,
                encrypted_metadata_nonce = CASE WHEN ? THEN ? ELSE encrypted_metadata_nonce END,
                encrypted_metadata_encrypted_key =
                    CASE WHEN ? THEN ? ELSE encrypted_metadata_encrypted_key END
             WHERE project_id = ? AND bucket_name = ? AND object_key = ? AND version = ?
               AND stream_id = ? AND status = ?
             RETURNING {OBJECT_COLUMNS}"
        );
        let stream = &opts.object_stream;
        let encryption = opts.encryption.pack();
        let row = sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(ObjectStatus::Committed)
            .bind(segments.len() as i32)
            .bind(total_plain_size)
            .bind(total_encrypted_size)
            .bind(fixed_segment_size(segments))
            .bind(encryption)
            .bind(encryption)
            .bind(opts.override_encrypted_metadata)
            .bind(metadata.as_ref().map(|m| m.encrypted_metadata.clone()))
            .bind(opts.override_encrypted_metadata)
            .bind(metadata.as_ref().map(|m| m.nonce.clone()))
            .bind(opts.override_encrypted_metadata)
            .bind(metadata.as_ref().map(|m| m.encrypted_key.clone()))
            .bind(stream.project_id)
            .bind(&stream.bucket_name)
            .bind(&stream.object_key)
            .bind(stream.version)
            .bind(stream.stream_id)
            .bind(ObjectStatus::Pending)
            .fetch_optional(&mut *conn)
            .await
            .op("commit object")?
            .ok_or_else(|| {
                MetabaseError::ObjectNotFound(
                    "object with specified version and pending status is missing".into(),
                )
            })?;

        Ok(row.into())
    }
}

/// Check part count and the minimum size of every part but the last.
fn validate_parts(
    segments: &[SegmentSizes],
    min_part_size: i64,
    max_number_of_parts: usize,
) -> MetabaseResult<()> {
    // segments are ordered by position, so parts come out ordered too
    let mut parts: Vec<(u32, i64)> = Vec::new();
    for segment in segments {
        let part = SegmentPosition::from_db(segment.position).part;
        match parts.last_mut() {
            Some((number, size)) if *number == part => *size += i64::from(segment.plain_size),
            _ => parts.push((part, i64::from(segment.plain_size))),
        }
    }

    if parts.len() > max_number_of_parts {
        return Err(MetabaseError::invalid(format!(
            "exceeded maximum number of parts: {}",
            max_number_of_parts
        )));
    }

    if let Some((_, init)) = parts.split_last() {
        for (number, size) in init {
            if *size < min_part_size {
                return Err(MetabaseError::invalid(format!(
                    "size of part number {} is below minimum threshold, got: {}, min: {}",
                    number, size, min_part_size
                )));
            }
        }
    }
    Ok(())
}

/// Common plain size when segments are `(0, 0..n)` and all but the last
/// share it; `-1` otherwise, `0` without segments.
fn fixed_segment_size(segments: &[SegmentSizes]) -> i32 {
    let Some(first) = segments.first() else {
        return 0;
    };
    let fixed = first.plain_size;
    for (i, segment) in segments.iter().enumerate() {
        let position = SegmentPosition::from_db(segment.position);
        if position.part != 0 || position.index as usize != i {
            return -1;
        }
        if i < segments.len() - 1 && segment.plain_size != fixed {
            return -1;
        }
    }
    fixed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(part: u32, index: u32, plain_size: i32) -> SegmentSizes {
        SegmentSizes {
            position: SegmentPosition::new(part, index).to_db(),
            plain_offset: 0,
            plain_size,
            encrypted_size: plain_size + 16,
        }
    }

    #[test]
    fn fixed_segment_size_requires_regular_layout() {
        assert_eq!(fixed_segment_size(&[]), 0);
        assert_eq!(
            fixed_segment_size(&[sizes(0, 0, 64), sizes(0, 1, 64), sizes(0, 2, 10)]),
            64
        );
        assert_eq!(
            fixed_segment_size(&[sizes(0, 0, 64), sizes(0, 1, 32), sizes(0, 2, 64)]),
            -1
        );
        assert_eq!(fixed_segment_size(&[sizes(0, 0, 64), sizes(0, 2, 64)]), -1);
        assert_eq!(fixed_segment_size(&[sizes(1, 0, 64)]), -1);
    }

    #[test]
    fn validate_parts_checks_all_but_last_part() {
        let mib = 1024 * 1024;
        let ok = [sizes(1, 0, 5 * mib), sizes(2, 0, mib)];
        assert!(validate_parts(&ok, 5 * i64::from(mib), 10).is_ok());

        let small = [sizes(1, 0, 2 * mib), sizes(2, 0, 5 * mib)];
        let err = validate_parts(&small, 5 * i64::from(mib), 10).unwrap_err();
        assert!(err.to_string().contains("size of part number 1 is below minimum threshold"));

        // sizes of one part add up across its segments
        let split = [sizes(1, 0, 3 * mib), sizes(1, 1, 2 * mib), sizes(2, 0, 1)];
        assert!(validate_parts(&split, 5 * i64::from(mib), 10).is_ok());

        let many = [sizes(1, 0, 1), sizes(2, 0, 1), sizes(3, 0, 1), sizes(4, 0, 1)];
        let err = validate_parts(&many, 0, 3).unwrap_err();
        assert!(err.to_string().contains("exceeded maximum number of parts: 3"));
    }
}
