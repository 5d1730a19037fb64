//! Starting uploads: pending objects and remote segment reservations.

use crate::{
    errors::{MetabaseError, MetabaseResult, is_unique_violation},
    models::{
        EncryptedMetadata, EncryptionParameters, NEXT_VERSION, Object, ObjectStatus, ObjectStream,
        PieceId, Pieces, SegmentPosition,
        object::{OBJECT_COLUMNS, ObjectRow},
    },
    services::metabase::{Metabase, now},
};
use chrono::{DateTime, Utc};

/// Options shared by both begin-object variants.
#[derive(Clone, Debug, Default)]
pub struct BeginObject {
    pub object_stream: ObjectStream,
    pub expires_at: Option<DateTime<Utc>>,
    /// Defaults to now + the configured zombie deadline.
    pub zombie_deletion_deadline: Option<DateTime<Utc>>,
    pub encrypted_metadata: Option<Vec<u8>>,
    pub encrypted_metadata_nonce: Option<Vec<u8>>,
    pub encrypted_metadata_encrypted_key: Option<Vec<u8>>,
    pub encryption: EncryptionParameters,
}

/// Reserve a remote segment of a pending object.
#[derive(Clone, Debug, Default)]
pub struct BeginSegment {
    pub object_stream: ObjectStream,
    pub position: SegmentPosition,
    pub root_piece_id: PieceId,
    pub pieces: Pieces,
}

impl BeginObject {
    fn verify(&self) -> MetabaseResult<Option<EncryptedMetadata>> {
        self.object_stream.verify()?;
        if self.encryption.is_zero() {
            return Err(MetabaseError::invalid("Encryption is missing"));
        }
        EncryptedMetadata::from_parts(
            self.encrypted_metadata.clone(),
            self.encrypted_metadata_nonce.clone(),
            self.encrypted_metadata_encrypted_key.clone(),
        )
    }
}

impl Metabase {
    /// Insert a pending object at the next free version of its key.
    ///
    /// The version is computed inside the insert statement from every row of
    /// the key regardless of status, so a version taken by a pending upload
    /// is never handed out twice even when a later version commits first.
    pub async fn begin_object_next_version(&self, opts: BeginObject) -> MetabaseResult<Object> {
        let metadata = opts.verify()?;
        if opts.object_stream.version != NEXT_VERSION {
            return Err(MetabaseError::invalid("Version should be NEXT_VERSION"));
        }

        let stream = &opts.object_stream;
        let deadline = self.zombie_deadline(opts.zombie_deletion_deadline);
        let sql = format!(
            "INSERT INTO objects (
                project_id, bucket_name, object_key, version, stream_id, created_at,
                expires_at, status, encryption, encrypted_metadata, encrypted_metadata_nonce,
                encrypted_metadata_encrypted_key, zombie_deletion_deadline
            )
            SELECT ?, ?, ?, COALESCE(MAX(version), 0) + 1, ?, ?, ?, ?, ?, ?, ?, ?, ?
            FROM objects WHERE project_id = ? AND bucket_name = ? AND object_key = ?
            RETURNING {OBJECT_COLUMNS}"
        );

        let row = sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(stream.project_id)
            .bind(&stream.bucket_name)
            .bind(&stream.object_key)
            .bind(stream.stream_id)
            .bind(now())
            .bind(opts.expires_at)
            .bind(ObjectStatus::Pending)
            .bind(opts.encryption.pack())
            .bind(metadata.as_ref().map(|m| m.encrypted_metadata.clone()))
            .bind(metadata.as_ref().map(|m| m.nonce.clone()))
            .bind(metadata.as_ref().map(|m| m.encrypted_key.clone()))
            .bind(deadline)
            .bind(stream.project_id)
            .bind(&stream.bucket_name)
            .bind(&stream.object_key)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    MetabaseError::ObjectAlreadyExists(format!(
                        "concurrent upload of {} took the next version",
                        stream.object_key
                    ))
                } else {
                    MetabaseError::Storage {
                        operation: "begin object next version",
                        source: err,
                    }
                }
            })
            .inspect_err(|err| {
                err.log_internal("begin object next version", Some(stream.stream_id))
            })?;

        tracing::debug!(
            stream_id = %row.stream_id,
            version = row.version,
            "began object at next version"
        );
        Ok(row.into())
    }

    /// Insert a pending object at exactly the requested version.
    ///
    /// Fails with `ObjectAlreadyExists` when any pending or committed row
    /// holds the version, including when a concurrent begin wins the race.
    pub async fn begin_object_exact_version(&self, opts: BeginObject) -> MetabaseResult<Object> {
        let metadata = opts.verify()?;
        if opts.object_stream.version == NEXT_VERSION {
            return Err(MetabaseError::invalid("Version should not be NEXT_VERSION"));
        }

        let stream = &opts.object_stream;
        let deadline = self.zombie_deadline(opts.zombie_deletion_deadline);
        let sql = format!(
            "INSERT INTO objects (
                project_id, bucket_name, object_key, version, stream_id, created_at,
                expires_at, status, encryption, encrypted_metadata, encrypted_metadata_nonce,
                encrypted_metadata_encrypted_key, zombie_deletion_deadline
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {OBJECT_COLUMNS}"
        );

        let row = sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(stream.project_id)
            .bind(&stream.bucket_name)
            .bind(&stream.object_key)
            .bind(stream.version)
            .bind(stream.stream_id)
            .bind(now())
            .bind(opts.expires_at)
            .bind(ObjectStatus::Pending)
            .bind(opts.encryption.pack())
            .bind(metadata.as_ref().map(|m| m.encrypted_metadata.clone()))
            .bind(metadata.as_ref().map(|m| m.nonce.clone()))
            .bind(metadata.as_ref().map(|m| m.encrypted_key.clone()))
            .bind(deadline)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    MetabaseError::ObjectAlreadyExists(format!(
                        "version {} of {} already exists",
                        stream.version, stream.object_key
                    ))
                } else {
                    MetabaseError::Storage {
                        operation: "begin object exact version",
                        source: err,
                    }
                }
            })
            .inspect_err(|err| {
                err.log_internal("begin object exact version", Some(stream.stream_id))
            })?;

        tracing::debug!(
            stream_id = %row.stream_id,
            version = row.version,
            "began object at exact version"
        );
        Ok(row.into())
    }

    /// Validate a remote segment upload against its pending object.
    ///
    /// Nothing is written: the segment row appears on commit. Pieces must be
    /// supplied in ascending number order.
    pub async fn begin_segment(&self, opts: BeginSegment) -> MetabaseResult<()> {
        opts.object_stream.verify()?;
        opts.position.verify()?;
        if opts.root_piece_id.is_zero() {
            return Err(MetabaseError::invalid("RootPieceID missing"));
        }
        opts.pieces.verify()?;

        let mut conn = self.acquire().await?;
        let pending =
            Self::fetch_object_row(&mut conn, &opts.object_stream, Some(ObjectStatus::Pending))
                .await
                .inspect_err(|err| {
                    err.log_internal("begin segment", Some(opts.object_stream.stream_id))
                })?;
        if pending.is_none() {
            return Err(MetabaseError::PendingObjectMissing(format!(
                "stream {}",
                opts.object_stream.stream_id
            )));
        }

        tracing::debug!(
            stream_id = %opts.object_stream.stream_id,
            position = %opts.position,
            pieces = opts.pieces.len(),
            "began segment"
        );
        Ok(())
    }

    pub(crate) fn zombie_deadline(&self, requested: Option<DateTime<Utc>>) -> DateTime<Utc> {
        requested.unwrap_or_else(|| now() + self.config().default_zombie_deadline)
    }
}
