//! Server-side copy: new objects that share the original's pieces.
//!
//! A copy gets its own object row and one segment row per original segment
//! carrying new key material but no pieces. A single `segment_copies` row
//! points the copy at the stream that actually holds the pieces. Copying a
//! copy points the new stream at that same ancestor, so chains never grow
//! beyond one level. Inline segments are duplicated instead of shared.

use crate::{
    errors::{MetabaseError, MetabaseResult, StorageContext},
    models::{
        EncryptedMetadata, EncryptionParameters, Object, ObjectKey, ObjectLocation, ObjectStatus,
        ObjectStream, PieceId, SegmentPosition, StreamId, Version,
        object::{OBJECT_COLUMNS, ObjectRow},
        segment::{SEGMENT_COLUMNS, SegmentRow},
    },
    services::metabase::{Metabase, now},
};

/// Select the object to copy.
#[derive(Clone, Debug, Default)]
pub struct BeginCopyObject {
    pub location: ObjectLocation,
    /// Latest committed version when `None`.
    pub version: Option<Version>,
}

/// Per-segment key material.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedKeyAndNonce {
    pub position: SegmentPosition,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
}

/// What a client needs to re-encrypt keys for the copy.
#[derive(Clone, Debug)]
pub struct BeginCopyObjectResult {
    pub stream_id: StreamId,
    pub version: Version,
    pub encrypted_metadata: Option<EncryptedMetadata>,
    pub encryption: EncryptionParameters,
    pub encrypted_keys_nonces: Vec<EncryptedKeyAndNonce>,
}

/// Create the copy.
#[derive(Clone, Debug, Default)]
pub struct FinishCopyObject {
    /// The original object.
    pub object_stream: ObjectStream,
    pub new_bucket: String,
    pub new_encrypted_object_key: ObjectKey,
    pub new_stream_id: StreamId,
    /// One entry per original segment.
    pub new_segment_keys: Vec<EncryptedKeyAndNonce>,
    /// Replace the metadata entirely instead of re-wrapping the original's.
    pub override_metadata: bool,
    pub new_encrypted_metadata: Option<Vec<u8>>,
    pub new_encrypted_metadata_key_nonce: Option<Vec<u8>>,
    pub new_encrypted_metadata_key: Option<Vec<u8>>,
}

impl FinishCopyObject {
    fn verify(&self) -> MetabaseResult<()> {
        self.object_stream.verify()?;
        if self.new_bucket.is_empty() {
            return Err(MetabaseError::invalid("NewBucket is missing"));
        }
        if self.new_encrypted_object_key.is_empty() {
            return Err(MetabaseError::invalid("NewEncryptedObjectKey is missing"));
        }
        if self.new_stream_id.is_nil() {
            return Err(MetabaseError::invalid("NewStreamID is missing"));
        }
        if self.new_stream_id == self.object_stream.stream_id {
            return Err(MetabaseError::invalid(
                "source and destination stream ids are the same",
            ));
        }
        Ok(())
    }

    /// Metadata for the copy given the original's.
    fn new_metadata(
        &self,
        original: Option<EncryptedMetadata>,
    ) -> MetabaseResult<Option<EncryptedMetadata>> {
        if self.override_metadata {
            return EncryptedMetadata::from_parts(
                self.new_encrypted_metadata.clone(),
                self.new_encrypted_metadata_key_nonce.clone(),
                self.new_encrypted_metadata_key.clone(),
            );
        }
        let Some(original) = original else {
            return Ok(None);
        };
        match (
            &self.new_encrypted_metadata_key_nonce,
            &self.new_encrypted_metadata_key,
        ) {
            (Some(nonce), Some(key)) if !nonce.is_empty() && !key.is_empty() => {
                Ok(Some(EncryptedMetadata {
                    encrypted_metadata: original.encrypted_metadata,
                    nonce: nonce.clone(),
                    encrypted_key: key.clone(),
                }))
            }
            _ => Err(MetabaseError::invalid(
                "EncryptedMetadataKeyNonce and EncryptedMetadataKey must be set",
            )),
        }
    }
}

impl Metabase {
    /// Collect what a client needs to prepare a copy of an object.
    pub async fn begin_copy_object(
        &self,
        opts: BeginCopyObject,
    ) -> MetabaseResult<BeginCopyObjectResult> {
        opts.location.verify()?;
        if opts.version.is_some_and(|version| version <= 0) {
            return Err(MetabaseError::invalid("Version invalid"));
        }

        let (object, keys) = async {
            // one read transaction so the keys belong to the object read
            let mut tx = self.db.begin().await.op("begin transaction")?;
            let object: Object = match opts.version {
                Some(version) => {
                    Self::fetch_exact_committed(&mut tx, &opts.location, version).await?
                }
                None => Self::fetch_latest_committed(&mut tx, &opts.location)
                    .await?
                    .ok_or_else(|| {
                        MetabaseError::ObjectNotFound(opts.location.object_key.to_string())
                    })?,
            }
            .into();

            let keys = sqlx::query_as::<_, (i64, Vec<u8>, Vec<u8>)>(
                "SELECT position, encrypted_key_nonce, encrypted_key
                 FROM segments WHERE stream_id = ? ORDER BY position",
            )
            .bind(object.stream.stream_id)
            .fetch_all(&mut *tx)
            .await
            .op("begin copy object")?;
            tx.rollback().await.op("begin copy object")?;
            Ok::<_, MetabaseError>((object, keys))
        }
        .await
        .inspect_err(|err| err.log_internal("begin copy object", None))?;
        let stream_id = object.stream.stream_id;

        Ok(BeginCopyObjectResult {
            stream_id,
            version: object.stream.version,
            encrypted_metadata: object.encrypted_metadata,
            encryption: object.encryption,
            encrypted_keys_nonces: keys
                .into_iter()
                .map(|(position, encrypted_key_nonce, encrypted_key)| EncryptedKeyAndNonce {
                    position: SegmentPosition::from_db(position),
                    encrypted_key_nonce,
                    encrypted_key,
                })
                .collect(),
        })
    }

    /// Create the copy object, its key-only segments and the copy relation
    /// in one transaction. The copy lands at the next version of the
    /// destination key.
    pub async fn finish_copy_object(&self, opts: FinishCopyObject) -> MetabaseResult<Object> {
        opts.verify()?;
        let original_stream_id = opts.object_stream.stream_id;

        async {
            let mut tx = self.begin_write().await?;

            let original: Object = Self::fetch_object_row(
                &mut tx,
                &opts.object_stream,
                Some(ObjectStatus::Committed),
            )
            .await?
            .ok_or_else(|| {
                MetabaseError::ObjectNotFound(format!(
                    "source object {} version {}",
                    opts.object_stream.object_key, opts.object_stream.version
                ))
            })?
            .into();

            if opts.new_segment_keys.len() != original.segment_count as usize {
                return Err(MetabaseError::invalid(format!(
                    "wrong number of segments keys received (received {}, need {})",
                    opts.new_segment_keys.len(),
                    original.segment_count
                )));
            }
            let metadata = opts.new_metadata(original.encrypted_metadata.clone())?;

            let sql = format!(
                "SELECT {SEGMENT_COLUMNS} FROM segments WHERE stream_id = ? ORDER BY position"
            );
            let segments = sqlx::query_as::<_, SegmentRow>(&sql)
                .bind(original_stream_id)
                .fetch_all(&mut *tx)
                .await
                .op("finish copy object")?;
            if segments.len() != original.segment_count as usize {
                return Err(MetabaseError::Corrupted(format!(
                    "object {} claims {} segments but has {}",
                    original_stream_id,
                    original.segment_count,
                    segments.len()
                )));
            }

            let mut new_keys = opts.new_segment_keys.clone();
            new_keys.sort_by_key(|key| key.position);
            for (segment, key) in segments.iter().zip(&new_keys) {
                if segment.position() != key.position {
                    return Err(MetabaseError::invalid(format!(
                        "missing new segment keys for segment {}",
                        segment.position()
                    )));
                }
            }

            let ancestor = Self::ancestor_of(&mut tx, original_stream_id)
                .await?
                .unwrap_or(original_stream_id);

            let new_version: Version = sqlx::query_scalar(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM objects
                 WHERE project_id = ? AND bucket_name = ? AND object_key = ?",
            )
            .bind(original.stream.project_id)
            .bind(&opts.new_bucket)
            .bind(&opts.new_encrypted_object_key)
            .fetch_one(&mut *tx)
            .await
            .op("finish copy object")?;

            let created_at = now();
            let sql = format!(
                "INSERT INTO objects (
                    project_id, bucket_name, object_key, version, stream_id, created_at,
                    expires_at, status, segment_count, encrypted_metadata, encrypted_metadata_nonce,
                    encrypted_metadata_encrypted_key, total_plain_size, total_encrypted_size,
                    fixed_segment_size, encryption, zombie_deletion_deadline
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
                RETURNING {OBJECT_COLUMNS}"
            );
            let row = sqlx::query_as::<_, ObjectRow>(&sql)
                .bind(original.stream.project_id)
                .bind(&opts.new_bucket)
                .bind(&opts.new_encrypted_object_key)
                .bind(new_version)
                .bind(opts.new_stream_id)
                .bind(created_at)
                .bind(original.expires_at)
                .bind(ObjectStatus::Committed)
                .bind(original.segment_count)
                .bind(metadata.as_ref().map(|m| m.encrypted_metadata.clone()))
                .bind(metadata.as_ref().map(|m| m.nonce.clone()))
                .bind(metadata.as_ref().map(|m| m.encrypted_key.clone()))
                .bind(original.total_plain_size)
                .bind(original.total_encrypted_size)
                .bind(original.fixed_segment_size)
                .bind(original.encryption.pack())
                .fetch_one(&mut *tx)
                .await
                .op("finish copy object")?;

            let mut shares_pieces = false;
            for (segment, key) in segments.iter().zip(&new_keys) {
                let inline = segment.redundancy == 0 && !segment.has_local_pieces();
                shares_pieces |= !inline;
                sqlx::query(
                    "INSERT INTO segments (
                        stream_id, position, created_at, expires_at, repaired_at, root_piece_id,
                        encrypted_key_nonce, encrypted_key, encrypted_size, plain_offset, plain_size,
                        encrypted_etag, redundancy, inline_data, remote_alias_pieces
                    ) VALUES (?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)",
                )
                .bind(opts.new_stream_id)
                .bind(segment.position)
                .bind(created_at)
                .bind(segment.expires_at)
                .bind(PieceId::default())
                .bind(&key.encrypted_key_nonce)
                .bind(&key.encrypted_key)
                .bind(segment.encrypted_size)
                .bind(segment.plain_offset)
                .bind(segment.plain_size)
                .bind(&segment.encrypted_etag)
                .bind(segment.redundancy)
                .bind(if inline { segment.inline_data.clone() } else { None })
                .execute(&mut *tx)
                .await
                .op("finish copy object")?;
            }

            if shares_pieces {
                sqlx::query(
                    "INSERT INTO segment_copies (stream_id, ancestor_stream_id) VALUES (?, ?)",
                )
                    .bind(opts.new_stream_id)
                    .bind(ancestor)
                    .execute(&mut *tx)
                    .await
                    .op("finish copy object")?;
            }

            tx.commit().await.op("finish copy object")?;

            tracing::info!(
                original = %original_stream_id,
                copy = %opts.new_stream_id,
                %ancestor,
                segments = segments.len(),
                "finished object copy"
            );
            Ok::<_, MetabaseError>(Object::from(row))
        }
        .await
        .inspect_err(|err| err.log_internal("finish copy object", Some(original_stream_id)))
    }
}
