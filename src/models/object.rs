//! Object versions: identity, lifecycle status and size bookkeeping.

use crate::{
    errors::{MetabaseError, MetabaseResult},
    models::ids::{ObjectKey, ProjectId, StreamId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Object version number. Positive for stored rows.
pub type Version = i64;

/// Sentinel asking the engine to pick the next free version for a key.
pub const NEXT_VERSION: Version = 0;

/// Lifecycle of an object row.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, sqlx::Type)]
#[repr(i32)]
pub enum ObjectStatus {
    Pending = 1,
    Committed = 3,
}

/// A key in a bucket, independent of version.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
pub struct ObjectLocation {
    pub project_id: ProjectId,
    pub bucket_name: String,
    pub object_key: ObjectKey,
}

impl ObjectLocation {
    pub fn verify(&self) -> MetabaseResult<()> {
        if self.project_id.is_nil() {
            return Err(MetabaseError::invalid("ProjectID missing"));
        }
        if self.bucket_name.is_empty() {
            return Err(MetabaseError::invalid("BucketName missing"));
        }
        if self.object_key.is_empty() {
            return Err(MetabaseError::invalid("ObjectKey missing"));
        }
        Ok(())
    }

    pub fn with_version(&self, version: Version, stream_id: StreamId) -> ObjectStream {
        ObjectStream {
            project_id: self.project_id,
            bucket_name: self.bucket_name.clone(),
            object_key: self.object_key.clone(),
            version,
            stream_id,
        }
    }
}

/// Full identity of one object instance.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
pub struct ObjectStream {
    pub project_id: ProjectId,
    pub bucket_name: String,
    pub object_key: ObjectKey,
    pub version: Version,
    pub stream_id: StreamId,
}

impl ObjectStream {
    pub fn verify(&self) -> MetabaseResult<()> {
        self.location().verify()?;
        if self.version < 0 {
            return Err(MetabaseError::invalid("Version invalid"));
        }
        if self.stream_id.is_nil() {
            return Err(MetabaseError::invalid("StreamID missing"));
        }
        Ok(())
    }

    pub fn location(&self) -> ObjectLocation {
        ObjectLocation {
            project_id: self.project_id,
            bucket_name: self.bucket_name.clone(),
            object_key: self.object_key.clone(),
        }
    }
}

/// Object-level encryption settings, persisted packed into one integer.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct EncryptionParameters {
    pub cipher_suite: u8,
    pub block_size: i32,
}

impl EncryptionParameters {
    pub fn is_zero(&self) -> bool {
        self.cipher_suite == 0 && self.block_size == 0
    }

    pub fn pack(&self) -> i64 {
        (i64::from(self.cipher_suite) << 32) | i64::from(self.block_size as u32)
    }

    pub fn unpack(value: i64) -> Self {
        Self {
            cipher_suite: ((value >> 32) & 0xff) as u8,
            block_size: (value & 0xffff_ffff) as u32 as i32,
        }
    }
}

/// Encrypted user metadata together with the material needed to open it.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct EncryptedMetadata {
    pub encrypted_metadata: Vec<u8>,
    pub nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
}

impl EncryptedMetadata {
    /// Build from the three optional columns/fields: all set or none set.
    pub fn from_parts(
        encrypted_metadata: Option<Vec<u8>>,
        nonce: Option<Vec<u8>>,
        encrypted_key: Option<Vec<u8>>,
    ) -> MetabaseResult<Option<Self>> {
        match (encrypted_metadata, nonce, encrypted_key) {
            (None, None, None) => Ok(None),
            (Some(encrypted_metadata), Some(nonce), Some(encrypted_key)) => Ok(Some(Self {
                encrypted_metadata,
                nonce,
                encrypted_key,
            })),
            (None, _, _) => Err(MetabaseError::invalid(
                "EncryptedMetadataNonce and EncryptedMetadataEncryptedKey must be not set if EncryptedMetadata is not set",
            )),
            (Some(_), _, _) => Err(MetabaseError::invalid(
                "EncryptedMetadataNonce and EncryptedMetadataEncryptedKey must be set if EncryptedMetadata is set",
            )),
        }
    }
}

/// Public read-only view of an object version.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Object {
    pub stream: ObjectStream,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ObjectStatus,
    pub segment_count: i32,
    pub encrypted_metadata: Option<EncryptedMetadata>,
    pub total_plain_size: i64,
    pub total_encrypted_size: i64,
    /// Common plain size of all but the last segment, `-1` when irregular.
    pub fixed_segment_size: i32,
    pub encryption: EncryptionParameters,
    pub zombie_deletion_deadline: Option<DateTime<Utc>>,
}

impl Object {
    pub fn is_committed(&self) -> bool {
        self.status == ObjectStatus::Committed
    }

    /// Objects migrated from the legacy layout have unreliable plain offsets.
    pub fn is_migrated(&self) -> bool {
        self.total_plain_size <= 0
    }
}

/// Column list matching [`ObjectRow`], shared by SELECT and RETURNING clauses.
pub(crate) const OBJECT_COLUMNS: &str = "project_id, bucket_name, object_key, version, stream_id, \
     created_at, expires_at, status, segment_count, encrypted_metadata_nonce, encrypted_metadata, \
     encrypted_metadata_encrypted_key, total_plain_size, total_encrypted_size, fixed_segment_size, \
     encryption, zombie_deletion_deadline";

/// Raw `objects` row as stored.
#[derive(FromRow, Debug, Clone)]
pub(crate) struct ObjectRow {
    pub project_id: ProjectId,
    pub bucket_name: String,
    pub object_key: ObjectKey,
    pub version: Version,
    pub stream_id: StreamId,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ObjectStatus,
    pub segment_count: i32,
    pub encrypted_metadata_nonce: Option<Vec<u8>>,
    pub encrypted_metadata: Option<Vec<u8>>,
    pub encrypted_metadata_encrypted_key: Option<Vec<u8>>,
    pub total_plain_size: i64,
    pub total_encrypted_size: i64,
    pub fixed_segment_size: i32,
    pub encryption: i64,
    pub zombie_deletion_deadline: Option<DateTime<Utc>>,
}

impl From<ObjectRow> for Object {
    fn from(row: ObjectRow) -> Self {
        // A row only holds a complete triple; partial leftovers read as absent.
        let encrypted_metadata = match (
            row.encrypted_metadata,
            row.encrypted_metadata_nonce,
            row.encrypted_metadata_encrypted_key,
        ) {
            (Some(encrypted_metadata), Some(nonce), Some(encrypted_key)) => {
                Some(EncryptedMetadata {
                    encrypted_metadata,
                    nonce,
                    encrypted_key,
                })
            }
            _ => None,
        };

        Object {
            stream: ObjectStream {
                project_id: row.project_id,
                bucket_name: row.bucket_name,
                object_key: row.object_key,
                version: row.version,
                stream_id: row.stream_id,
            },
            created_at: row.created_at,
            expires_at: row.expires_at,
            status: row.status,
            segment_count: row.segment_count,
            encrypted_metadata,
            total_plain_size: row.total_plain_size,
            total_encrypted_size: row.total_encrypted_size,
            fixed_segment_size: row.fixed_segment_size,
            encryption: EncryptionParameters::unpack(row.encryption),
            zombie_deletion_deadline: row.zombie_deletion_deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn encryption_parameters_pack_roundtrip() {
        let params = EncryptionParameters {
            cipher_suite: 4,
            block_size: 29 * 256,
        };
        assert_eq!(EncryptionParameters::unpack(params.pack()), params);
        assert!(EncryptionParameters::unpack(0).is_zero());
    }

    #[test]
    fn metadata_triple_must_be_complete() {
        assert!(EncryptedMetadata::from_parts(None, None, None)
            .unwrap()
            .is_none());
        assert!(
            EncryptedMetadata::from_parts(Some(vec![1]), Some(vec![2]), Some(vec![3]))
                .unwrap()
                .is_some()
        );
        assert!(EncryptedMetadata::from_parts(Some(vec![1]), None, Some(vec![3])).is_err());
        assert!(EncryptedMetadata::from_parts(None, Some(vec![2]), None).is_err());
    }

    #[test]
    fn stream_verify_reports_missing_fields() {
        let mut stream = ObjectStream {
            project_id: Uuid::new_v4(),
            bucket_name: "bucket".into(),
            object_key: ObjectKey::from("key"),
            version: 1,
            stream_id: Uuid::new_v4(),
        };
        assert!(stream.verify().is_ok());

        stream.bucket_name.clear();
        assert_eq!(
            stream.verify().unwrap_err().to_string(),
            "invalid request: BucketName missing"
        );

        stream.bucket_name = "bucket".into();
        stream.stream_id = Uuid::nil();
        assert!(stream.verify().is_err());
    }
}
