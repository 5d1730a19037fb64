//! Cursor-based listing within one bucket.

use crate::{
    errors::{MetabaseError, MetabaseResult, StorageContext},
    models::{
        EncryptedMetadata, EncryptionParameters, ObjectKey, ObjectLocation, ObjectStatus,
        ProjectId, StreamId, Version, ids::prefix_limit,
    },
    services::metabase::Metabase,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, QueryBuilder, sqlite::Sqlite};
use std::collections::VecDeque;

const DEFAULT_BATCH_SIZE: usize = 1000;
const DELIMITER: u8 = b'/';

/// Exclusive starting point of a listing. Keys are absolute, not relative
/// to the listing prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IterateCursor {
    pub key: ObjectKey,
    pub version: Version,
}

#[derive(Clone, Debug)]
pub struct IterateObjectsWithStatus {
    pub project_id: ProjectId,
    pub bucket_name: String,
    pub recursive: bool,
    pub batch_size: usize,
    pub prefix: ObjectKey,
    pub cursor: IterateCursor,
    pub status: ObjectStatus,
    pub include_custom_metadata: bool,
    pub include_system_metadata: bool,
}

impl IterateObjectsWithStatus {
    pub fn new(
        project_id: ProjectId,
        bucket_name: impl Into<String>,
        status: ObjectStatus,
    ) -> Self {
        Self {
            project_id,
            bucket_name: bucket_name.into(),
            recursive: true,
            batch_size: DEFAULT_BATCH_SIZE,
            prefix: ObjectKey::default(),
            cursor: IterateCursor::default(),
            status,
            include_custom_metadata: true,
            include_system_metadata: true,
        }
    }

    fn verify(&self) -> MetabaseResult<()> {
        if self.project_id.is_nil() {
            return Err(MetabaseError::invalid("ProjectID missing"));
        }
        if self.bucket_name.is_empty() {
            return Err(MetabaseError::invalid("BucketName missing"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct IteratePendingObjectsByKey {
    pub location: ObjectLocation,
    pub batch_size: usize,
    /// Exclusive lower bound on stream id.
    pub cursor: StreamId,
}

/// One listing result. Keys are relative to the listing prefix; in
/// non-recursive mode `is_prefix` entries stand for every key below them.
///
/// System fields are zero/absent unless system metadata was requested, and
/// `encrypted_metadata` is absent unless custom metadata was requested.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectEntry {
    pub is_prefix: bool,
    pub object_key: ObjectKey,
    pub version: Version,
    pub stream_id: StreamId,
    pub status: ObjectStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub segment_count: i32,
    pub total_plain_size: i64,
    pub total_encrypted_size: i64,
    pub fixed_segment_size: i32,
    pub encryption: EncryptionParameters,
    pub encrypted_metadata: Option<EncryptedMetadata>,
}

#[derive(FromRow, Debug)]
struct EntryRow {
    object_key: ObjectKey,
    version: Version,
    stream_id: StreamId,
    status: ObjectStatus,
    created_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    segment_count: i32,
    total_plain_size: i64,
    total_encrypted_size: i64,
    fixed_segment_size: i32,
    encryption: i64,
    encrypted_metadata_nonce: Option<Vec<u8>>,
    encrypted_metadata: Option<Vec<u8>>,
    encrypted_metadata_encrypted_key: Option<Vec<u8>>,
}

impl EntryRow {
    fn into_entry(self, object_key: ObjectKey) -> ObjectEntry {
        let encrypted_metadata = match (
            self.encrypted_metadata,
            self.encrypted_metadata_nonce,
            self.encrypted_metadata_encrypted_key,
        ) {
            (Some(encrypted_metadata), Some(nonce), Some(encrypted_key)) => Some(EncryptedMetadata {
                encrypted_metadata,
                nonce,
                encrypted_key,
            }),
            _ => None,
        };
        ObjectEntry {
            is_prefix: false,
            object_key,
            version: self.version,
            stream_id: self.stream_id,
            status: self.status,
            created_at: self.created_at,
            expires_at: self.expires_at,
            segment_count: self.segment_count,
            total_plain_size: self.total_plain_size,
            total_encrypted_size: self.total_encrypted_size,
            fixed_segment_size: self.fixed_segment_size,
            encryption: EncryptionParameters::unpack(self.encryption),
            encrypted_metadata,
        }
    }
}

/// Column list for listing queries, with unrequested fields replaced by
/// constants so they are never read from disk.
fn entry_columns(custom: bool, system: bool) -> String {
    let mut columns = vec!["object_key", "version", "stream_id", "status"];
    if system {
        columns.extend([
            "created_at",
            "expires_at",
            "segment_count",
            "total_plain_size",
            "total_encrypted_size",
            "fixed_segment_size",
            "encryption",
        ]);
    } else {
        columns.extend([
            "NULL AS created_at",
            "NULL AS expires_at",
            "0 AS segment_count",
            "0 AS total_plain_size",
            "0 AS total_encrypted_size",
            "0 AS fixed_segment_size",
            "0 AS encryption",
        ]);
    }
    if custom {
        columns.extend([
            "encrypted_metadata_nonce",
            "encrypted_metadata",
            "encrypted_metadata_encrypted_key",
        ]);
    } else {
        columns.extend([
            "NULL AS encrypted_metadata_nonce",
            "NULL AS encrypted_metadata",
            "NULL AS encrypted_metadata_encrypted_key",
        ]);
    }
    columns.join(", ")
}

/// Lazy listing of all versions of a bucket, fetched in batches.
pub struct ObjectsIterator<'a> {
    metabase: &'a Metabase,
    opts: IterateObjectsWithStatus,
    columns: String,
    upper: Option<Vec<u8>>,
    cursor: IterateCursor,
    buffer: VecDeque<EntryRow>,
    exhausted: bool,
}

impl ObjectsIterator<'_> {
    /// Next entry, or `None` once the listing is complete.
    pub async fn next(&mut self) -> MetabaseResult<Option<ObjectEntry>> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                self.cursor = IterateCursor {
                    key: row.object_key.clone(),
                    version: row.version,
                };
                let prefix_len = self.opts.prefix.0.len();
                let relative = ObjectKey(row.object_key.0[prefix_len..].to_vec());

                if !self.opts.recursive {
                    if let Some(collapsed) = common_prefix(&relative.0) {
                        self.skip_collapsed(collapsed);
                        let mut entry = row.into_entry(ObjectKey(collapsed.to_vec()));
                        entry.is_prefix = true;
                        return Ok(Some(entry));
                    }
                }
                return Ok(Some(row.into_entry(relative)));
            }

            if self.exhausted {
                return Ok(None);
            }
            self.fetch_batch().await?;
        }
    }

    /// A cursor below a collapsed prefix means that prefix was already
    /// returned, so resume after every key under it.
    fn resume_after_prefix(&mut self) {
        if self.opts.recursive {
            return;
        }
        let Some(relative) = self.cursor.key.0.strip_prefix(self.opts.prefix.0.as_slice()) else {
            return;
        };
        if let Some(collapsed) = common_prefix(relative) {
            let collapsed = collapsed.to_vec();
            self.skip_collapsed(&collapsed);
        }
    }

    /// Drop buffered keys under a just-emitted prefix and move the cursor
    /// past it when the buffer runs dry.
    fn skip_collapsed(&mut self, collapsed: &[u8]) {
        let mut full = self.opts.prefix.0.clone();
        full.extend_from_slice(collapsed);

        while self
            .buffer
            .front()
            .is_some_and(|row| row.object_key.0.starts_with(&full))
        {
            self.buffer.pop_front();
        }
        if self.buffer.is_empty() {
            match prefix_limit(&full) {
                // versions start at 1, so (limit, 0) is just before the limit key
                Some(limit) => {
                    self.cursor = IterateCursor {
                        key: ObjectKey(limit),
                        version: 0,
                    }
                }
                None => self.exhausted = true,
            }
        }
    }

    async fn fetch_batch(&mut self) -> MetabaseResult<()> {
        let batch_size = self.opts.batch_size;
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT ");
        builder.push(&self.columns);
        builder.push(" FROM objects WHERE project_id = ");
        builder.push_bind(self.opts.project_id);
        builder.push(" AND bucket_name = ");
        builder.push_bind(self.opts.bucket_name.clone());
        builder.push(" AND status = ");
        builder.push_bind(self.opts.status);
        builder.push(" AND object_key >= ");
        builder.push_bind(self.opts.prefix.clone());
        if let Some(upper) = &self.upper {
            builder.push(" AND object_key < ");
            builder.push_bind(upper.clone());
        }
        builder.push(" AND (object_key, version) > (");
        builder.push_bind(self.cursor.key.clone());
        builder.push(", ");
        builder.push_bind(self.cursor.version);
        builder.push(") ORDER BY object_key, version LIMIT ");
        builder.push_bind(batch_size as i64);

        let rows = builder
            .build_query_as::<EntryRow>()
            .fetch_all(&*self.metabase.db)
            .await
            .op("iterate objects")
            .inspect_err(|err| err.log_internal("iterate objects", None))?;

        self.exhausted = rows.len() < batch_size;
        self.buffer.extend(rows);
        Ok(())
    }
}

/// Lazy listing of pending uploads of one key, ordered by stream id.
pub struct PendingObjectsIterator<'a> {
    metabase: &'a Metabase,
    opts: IteratePendingObjectsByKey,
    buffer: VecDeque<EntryRow>,
    exhausted: bool,
}

impl PendingObjectsIterator<'_> {
    pub async fn next(&mut self) -> MetabaseResult<Option<ObjectEntry>> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                self.opts.cursor = row.stream_id;
                let key = row.object_key.clone();
                return Ok(Some(row.into_entry(key)));
            }
            if self.exhausted {
                return Ok(None);
            }

            let location = &self.opts.location;
            let sql = format!(
                "SELECT {} FROM objects
                 WHERE project_id = ? AND bucket_name = ? AND object_key = ? AND status = ?
                   AND stream_id > ?
                 ORDER BY stream_id LIMIT ?",
                entry_columns(true, true)
            );
            let rows = sqlx::query_as::<_, EntryRow>(&sql)
                .bind(location.project_id)
                .bind(&location.bucket_name)
                .bind(&location.object_key)
                .bind(ObjectStatus::Pending)
                .bind(self.opts.cursor)
                .bind(self.opts.batch_size as i64)
                .fetch_all(&*self.metabase.db)
                .await
                .op("iterate pending objects by key")
                .inspect_err(|err| err.log_internal("iterate pending objects by key", None))?;

            self.exhausted = rows.len() < self.opts.batch_size;
            self.buffer.extend(rows);
        }
    }
}

/// Part of `relative` up to and including the first delimiter.
fn common_prefix(relative: &[u8]) -> Option<&[u8]> {
    relative
        .iter()
        .position(|byte| *byte == DELIMITER)
        .map(|pos| &relative[..=pos])
}

impl Metabase {
    /// List object versions of one status in a bucket.
    pub fn iterate_objects_all_versions_with_status(
        &self,
        mut opts: IterateObjectsWithStatus,
    ) -> MetabaseResult<ObjectsIterator<'_>> {
        opts.verify()?;
        if opts.batch_size == 0 || opts.batch_size > DEFAULT_BATCH_SIZE {
            opts.batch_size = DEFAULT_BATCH_SIZE;
        }

        let upper = if opts.prefix.is_empty() {
            None
        } else {
            prefix_limit(&opts.prefix.0)
        };
        let mut iterator = ObjectsIterator {
            metabase: self,
            columns: entry_columns(opts.include_custom_metadata, opts.include_system_metadata),
            upper,
            cursor: opts.cursor.clone(),
            opts,
            buffer: VecDeque::new(),
            exhausted: false,
        };
        iterator.resume_after_prefix();
        Ok(iterator)
    }

    /// List pending uploads of a single key, for zombie detection.
    pub fn iterate_pending_objects_by_key(
        &self,
        mut opts: IteratePendingObjectsByKey,
    ) -> MetabaseResult<PendingObjectsIterator<'_>> {
        opts.location.verify()?;
        if opts.batch_size == 0 || opts.batch_size > DEFAULT_BATCH_SIZE {
            opts.batch_size = DEFAULT_BATCH_SIZE;
        }
        Ok(PendingObjectsIterator {
            metabase: self,
            opts,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_prefix_stops_at_first_delimiter() {
        assert_eq!(common_prefix(b"a/b/c"), Some(&b"a/"[..]));
        assert_eq!(common_prefix(b"/x"), Some(&b"/"[..]));
        assert_eq!(common_prefix(b"plain"), None);
    }

    #[test]
    fn narrowed_columns_keep_row_shape() {
        let narrow = entry_columns(false, false);
        assert!(narrow.contains("NULL AS created_at"));
        assert!(narrow.contains("NULL AS encrypted_metadata,"));
        let full = entry_columns(true, true);
        assert!(!full.contains("NULL"));
        assert_eq!(narrow.split(", ").count(), full.split(", ").count());
    }
}
