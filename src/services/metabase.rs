//! The `Metabase` handle and helpers shared by every operation.
//!
//! Operations are grouped by concern in sibling modules, each adding an
//! `impl Metabase` block. Every mutating operation runs in a single SQLite
//! transaction; reads go through [`Metabase::resolve_segments`] so copy
//! segments are always resolved against their ancestor the same way.

use crate::{
    config::MetabaseConfig,
    errors::{MetabaseError, MetabaseResult, StorageContext},
    models::{
        ObjectStatus, ObjectStream, PieceId, Pieces, Segment, SegmentPosition, StreamId,
        object::{OBJECT_COLUMNS, ObjectRow},
        segment::SegmentRow,
    },
    services::aliases::NodeAliasCache,
};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool, Transaction, pool::PoolConnection, sqlite::Sqlite};
use std::{collections::HashMap, sync::Arc};

/// Object/segment metadata engine backed by SQLite.
#[derive(Clone)]
pub struct Metabase {
    /// Shared SQLite connection pool used for all metadata operations.
    pub db: Arc<SqlitePool>,
    aliases: Arc<NodeAliasCache>,
    config: MetabaseConfig,
}

impl Metabase {
    pub fn new(db: Arc<SqlitePool>, config: MetabaseConfig) -> Self {
        tracing::info!(
            application = %config.application_name,
            min_part_size = config.min_part_size,
            max_number_of_parts = config.max_number_of_parts,
            server_side_copy = config.server_side_copy,
            "metabase initialized"
        );
        Self {
            aliases: Arc::new(NodeAliasCache::new(db.clone())),
            db,
            config,
        }
    }

    pub fn config(&self) -> &MetabaseConfig {
        &self.config
    }

    pub fn aliases(&self) -> &NodeAliasCache {
        &self.aliases
    }

    pub(crate) async fn acquire(&self) -> MetabaseResult<PoolConnection<Sqlite>> {
        self.db.acquire().await.op("acquire connection")
    }

    /// Open a transaction that holds the write lock from its first statement.
    ///
    /// A deferred transaction that reads and then writes fails with
    /// SQLITE_BUSY when another writer committed since its read, without
    /// waiting on the busy timeout. Taking the lock at BEGIN makes writers
    /// queue on the busy timeout instead.
    pub(crate) async fn begin_write(&self) -> MetabaseResult<Transaction<'static, Sqlite>> {
        self.db
            .begin_with("BEGIN IMMEDIATE")
            .await
            .op("begin write transaction")
    }

    /// Load one object row by its full identity, optionally filtered by status.
    pub(crate) async fn fetch_object_row(
        conn: &mut SqliteConnection,
        stream: &ObjectStream,
        status: Option<ObjectStatus>,
    ) -> MetabaseResult<Option<ObjectRow>> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE project_id = ? AND bucket_name = ? AND object_key = ? AND version = ?
               AND stream_id = ? AND (? IS NULL OR status = ?)"
        );
        sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(stream.project_id)
            .bind(&stream.bucket_name)
            .bind(&stream.object_key)
            .bind(stream.version)
            .bind(stream.stream_id)
            .bind(status)
            .bind(status)
            .fetch_optional(&mut *conn)
            .await
            .op("fetch object")
    }

    /// Stream the given copy stream points at, if it is a copy.
    pub(crate) async fn ancestor_of(
        conn: &mut SqliteConnection,
        stream_id: StreamId,
    ) -> MetabaseResult<Option<StreamId>> {
        sqlx::query_scalar::<_, StreamId>(
            "SELECT ancestor_stream_id FROM segment_copies WHERE stream_id = ?",
        )
        .bind(stream_id)
        .fetch_optional(&mut *conn)
        .await
        .op("fetch ancestor stream")
    }

    /// Turn raw segment rows into public views.
    ///
    /// A row whose pieces live in the ancestor triggers exactly one dependent
    /// read of the ancestor segment at the same position, which provides the
    /// root piece id, repair time and pieces. Chains are one level deep, so
    /// the ancestor row always holds its own pieces.
    pub(crate) async fn resolve_segments(
        &self,
        conn: &mut SqliteConnection,
        rows: Vec<SegmentRow>,
    ) -> MetabaseResult<Vec<Segment>> {
        let mut ancestors: HashMap<StreamId, Option<StreamId>> = HashMap::new();
        let mut segments = Vec::with_capacity(rows.len());

        for mut row in rows {
            if self.config.server_side_copy && row.pieces_in_ancestor_segment() {
                let ancestor = match ancestors.get(&row.stream_id) {
                    Some(ancestor) => *ancestor,
                    None => {
                        let ancestor = Self::ancestor_of(conn, row.stream_id).await?;
                        ancestors.insert(row.stream_id, ancestor);
                        ancestor
                    }
                };
                let ancestor = ancestor.ok_or_else(|| {
                    MetabaseError::Corrupted(format!(
                        "segment {} of stream {} has no pieces and no ancestor",
                        row.position(),
                        row.stream_id
                    ))
                })?;
                let (root_piece_id, repaired_at, remote_alias_pieces) =
                    Self::fetch_ancestor_pieces(conn, ancestor, row.position()).await?;
                row.root_piece_id = root_piece_id;
                row.repaired_at = repaired_at;
                row.remote_alias_pieces = remote_alias_pieces;
            }

            let pieces = self.alias_pieces_of(conn, &row).await?;
            segments.push(row.into_segment(pieces));
        }

        Ok(segments)
    }

    async fn fetch_ancestor_pieces(
        conn: &mut SqliteConnection,
        ancestor: StreamId,
        position: SegmentPosition,
    ) -> MetabaseResult<(PieceId, Option<DateTime<Utc>>, Option<Vec<u8>>)> {
        sqlx::query_as::<_, (PieceId, Option<DateTime<Utc>>, Option<Vec<u8>>)>(
            "SELECT root_piece_id, repaired_at, remote_alias_pieces
             FROM segments WHERE stream_id = ? AND position = ?",
        )
        .bind(ancestor)
        .bind(position.to_db())
        .fetch_optional(&mut *conn)
        .await
        .op("fetch ancestor segment")?
        .ok_or_else(|| {
            MetabaseError::Corrupted(format!(
                "ancestor {} has no segment at position {}",
                ancestor, position
            ))
        })
    }

    pub(crate) async fn alias_pieces_of(
        &self,
        conn: &mut SqliteConnection,
        row: &SegmentRow,
    ) -> MetabaseResult<Pieces> {
        let aliases = row.alias_pieces()?;
        if aliases.is_empty() {
            return Ok(Pieces::default());
        }
        self.aliases.convert_aliases_to_pieces(conn, &aliases).await
    }
}

/// Current time, truncated to microseconds so values survive a round trip
/// through the TEXT columns unchanged.
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}
