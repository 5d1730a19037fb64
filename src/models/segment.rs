//! Segments: per-position slices of an object's plaintext.

use crate::{
    errors::{MetabaseError, MetabaseResult},
    models::{
        ids::{PieceId, StreamId},
        pieces::{AliasPieces, Pieces},
    },
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Position of a segment inside its stream, ordered by `(part, index)`.
#[derive(
    Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default,
)]
pub struct SegmentPosition {
    pub part: u32,
    pub index: u32,
}

impl SegmentPosition {
    /// Highest part number whose encoded position stays a positive `i64`,
    /// keeping SQL ordering equal to `(part, index)` ordering.
    pub const MAX_PART: u32 = i32::MAX as u32;

    pub fn new(part: u32, index: u32) -> Self {
        Self { part, index }
    }

    pub fn verify(&self) -> MetabaseResult<()> {
        if self.part > Self::MAX_PART {
            return Err(MetabaseError::invalid(format!(
                "Position part {} exceeds {}",
                self.part,
                Self::MAX_PART
            )));
        }
        Ok(())
    }

    /// Single ordered integer `part << 32 | index`.
    pub fn encode(&self) -> u64 {
        (u64::from(self.part) << 32) | u64::from(self.index)
    }

    pub fn decode(value: u64) -> Self {
        Self {
            part: (value >> 32) as u32,
            index: value as u32,
        }
    }

    /// Value stored in the `position` column.
    pub(crate) fn to_db(self) -> i64 {
        self.encode() as i64
    }

    pub(crate) fn from_db(value: i64) -> Self {
        Self::decode(value as u64)
    }
}

impl fmt::Display for SegmentPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.part, self.index)
    }
}

/// Erasure-coding parameters of a remote segment. The zero value marks an
/// inline segment.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct RedundancyScheme {
    pub algorithm: u8,
    pub share_size: i32,
    pub required_shares: i16,
    pub repair_shares: i16,
    pub optimal_shares: i16,
    pub total_shares: i16,
}

impl RedundancyScheme {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Pack into one integer: algorithm (8 bits), share size (24 bits) and
    /// one byte per share count.
    pub fn pack(&self) -> i64 {
        let packed = (u64::from(self.algorithm) << 56)
            | ((self.share_size as u64 & 0xff_ffff) << 32)
            | ((self.required_shares as u64 & 0xff) << 24)
            | ((self.repair_shares as u64 & 0xff) << 16)
            | ((self.optimal_shares as u64 & 0xff) << 8)
            | (self.total_shares as u64 & 0xff);
        packed as i64
    }

    pub fn unpack(value: i64) -> Self {
        let value = value as u64;
        Self {
            algorithm: (value >> 56) as u8,
            share_size: ((value >> 32) & 0xff_ffff) as i32,
            required_shares: ((value >> 24) & 0xff) as i16,
            repair_shares: ((value >> 16) & 0xff) as i16,
            optimal_shares: ((value >> 8) & 0xff) as i16,
            total_shares: (value & 0xff) as i16,
        }
    }
}

/// Public read-only view of a segment with pieces already resolved to
/// storage nodes, through the ancestor when the segment is a copy.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Segment {
    pub stream_id: StreamId,
    pub position: SegmentPosition,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub repaired_at: Option<DateTime<Utc>>,
    pub root_piece_id: PieceId,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub encrypted_size: i32,
    pub plain_offset: i64,
    pub plain_size: i32,
    pub encrypted_etag: Option<Vec<u8>>,
    pub redundancy: RedundancyScheme,
    pub inline_data: Bytes,
    pub pieces: Pieces,
}

impl Segment {
    pub fn inline(&self) -> bool {
        self.redundancy.is_zero() && self.pieces.is_empty()
    }

    pub fn pieces_in_ancestor_segment(&self) -> bool {
        self.encrypted_size != 0 && self.inline_data.is_empty() && self.pieces.is_empty()
    }
}

/// Pieces of a removed segment that no surviving stream references anymore.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct DeletedSegmentInfo {
    pub root_piece_id: PieceId,
    pub pieces: Pieces,
}

/// Column list matching [`SegmentRow`].
pub(crate) const SEGMENT_COLUMNS: &str = "stream_id, position, created_at, expires_at, \
     repaired_at, root_piece_id, encrypted_key_nonce, encrypted_key, encrypted_size, \
     plain_offset, plain_size, encrypted_etag, redundancy, inline_data, remote_alias_pieces";

/// Raw `segments` row as stored.
#[derive(FromRow, Debug, Clone)]
pub(crate) struct SegmentRow {
    pub stream_id: StreamId,
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub repaired_at: Option<DateTime<Utc>>,
    pub root_piece_id: PieceId,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub encrypted_size: i32,
    pub plain_offset: i64,
    pub plain_size: i32,
    pub encrypted_etag: Option<Vec<u8>>,
    pub redundancy: i64,
    pub inline_data: Option<Vec<u8>>,
    pub remote_alias_pieces: Option<Vec<u8>>,
}

impl SegmentRow {
    pub fn position(&self) -> SegmentPosition {
        SegmentPosition::from_db(self.position)
    }

    pub fn alias_pieces(&self) -> MetabaseResult<AliasPieces> {
        match &self.remote_alias_pieces {
            Some(data) => AliasPieces::decode(data),
            None => Ok(AliasPieces::default()),
        }
    }

    pub fn has_inline_data(&self) -> bool {
        self.inline_data.as_ref().is_some_and(|data| !data.is_empty())
    }

    pub fn has_local_pieces(&self) -> bool {
        self.remote_alias_pieces
            .as_ref()
            .is_some_and(|data| data.len() > 1)
    }

    /// True for copy segments whose pieces live in the ancestor stream.
    pub fn pieces_in_ancestor_segment(&self) -> bool {
        self.encrypted_size != 0 && !self.has_inline_data() && !self.has_local_pieces()
    }

    /// Build the public view once pieces are resolved.
    pub fn into_segment(self, pieces: Pieces) -> Segment {
        Segment {
            stream_id: self.stream_id,
            position: SegmentPosition::from_db(self.position),
            created_at: self.created_at,
            expires_at: self.expires_at,
            repaired_at: self.repaired_at,
            root_piece_id: self.root_piece_id,
            encrypted_key_nonce: self.encrypted_key_nonce,
            encrypted_key: self.encrypted_key,
            encrypted_size: self.encrypted_size,
            plain_offset: self.plain_offset,
            plain_size: self.plain_size,
            encrypted_etag: self.encrypted_etag,
            redundancy: RedundancyScheme::unpack(self.redundancy),
            inline_data: Bytes::from(self.inline_data.unwrap_or_default()),
            pieces,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_encoding_preserves_order() {
        let positions = [
            SegmentPosition::new(0, 0),
            SegmentPosition::new(0, 1),
            SegmentPosition::new(0, u32::MAX),
            SegmentPosition::new(1, 0),
            SegmentPosition::new(7, 3),
        ];
        for pair in positions.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].to_db() < pair[1].to_db());
        }
        assert_eq!(SegmentPosition::new(2, 5).encode(), (2u64 << 32) | 5);
        let position = SegmentPosition::new(2, 5);
        assert_eq!(SegmentPosition::from_db(position.to_db()), position);
    }

    #[test]
    fn parts_beyond_signed_range_are_rejected() {
        let last = SegmentPosition::new(SegmentPosition::MAX_PART, u32::MAX);
        assert!(last.verify().is_ok());
        assert!(last.to_db() > SegmentPosition::new(1, 0).to_db());

        let err = SegmentPosition::new(SegmentPosition::MAX_PART + 1, 0)
            .verify()
            .unwrap_err();
        assert!(matches!(err, MetabaseError::InvalidRequest(_)));
    }

    #[test]
    fn redundancy_pack_keeps_share_counts() {
        let rs = RedundancyScheme {
            algorithm: 1,
            share_size: 256 * 1024,
            required_shares: 29,
            repair_shares: 35,
            optimal_shares: 80,
            total_shares: 110,
        };
        assert_eq!(RedundancyScheme::unpack(rs.pack()), rs);
        assert!(RedundancyScheme::unpack(0).is_zero());
    }
}
