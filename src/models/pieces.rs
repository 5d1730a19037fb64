//! Piece placements and their compact alias encoding.

use crate::{
    errors::{MetabaseError, MetabaseResult},
    models::ids::NodeId,
};
use serde::{Deserialize, Serialize};

/// One erasure-coded share of a segment, placed on one storage node.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct Piece {
    pub number: u16,
    pub storage_node: NodeId,
}

/// Pieces of a remote segment, ordered by piece number.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
pub struct Pieces(pub Vec<Piece>);

impl Pieces {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Piece> {
        self.0.iter()
    }

    /// Check the caller contract for piece lists.
    ///
    /// Pieces are not sorted here: out-of-order input is rejected so client
    /// bugs surface at upload time.
    pub fn verify(&self) -> MetabaseResult<()> {
        if self.0.is_empty() {
            return Err(MetabaseError::invalid("pieces missing"));
        }

        let mut previous: Option<u16> = None;
        for piece in &self.0 {
            if piece.storage_node.is_zero() {
                return Err(MetabaseError::invalid(format!(
                    "piece number {} is missing storage node id",
                    piece.number
                )));
            }
            if let Some(prev) = previous {
                if prev == piece.number {
                    return Err(MetabaseError::invalid(format!(
                        "duplicated piece number {}",
                        piece.number
                    )));
                }
                if prev > piece.number {
                    return Err(MetabaseError::invalid("pieces should be ordered"));
                }
            }
            previous = Some(piece.number);
        }
        Ok(())
    }
}

impl From<Vec<Piece>> for Pieces {
    fn from(value: Vec<Piece>) -> Self {
        Self(value)
    }
}

/// Compact integer substitute for a [`NodeId`].
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeAlias(pub i64);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AliasPiece {
    pub number: u16,
    pub alias: NodeAlias,
}

/// Piece list as persisted in `segments.remote_alias_pieces`.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct AliasPieces(pub Vec<AliasPiece>);

const ALIAS_PIECES_VERSION: u8 = 1;

impl AliasPieces {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode as `version || (varint number, varint alias)*`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.0.len() * 3);
        out.push(ALIAS_PIECES_VERSION);
        for piece in &self.0 {
            put_uvarint(&mut out, u64::from(piece.number));
            put_uvarint(&mut out, piece.alias.0 as u64);
        }
        out
    }

    pub fn decode(data: &[u8]) -> MetabaseResult<Self> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        if data[0] != ALIAS_PIECES_VERSION {
            return Err(MetabaseError::Corrupted(format!(
                "unknown alias pieces version {}",
                data[0]
            )));
        }

        let mut pieces = Vec::new();
        let mut rest = &data[1..];
        while !rest.is_empty() {
            let (number, tail) = take_uvarint(rest)?;
            let (alias, tail) = take_uvarint(tail)?;
            let number = u16::try_from(number).map_err(|_| {
                MetabaseError::Corrupted(format!("piece number {} out of range", number))
            })?;
            pieces.push(AliasPiece {
                number,
                alias: NodeAlias(alias as i64),
            });
            rest = tail;
        }
        Ok(Self(pieces))
    }
}

fn put_uvarint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn take_uvarint(data: &[u8]) -> MetabaseResult<(u64, &[u8])> {
    let mut value = 0u64;
    for (i, byte) in data.iter().enumerate() {
        if i >= 10 {
            break;
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, &data[i + 1..]));
        }
    }
    Err(MetabaseError::Corrupted("truncated alias pieces".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(b: u8) -> NodeId {
        NodeId([b; 32])
    }

    #[test]
    fn verify_rejects_bad_piece_lists() {
        let empty = Pieces::default();
        assert!(matches!(
            empty.verify(),
            Err(MetabaseError::InvalidRequest(_))
        ));

        let zero_node = Pieces(vec![Piece {
            number: 0,
            storage_node: NodeId::default(),
        }]);
        assert!(zero_node.verify().is_err());

        let duplicated = Pieces(vec![
            Piece {
                number: 1,
                storage_node: node(1),
            },
            Piece {
                number: 1,
                storage_node: node(2),
            },
        ]);
        let err = duplicated.verify().unwrap_err();
        assert!(err.to_string().contains("duplicated piece number 1"));

        let unordered = Pieces(vec![
            Piece {
                number: 2,
                storage_node: node(1),
            },
            Piece {
                number: 1,
                storage_node: node(2),
            },
        ]);
        let err = unordered.verify().unwrap_err();
        assert!(err.to_string().contains("ordered"));
    }

    #[test]
    fn alias_pieces_encoding_is_compact() {
        let pieces = AliasPieces(vec![
            AliasPiece {
                number: 0,
                alias: NodeAlias(1),
            },
            AliasPiece {
                number: 300,
                alias: NodeAlias(70_000),
            },
        ]);
        let encoded = pieces.encode();
        assert_eq!(encoded.len(), 1 + 2 + 2 + 3);
        assert_eq!(AliasPieces::decode(&encoded).unwrap(), pieces);
    }

    #[test]
    fn alias_pieces_decode_rejects_garbage() {
        assert!(AliasPieces::decode(&[]).unwrap().is_empty());
        assert!(matches!(
            AliasPieces::decode(&[9, 1, 1]),
            Err(MetabaseError::Corrupted(_))
        ));
        assert!(matches!(
            AliasPieces::decode(&[1, 0x80]),
            Err(MetabaseError::Corrupted(_))
        ));
    }
}
