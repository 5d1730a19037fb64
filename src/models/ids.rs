//! Fixed-width identifiers and byte-string keys stored as SQLite BLOBs.

use serde::{Deserialize, Serialize};
use sqlx::{
    Database, Decode, Encode,
    encode::IsNull,
    error::BoxDynError,
    sqlite::{Sqlite, SqliteTypeInfo, SqliteValueRef},
};
use std::fmt;
use uuid::Uuid;

/// Identifies one object instance (the segments of one version).
pub type StreamId = Uuid;

/// Identifies the project that owns a bucket.
pub type ProjectId = Uuid;

/// Full identifier of a storage node.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub [u8; 32]);

/// Root piece identifier from which every piece id of a segment is derived.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PieceId(pub [u8; 32]);

/// Encrypted object key. Keys are arbitrary bytes and are ordered bytewise.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectKey(pub Vec<u8>);

impl NodeId {
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn from_blob(bytes: &[u8]) -> Result<Self, BoxDynError> {
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("node id must be 32 bytes, got {}", bytes.len()))?;
        Ok(Self(raw))
    }
}

impl PieceId {
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn from_blob(bytes: &[u8]) -> Result<Self, BoxDynError> {
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("piece id must be 32 bytes, got {}", bytes.len()))?;
        Ok(Self(raw))
    }
}

impl ObjectKey {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn from_blob(bytes: &[u8]) -> Result<Self, BoxDynError> {
        Ok(Self(bytes.to_vec()))
    }
}

impl From<&str> for ObjectKey {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for ObjectKey {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl fmt::Display for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceId({})", self)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Store a byte-backed newtype as a BLOB column.
macro_rules! blob_column {
    ($name:ident) => {
        impl sqlx::Type<Sqlite> for $name {
            fn type_info() -> SqliteTypeInfo {
                <Vec<u8> as sqlx::Type<Sqlite>>::type_info()
            }

            fn compatible(ty: &SqliteTypeInfo) -> bool {
                <Vec<u8> as sqlx::Type<Sqlite>>::compatible(ty)
            }
        }

        impl<'q> Encode<'q, Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut <Sqlite as Database>::ArgumentBuffer<'q>,
            ) -> Result<IsNull, BoxDynError> {
                <Vec<u8> as Encode<'q, Sqlite>>::encode(self.as_bytes().to_vec(), buf)
            }
        }

        impl<'r> Decode<'r, Sqlite> for $name {
            fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
                let bytes = <&[u8] as Decode<'r, Sqlite>>::decode(value)?;
                Self::from_blob(bytes)
            }
        }
    };
}

blob_column!(NodeId);
blob_column!(PieceId);
blob_column!(ObjectKey);

/// Smallest key that is greater than every key starting with `prefix`.
///
/// Returns `None` when no such key exists (empty prefix or all bytes 0xff).
pub fn prefix_limit(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut limit = prefix.to_vec();
    while let Some(last) = limit.pop() {
        if last < u8::MAX {
            limit.push(last + 1);
            return Some(limit);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_limit_increments_last_byte() {
        assert_eq!(prefix_limit(b"a/"), Some(b"a0".to_vec()));
        assert_eq!(prefix_limit(b"ab\xff"), Some(b"ac".to_vec()));
        assert_eq!(prefix_limit(b"\xff\xff"), None);
        assert_eq!(prefix_limit(b""), None);
    }

    #[test]
    fn ids_render_as_hex() {
        let mut raw = [0u8; 32];
        raw[31] = 0xab;
        let node = NodeId(raw);
        assert!(node.to_string().ends_with("ab"));
        assert_eq!(node.to_string().len(), 64);
        assert!(!node.is_zero());
        assert!(NodeId::default().is_zero());
    }
}
