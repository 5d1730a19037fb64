//! Data model of the metadata engine.
//!
//! Each persisted table has an internal row type (`*Row`, `sqlx::FromRow`)
//! and a public read-only view connected by an explicit conversion. Views
//! serialize with `serde` for the operations surface.

pub mod ids;
pub mod object;
pub mod pieces;
pub mod segment;

pub use ids::{NodeId, ObjectKey, PieceId, ProjectId, StreamId};
pub use object::{
    EncryptedMetadata, EncryptionParameters, NEXT_VERSION, Object, ObjectLocation, ObjectStatus,
    ObjectStream, Version,
};
pub use pieces::{AliasPiece, AliasPieces, NodeAlias, Piece, Pieces};
pub use segment::{DeletedSegmentInfo, RedundancyScheme, Segment, SegmentPosition};
