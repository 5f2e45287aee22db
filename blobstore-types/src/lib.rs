//! Shared identifiers, wire-adjacent value types and the error taxonomy used by
//! the blob storage backend.
//!
//! This crate intentionally carries no I/O, no locking, and no selector or
//! pipeline logic — it is the small, dependency-light "vocabulary" crate that
//! both the chunk selector and the blob pipeline build on.

pub mod chunk;
pub mod error;
pub mod ids;

pub use chunk::{AllocHints, ChunkState, MultiBlkId};
pub use error::{BlobError, BlobErrorKind};
pub use ids::{BlobId, PChunkId, PdevId, PgId, ShardId, TaskId, VChunkId};
