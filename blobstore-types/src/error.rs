//! Error taxonomy for the blob pipeline.
//!
//! Mirrors the shape of `BlockReadError`/`TapeLockError` in the teacher: a
//! `thiserror`-derived enum at the component boundary, one variant per
//! client-meaningful failure mode, with `#[from]` used only where the
//! conversion is lossless. Internal invariant violations inside the chunk
//! selector are reported as `anyhow::Error` instead — they indicate a bug,
//! not a condition a caller can act on.

use thiserror::Error;

use crate::ids::PgId;

/// Discriminant used by callers that want to branch on failure kind without
/// matching the full [`BlobError`] (e.g. to decide whether a retry is safe).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobErrorKind {
    ShuttingDown,
    NotLeader,
    RetryRequest,
    Timeout,
    ChecksumMismatch,
    ReadFailed,
    InvalidArg,
    IndexError,
    UnknownPg,
    UnknownShard,
    UnknownBlob,
    NoSpaceLeft,
    ReplicationError,
    UnsupportedOp,
    RollBack,
    Unknown,
}

/// Error returned by the blob PUT/GET/DELETE API.
///
/// Each variant corresponds to one `BlobErrorCode` reached by `toBlobError()`
/// in the original backend; the mapping from the replication engine's own
/// error space happens once, at the call site, rather than being re-derived
/// by every caller.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("node is shutting down")]
    ShuttingDown,

    #[error("not the leader for this shard{}", .current_leader.map(|id| format!(" (current leader: {id})")).unwrap_or_default())]
    NotLeader { current_leader: Option<u64> },

    #[error("request should be retried")]
    RetryRequest,

    #[error("request timed out")]
    Timeout,

    #[error("checksum mismatch reading blob")]
    ChecksumMismatch,

    #[error("read from storage failed: {0}")]
    ReadFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("index operation failed: {0}")]
    IndexError(String),

    #[error("unknown placement group {0:?}")]
    UnknownPg(PgId),

    #[error("unknown shard {0:#x}")]
    UnknownShard(u64),

    #[error("unknown blob {0:#x}")]
    UnknownBlob(u64),

    #[error("no space left on device")]
    NoSpaceLeft,

    #[error("replication error: {0}")]
    ReplicationError(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOp(String),

    #[error("request was rolled back")]
    RollBack,

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl BlobError {
    pub fn kind(&self) -> BlobErrorKind {
        match self {
            BlobError::ShuttingDown => BlobErrorKind::ShuttingDown,
            BlobError::NotLeader { .. } => BlobErrorKind::NotLeader,
            BlobError::RetryRequest => BlobErrorKind::RetryRequest,
            BlobError::Timeout => BlobErrorKind::Timeout,
            BlobError::ChecksumMismatch => BlobErrorKind::ChecksumMismatch,
            BlobError::ReadFailed(_) => BlobErrorKind::ReadFailed,
            BlobError::InvalidArg(_) => BlobErrorKind::InvalidArg,
            BlobError::IndexError(_) => BlobErrorKind::IndexError,
            BlobError::UnknownPg(_) => BlobErrorKind::UnknownPg,
            BlobError::UnknownShard(_) => BlobErrorKind::UnknownShard,
            BlobError::UnknownBlob(_) => BlobErrorKind::UnknownBlob,
            BlobError::NoSpaceLeft => BlobErrorKind::NoSpaceLeft,
            BlobError::ReplicationError(_) => BlobErrorKind::ReplicationError,
            BlobError::UnsupportedOp(_) => BlobErrorKind::UnsupportedOp,
            BlobError::RollBack => BlobErrorKind::RollBack,
            BlobError::Unknown(_) => BlobErrorKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_formats_hint_when_present() {
        let err = BlobError::NotLeader {
            current_leader: Some(7),
        };
        assert_eq!(err.to_string(), "not the leader for this shard (current leader: 7)");
        assert_eq!(err.kind(), BlobErrorKind::NotLeader);
    }

    #[test]
    fn not_leader_omits_hint_when_absent() {
        let err = BlobError::NotLeader {
            current_leader: None,
        };
        assert_eq!(err.to_string(), "not the leader for this shard");
    }
}
