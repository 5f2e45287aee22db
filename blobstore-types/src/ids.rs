//! Newtype identifiers threaded between the chunk selector and the blob pipeline.

use serde::{Deserialize, Serialize};

/// Number of low bits of a [`ShardId`] reserved for the shard-local sequence;
/// the remaining high bits carry the owning [`PgId`]. Mirrors the original
/// `shard_width`/`shard_mask` split.
pub const SHARD_WIDTH: u32 = 48;

/// Process-wide unique id of a physical chunk on some device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PChunkId(pub u64);

/// Dense, PG-local index into a PG's chunk collection. Stable across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VChunkId(pub u32);

/// Physical device identifier; chunks co-located on one device share a `PdevId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PdevId(pub u32);

/// Placement group id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PgId(pub u16);

/// Client-visible blob id, unique within a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId(pub u64);

/// Caller-supplied id for long-running GC tasks, passed through to the selector
/// so log lines and invariant-violation messages can be correlated with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

/// Shard identifier: packs the owning [`PgId`] into the high bits and a
/// shard-local sequence number into the low [`SHARD_WIDTH`] bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u64);

impl ShardId {
    pub fn new(pg_id: PgId, shard_local_id: u64) -> Self {
        ShardId(((pg_id.0 as u64) << SHARD_WIDTH) | shard_local_id)
    }

    pub fn pg_id(self) -> PgId {
        PgId((self.0 >> SHARD_WIDTH) as u16)
    }

    pub fn shard_local_id(self) -> u64 {
        self.0 & ((1u64 << SHARD_WIDTH) - 1)
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_id_round_trips_pg_and_local_id() {
        let id = ShardId::new(PgId(1), 1);
        assert_eq!(id.pg_id(), PgId(1));
        assert_eq!(id.shard_local_id(), 1);
        assert_eq!(id.0, 0x0001_0000_0000_0001);
    }
}
