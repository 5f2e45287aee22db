//! Chunk lifecycle state and the small value types exchanged across the
//! chunk-selector / replication-engine boundary.

use serde::{Deserialize, Serialize};

use crate::ids::PChunkId;

/// Lifecycle state of a physical chunk. Mirrors the original `ENUM(ChunkState,
/// uint8_t, AVAILABLE = 0, INUSE, GC)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
    /// Unbound (eligible for PG formation) or bound-and-unused (eligible for
    /// shard allocation within its PG).
    Available,
    /// Currently backing an open shard.
    InUse,
    /// Reserved by the garbage collector; not selectable.
    Gc,
}

/// One or more contiguous block ranges referring to on-device storage.
///
/// A single allocation is the common case; GC or future erasure-coding variants
/// may split storage for one blob across more than one range, so this is kept
/// as a small vector rather than a single `(blk_num, blk_count)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiBlkId {
    pub blk_num: u64,
    pub blk_count: u32,
}

impl MultiBlkId {
    pub const fn new(blk_num: u64, blk_count: u32) -> Self {
        MultiBlkId { blk_num, blk_count }
    }

    /// Sentinel value marking a deleted blob's index entry. Chosen so it can
    /// never collide with a real allocation (`blk_count == 0`).
    pub const fn tombstone() -> Self {
        MultiBlkId {
            blk_num: u64::MAX,
            blk_count: 0,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        *self == Self::tombstone()
    }
}

/// Hints passed down to `select_chunk`/`get_blk_alloc_hints` so the allocator
/// can honor an already-chosen chunk (replication replay) or a preferred device.
#[derive(Debug, Clone, Default)]
pub struct AllocHints {
    pub chunk_id_hint: Option<PChunkId>,
    pub pdev_id_hint: Option<crate::ids::PdevId>,
    pub reserved_blks: Option<u32>,
    pub committed_blk_id: Option<MultiBlkId>,
}
