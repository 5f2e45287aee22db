//! PG chunk collection (C3): one placement group's dense, `v_chunk_id`-indexed
//! vector of chunks, plus a heap view over its `AVAILABLE` entries so shard
//! creation can pick the PG-local most-free chunk.
//!
//! Grounded on `heap_chunk_selector.h`'s `PGChunkCollection` (`m_pg_chunks`
//! vector under a mutex, `available_num_chunks`/`available_blk_count` atomics,
//! `m_total_blks`).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

use blobstore_types::{ChunkState, PChunkId, VChunkId};

#[derive(Debug, Clone)]
struct PgChunkSlot {
    p_chunk_id: PChunkId,
    state: ChunkState,
    available_blks: u64,
    total_blks: u64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct HeapEntry {
    available_blks: u64,
    v_chunk_id: VChunkId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.available_blks.cmp(&other.available_blks)
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    /// Dense, `v_chunk_id`-indexed. Every slot is always present once
    /// assigned; entries are never removed during the PG's life.
    slots: Vec<PgChunkSlot>,
    /// Heap view restricted to currently `AVAILABLE` slots. Lazily kept in
    /// sync by the mutating methods below rather than rebuilt from `slots`
    /// on every call.
    available_heap: BinaryHeap<HeapEntry>,
}

/// All chunks bound to one PG, dense-indexed by `v_chunk_id`.
pub struct PgChunkCollection {
    inner: Mutex<Inner>,
    available_num_chunks: AtomicU64,
    available_blk_count: AtomicU64,
    total_blks: AtomicU64,
}

impl Default for PgChunkCollection {
    fn default() -> Self {
        PgChunkCollection {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                available_heap: BinaryHeap::new(),
            }),
            available_num_chunks: AtomicU64::new(0),
            available_blk_count: AtomicU64::new(0),
            total_blks: AtomicU64::new(0),
        }
    }
}

impl PgChunkCollection {
    pub fn new() -> Self {
        PgChunkCollection::default()
    }

    /// Append a chunk at the next dense `v_chunk_id`, starting `AVAILABLE`.
    /// Used by `recover_pg_chunks` and PG formation.
    pub fn push_available(&self, p_chunk_id: PChunkId, total_blks: u64) -> VChunkId {
        let mut inner = self.inner.lock().unwrap();
        let v_chunk_id = VChunkId(inner.slots.len() as u32);
        inner.slots.push(PgChunkSlot {
            p_chunk_id,
            state: ChunkState::Available,
            available_blks: total_blks,
            total_blks,
        });
        inner.available_heap.push(HeapEntry {
            available_blks: total_blks,
            v_chunk_id,
        });
        self.available_num_chunks.fetch_add(1, AtomicOrdering::Relaxed);
        self.available_blk_count
            .fetch_add(total_blks, AtomicOrdering::Relaxed);
        self.total_blks.fetch_add(total_blks, AtomicOrdering::Relaxed);
        v_chunk_id
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn p_chunk_id(&self, v_chunk_id: VChunkId) -> Option<PChunkId> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .get(v_chunk_id.0 as usize)
            .map(|s| s.p_chunk_id)
    }

    pub fn state(&self, v_chunk_id: VChunkId) -> Option<ChunkState> {
        let inner = self.inner.lock().unwrap();
        inner.slots.get(v_chunk_id.0 as usize).map(|s| s.state)
    }

    pub fn is_available(&self, v_chunk_id: VChunkId) -> bool {
        self.state(v_chunk_id) == Some(ChunkState::Available)
    }

    /// Snapshot of `[v_chunk_id → p_chunk_id]` for superblock persistence.
    pub fn p_chunk_ids(&self) -> Vec<PChunkId> {
        self.inner
            .lock()
            .unwrap()
            .slots
            .iter()
            .map(|s| s.p_chunk_id)
            .collect()
    }

    /// Pop the most-available `AVAILABLE` slot and transition it to `INUSE`.
    /// Used by `get_most_available_blk_chunk`.
    pub fn pop_most_available(&self) -> Option<VChunkId> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let top = inner.available_heap.pop()?;
            let slot = &mut inner.slots[top.v_chunk_id.0 as usize];
            // Stale heap entries (superseded by a state change since push)
            // are dropped rather than acted on.
            if slot.state != ChunkState::Available || slot.available_blks != top.available_blks {
                continue;
            }
            slot.state = ChunkState::InUse;
            self.available_num_chunks.fetch_sub(1, AtomicOrdering::Relaxed);
            self.available_blk_count
                .fetch_sub(slot.available_blks, AtomicOrdering::Relaxed);
            return Some(top.v_chunk_id);
        }
    }

    /// `INUSE → AVAILABLE`, reinserting into the PG heap. Used by
    /// `release_chunk`.
    pub fn release(&self, v_chunk_id: VChunkId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(slot) = inner.slots.get_mut(v_chunk_id.0 as usize) else {
            return false;
        };
        if slot.state != ChunkState::InUse {
            return false;
        }
        slot.state = ChunkState::Available;
        let available_blks = slot.available_blks;
        inner.available_heap.push(HeapEntry {
            available_blks,
            v_chunk_id,
        });
        self.available_num_chunks.fetch_add(1, AtomicOrdering::Relaxed);
        self.available_blk_count
            .fetch_add(available_blks, AtomicOrdering::Relaxed);
        true
    }

    /// Force-acquire a specific slot, `AVAILABLE → INUSE`. Used by recovery
    /// and create-shard replay.
    pub fn acquire_specific(&self, v_chunk_id: VChunkId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(slot) = inner.slots.get_mut(v_chunk_id.0 as usize) else {
            return false;
        };
        if slot.state != ChunkState::Available {
            return false;
        }
        slot.state = ChunkState::InUse;
        self.available_num_chunks.fetch_sub(1, AtomicOrdering::Relaxed);
        self.available_blk_count
            .fetch_sub(slot.available_blks, AtomicOrdering::Relaxed);
        true
    }

    /// Used during boot recovery to reflect shards already open before
    /// restart, without touching the availability accounting (the chunk was
    /// never counted as available in the first place at this point).
    pub fn set_state_raw(&self, v_chunk_id: VChunkId, state: ChunkState) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.slots.get_mut(v_chunk_id.0 as usize) {
            slot.state = state;
        }
    }

    /// Substitute the physical chunk backing `v_chunk_id`, used by
    /// `switch_chunks_for_pg`. Returns the previous `p_chunk_id` and its
    /// block counts, if the slot exists.
    pub fn swap_physical(
        &self,
        v_chunk_id: VChunkId,
        new_p_chunk_id: PChunkId,
        new_total_blks: u64,
        new_available_blks: u64,
        new_state: ChunkState,
    ) -> Option<PChunkId> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.slots.get_mut(v_chunk_id.0 as usize)?;
        let old = slot.p_chunk_id;
        let total_delta = new_total_blks as i64 - slot.total_blks as i64;
        let avail_delta = if slot.state == ChunkState::Available {
            new_available_blks as i64 - slot.available_blks as i64
        } else {
            new_available_blks as i64
        };
        slot.p_chunk_id = new_p_chunk_id;
        slot.total_blks = new_total_blks;
        slot.available_blks = new_available_blks;
        slot.state = new_state;
        if new_state == ChunkState::Available {
            inner.available_heap.push(HeapEntry {
                available_blks: new_available_blks,
                v_chunk_id,
            });
        }
        drop(inner);
        if total_delta >= 0 {
            self.total_blks
                .fetch_add(total_delta as u64, AtomicOrdering::Relaxed);
        } else {
            self.total_blks
                .fetch_sub((-total_delta) as u64, AtomicOrdering::Relaxed);
        }
        if new_state == ChunkState::Available {
            self.available_num_chunks.fetch_add(1, AtomicOrdering::Relaxed);
        }
        if avail_delta >= 0 {
            self.available_blk_count
                .fetch_add(avail_delta as u64, AtomicOrdering::Relaxed);
        } else {
            self.available_blk_count
                .fetch_sub((-avail_delta) as u64, AtomicOrdering::Relaxed);
        }
        Some(old)
    }

    pub fn available_num_chunks(&self) -> u64 {
        self.available_num_chunks.load(AtomicOrdering::Relaxed)
    }

    pub fn available_blk_count(&self) -> u64 {
        self.available_blk_count.load(AtomicOrdering::Relaxed)
    }

    pub fn total_blks(&self) -> u64 {
        self.total_blks.load(AtomicOrdering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_most_available_picks_largest() {
        let pg = PgChunkCollection::new();
        pg.push_available(PChunkId(1), 10);
        pg.push_available(PChunkId(2), 30);
        pg.push_available(PChunkId(3), 20);

        let v = pg.pop_most_available().unwrap();
        assert_eq!(pg.p_chunk_id(v), Some(PChunkId(2)));
        assert_eq!(pg.state(v), Some(ChunkState::InUse));
        assert_eq!(pg.available_num_chunks(), 2);
    }

    #[test]
    fn release_returns_chunk_to_available() {
        let pg = PgChunkCollection::new();
        pg.push_available(PChunkId(1), 10);
        let v = pg.pop_most_available().unwrap();
        assert!(pg.release(v));
        assert!(pg.is_available(v));
        assert_eq!(pg.available_num_chunks(), 1);
    }

    #[test]
    fn swap_physical_replaces_slot_contents() {
        let pg = PgChunkCollection::new();
        pg.push_available(PChunkId(1), 10);
        let v = VChunkId(0);
        pg.set_state_raw(v, ChunkState::Gc);
        let old = pg.swap_physical(v, PChunkId(2), 10, 10, ChunkState::InUse).unwrap();
        assert_eq!(old, PChunkId(1));
        assert_eq!(pg.p_chunk_id(v), Some(PChunkId(2)));
        assert_eq!(pg.state(v), Some(ChunkState::InUse));
    }
}
