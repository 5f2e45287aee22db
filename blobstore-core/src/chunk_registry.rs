//! Chunk registry (C1): the single source of truth for every physical chunk
//! known to the node, keyed by `p_chunk_id`.
//!
//! Grounded on `heap_chunk_selector.h`'s `ExtendedVChunk` (a thin wrapper
//! around the underlying device's `VChunk` carrying selector-only state:
//! lifecycle, optional PG binding, optional `v_chunk_id`) and `m_chunks`, the
//! map the header keeps of them.

use std::collections::HashMap;
use std::sync::RwLock;

use blobstore_types::{ChunkState, PChunkId, PdevId, PgId, VChunkId};

/// One physical chunk's selector-visible state.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub p_chunk_id: PChunkId,
    pub pdev_id: PdevId,
    pub total_blks: u64,
    pub available_blks: u64,
    pub state: ChunkState,
    pub pg_id: Option<PgId>,
    pub v_chunk_id: Option<VChunkId>,
}

impl ChunkRecord {
    pub fn new(p_chunk_id: PChunkId, pdev_id: PdevId, total_blks: u64) -> Self {
        ChunkRecord {
            p_chunk_id,
            pdev_id,
            total_blks,
            available_blks: total_blks,
            state: ChunkState::Available,
            pg_id: None,
            v_chunk_id: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.pg_id.is_some()
    }
}

/// `chunks: p_chunk_id → ExtendedVChunk` under the registry's reader-writer
/// lock. A plain `HashMap` behind an `RwLock` rather than per-entry locks:
/// callers needing concurrent per-PG/per-device work go through
/// [`crate::pg_chunks::PgChunkCollection`] and [`crate::device_heap::DeviceHeap`]
/// instead, which is exactly the split the header draws between `m_chunks`
/// and its per-PG/per-device structures.
#[derive(Default)]
pub struct ChunkRegistry {
    chunks: RwLock<HashMap<PChunkId, ChunkRecord>>,
}

impl ChunkRegistry {
    pub fn new() -> Self {
        ChunkRegistry::default()
    }

    /// Boot step 1: register a chunk the device layer reports. Not yet bound
    /// to any PG and not yet placed in a device heap.
    pub fn add_chunk(&self, record: ChunkRecord) {
        self.chunks.write().unwrap().insert(record.p_chunk_id, record);
    }

    pub fn get(&self, id: PChunkId) -> Option<ChunkRecord> {
        self.chunks.read().unwrap().get(&id).cloned()
    }

    pub fn foreach_chunks(&self, mut f: impl FnMut(&ChunkRecord)) {
        for record in self.chunks.read().unwrap().values() {
            f(record);
        }
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.read().unwrap().len()
    }

    pub fn total_disks(&self) -> usize {
        let chunks = self.chunks.read().unwrap();
        chunks
            .values()
            .map(|c| c.pdev_id)
            .collect::<std::collections::HashSet<_>>()
            .len()
    }

    /// Snapshot of which physical chunks live on a given device, for
    /// diagnostics and for the boot-time heap build.
    pub fn chunks_on_device(&self, pdev_id: PdevId) -> Vec<ChunkRecord> {
        self.chunks
            .read()
            .unwrap()
            .values()
            .filter(|c| c.pdev_id == pdev_id)
            .cloned()
            .collect()
    }

    pub fn set_state(&self, id: PChunkId, state: ChunkState) -> Option<ChunkState> {
        let mut chunks = self.chunks.write().unwrap();
        let record = chunks.get_mut(&id)?;
        let prev = record.state;
        record.state = state;
        Some(prev)
    }

    pub fn bind(&self, id: PChunkId, pg_id: PgId, v_chunk_id: VChunkId) {
        let mut chunks = self.chunks.write().unwrap();
        if let Some(record) = chunks.get_mut(&id) {
            record.pg_id = Some(pg_id);
            record.v_chunk_id = Some(v_chunk_id);
        }
    }

    pub fn unbind(&self, id: PChunkId) {
        let mut chunks = self.chunks.write().unwrap();
        if let Some(record) = chunks.get_mut(&id) {
            record.pg_id = None;
            record.v_chunk_id = None;
        }
    }

    pub fn set_available_blks(&self, id: PChunkId, available_blks: u64) {
        let mut chunks = self.chunks.write().unwrap();
        if let Some(record) = chunks.get_mut(&id) {
            record.available_blks = available_blks;
        }
    }

    pub fn is_available(&self, id: PChunkId) -> bool {
        self.chunks
            .read()
            .unwrap()
            .get(&id)
            .map(|c| c.state == ChunkState::Available)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_lookup_chunk() {
        let registry = ChunkRegistry::new();
        registry.add_chunk(ChunkRecord::new(PChunkId(1), PdevId(0), 100));
        let record = registry.get(PChunkId(1)).unwrap();
        assert_eq!(record.total_blks, 100);
        assert_eq!(record.state, ChunkState::Available);
        assert!(!record.is_bound());
    }

    #[test]
    fn bind_and_unbind_round_trip() {
        let registry = ChunkRegistry::new();
        registry.add_chunk(ChunkRecord::new(PChunkId(1), PdevId(0), 100));
        registry.bind(PChunkId(1), PgId(7), VChunkId(0));
        assert_eq!(registry.get(PChunkId(1)).unwrap().pg_id, Some(PgId(7)));
        registry.unbind(PChunkId(1));
        assert_eq!(registry.get(PChunkId(1)).unwrap().pg_id, None);
    }

    #[test]
    fn total_disks_counts_distinct_pdevs() {
        let registry = ChunkRegistry::new();
        registry.add_chunk(ChunkRecord::new(PChunkId(1), PdevId(0), 100));
        registry.add_chunk(ChunkRecord::new(PChunkId(2), PdevId(0), 100));
        registry.add_chunk(ChunkRecord::new(PChunkId(3), PdevId(1), 100));
        assert_eq!(registry.total_disks(), 2);
        assert_eq!(registry.total_chunks(), 3);
    }
}
