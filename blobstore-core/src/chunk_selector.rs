//! Chunk selector façade (C4): the public API orchestrating the chunk
//! registry, per-device heaps and per-PG collections under one coarse lock.
//!
//! Grounded on `heap_chunk_selector.h`'s public method surface almost one for
//! one (`select_chunks_for_pg`, `get_most_available_blk_chunk`,
//! `select_specific_chunk`, `release_chunk`, `try_mark_chunk_to_gc_state`,
//! `mark_chunk_out_of_gc_state`, `switch_chunks_for_pg`,
//! `update_vchunk_info_after_gc`, `return_pg_chunks_to_dev_heap`,
//! `reset_pg_chunks`, the boot sequence, and the read-only accessors), and on
//! `chunk_store.rs`'s style of many small `pub fn`s returning `Result`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, Result};
use blobstore_types::{ChunkState, PChunkId, PdevId, PgId, TaskId, VChunkId};
use log::{debug, warn};

use crate::chunk_registry::{ChunkRecord, ChunkRegistry};
use crate::device_heap::DeviceHeap;
use crate::pg_chunks::PgChunkCollection;

/// `registry_lock` in the design: guards structural edits to the two maps
/// below (inserting/removing a device or a PG). Held shared for normal
/// per-device/per-PG operations, which then take the component-local lock.
struct Maps {
    per_dev_heap: HashMap<PdevId, Arc<DeviceHeap>>,
    per_pg_chunks: HashMap<PgId, Arc<PgChunkCollection>>,
}

pub struct ChunkSelector {
    chunk_size_blks: u64,
    registry: ChunkRegistry,
    maps: RwLock<Maps>,
}

impl ChunkSelector {
    pub fn new(chunk_size_blks: u64) -> Self {
        ChunkSelector {
            chunk_size_blks,
            registry: ChunkRegistry::new(),
            maps: RwLock::new(Maps {
                per_dev_heap: HashMap::new(),
                per_pg_chunks: HashMap::new(),
            }),
        }
    }

    // ---- boot sequence ----------------------------------------------------

    /// Boot step 1: register a chunk reported by the device layer.
    pub fn add_chunk(&self, p_chunk_id: PChunkId, pdev_id: PdevId, total_blks: u64) {
        self.registry
            .add_chunk(ChunkRecord::new(p_chunk_id, pdev_id, total_blks));
    }

    /// Boot step 2: bind each listed chunk to `pg_id`'s collection, in order,
    /// so `v_chunk_id` equals the chunk's position in `p_chunk_ids`. All
    /// recovered chunks start `AVAILABLE`.
    pub fn recover_pg_chunks(&self, pg_id: PgId, p_chunk_ids: &[PChunkId]) -> Result<()> {
        let pg = self.pg_collection_or_insert(pg_id);
        for &p_chunk_id in p_chunk_ids {
            let record = self
                .registry
                .get(p_chunk_id)
                .ok_or_else(|| anyhow!("recover_pg_chunks: unknown chunk {:?}", p_chunk_id))?;
            let v_chunk_id = pg.push_available(p_chunk_id, record.total_blks);
            self.registry.bind(p_chunk_id, pg_id, v_chunk_id);
        }
        Ok(())
    }

    /// Boot step 3: scan the registry and insert every unbound `AVAILABLE`
    /// chunk into its device's heap. After this call the selector is
    /// serviceable.
    pub fn build_pdev_available_chunk_heap(&self) {
        let mut unbound = Vec::new();
        self.registry.foreach_chunks(|record| {
            if !record.is_bound() && record.state == ChunkState::Available {
                unbound.push(record.clone());
            }
        });
        for record in unbound {
            let heap = self.device_heap_or_insert(record.pdev_id);
            heap.push(record.p_chunk_id, record.available_blks, record.total_blks, true);
        }
    }

    /// Boot step 4: flip the listed `v_chunk_id`s of `pg_id` to `INUSE` to
    /// reflect shards already open before restart.
    pub fn recover_pg_chunks_states(&self, pg_id: PgId, open_v_chunk_ids: &[VChunkId]) -> Result<()> {
        let pg = self.pg_collection(pg_id)?;
        for &v in open_v_chunk_ids {
            pg.set_state_raw(v, ChunkState::InUse);
        }
        Ok(())
    }

    // ---- PG lifecycle -------------------------------------------------

    /// Picks the device with the most free chunks satisfying the size
    /// requirement, pops that many chunks from its heap, and binds them
    /// densely to a new PG collection starting at `v_chunk_id = 0`.
    pub fn select_chunks_for_pg(&self, pg_id: PgId, pg_size_blks: u64) -> Option<u32> {
        let needed = pg_size_blks.div_ceil(self.chunk_size_blks).max(1) as usize;

        let candidate_pdev = {
            let maps = self.maps.read().unwrap();
            maps.per_dev_heap
                .iter()
                .filter(|(_, heap)| heap.len() >= needed)
                .max_by_key(|(_, heap)| heap.available_blk_count())
                .map(|(pdev, _)| *pdev)?
        };

        let heap = self.device_heap_or_insert(candidate_pdev);
        let pg = self.pg_collection_or_insert(pg_id);

        let mut bound = 0u32;
        for _ in 0..needed {
            let Some(p_chunk_id) = heap.pop() else {
                break;
            };
            let record = self.registry.get(p_chunk_id)?;
            let v_chunk_id = pg.push_available(p_chunk_id, record.total_blks);
            self.registry.bind(p_chunk_id, pg_id, v_chunk_id);
            bound += 1;
        }
        Some(bound)
    }

    /// Non-PG selection path (reserved-chunks pool): returns the hinted chunk
    /// unconditionally if set, else picks from the hinted device or the
    /// device with the most free blocks. Unused by the blob PUT/GET/DELETE
    /// path, which always goes through `get_most_available_blk_chunk`.
    pub fn select_chunk(
        &self,
        hints: &blobstore_types::AllocHints,
    ) -> Option<PChunkId> {
        if let Some(chunk_id) = hints.chunk_id_hint {
            return Some(chunk_id);
        }
        let maps = self.maps.read().unwrap();
        let heap = if let Some(pdev) = hints.pdev_id_hint {
            maps.per_dev_heap.get(&pdev)?
        } else {
            maps.per_dev_heap
                .values()
                .max_by_key(|h| h.available_blk_count())?
        };
        heap.pop()
    }

    /// Pops the PG's most-available `AVAILABLE` chunk, transitioning it to
    /// `INUSE`. Used by shard creation.
    pub fn get_most_available_blk_chunk(&self, pg_id: PgId) -> Option<VChunkId> {
        let pg = self.pg_collection(pg_id).ok()?;
        let v_chunk_id = pg.pop_most_available()?;
        if let Some(p_chunk_id) = pg.p_chunk_id(v_chunk_id) {
            self.registry.set_state(p_chunk_id, ChunkState::InUse);
        }
        Some(v_chunk_id)
    }

    /// Force-acquires a specific PG chunk (`AVAILABLE → INUSE`). Fails if not
    /// `AVAILABLE`. Used by recovery and create-shard replay.
    pub fn select_specific_chunk(&self, pg_id: PgId, v_chunk_id: VChunkId) -> Result<()> {
        let pg = self.pg_collection(pg_id)?;
        if !pg.acquire_specific(v_chunk_id) {
            bail!(
                "select_specific_chunk: {:?}/{:?} not AVAILABLE",
                pg_id,
                v_chunk_id
            );
        }
        if let Some(p_chunk_id) = pg.p_chunk_id(v_chunk_id) {
            self.registry.set_state(p_chunk_id, ChunkState::InUse);
        }
        Ok(())
    }

    /// `INUSE → AVAILABLE`, reinserting into the PG's heap. Used on shard seal
    /// and create-shard rollback.
    pub fn release_chunk(&self, pg_id: PgId, v_chunk_id: VChunkId) -> bool {
        let Ok(pg) = self.pg_collection(pg_id) else {
            return false;
        };
        let released = pg.release(v_chunk_id);
        if released {
            if let Some(p_chunk_id) = pg.p_chunk_id(v_chunk_id) {
                self.registry.set_state(p_chunk_id, ChunkState::Available);
            }
        }
        released
    }

    // ---- GC transitions -------------------------------------------------

    /// `INUSE → GC` if `force`, else only `AVAILABLE → GC`. A non-forced
    /// failure is reported via the return value, not fatal: the caller
    /// (GC scheduler) simply tries a different chunk.
    pub fn try_mark_chunk_to_gc_state(&self, p_chunk_id: PChunkId, force: bool) -> bool {
        let Some(record) = self.registry.get(p_chunk_id) else {
            return false;
        };
        let allowed = match record.state {
            ChunkState::Available => true,
            ChunkState::InUse => force,
            ChunkState::Gc => false,
        };
        if !allowed {
            return false;
        }
        self.registry.set_state(p_chunk_id, ChunkState::Gc);
        // Keep the PG-local slot (if this chunk is bound) in sync with the
        // registry, so `is_chunk_available`/`get_pg_chunks`-style accessors
        // reading the PG collection agree with the registry mid-GC.
        if let (Some(pg_id), Some(v_chunk_id)) = (record.pg_id, record.v_chunk_id) {
            if let Ok(pg) = self.pg_collection(pg_id) {
                pg.set_state_raw(v_chunk_id, ChunkState::Gc);
            }
        }
        if record.state == ChunkState::InUse {
            // Caller is responsible for quiescing writers through this chunk
            // before forcing it into GC; the selector does not block or wait.
            debug!("force-marked in-use chunk {:?} for GC", p_chunk_id);
        }
        true
    }

    /// `GC → final_state`. Must only be called for a chunk currently in `GC`.
    pub fn mark_chunk_out_of_gc_state(
        &self,
        p_chunk_id: PChunkId,
        final_state: ChunkState,
        task_id: TaskId,
    ) -> Result<()> {
        let Some(record) = self.registry.get(p_chunk_id) else {
            bail!("mark_chunk_out_of_gc_state: unknown chunk {:?}", p_chunk_id);
        };
        if record.state != ChunkState::Gc {
            bail!(
                "mark_chunk_out_of_gc_state: chunk {:?} not in GC (task {:?})",
                p_chunk_id,
                task_id
            );
        }
        self.registry.set_state(p_chunk_id, final_state);
        // Mirror the transition onto the PG-local slot so it doesn't stay
        // stuck at `Gc` after `try_mark_chunk_to_gc_state` moved it there.
        if let (Some(pg_id), Some(v_chunk_id)) = (record.pg_id, record.v_chunk_id) {
            if let Ok(pg) = self.pg_collection(pg_id) {
                pg.set_state_raw(v_chunk_id, final_state);
            }
        }
        Ok(())
    }

    /// Atomic substitution after GC copy: transfer `v_chunk_id`/`pg_id`
    /// binding from `old` to `new`; `old` becomes unbound and returns to its
    /// device heap.
    pub fn switch_chunks_for_pg(
        &self,
        pg_id: PgId,
        old_p_chunk_id: PChunkId,
        new_p_chunk_id: PChunkId,
        task_id: TaskId,
    ) -> Result<()> {
        let old_record = self
            .registry
            .get(old_p_chunk_id)
            .ok_or_else(|| anyhow!("switch_chunks_for_pg: unknown old chunk {:?}", old_p_chunk_id))?;
        let new_record = self
            .registry
            .get(new_p_chunk_id)
            .ok_or_else(|| anyhow!("switch_chunks_for_pg: unknown new chunk {:?}", new_p_chunk_id))?;
        let v_chunk_id = old_record
            .v_chunk_id
            .ok_or_else(|| anyhow!("switch_chunks_for_pg: old chunk {:?} is unbound", old_p_chunk_id))?;

        let pg = self.pg_collection(pg_id)?;
        pg.swap_physical(
            v_chunk_id,
            new_p_chunk_id,
            new_record.total_blks,
            new_record.available_blks,
            ChunkState::Gc,
        )
        .ok_or_else(|| anyhow!("switch_chunks_for_pg: {:?} has no v_chunk {:?}", pg_id, v_chunk_id))?;

        self.registry.bind(new_p_chunk_id, pg_id, v_chunk_id);
        // `pg.swap_physical` above already moved the PG-local slot to `Gc`;
        // mirror that onto the registry record so `mark_chunk_out_of_gc_state`'s
        // `record.state == ChunkState::Gc` precondition holds for the caller's
        // mandatory next call.
        self.registry.set_state(new_p_chunk_id, ChunkState::Gc);
        self.registry.unbind(old_p_chunk_id);
        self.registry.set_state(old_p_chunk_id, ChunkState::Available);

        let heap = self.device_heap_or_insert(old_record.pdev_id);
        heap.push(old_p_chunk_id, old_record.total_blks, old_record.total_blks, true);

        debug!(
            "switch_chunks_for_pg: {:?} v_chunk {:?}: {:?} -> {:?} (task {:?})",
            pg_id, v_chunk_id, old_p_chunk_id, new_p_chunk_id, task_id
        );
        Ok(())
    }

    /// Combined finalisation: performs `switch_chunks_for_pg` then sets
    /// `new.state = final_state`.
    pub fn update_vchunk_info_after_gc(
        &self,
        old_p_chunk_id: PChunkId,
        new_p_chunk_id: PChunkId,
        final_state: ChunkState,
        pg_id: PgId,
        task_id: TaskId,
    ) -> Result<()> {
        self.switch_chunks_for_pg(pg_id, old_p_chunk_id, new_p_chunk_id, task_id)?;
        self.registry.set_state(new_p_chunk_id, final_state);
        let pg = self.pg_collection(pg_id)?;
        if let Some(record) = self.registry.get(new_p_chunk_id) {
            if let Some(v_chunk_id) = record.v_chunk_id {
                pg.set_state_raw(v_chunk_id, final_state);
            }
        }
        Ok(())
    }

    /// Unbinds every chunk in the PG collection, resets state to `AVAILABLE`,
    /// reinserts into the device heap, and removes the PG entry.
    pub fn return_pg_chunks_to_dev_heap(&self, pg_id: PgId) -> Result<()> {
        self.reset_pg_chunks(pg_id)?;
        self.maps.write().unwrap().per_pg_chunks.remove(&pg_id);
        Ok(())
    }

    /// Same as `return_pg_chunks_to_dev_heap` but keeps the collection entry
    /// (emptying its bindings). Used by baseline resync.
    pub fn reset_pg_chunks(&self, pg_id: PgId) -> Result<()> {
        let pg = self.pg_collection(pg_id)?;
        for p_chunk_id in pg.p_chunk_ids() {
            let Some(record) = self.registry.get(p_chunk_id) else {
                continue;
            };
            self.registry.unbind(p_chunk_id);
            self.registry.set_state(p_chunk_id, ChunkState::Available);
            let heap = self.device_heap_or_insert(record.pdev_id);
            heap.push(p_chunk_id, record.total_blks, record.total_blks, true);
        }
        Ok(())
    }

    // ---- read-only accessors -------------------------------------------

    pub fn avail_blks(&self, pg_id: PgId) -> Result<u64> {
        Ok(self.pg_collection(pg_id)?.available_blk_count())
    }

    pub fn total_blks(&self, pg_id: PgId) -> Result<u64> {
        Ok(self.pg_collection(pg_id)?.total_blks())
    }

    pub fn avail_num_chunks(&self, pg_id: PgId) -> Result<u64> {
        Ok(self.pg_collection(pg_id)?.available_num_chunks())
    }

    /// Largest available-chunk count across all per-device heaps.
    pub fn most_avail_num_chunks(&self) -> usize {
        self.maps
            .read()
            .unwrap()
            .per_dev_heap
            .values()
            .map(|h| h.len())
            .max()
            .unwrap_or(0)
    }

    pub fn total_chunks(&self) -> usize {
        self.registry.total_chunks()
    }

    pub fn total_disks(&self) -> usize {
        self.registry.total_disks()
    }

    pub fn get_chunk_size(&self) -> u64 {
        self.chunk_size_blks
    }

    pub fn is_chunk_available(&self, pg_id: PgId, v_chunk_id: VChunkId) -> bool {
        self.pg_collection(pg_id)
            .map(|pg| pg.is_available(v_chunk_id))
            .unwrap_or(false)
    }

    /// Snapshot of a PG's `[v_chunk_id → p_chunk_id]` list, for superblock
    /// persistence.
    pub fn get_pg_chunks(&self, pg_id: PgId) -> Result<Vec<PChunkId>> {
        Ok(self.pg_collection(pg_id)?.p_chunk_ids())
    }

    pub fn get_pg_vchunk(&self, pg_id: PgId, v_chunk_id: VChunkId) -> Option<PChunkId> {
        self.pg_collection(pg_id).ok()?.p_chunk_id(v_chunk_id)
    }

    /// Snapshot of which physical chunks belong to a device, for diagnostics.
    pub fn get_pdev_chunks(&self, pdev_id: PdevId) -> Vec<PChunkId> {
        self.registry
            .chunks_on_device(pdev_id)
            .into_iter()
            .map(|c| c.p_chunk_id)
            .collect()
    }

    pub fn get_extend_vchunk(&self, p_chunk_id: PChunkId) -> Option<ChunkRecord> {
        self.registry.get(p_chunk_id)
    }

    // ---- internals --------------------------------------------------------

    fn pg_collection(&self, pg_id: PgId) -> Result<Arc<PgChunkCollection>> {
        self.maps
            .read()
            .unwrap()
            .per_pg_chunks
            .get(&pg_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown PG {:?}", pg_id))
    }

    fn pg_collection_or_insert(&self, pg_id: PgId) -> Arc<PgChunkCollection> {
        if let Some(pg) = self.maps.read().unwrap().per_pg_chunks.get(&pg_id) {
            return pg.clone();
        }
        let mut maps = self.maps.write().unwrap();
        maps.per_pg_chunks
            .entry(pg_id)
            .or_insert_with(|| Arc::new(PgChunkCollection::new()))
            .clone()
    }

    fn device_heap_or_insert(&self, pdev_id: PdevId) -> Arc<DeviceHeap> {
        if let Some(heap) = self.maps.read().unwrap().per_dev_heap.get(&pdev_id) {
            return heap.clone();
        }
        let mut maps = self.maps.write().unwrap();
        maps.per_dev_heap
            .entry(pdev_id)
            .or_insert_with(|| Arc::new(DeviceHeap::new()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_single_device(selector: &ChunkSelector, pdev: PdevId, chunks: &[(u64, u64)]) {
        for (i, &(_total, _avail)) in chunks.iter().enumerate() {
            selector.add_chunk(PChunkId(i as u64 + 1), pdev, chunks[i].0);
        }
        selector.build_pdev_available_chunk_heap();
    }

    #[test]
    fn selector_heap_scenario() {
        // heap_chunk_selector scenario: free-blocks {10, 30, 20}, request 2
        // chunks worth of PG, expect the two largest picked.
        let selector = ChunkSelector::new(1);
        boot_single_device(&selector, PdevId(0), &[(10, 10), (30, 30), (20, 20)]);

        let bound = selector.select_chunks_for_pg(PgId(1), 2).unwrap();
        assert_eq!(bound, 2);

        let remaining = selector.most_avail_num_chunks();
        assert_eq!(remaining, 1);

        let v = selector.get_most_available_blk_chunk(PgId(1)).unwrap();
        let p_chunk_id = selector.get_pg_vchunk(PgId(1), v).unwrap();
        let record = selector.get_extend_vchunk(p_chunk_id).unwrap();
        assert_eq!(record.total_blks, 30);
    }

    #[test]
    fn gc_swap_scenario() {
        let selector = ChunkSelector::new(1);
        selector.add_chunk(PChunkId(10), PdevId(0), 10);
        selector.add_chunk(PChunkId(20), PdevId(0), 10);
        // Correct boot order: bind PG chunks before building the device heap,
        // so the heap only ever sees unbound chunks.
        selector.recover_pg_chunks(PgId(1), &[PChunkId(10)]).unwrap();
        selector.build_pdev_available_chunk_heap();

        assert!(selector.try_mark_chunk_to_gc_state(PChunkId(10), false));

        // GC reserves a destination chunk from the device heap before
        // copying; the caller is responsible for popping it out first.
        let popped = selector
            .select_chunk(&blobstore_types::AllocHints {
                pdev_id_hint: Some(PdevId(0)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(popped, PChunkId(20));

        selector
            .switch_chunks_for_pg(PgId(1), PChunkId(10), PChunkId(20), TaskId(42))
            .unwrap();
        selector
            .mark_chunk_out_of_gc_state(PChunkId(20), ChunkState::InUse, TaskId(42))
            .unwrap();

        let p = selector.get_pg_vchunk(PgId(1), VChunkId(0)).unwrap();
        assert_eq!(p, PChunkId(20));
        assert!(!selector.get_extend_vchunk(PChunkId(10)).unwrap().is_bound());
    }

    #[test]
    fn release_and_reacquire_cycle() {
        let selector = ChunkSelector::new(1);
        selector.add_chunk(PChunkId(1), PdevId(0), 10);
        selector.build_pdev_available_chunk_heap();
        selector.select_chunks_for_pg(PgId(1), 1).unwrap();

        let v = selector.get_most_available_blk_chunk(PgId(1)).unwrap();
        assert!(!selector.is_chunk_available(PgId(1), v));
        assert!(selector.release_chunk(PgId(1), v));
        assert!(selector.is_chunk_available(PgId(1), v));
    }
}
