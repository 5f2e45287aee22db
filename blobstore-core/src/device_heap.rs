//! Per-device heap (C2): a max-heap over unbound `AVAILABLE` chunks of one
//! physical device, ordered by free-block count.
//!
//! Grounded on `heap_chunk_selector.h`'s `ChunkHeap` (`std::priority_queue`
//! wrapped with a mutex and running `available_blk_count`/`m_total_blks`
//! atomics) and `ExtendedVChunkComparator`, which orders purely on
//! `available_blks()`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

use blobstore_types::PChunkId;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct HeapEntry {
    available_blks: u64,
    p_chunk_id: PChunkId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; ties broken by insertion order are not
        // representable here, so equal free-block counts compare equal and
        // the heap's own (unspecified, but deterministic within one binary)
        // internal ordering decides among them, matching the "arbitrary but
        // deterministic" tie-break the selector promises.
        self.available_blks.cmp(&other.available_blks)
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Heap of unbound, `AVAILABLE` chunks belonging to one device.
pub struct DeviceHeap {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    available_blk_count: AtomicU64,
    total_blks: AtomicU64,
}

impl Default for DeviceHeap {
    fn default() -> Self {
        DeviceHeap {
            heap: Mutex::new(BinaryHeap::new()),
            available_blk_count: AtomicU64::new(0),
            total_blks: AtomicU64::new(0),
        }
    }
}

impl DeviceHeap {
    pub fn new() -> Self {
        DeviceHeap::default()
    }

    /// Insert (or re-insert) a chunk. `total_blks` is added to the device's
    /// aggregate total only when `account_total` is set, so that re-inserting
    /// a chunk already accounted for (e.g. on `release_chunk`) doesn't
    /// double-count it.
    pub fn push(&self, p_chunk_id: PChunkId, available_blks: u64, total_blks: u64, account_total: bool) {
        self.heap.lock().unwrap().push(HeapEntry {
            available_blks,
            p_chunk_id,
        });
        self.available_blk_count
            .fetch_add(available_blks, AtomicOrdering::Relaxed);
        if account_total {
            self.total_blks.fetch_add(total_blks, AtomicOrdering::Relaxed);
        }
    }

    /// Pop the chunk with the most free blocks.
    pub fn pop(&self) -> Option<PChunkId> {
        let mut heap = self.heap.lock().unwrap();
        let entry = heap.pop()?;
        self.available_blk_count
            .fetch_sub(entry.available_blks, AtomicOrdering::Relaxed);
        Some(entry.p_chunk_id)
    }

    /// Number of chunks currently resident in the heap.
    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
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
    fn pops_most_available_first() {
        let heap = DeviceHeap::new();
        heap.push(PChunkId(1), 10, 10, true);
        heap.push(PChunkId(2), 30, 30, true);
        heap.push(PChunkId(3), 20, 20, true);

        assert_eq!(heap.pop(), Some(PChunkId(2)));
        assert_eq!(heap.pop(), Some(PChunkId(3)));
        assert_eq!(heap.pop(), Some(PChunkId(1)));
        assert_eq!(heap.pop(), None);
    }

    #[test]
    fn available_blk_count_tracks_push_and_pop() {
        let heap = DeviceHeap::new();
        heap.push(PChunkId(1), 10, 10, true);
        heap.push(PChunkId(2), 30, 30, true);
        assert_eq!(heap.available_blk_count(), 40);
        assert_eq!(heap.total_blks(), 40);
        heap.pop();
        assert_eq!(heap.available_blk_count(), 10);
        assert_eq!(heap.total_blks(), 40);
    }
}
