//! Per-PG blob index: an ordered `(shard_id, blob_id) → MultiBlkId` map.
//!
//! Grounded on `pbs-datastore/src/index.rs`'s `IndexFile` trait style (a
//! small trait the rest of the crate programs against) and on
//! `examples/original_source/.../index_kv.hpp`'s `BlobRouteKey`/`BlobRouteValue`
//! wrappers — an ordered key `(shard_id, blob_id)` over a B-tree, with
//! `put`/`get` taking an explicit insert-vs-update mode and reporting whether
//! the key already existed. The real backend's key/value types wrap a
//! production B-tree engine (out of scope here); `InMemoryIndexTable` is the
//! in-memory stand-in used by tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use blobstore_types::{BlobId, MultiBlkId, ShardId};

/// Ordered index key: shard first, then blob id, matching `BlobRouteKey`'s
/// comparator so a PG's entries can be range-scanned by shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexKey {
    pub shard_id: ShardId,
    pub blob_id: BlobId,
}

impl IndexKey {
    pub fn new(shard_id: ShardId, blob_id: BlobId) -> Self {
        IndexKey { shard_id, blob_id }
    }
}

/// Whether a `put` should only create a new entry or may overwrite one that
/// already exists. Mirrors the original's `INSERT`/`UPDATE` put-types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    Insert,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Success,
    KeyExists,
    NotFound,
}

/// Contract consumed from the B-tree index engine. Out of scope here beyond
/// this trait boundary; `InMemoryIndexTable` is the reference implementation
/// used by tests.
pub trait IndexTable: Send + Sync {
    /// Insert or update `key → value`. Returns the status and, when the key
    /// already existed, its previous value (needed by the commit handler to
    /// distinguish a fresh insert from idempotent replay, and by delete to
    /// recover the blocks being freed).
    fn put(
        &self,
        key: IndexKey,
        value: MultiBlkId,
        mode: PutMode,
    ) -> (IndexStatus, Option<MultiBlkId>);

    fn get(&self, key: IndexKey) -> Option<MultiBlkId>;
}

/// In-memory `IndexTable` backed by a `BTreeMap` under a single mutex. The
/// index is PG-local (one instance per PG), matching the per-PG mutex
/// granularity used elsewhere in the selector.
#[derive(Default)]
pub struct InMemoryIndexTable {
    entries: Mutex<BTreeMap<IndexKey, MultiBlkId>>,
}

impl InMemoryIndexTable {
    pub fn new() -> Self {
        InMemoryIndexTable::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IndexTable for InMemoryIndexTable {
    fn put(
        &self,
        key: IndexKey,
        value: MultiBlkId,
        mode: PutMode,
    ) -> (IndexStatus, Option<MultiBlkId>) {
        let mut entries = self.entries.lock().unwrap();
        let previous = entries.get(&key).cloned();
        match mode {
            PutMode::Insert if previous.is_some() => return (IndexStatus::KeyExists, previous),
            PutMode::Update if previous.is_none() => return (IndexStatus::NotFound, None),
            _ => {}
        }
        entries.insert(key, value);
        (IndexStatus::Success, previous)
    }

    fn get(&self, key: IndexKey) -> Option<MultiBlkId> {
        self.entries.lock().unwrap().get(&key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobstore_types::PgId;

    fn key(n: u64) -> IndexKey {
        IndexKey::new(ShardId::new(PgId(1), 1), BlobId(n))
    }

    #[test]
    fn insert_reports_key_exists_on_second_insert() {
        let index = InMemoryIndexTable::new();
        let (status, prev) = index.put(key(0), MultiBlkId::new(100, 1), PutMode::Insert);
        assert_eq!(status, IndexStatus::Success);
        assert_eq!(prev, None);

        let (status, prev) = index.put(key(0), MultiBlkId::new(200, 1), PutMode::Insert);
        assert_eq!(status, IndexStatus::KeyExists);
        assert_eq!(prev, Some(MultiBlkId::new(100, 1)));
        // Insert-mode collision must not overwrite.
        assert_eq!(index.get(key(0)), Some(MultiBlkId::new(100, 1)));
    }

    #[test]
    fn update_overwrites_and_returns_previous() {
        let index = InMemoryIndexTable::new();
        index.put(key(0), MultiBlkId::new(100, 1), PutMode::Insert);
        let (status, prev) = index.put(key(0), MultiBlkId::tombstone(), PutMode::Update);
        assert_eq!(status, IndexStatus::Success);
        assert_eq!(prev, Some(MultiBlkId::new(100, 1)));
        assert_eq!(index.get(key(0)), Some(MultiBlkId::tombstone()));
    }

    #[test]
    fn update_on_missing_key_returns_not_found() {
        let index = InMemoryIndexTable::new();
        let (status, prev) = index.put(key(0), MultiBlkId::tombstone(), PutMode::Update);
        assert_eq!(status, IndexStatus::NotFound);
        assert_eq!(prev, None);
        // A rejected update must not create the entry.
        assert_eq!(index.get(key(0)), None);
    }

    #[test]
    fn get_missing_key_returns_none() {
        let index = InMemoryIndexTable::new();
        assert_eq!(index.get(key(0)), None);
    }
}
