//! Blob pipeline (C5) and commit/rollback handlers (C6): PUT/GET/DELETE
//! against a shard, interleaved with the replication log.
//!
//! Grounded almost directly on
//! `examples/original_source/.../hs_blob_manager.cpp`'s `_put_blob`,
//! `_get_blob`/`_get_blob_data`, `_del_blob`, `local_add_blob_info`,
//! `on_blob_put_commit`, `on_blob_del_commit`, `on_blob_message_rollback`,
//! `blob_put_get_blk_alloc_hints` and `compute_blob_payload_hash`; the
//! pending-request/shutdown gate follows `proxmox-rest-server/src/lib.rs`'s
//! `SHUTDOWN_REQUESTED`/`fail_on_shutdown`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use blobstore_types::{AllocHints, BlobError, BlobId, MultiBlkId, PChunkId, PgId, ShardId};
use log::{debug, warn};
use tokio::sync::oneshot;

use crate::blob_format::{
    compute_blob_payload_hash, pad_to_block_size, BlobHeader, MsgType, ReplicationMessageHeader,
    BLOB_HEADER_SIZE,
};
use crate::counters::PgDurableCounters;
use crate::index::{IndexKey, IndexStatus, IndexTable, PutMode};
use crate::repl::{ReplDev, ReplStateMachine};

/// Alignment of the `user_key` region within a blob's on-disk layout. Chosen
/// as a small power of two, independent of `blk_size`, so `data_offset` does
/// not depend on the underlying device.
const DATA_OFFSET_ALIGN: usize = 8;

/// Shard metadata consumed from the (external, out of scope) shard manager.
#[derive(Debug, Clone)]
pub struct ShardInfo {
    pub id: ShardId,
    pub placement_group: PgId,
    pub p_chunk_id: PChunkId,
}

/// Input to a PUT.
#[derive(Debug, Clone)]
pub struct BlobWrite {
    pub body: Vec<u8>,
    pub user_key: Vec<u8>,
    pub object_offset: u64,
}

/// Result of a GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub body: Vec<u8>,
    pub user_key: Vec<u8>,
    pub object_offset: u64,
    pub leader_hint: Option<u64>,
}

struct PgState {
    index: Arc<dyn IndexTable>,
    counters: Arc<PgDurableCounters>,
    disk_down: bool,
}

type PendingKey = (PgId, BlobId);

/// Client-facing PUT/GET/DELETE API plus the commit/rollback handlers the
/// replication engine drives.
pub struct BlobManager {
    repl_dev: Arc<dyn ReplDev>,
    shards: RwLock<HashMap<ShardId, ShardInfo>>,
    pgs: RwLock<HashMap<PgId, PgState>>,
    pending_puts: Mutex<HashMap<PendingKey, oneshot::Sender<Result<(), BlobError>>>>,
    pending_dels: Mutex<HashMap<PendingKey, oneshot::Sender<Result<(), BlobError>>>>,
    pending_request_count: AtomicUsize,
    shutting_down: AtomicBool,
}

impl BlobManager {
    pub fn new(repl_dev: Arc<dyn ReplDev>) -> Arc<Self> {
        Arc::new(BlobManager {
            repl_dev,
            shards: RwLock::new(HashMap::new()),
            pgs: RwLock::new(HashMap::new()),
            pending_puts: Mutex::new(HashMap::new()),
            pending_dels: Mutex::new(HashMap::new()),
            pending_request_count: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn register_shard(&self, info: ShardInfo) {
        self.shards.write().unwrap().insert(info.id, info);
    }

    pub fn register_pg(&self, pg_id: PgId, index: Arc<dyn IndexTable>) {
        self.pgs.write().unwrap().insert(
            pg_id,
            PgState {
                index,
                counters: Arc::new(PgDurableCounters::new()),
                disk_down: false,
            },
        );
    }

    pub fn set_disk_down(&self, pg_id: PgId, disk_down: bool) {
        if let Some(state) = self.pgs.write().unwrap().get_mut(&pg_id) {
            state.disk_down = disk_down;
        }
    }

    pub fn pg_counters(&self, pg_id: PgId) -> Option<Arc<PgDurableCounters>> {
        self.pgs.read().unwrap().get(&pg_id).map(|s| s.counters.clone())
    }

    /// Sets the shutdown flag; callers should then poll `pending_requests()`
    /// until it reaches zero before tearing down.
    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn pending_requests(&self) -> usize {
        self.pending_request_count.load(Ordering::SeqCst)
    }

    fn incr_pending_request_num(&self) {
        self.pending_request_count.fetch_add(1, Ordering::SeqCst);
    }

    fn decr_pending_request_num(&self) {
        self.pending_request_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn fail_on_shutdown(&self) -> Result<(), BlobError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BlobError::ShuttingDown);
        }
        Ok(())
    }

    fn shard(&self, shard_id: ShardId) -> Result<ShardInfo, BlobError> {
        self.shards
            .read()
            .unwrap()
            .get(&shard_id)
            .cloned()
            .ok_or(BlobError::UnknownShard(shard_id.0))
    }

    fn pg_index(&self, pg_id: PgId) -> Result<Arc<dyn IndexTable>, BlobError> {
        self.pgs
            .read()
            .unwrap()
            .get(&pg_id)
            .map(|s| s.index.clone())
            .ok_or(BlobError::UnknownPg(pg_id))
    }

    fn pg_counters_or_err(&self, pg_id: PgId) -> Result<Arc<PgDurableCounters>, BlobError> {
        self.pgs
            .read()
            .unwrap()
            .get(&pg_id)
            .map(|s| s.counters.clone())
            .ok_or(BlobError::UnknownPg(pg_id))
    }

    fn is_disk_down(&self, pg_id: PgId) -> bool {
        self.pgs
            .read()
            .unwrap()
            .get(&pg_id)
            .map(|s| s.disk_down)
            .unwrap_or(false)
    }

    fn check_leader_and_ready(&self) -> Result<(), BlobError> {
        if !self.repl_dev.is_leader() {
            return Err(BlobError::NotLeader {
                current_leader: self.repl_dev.get_leader_id(),
            });
        }
        if !self.repl_dev.is_ready_for_traffic() {
            return Err(BlobError::RetryRequest);
        }
        Ok(())
    }

    /// Builds the on-disk payload `[BlobHeader | user_key | pad | body | pad]`
    /// and the header's payload hash, per the layout in the data model.
    fn build_blob_payload(
        shard_id: ShardId,
        blob_id: BlobId,
        write: &BlobWrite,
        blk_size: u64,
    ) -> (BlobHeader, Vec<u8>) {
        let payload_hash = compute_blob_payload_hash(&write.body, &write.user_key);
        let user_key_size = write.user_key.len() as u32;
        let data_offset = pad_to_block_size(BLOB_HEADER_SIZE + write.user_key.len(), DATA_OFFSET_ALIGN) as u32;

        let header = BlobHeader::new(
            shard_id,
            blob_id,
            write.body.len() as u64,
            user_key_size,
            write.object_offset,
            data_offset,
            payload_hash,
        );

        let mut payload = header.to_bytes();
        payload.extend_from_slice(&write.user_key);
        payload.resize(data_offset as usize, 0);
        payload.extend_from_slice(&write.body);
        let total = pad_to_block_size(payload.len(), blk_size.max(1) as usize);
        payload.resize(total, 0);

        (header, payload)
    }

    pub async fn put_blob(
        &self,
        shard_id: ShardId,
        write: BlobWrite,
        trace_id: u64,
    ) -> Result<BlobId, BlobError> {
        self.fail_on_shutdown()?;
        self.incr_pending_request_num();
        let result = self.put_blob_inner(shard_id, write, trace_id).await;
        self.decr_pending_request_num();
        result
    }

    async fn put_blob_inner(
        &self,
        shard_id: ShardId,
        write: BlobWrite,
        trace_id: u64,
    ) -> Result<BlobId, BlobError> {
        let shard = self.shard(shard_id)?;
        let pg_id = shard.placement_group;

        if self.is_disk_down(pg_id) {
            return Err(BlobError::NotLeader { current_leader: None });
        }

        let counters = self.pg_counters_or_err(pg_id)?;
        // Eagerly allocated on the proposer, ahead of replication, so the
        // client reply can carry the id even before commit.
        let blob_id = BlobId(counters.next_blob_id());

        self.check_leader_and_ready()?;

        debug!(
            "put_blob: pg={:?} shard={:?} blob={:?} trace={}",
            pg_id, shard_id, blob_id, trace_id
        );

        let blk_size = self.repl_dev.get_blk_size();
        let (_header, payload) = Self::build_blob_payload(shard_id, blob_id, &write, blk_size);
        let payload_crc = crc32fast::hash(&payload);

        let mut msg_header = ReplicationMessageHeader::new(
            MsgType::PutBlob,
            pg_id.0,
            shard_id,
            blob_id,
            payload.len() as u32,
            payload_crc,
        );
        msg_header.seal();

        let (tx, rx) = oneshot::channel();
        self.pending_puts.lock().unwrap().insert((pg_id, blob_id), tx);

        let alloc_result = self
            .repl_dev
            .async_alloc_write(msg_header, blob_id.0.to_le_bytes().to_vec(), payload, trace_id)
            .await;

        if let Err(e) = alloc_result {
            self.pending_puts.lock().unwrap().remove(&(pg_id, blob_id));
            return Err(e);
        }

        match rx.await {
            Ok(Ok(())) => Ok(blob_id),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BlobError::RollBack),
        }
    }

    pub async fn get_blob(
        &self,
        shard_id: ShardId,
        blob_id: BlobId,
        offset: u64,
        len: u64,
        trace_id: u64,
    ) -> Result<Blob, BlobError> {
        self.fail_on_shutdown()?;
        self.incr_pending_request_num();
        let result = self.get_blob_inner(shard_id, blob_id, offset, len, trace_id).await;
        self.decr_pending_request_num();
        result
    }

    async fn get_blob_inner(
        &self,
        shard_id: ShardId,
        blob_id: BlobId,
        offset: u64,
        len: u64,
        trace_id: u64,
    ) -> Result<Blob, BlobError> {
        let shard = self.shard(shard_id)?;
        let pg_id = shard.placement_group;
        let index = self.pg_index(pg_id)?;

        let key = IndexKey::new(shard_id, blob_id);
        let pbas = index.get(key).ok_or(BlobError::UnknownBlob(blob_id.0))?;
        if pbas.is_tombstone() {
            return Err(BlobError::UnknownBlob(blob_id.0));
        }

        debug!(
            "get_blob: pg={:?} shard={:?} blob={:?} trace={}",
            pg_id, shard_id, blob_id, trace_id
        );

        let raw = self
            .repl_dev
            .async_read(pbas, 0)
            .await
            .map_err(|e| BlobError::ReadFailed(e.to_string()))?;

        if raw.len() < BLOB_HEADER_SIZE {
            return Err(BlobError::ReadFailed("short read: header truncated".into()));
        }
        let header = BlobHeader::from_bytes(&raw);

        if !header.valid() {
            return Err(BlobError::ReadFailed("invalid blob header".into()));
        }
        if header.shard_id != shard_id.0 {
            return Err(BlobError::ReadFailed("shard id mismatch".into()));
        }

        let user_key_size = header.user_key_size as usize;
        let data_offset = header.data_offset as usize;
        let blob_size = header.blob_size as usize;

        if raw.len() < data_offset + blob_size {
            return Err(BlobError::ReadFailed("short read: body truncated".into()));
        }

        let user_key = raw[BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + user_key_size].to_vec();
        let body = &raw[data_offset..data_offset + blob_size];

        let recomputed = compute_blob_payload_hash(body, &user_key);
        if recomputed != header.payload_hash {
            return Err(BlobError::ChecksumMismatch);
        }

        if offset > blob_size as u64 {
            return Err(BlobError::InvalidArg(format!(
                "offset {} exceeds blob size {}",
                offset, blob_size
            )));
        }
        let req_len = if len == 0 { blob_size as u64 - offset } else { len };
        if offset + req_len > blob_size as u64 {
            return Err(BlobError::InvalidArg(format!(
                "range [{},{}) exceeds blob size {}",
                offset,
                offset + req_len,
                blob_size
            )));
        }

        let slice = &body[offset as usize..(offset + req_len) as usize];

        Ok(Blob {
            body: slice.to_vec(),
            user_key,
            object_offset: header.object_offset,
            leader_hint: self.repl_dev.get_leader_id(),
        })
    }

    pub async fn del_blob(&self, shard_id: ShardId, blob_id: BlobId, trace_id: u64) -> Result<(), BlobError> {
        self.fail_on_shutdown()?;
        self.incr_pending_request_num();
        let result = self.del_blob_inner(shard_id, blob_id, trace_id).await;
        self.decr_pending_request_num();
        result
    }

    async fn del_blob_inner(&self, shard_id: ShardId, blob_id: BlobId, trace_id: u64) -> Result<(), BlobError> {
        let shard = self.shard(shard_id)?;
        let pg_id = shard.placement_group;

        self.check_leader_and_ready()?;

        debug!(
            "del_blob: pg={:?} shard={:?} blob={:?} trace={}",
            pg_id, shard_id, blob_id, trace_id
        );

        let mut msg_header = ReplicationMessageHeader::new(MsgType::DelBlob, pg_id.0, shard_id, blob_id, 0, 0);
        msg_header.seal();

        let (tx, rx) = oneshot::channel();
        self.pending_dels.lock().unwrap().insert((pg_id, blob_id), tx);

        let alloc_result = self
            .repl_dev
            .async_alloc_write(msg_header, blob_id.0.to_le_bytes().to_vec(), Vec::new(), trace_id)
            .await;

        if let Err(e) = alloc_result {
            self.pending_dels.lock().unwrap().remove(&(pg_id, blob_id));
            return Err(e);
        }

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BlobError::RollBack),
        }
    }
}

#[async_trait]
impl ReplStateMachine for BlobManager {
    async fn blob_put_get_blk_alloc_hints(
        &self,
        header: &ReplicationMessageHeader,
    ) -> Result<AllocHints, BlobError> {
        let pg_id = PgId(header.pg_id);
        let shard_id = ShardId(header.shard_id);

        let shard = self
            .shards
            .read()
            .unwrap()
            .get(&shard_id)
            .cloned()
            .ok_or(BlobError::UnknownShard(header.shard_id))?;
        if shard.placement_group != pg_id {
            return Err(BlobError::UnknownShard(header.shard_id));
        }

        let committed_blk_id = if header.blob_id != 0 {
            self.pg_index(pg_id)
                .ok()
                .and_then(|index| index.get(IndexKey::new(shard_id, BlobId(header.blob_id))))
        } else {
            None
        };

        Ok(AllocHints {
            chunk_id_hint: Some(shard.p_chunk_id),
            pdev_id_hint: None,
            reserved_blks: if self.repl_dev.is_leader() {
                Some(header.payload_size)
            } else {
                None
            },
            committed_blk_id,
        })
    }

    async fn on_blob_put_commit(&self, lsn: u64, header: ReplicationMessageHeader, pbas: MultiBlkId) {
        if header.is_corrupt() {
            self.resolve_pending_put(header, Err(BlobError::ChecksumMismatch));
            return;
        }

        let pg_id = PgId(header.pg_id);
        let blob_id = BlobId(header.blob_id);
        let shard_id = ShardId(header.shard_id);

        let Ok(index) = self.pg_index(pg_id) else {
            self.resolve_pending_put(header, Err(BlobError::UnknownPg(pg_id)));
            return;
        };
        let Ok(counters) = self.pg_counters_or_err(pg_id) else {
            self.resolve_pending_put(header, Err(BlobError::UnknownPg(pg_id)));
            return;
        };

        // INSERT mode: a duplicate commit (follower replay of an already
        // applied LSN) must report `key_exists` rather than silently
        // overwriting, so the counter updates below can be skipped for it.
        let (status, _previous) = index.put(
            IndexKey::new(shard_id, blob_id),
            pbas.clone(),
            PutMode::Insert,
        );

        let result = match status {
            IndexStatus::Success => {
                // New insert: bump the monotonic counter (idempotent under
                // replay) and the live-blob accounting.
                counters.observe_blob_id(blob_id.0);
                counters.on_blob_inserted(pbas.blk_count as u64);
                Ok(())
            }
            IndexStatus::KeyExists => {
                // Already applied: the durable counters were bumped in the
                // proposer path before the superblock checkpoint preceding
                // this replay, so skip re-counting (see design notes on
                // checkpoint ordering).
                Ok(())
            }
            IndexStatus::NotFound => Err(BlobError::IndexError("put returned not_found".into())),
        };

        debug!("on_blob_put_commit: lsn={} pg={:?} blob={:?} -> {:?}", lsn, pg_id, blob_id, status);
        self.resolve_pending_put(header, result);
    }

    async fn on_blob_del_commit(&self, lsn: u64, header: ReplicationMessageHeader) {
        if header.is_corrupt() {
            self.resolve_pending_del(header, Err(BlobError::ChecksumMismatch));
            return;
        }

        let pg_id = PgId(header.pg_id);
        let blob_id = BlobId(header.blob_id);
        let shard_id = ShardId(header.shard_id);

        let Ok(index) = self.pg_index(pg_id) else {
            self.resolve_pending_del(header, Err(BlobError::UnknownPg(pg_id)));
            return;
        };

        let (status, previous) = index.put(
            IndexKey::new(shard_id, blob_id),
            MultiBlkId::tombstone(),
            PutMode::Update,
        );

        match status {
            IndexStatus::Success => match previous {
                None => unreachable!("UPDATE mode reports not_found, not success, on a missing key"),
                Some(ref prev) if prev.is_tombstone() => {
                    warn!(
                        "on_blob_del_commit: lsn={} pg={:?} blob={:?} already tombstoned, idempotent",
                        lsn, pg_id, blob_id
                    );
                }
                Some(prev) => {
                    // Free is best-effort: even on failure we still retire
                    // the blob from the live count, GC will reclaim later.
                    let _ = self.repl_dev.async_free_blks(lsn, prev).await;
                    if let Ok(counters) = self.pg_counters_or_err(pg_id) {
                        counters.on_blob_tombstoned();
                    }
                }
            },
            IndexStatus::NotFound => {
                warn!(
                    "on_blob_del_commit: lsn={} pg={:?} blob={:?} missing prior entry (baseline resync race), tolerated",
                    lsn, pg_id, blob_id
                );
            }
            IndexStatus::KeyExists => unreachable!("UPDATE mode never reports key_exists"),
        }

        self.resolve_pending_del(header, Ok(()));
    }

    async fn on_blob_message_rollback(&self, header: ReplicationMessageHeader) {
        match MsgType::from_u8(header.msg_type) {
            Some(MsgType::PutBlob) => self.resolve_pending_put(header, Err(BlobError::RollBack)),
            Some(MsgType::DelBlob) => self.resolve_pending_del(header, Err(BlobError::RollBack)),
            None => {}
        }
    }
}

impl BlobManager {
    fn resolve_pending_put(&self, header: ReplicationMessageHeader, result: Result<(), BlobError>) {
        let key = (PgId(header.pg_id), BlobId(header.blob_id));
        if let Some(tx) = self.pending_puts.lock().unwrap().remove(&key) {
            let _ = tx.send(result);
        }
    }

    fn resolve_pending_del(&self, header: ReplicationMessageHeader, result: Result<(), BlobError>) {
        let key = (PgId(header.pg_id), BlobId(header.blob_id));
        if let Some(tx) = self.pending_dels.lock().unwrap().remove(&key) {
            let _ = tx.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::InMemoryIndexTable;
    use crate::repl::LoopbackReplDev;
    use blobstore_types::{PChunkId, PgId};

    async fn setup() -> (Arc<BlobManager>, Arc<LoopbackReplDev>, ShardId) {
        let dev = Arc::new(LoopbackReplDev::new(16));
        let manager = BlobManager::new(dev.clone());
        dev.register_state_machine(manager.clone());

        let pg_id = PgId(1);
        let shard_id = ShardId::new(pg_id, 1);
        manager.register_pg(pg_id, Arc::new(InMemoryIndexTable::new()));
        manager.register_shard(ShardInfo {
            id: shard_id,
            placement_group: pg_id,
            p_chunk_id: PChunkId(1),
        });
        (manager, dev, shard_id)
    }

    #[tokio::test]
    async fn basic_put_get_scenario() {
        let (manager, _dev, shard_id) = setup().await;
        let blob_id = manager
            .put_blob(
                shard_id,
                BlobWrite {
                    body: b"hello".to_vec(),
                    user_key: b"k".to_vec(),
                    object_offset: 0,
                },
                1,
            )
            .await
            .unwrap();
        assert_eq!(blob_id, BlobId(0));

        let blob = manager.get_blob(shard_id, blob_id, 0, 0, 1).await.unwrap();
        assert_eq!(blob.body, b"hello");
        assert_eq!(blob.user_key, b"k");
        assert_eq!(blob.object_offset, 0);
    }

    #[tokio::test]
    async fn unaligned_body_round_trips_exact_length() {
        let (manager, _dev, shard_id) = setup().await;
        let blob_id = manager
            .put_blob(
                shard_id,
                BlobWrite {
                    body: vec![7u8; 5],
                    user_key: Vec::new(),
                    object_offset: 0,
                },
                1,
            )
            .await
            .unwrap();
        let blob = manager.get_blob(shard_id, blob_id, 0, 0, 1).await.unwrap();
        assert_eq!(blob.body.len(), 5);
    }

    #[tokio::test]
    async fn range_read_returns_exact_slice_and_rejects_out_of_bounds() {
        let (manager, _dev, shard_id) = setup().await;
        let body: Vec<u8> = (0..100u32).map(|b| b as u8).collect();
        let blob_id = manager
            .put_blob(
                shard_id,
                BlobWrite {
                    body,
                    user_key: Vec::new(),
                    object_offset: 0,
                },
                1,
            )
            .await
            .unwrap();

        let blob = manager.get_blob(shard_id, blob_id, 40, 20, 1).await.unwrap();
        assert_eq!(blob.body, (40u8..60).collect::<Vec<u8>>());

        let err = manager.get_blob(shard_id, blob_id, 90, 20, 1).await.unwrap_err();
        assert_eq!(err.kind(), blobstore_types::BlobErrorKind::InvalidArg);
    }

    #[tokio::test]
    async fn hash_tamper_on_disk_is_detected_as_checksum_mismatch() {
        let (manager, dev, shard_id) = setup().await;
        let blob_id = manager
            .put_blob(
                shard_id,
                BlobWrite {
                    body: b"hello".to_vec(),
                    user_key: b"k".to_vec(),
                    object_offset: 0,
                },
                1,
            )
            .await
            .unwrap();

        let index = manager.pg_index(PgId(1)).unwrap();
        let pbas = index.get(IndexKey::new(shard_id, blob_id)).unwrap();
        dev.corrupt_byte(&pbas, BLOB_HEADER_SIZE + 2);

        let err = manager.get_blob(shard_id, blob_id, 0, 0, 1).await.unwrap_err();
        assert_eq!(err.kind(), blobstore_types::BlobErrorKind::ChecksumMismatch);
    }

    #[tokio::test]
    async fn replaying_the_same_put_commit_does_not_double_count() {
        let (manager, _dev, shard_id) = setup().await;
        let blob_id = manager
            .put_blob(
                shard_id,
                BlobWrite {
                    body: b"hello".to_vec(),
                    user_key: Vec::new(),
                    object_offset: 0,
                },
                1,
            )
            .await
            .unwrap();

        let index = manager.pg_index(PgId(1)).unwrap();
        let pbas = index.get(IndexKey::new(shard_id, blob_id)).unwrap();
        let counters = manager.pg_counters(PgId(1)).unwrap();
        assert_eq!(counters.active_blob_count(), 1);
        assert_eq!(counters.total_occupied_blk_count(), pbas.blk_count as u64);

        // Follower replay of the already-applied commit must be a no-op on
        // the durable counters: the index reports `key_exists`.
        let mut msg_header =
            ReplicationMessageHeader::new(MsgType::PutBlob, shard_id.pg_id().0, shard_id, blob_id, 0, 0);
        msg_header.seal();
        manager.on_blob_put_commit(99, msg_header, pbas.clone()).await;

        assert_eq!(counters.active_blob_count(), 1);
        assert_eq!(counters.total_occupied_blk_count(), pbas.blk_count as u64);
    }

    #[tokio::test]
    async fn del_commit_for_never_put_blob_is_tolerated_as_baseline_resync_race() {
        let (manager, _dev, shard_id) = setup().await;

        // No put_blob happened: the index has never seen this blob, the
        // scenario spec.md:140 calls a "baseline-resync race".
        let mut msg_header = ReplicationMessageHeader::new(
            MsgType::DelBlob,
            shard_id.pg_id().0,
            shard_id,
            BlobId(0xbeef),
            0,
            0,
        );
        msg_header.seal();
        manager.on_blob_del_commit(1, msg_header).await;

        let pg_counters = manager.pg_counters(PgId(1)).unwrap();
        assert_eq!(pg_counters.active_blob_count(), 0);
        assert_eq!(pg_counters.tombstone_blob_count(), 0);
    }

    #[tokio::test]
    async fn delete_then_get_reports_unknown_blob() {
        let (manager, _dev, shard_id) = setup().await;
        let blob_id = manager
            .put_blob(
                shard_id,
                BlobWrite {
                    body: b"x".to_vec(),
                    user_key: Vec::new(),
                    object_offset: 0,
                },
                1,
            )
            .await
            .unwrap();

        manager.del_blob(shard_id, blob_id, 1).await.unwrap();
        let err = manager.get_blob(shard_id, blob_id, 0, 0, 1).await.unwrap_err();
        assert_eq!(err.kind(), blobstore_types::BlobErrorKind::UnknownBlob);

        let pg_counters = manager.pg_counters(PgId(1)).unwrap();
        assert_eq!(pg_counters.active_blob_count(), 0);
        assert_eq!(pg_counters.tombstone_blob_count(), 1);
    }

    #[tokio::test]
    async fn unknown_shard_is_rejected() {
        let (manager, _dev, _shard_id) = setup().await;
        let bogus = ShardId::new(PgId(99), 1);
        let err = manager
            .put_blob(
                bogus,
                BlobWrite {
                    body: b"x".to_vec(),
                    user_key: Vec::new(),
                    object_offset: 0,
                },
                1,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), blobstore_types::BlobErrorKind::UnknownShard);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_requests() {
        let (manager, _dev, shard_id) = setup().await;
        manager.request_shutdown();
        let err = manager.get_blob(shard_id, BlobId(0), 0, 0, 1).await.unwrap_err();
        assert_eq!(err.kind(), blobstore_types::BlobErrorKind::ShuttingDown);
        assert_eq!(manager.pending_requests(), 0);
    }
}
