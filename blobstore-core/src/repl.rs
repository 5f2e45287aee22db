//! Replication-engine contract (C7): the trait boundary the blob pipeline
//! calls into, and the callbacks the replication engine's state machine
//! invokes back into the blob pipeline on commit/rollback.
//!
//! Grounded on `pbs-datastore/src/read_chunk.rs`'s `AsyncReadChunk` trait
//! shape (an async trait over an I/O backend) for `ReplDev`, and on
//! `examples/original_source/.../hs_blob_manager.cpp`'s method surface
//! (`is_leader`, `get_leader_id`, `is_ready_for_traffic`, `get_blk_size`,
//! `async_alloc_write`, `async_read`, `async_free_blks`,
//! `blob_put_get_blk_alloc_hints`, `on_blob_put_commit`, `on_blob_del_commit`,
//! `on_blob_message_rollback`) for the split between the two traits: the
//! replication engine's own log/allocator surface (`ReplDev`) versus the
//! commit/rollback hooks it drives on the component that registered with it
//! (`ReplStateMachine`), per the design notes' "coarse-global callbacks"
//! entry (tagged context dispatched by the engine back to its registrant).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use blobstore_types::{AllocHints, BlobError, MultiBlkId};

use crate::blob_format::ReplicationMessageHeader;

/// Calls the blob pipeline makes into the replication engine.
#[async_trait]
pub trait ReplDev: Send + Sync {
    fn is_leader(&self) -> bool;
    fn get_leader_id(&self) -> Option<u64>;
    fn is_ready_for_traffic(&self) -> bool;
    fn get_blk_size(&self) -> u64;

    async fn async_alloc_write(
        &self,
        header: ReplicationMessageHeader,
        key: Vec<u8>,
        payload: Vec<u8>,
        trace_id: u64,
    ) -> Result<MultiBlkId, BlobError>;

    async fn async_read(&self, blkid: MultiBlkId, len: usize) -> Result<Vec<u8>, BlobError>;

    async fn async_free_blks(&self, lsn: u64, blkid: MultiBlkId) -> Result<(), BlobError>;
}

/// Callbacks the replication engine's state machine drives on the component
/// that registered with it (the blob pipeline). Delivered in log order for a
/// given PG.
#[async_trait]
pub trait ReplStateMachine: Send + Sync {
    async fn blob_put_get_blk_alloc_hints(
        &self,
        header: &ReplicationMessageHeader,
    ) -> Result<AllocHints, BlobError>;

    async fn on_blob_put_commit(&self, lsn: u64, header: ReplicationMessageHeader, pbas: MultiBlkId);

    async fn on_blob_del_commit(&self, lsn: u64, header: ReplicationMessageHeader);

    async fn on_blob_message_rollback(&self, header: ReplicationMessageHeader);
}

/// Minimal in-memory `ReplDev` that commits synchronously and loops the
/// commit callback straight back into a registered `ReplStateMachine`. No
/// real replication, persistence or batching — purely so the blob pipeline
/// can be exercised end to end in tests.
pub struct LoopbackReplDev {
    blk_size: u64,
    leader: AtomicBool,
    ready: AtomicBool,
    next_blk_num: AtomicU64,
    lsn_counter: AtomicU64,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    handler: Mutex<Option<Arc<dyn ReplStateMachine>>>,
}

impl LoopbackReplDev {
    pub fn new(blk_size: u64) -> Self {
        LoopbackReplDev {
            blk_size,
            leader: AtomicBool::new(true),
            ready: AtomicBool::new(true),
            next_blk_num: AtomicU64::new(0),
            lsn_counter: AtomicU64::new(0),
            blocks: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
        }
    }

    pub fn register_state_machine(&self, handler: Arc<dyn ReplStateMachine>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Test hook: corrupt one byte of the block backing `blkid`, to drive the
    /// hash-tamper scenario.
    pub fn corrupt_byte(&self, blkid: &MultiBlkId, offset: usize) {
        let mut blocks = self.blocks.lock().unwrap();
        if let Some(buf) = blocks.get_mut(&blkid.blk_num) {
            if let Some(byte) = buf.get_mut(offset) {
                *byte ^= 0xff;
            }
        }
    }

    fn handler(&self) -> Option<Arc<dyn ReplStateMachine>> {
        self.handler.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplDev for LoopbackReplDev {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Relaxed)
    }

    fn get_leader_id(&self) -> Option<u64> {
        if self.is_leader() {
            None
        } else {
            Some(1)
        }
    }

    fn is_ready_for_traffic(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    fn get_blk_size(&self) -> u64 {
        self.blk_size
    }

    async fn async_alloc_write(
        &self,
        header: ReplicationMessageHeader,
        _key: Vec<u8>,
        payload: Vec<u8>,
        _trace_id: u64,
    ) -> Result<MultiBlkId, BlobError> {
        use crate::blob_format::MsgType;

        let handler = self
            .handler()
            .ok_or_else(|| BlobError::Unknown("no state machine registered".into()))?;

        // The engine consults the registrant for allocation hints before
        // committing; unknown PG/shard surfaces as a retryable error rather
        // than failing the write outright.
        let _hints = handler.blob_put_get_blk_alloc_hints(&header).await?;

        let blk_count = (payload.len() as u64).div_ceil(self.blk_size.max(1)) as u32;
        let blk_num = self
            .next_blk_num
            .fetch_add(blk_count as u64, Ordering::Relaxed);
        self.blocks.lock().unwrap().insert(blk_num, payload);
        let pbas = MultiBlkId::new(blk_num, blk_count);

        let lsn = self.lsn_counter.fetch_add(1, Ordering::Relaxed);
        match MsgType::from_u8(header.msg_type) {
            Some(MsgType::PutBlob) => handler.on_blob_put_commit(lsn, header, pbas.clone()).await,
            Some(MsgType::DelBlob) => handler.on_blob_del_commit(lsn, header).await,
            None => {}
        }
        Ok(pbas)
    }

    async fn async_read(&self, blkid: MultiBlkId, len: usize) -> Result<Vec<u8>, BlobError> {
        let blocks = self.blocks.lock().unwrap();
        let buf = blocks
            .get(&blkid.blk_num)
            .ok_or_else(|| BlobError::ReadFailed(format!("no block at {}", blkid.blk_num)))?;
        let take = if len == 0 { buf.len() } else { len.min(buf.len()) };
        Ok(buf[..take].to_vec())
    }

    async fn async_free_blks(&self, _lsn: u64, blkid: MultiBlkId) -> Result<(), BlobError> {
        self.blocks.lock().unwrap().remove(&blkid.blk_num);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopStateMachine;

    #[async_trait]
    impl ReplStateMachine for NoopStateMachine {
        async fn blob_put_get_blk_alloc_hints(
            &self,
            _header: &ReplicationMessageHeader,
        ) -> Result<AllocHints, BlobError> {
            Ok(AllocHints::default())
        }

        async fn on_blob_put_commit(&self, _lsn: u64, _header: ReplicationMessageHeader, _pbas: MultiBlkId) {}

        async fn on_blob_del_commit(&self, _lsn: u64, _header: ReplicationMessageHeader) {}

        async fn on_blob_message_rollback(&self, _header: ReplicationMessageHeader) {}
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dev = LoopbackReplDev::new(4096);
        dev.register_state_machine(Arc::new(NoopStateMachine));
        let header = ReplicationMessageHeader::new(
            crate::blob_format::MsgType::PutBlob,
            1,
            blobstore_types::ShardId::new(blobstore_types::PgId(1), 1),
            blobstore_types::BlobId(0),
            5,
            0,
        );
        let pbas = dev
            .async_alloc_write(header, vec![], b"hello".to_vec(), 0)
            .await
            .unwrap();
        assert_eq!(pbas.blk_count, 1);
        let data = dev.async_read(pbas, 0).await.unwrap();
        assert_eq!(data, b"hello");
    }
}
