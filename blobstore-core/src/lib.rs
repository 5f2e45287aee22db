//! Core of a distributed blob-object storage node atop a replicated block
//! device.
//!
//! # Chunk selector (C1–C4)
//!
//! Physical storage is grouped into fixed-size chunks, tracked by the
//! [`chunk_registry`] as [`chunk_registry::ChunkRecord`]s. Unbound chunks sit
//! in a per-device [`device_heap::DeviceHeap`], ordered by free-block count,
//! until a placement group claims a batch of them into its own
//! [`pg_chunks::PgChunkCollection`]. [`chunk_selector::ChunkSelector`] is the
//! single façade orchestrating all three under one coarse `registry_lock`,
//! matching the acquisition order documented there: the coarse lock (shared)
//! before any per-PG lock, before any per-device lock.
//!
//! # Blob pipeline (C5–C6)
//!
//! [`blob_manager::BlobManager`] implements PUT/GET/DELETE against a shard.
//! Writes are proposed through the [`repl::ReplDev`] trait (the replication
//! engine, out of scope here) and only take effect on the durable
//! [`index::IndexTable`] and [`counters::PgDurableCounters`] when the
//! engine's commit callback fires, in log order. [`blob_format`] defines the
//! on-disk blob layout and the on-wire replication message header, including
//! the CRC seal used to detect corruption on read.
//!
//! # Scope
//!
//! The replication engine itself, the block-device allocator, the B-tree
//! index engine, superblock checkpointing and the CLI/service binding are
//! external collaborators. This crate defines only the contracts consumed
//! from and presented to them ([`repl::ReplDev`], [`index::IndexTable`]) plus
//! an in-memory stand-in of each for tests.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod blob_format;
pub mod blob_manager;
pub mod chunk_registry;
pub mod chunk_selector;
pub mod counters;
pub mod device_heap;
pub mod index;
pub mod pg_chunks;
pub mod repl;

pub use blob_manager::{Blob, BlobManager, BlobWrite, ShardInfo};
pub use chunk_selector::ChunkSelector;
pub use counters::{PgDurableCounters, PgDurableCountersSnapshot};
pub use index::{InMemoryIndexTable, IndexKey, IndexStatus, IndexTable, PutMode};
pub use repl::{LoopbackReplDev, ReplDev, ReplStateMachine};
