//! Access-ordered block index (§4.4): the resident-block map plus the LRU
//! ordering structure the eviction engine scans.
//!
//! No intrusive linked list and no `lru` crate (outside this workspace's
//! dependency stack, and an intrusive list would need `unsafe`, forbidden
//! workspace-wide). Instead a plain `HashMap<BlockId, _>` for lookup plus a
//! `BTreeMap<tick, BlockId>` for order: touching a block removes its old
//! tick and inserts a fresh one, and scanning the `BTreeMap` ascending
//! visits blocks least-recently-used first. `tick` is a private
//! monotonically increasing counter, not a wall-clock timestamp, so it
//! stays well-ordered even if two accesses land in the same instant.

pub mod evictor;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use blockstore_core::{BlockId, DatasetId, MemoryMode, StorageLevel};

use crate::chunked_bytes::ChunkedBytes;

pub use evictor::EvictionEngine;

/// The in-memory form of a resident block: either deserialized records or
/// an encoded byte sequence, depending on how it was put.
pub enum ResidentEntry<R> {
    Deserialized { records: Arc<Vec<R>>, size: u64 },
    Serialized { bytes: ChunkedBytes, size: u64 },
}

impl<R> ResidentEntry<R> {
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            ResidentEntry::Deserialized { size, .. } | ResidentEntry::Serialized { size, .. } => *size,
        }
    }
}

/// A resident block plus the bookkeeping the index needs: which pool it was
/// charged against, the storage level reported to the rest of the engine,
/// and access metadata supplementing the base design with simple hit
/// counting and an age marker (useful for diagnostics and for tests that
/// assert an LRU ordering held).
pub struct IndexedEntry<R> {
    pub resident: ResidentEntry<R>,
    pub mode: MemoryMode,
    pub storage_level: StorageLevel,
    pub created_at: Instant,
    pub hits: u64,
}

/// Access-ordered map of resident blocks.
#[derive(Default)]
pub struct BlockIndex<R> {
    entries: HashMap<BlockId, IndexedEntry<R>>,
    order: BTreeMap<u64, BlockId>,
    ticks: HashMap<BlockId, u64>,
    next_tick: u64,
}

impl<R> BlockIndex<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            ticks: HashMap::new(),
            next_tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    /// Inserts a newly-materialized block as the most-recently-used entry.
    pub fn insert(&mut self, id: BlockId, resident: ResidentEntry<R>, mode: MemoryMode, storage_level: StorageLevel) {
        let tick = self.next_tick();
        self.order.insert(tick, id.clone());
        self.ticks.insert(id.clone(), tick);
        self.entries.insert(
            id,
            IndexedEntry {
                resident,
                mode,
                storage_level,
                created_at: Instant::now(),
                hits: 0,
            },
        );
    }

    /// Marks `id` as just accessed, moving it to the most-recently-used end
    /// and incrementing its hit count. No-op if `id` is absent.
    pub fn record_access(&mut self, id: &BlockId) {
        if !self.entries.contains_key(id) {
            return;
        }
        if let Some(old_tick) = self.ticks.remove(id) {
            self.order.remove(&old_tick);
        }
        let tick = self.next_tick();
        self.order.insert(tick, id.clone());
        self.ticks.insert(id.clone(), tick);
        if let Some(entry) = self.entries.get_mut(id) {
            entry.hits += 1;
        }
    }

    #[must_use]
    pub fn get(&self, id: &BlockId) -> Option<&IndexedEntry<R>> {
        self.entries.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &BlockId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&mut self, id: &BlockId) -> Option<IndexedEntry<R>> {
        if let Some(tick) = self.ticks.remove(id) {
            self.order.remove(&tick);
        }
        self.entries.remove(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry, returning them in no particular order. For
    /// shutdown and test teardown; does not touch the lock table.
    pub fn drain(&mut self) -> Vec<(BlockId, IndexedEntry<R>)> {
        self.order.clear();
        self.ticks.clear();
        self.entries.drain().collect()
    }

    /// The next block eviction should try to displace: least-recently-used
    /// first, restricted to `mode`, excluding blocks of `exclude_dataset`
    /// (so evicting one partition of a dataset never frees room by evicting
    /// another partition of the same dataset -- that would just displace
    /// the cache's own recent write) and blocks already in `skip` (locked
    /// candidates the caller has already tried and could not acquire this
    /// pass).
    #[must_use]
    pub fn next_eviction_candidate(
        &self,
        mode: MemoryMode,
        exclude_dataset: Option<DatasetId>,
        skip: &HashSet<BlockId>,
    ) -> Option<(BlockId, u64)> {
        for id in self.order.values() {
            if skip.contains(id) {
                continue;
            }
            let Some(entry) = self.entries.get(id) else {
                continue;
            };
            if entry.mode != mode {
                continue;
            }
            if let Some(ds) = exclude_dataset {
                if id.dataset_id() == Some(ds) {
                    continue;
                }
            }
            return Some((id.clone(), entry.resident.size()));
        }
        None
    }
}
