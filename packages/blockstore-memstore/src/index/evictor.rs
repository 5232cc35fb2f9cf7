//! Eviction engine (§4.4): scans the index in access order and displaces
//! blocks until enough room has been freed, or frees nothing at all.
//!
//! Runs in two phases, per §4.4 step 3: first collect candidates (taking a
//! non-blocking write lock on each, without removing anything from the
//! index) until their accumulated size would satisfy `bytes_needed` or no
//! further candidate exists; only then, if the accumulated size is enough,
//! commit by removing each from the index and calling the external
//! handler. If candidates run out before the target is reached, every
//! write lock obtained during the scan is released and nothing is
//! evicted -- partial eviction never happens, so a request that can't be
//! fully satisfied leaves every candidate block untouched.
//!
//! Lock ordering follows §5 exactly: the index mutex is taken only to pick
//! the next candidate during the scan and again, briefly, to remove it
//! during the commit phase; it is never held while [`BlockEvictionHandler::
//! drop_from_memory`] runs. The accountant is never locked while the index
//! is locked.

use std::collections::HashSet;

use blockstore_core::{BlockId, MemoryMode};
use parking_lot::Mutex;

use crate::locks::{BlockLockTable, TaskId, WriteLockGuard};
use crate::memory::MemoryAccountant;
use crate::traits::{BlockEvictionHandler, BlockPayload};

use super::{BlockIndex, ResidentEntry};

/// Runs one eviction pass against a shared index.
pub struct EvictionEngine<'a, R> {
    accountant: &'a MemoryAccountant,
    lock_table: &'a BlockLockTable,
    handler: &'a dyn BlockEvictionHandler<R>,
}

impl<'a, R> EvictionEngine<'a, R> {
    #[must_use]
    pub fn new(accountant: &'a MemoryAccountant, lock_table: &'a BlockLockTable, handler: &'a dyn BlockEvictionHandler<R>) -> Self {
        Self {
            accountant,
            lock_table,
            handler,
        }
    }

    /// Evicts least-recently-used blocks of `mode`, excluding
    /// `requesting`'s own dataset, until at least `bytes_needed` bytes have
    /// been freed. Returns the total bytes freed: either `0` (nothing
    /// evicted, because candidates never covered `bytes_needed`) or a
    /// value `>= bytes_needed` -- eviction is all-or-nothing, never
    /// partial.
    pub fn evict_to_free(&self, index: &Mutex<BlockIndex<R>>, requesting: &BlockId, bytes_needed: u64, mode: MemoryMode, evictor_task: TaskId) -> u64 {
        let (candidates, accumulated) = self.scan(index, requesting, bytes_needed, mode, evictor_task);

        if accumulated < bytes_needed {
            for (_, write_guard) in candidates {
                self.lock_table.unlock_write(&write_guard);
            }
            return 0;
        }

        let mut freed: u64 = 0;
        for (id, write_guard) in candidates {
            let Some(entry) = index.lock().remove(&id) else {
                // Unreachable in practice: the write lock taken during the
                // scan is held continuously until here, so nothing else
                // can have removed this entry in between. Kept defensive
                // rather than asserted, to avoid panicking on a future bug.
                self.lock_table.remove_block_entry(write_guard);
                continue;
            };

            let payload = match &entry.resident {
                ResidentEntry::Deserialized { records, .. } => BlockPayload::Values(records.as_slice()),
                ResidentEntry::Serialized { bytes, .. } => BlockPayload::Bytes(bytes),
            };
            let new_level = self.handler.drop_from_memory(&id, payload);

            let size = entry.resident.size();
            self.accountant.release_storage(size, entry.mode);
            freed += size;

            if new_level.is_retained() {
                tracing::debug!(?id, "evicted block retained at another tier");
                self.lock_table.unlock_write(&write_guard);
            } else {
                self.lock_table.remove_block_entry(write_guard);
            }
        }

        freed
    }

    fn scan(&self, index: &Mutex<BlockIndex<R>>, requesting: &BlockId, bytes_needed: u64, mode: MemoryMode, evictor_task: TaskId) -> (Vec<(BlockId, WriteLockGuard)>, u64) {
        let exclude_dataset = requesting.dataset_id();
        let mut skip: HashSet<BlockId> = HashSet::new();
        let mut collected: Vec<(BlockId, WriteLockGuard)> = Vec::new();
        let mut accumulated: u64 = 0;

        while accumulated < bytes_needed {
            let candidate = index.lock().next_eviction_candidate(mode, exclude_dataset, &skip);
            let Some((id, size)) = candidate else {
                break;
            };

            let Some(write_guard) = self.lock_table.try_lock_for_writing(&id, evictor_task).acquired() else {
                skip.insert(id);
                continue;
            };

            skip.insert(id.clone());
            accumulated += size;
            collected.push((id, write_guard));
        }

        (collected, accumulated)
    }
}
