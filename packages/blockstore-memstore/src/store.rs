//! Memory Store facade: composes the accountant, lock table, index, and
//! unroll engine into the single entry point the rest of the engine calls.
//!
//! Follows the same shape as a `storage::impls::default_record_store`:
//! one struct that owns every collaborator outright and exposes a small,
//! blocking, synchronous API -- no `async_trait`, since §5 rules out
//! suspension inside the core.

use std::cell::Cell;
use std::sync::Arc;

use blockstore_core::{BlockId, MemoryMode, StorageLevel};
use parking_lot::Mutex;

use crate::chunked_bytes::{ChunkedByteSink, ChunkedBytes};
use crate::config::BlockStoreConfig;
use crate::error::{AdmissionRejectedReason, BlockStoreError};
use crate::index::{BlockIndex, EvictionEngine, ResidentEntry};
use crate::locks::{BlockLockTable, LockOutcome, TaskId};
use crate::memory::MemoryAccountant;
use crate::traits::{BlockEvictionHandler, EstimateSize, SerializerManager};
use crate::unroll::{PartialUnroll, UnrollEngine, UnrollOutcome};

/// Result of a `put_iterator_as_*` call that did not hit a hard error.
///
/// `AdmissionRejected` is reserved for paths with no iterator remainder to
/// hand back (the finalize-transfer failure after the source sequence was
/// already fully consumed); whenever some records are unprocessed, the
/// caller gets them back via `Partial` instead of losing them to an error.
#[derive(Debug)]
pub enum PutIteratorOutcome<T, Rest> {
    Admitted,
    Partial(PartialUnroll<T, Rest>),
}

thread_local! {
    static EVICTING_ON_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Resets the reentrancy flag when a guarded eviction pass ends, including
/// on an unwind out of the handler.
struct EvictionGuard;

impl Drop for EvictionGuard {
    fn drop(&mut self) {
        EVICTING_ON_THIS_THREAD.with(|flag| flag.set(false));
    }
}

/// In-memory block store with cooperative unroll-and-evict admission.
pub struct MemoryStore<R> {
    config: BlockStoreConfig,
    accountant: MemoryAccountant,
    lock_table: BlockLockTable,
    index: Mutex<BlockIndex<R>>,
    handler: Arc<dyn BlockEvictionHandler<R>>,
    serializer_manager: Arc<dyn SerializerManager<R>>,
}

impl<R> MemoryStore<R> {
    #[must_use]
    pub fn new(config: BlockStoreConfig, handler: Arc<dyn BlockEvictionHandler<R>>, serializer_manager: Arc<dyn SerializerManager<R>>) -> Self {
        let accountant = MemoryAccountant::new(&config);
        Self {
            config,
            accountant,
            lock_table: BlockLockTable::new(),
            index: Mutex::new(BlockIndex::new()),
            handler,
            serializer_manager,
        }
    }

    /// Lets the execution engine report how much of the shared pool it is
    /// currently using, so storage acquisitions see the true free space.
    pub fn observe_execution_used(&self, n: u64, mode: MemoryMode) {
        self.accountant.observe_execution_used(n, mode);
    }

    #[must_use]
    pub fn contains(&self, id: &BlockId) -> bool {
        self.index.lock().contains(id)
    }

    #[must_use]
    pub fn memory_used(&self, mode: MemoryMode) -> crate::memory::PoolSnapshot {
        self.accountant.snapshot(mode)
    }

    fn guard_against_reentrancy(&self, id: &BlockId) -> Result<(), BlockStoreError> {
        if EVICTING_ON_THIS_THREAD.with(std::cell::Cell::get) {
            return Err(BlockStoreError::ReentrantEviction { id: id.clone() });
        }
        Ok(())
    }

    /// Runs one eviction pass on the calling thread, under the reentrancy
    /// guard, and returns the bytes freed.
    fn run_eviction(&self, requesting: &BlockId, bytes_needed: u64, mode: MemoryMode, evictor_task: TaskId) -> u64 {
        EVICTING_ON_THIS_THREAD.with(|flag| flag.set(true));
        let _guard = EvictionGuard;
        let engine = EvictionEngine::new(&self.accountant, &self.lock_table, self.handler.as_ref());
        engine.evict_to_free(&self.index, requesting, bytes_needed, mode, evictor_task)
    }

    fn free_bytes(&self, mode: MemoryMode) -> u64 {
        let snap = self.accountant.snapshot(mode);
        snap.max_total
            .saturating_sub(snap.storage_used)
            .saturating_sub(snap.unroll_used)
            .saturating_sub(snap.execution_used)
    }

    /// Acquires a storage reservation for `id`, running a single eviction
    /// pass and retrying exactly once if the initial acquisition fails
    /// (the chosen resolution to the post-eviction retry race: evict, then
    /// retry acquisition under the accountant's own lock rather than
    /// re-entering the eviction loop).
    fn ensure_storage_room(&self, id: &BlockId, size: u64, mode: MemoryMode, task_id: TaskId) -> bool {
        if self.accountant.acquire_storage(size, mode) {
            return true;
        }
        let shortfall = size.saturating_sub(self.free_bytes(mode));
        if shortfall > 0 {
            self.run_eviction(id, shortfall, mode, task_id);
        }
        self.accountant.acquire_storage(size, mode)
    }

    /// Distinguishes `InsufficientMemory` (nothing could ever make room,
    /// even after evicting every eligible block) from `EvictionForbidden`
    /// (the only occupants of this mode belong to the requester's own
    /// dataset, so eviction never had a candidate to try).
    fn classify_rejection(&self, id: &BlockId, size: u64, mode: MemoryMode) -> AdmissionRejectedReason {
        if size > self.accountant.snapshot(mode).max_total {
            return AdmissionRejectedReason::InsufficientMemory;
        }
        let exclude = id.dataset_id();
        let has_other_candidate = self
            .index
            .lock()
            .next_eviction_candidate(mode, exclude, &std::collections::HashSet::new())
            .is_some();
        if has_other_candidate {
            AdmissionRejectedReason::InsufficientMemory
        } else {
            AdmissionRejectedReason::EvictionForbidden
        }
    }

    fn try_grow_unroll(&self, id: &BlockId, needed: u64, mode: MemoryMode, task_id: TaskId) -> bool {
        let shortfall = needed.saturating_sub(self.free_bytes(mode));
        if shortfall > 0 {
            self.run_eviction(id, shortfall, mode, task_id);
        }
        self.accountant.acquire_unroll(needed, mode)
    }

    fn finalize_transfer(&self, id: &BlockId, bytes_held: u64, final_size: u64, mode: MemoryMode, task_id: TaskId) -> bool {
        if self.accountant.transfer_unroll_to_storage(bytes_held, final_size, mode) {
            return true;
        }
        let extra = final_size.saturating_sub(bytes_held);
        self.run_eviction(id, extra, mode, task_id);
        self.accountant.transfer_unroll_to_storage(bytes_held, final_size, mode)
    }

    /// Stores a block whose bytes are already fully materialized -- no
    /// unroll loop, just a single storage reservation.
    pub fn put_bytes(&self, id: BlockId, bytes: ChunkedBytes, mode: MemoryMode, level: StorageLevel, task_id: TaskId) -> Result<(), BlockStoreError> {
        self.guard_against_reentrancy(&id)?;
        let Some(write_guard) = self.lock_table.start_write(id.clone(), task_id) else {
            return Err(BlockStoreError::DuplicateBlock { id });
        };

        let size = bytes.len();
        if !self.ensure_storage_room(&id, size, mode, task_id) {
            let reason = self.classify_rejection(&id, size, mode);
            self.lock_table.remove_block_entry(write_guard);
            return Err(BlockStoreError::AdmissionRejected { id, reason });
        }

        self.index.lock().insert(id.clone(), ResidentEntry::Serialized { bytes, size }, mode, level);
        let _ = self.lock_table.downgrade_to_read(write_guard);
        Ok(())
    }

    /// Unrolls `records` into a deserialized in-memory buffer, admitting it
    /// on success. A sequence that cannot be fully materialized comes back
    /// as `Ok(PutIteratorOutcome::Partial(..))` carrying both the prefix
    /// already unrolled and the unconsumed remainder of `records`, so the
    /// caller can decide whether to retry, spill, or give up.
    pub fn put_iterator_as_values<I>(&self, id: BlockId, records: I, mode: MemoryMode, level: StorageLevel, task_id: TaskId) -> Result<PutIteratorOutcome<Vec<R>, I::IntoIter>, BlockStoreError>
    where
        R: EstimateSize,
        I: IntoIterator<Item = R>,
    {
        self.guard_against_reentrancy(&id)?;
        let Some(write_guard) = self.lock_table.start_write(id.clone(), task_id) else {
            return Err(BlockStoreError::DuplicateBlock { id });
        };

        let engine = UnrollEngine::new(&self.accountant, &self.config);
        let outcome = engine.unroll_values(records, mode, |needed| self.try_grow_unroll(&id, needed, mode, task_id));

        match outcome {
            UnrollOutcome::Success { value, bytes_held, final_size } => {
                if !self.finalize_transfer(&id, bytes_held, final_size, mode, task_id) {
                    self.accountant.release_unroll(bytes_held, mode);
                    self.lock_table.remove_block_entry(write_guard);
                    return Err(BlockStoreError::AdmissionRejected {
                        id,
                        reason: AdmissionRejectedReason::InsufficientMemory,
                    });
                }
                self.index.lock().insert(
                    id.clone(),
                    ResidentEntry::Deserialized {
                        records: Arc::new(value),
                        size: final_size,
                    },
                    mode,
                    level,
                );
                let _ = self.lock_table.downgrade_to_read(write_guard);
                Ok(PutIteratorOutcome::Admitted)
            }
            UnrollOutcome::Partial(partial) => {
                if partial.bytes_held > 0 {
                    self.accountant.release_unroll(partial.bytes_held, mode);
                }
                self.lock_table.remove_block_entry(write_guard);
                Ok(PutIteratorOutcome::Partial(partial))
            }
        }
    }

    /// Unrolls `records` into a serialized byte buffer via the configured
    /// `SerializerManager`, admitting it on success. See
    /// [`Self::put_iterator_as_values`] for how a partial unroll is
    /// reported.
    pub fn put_iterator_as_bytes<I>(
        &self,
        id: BlockId,
        records: I,
        mode: MemoryMode,
        level: StorageLevel,
        serializer_tag: &str,
        task_id: TaskId,
    ) -> Result<PutIteratorOutcome<ChunkedBytes, I::IntoIter>, BlockStoreError>
    where
        I: IntoIterator<Item = R>,
    {
        self.guard_against_reentrancy(&id)?;
        let Some(write_guard) = self.lock_table.start_write(id.clone(), task_id) else {
            return Err(BlockStoreError::DuplicateBlock { id });
        };

        let serializer = match self.serializer_manager.get_serializer(serializer_tag, true) {
            Ok(s) => s,
            Err(source) => {
                self.lock_table.remove_block_entry(write_guard);
                return Err(BlockStoreError::Serialization { id, source });
            }
        };

        let sink = ChunkedByteSink::new(self.config.chunk_size_bytes);
        let sink = match self.serializer_manager.wrap_for_compression(&id, sink) {
            Ok(s) => s,
            Err(source) => {
                self.lock_table.remove_block_entry(write_guard);
                return Err(BlockStoreError::Serialization { id, source });
            }
        };

        let engine = UnrollEngine::new(&self.accountant, &self.config);
        let outcome = engine.unroll_bytes(records, sink, serializer.as_ref(), mode, |needed| self.try_grow_unroll(&id, needed, mode, task_id));

        let outcome = match outcome {
            Ok(o) => o,
            Err(source) => {
                self.lock_table.remove_block_entry(write_guard);
                return Err(BlockStoreError::Serialization { id, source });
            }
        };

        match outcome {
            UnrollOutcome::Success { value, bytes_held, final_size } => {
                if !self.finalize_transfer(&id, bytes_held, final_size, mode, task_id) {
                    self.accountant.release_unroll(bytes_held, mode);
                    self.lock_table.remove_block_entry(write_guard);
                    return Err(BlockStoreError::AdmissionRejected {
                        id,
                        reason: AdmissionRejectedReason::InsufficientMemory,
                    });
                }
                self.index.lock().insert(id.clone(), ResidentEntry::Serialized { bytes: value, size: final_size }, mode, level);
                let _ = self.lock_table.downgrade_to_read(write_guard);
                Ok(PutIteratorOutcome::Admitted)
            }
            UnrollOutcome::Partial(partial) => {
                if partial.bytes_held > 0 {
                    self.accountant.release_unroll(partial.bytes_held, mode);
                }
                self.lock_table.remove_block_entry(write_guard);
                Ok(PutIteratorOutcome::Partial(partial))
            }
        }
    }

    /// Reads a resident block as bytes. Fails with `WrongVariant` if it is
    /// actually resident as deserialized values.
    pub fn get_bytes(&self, id: &BlockId, task_id: TaskId) -> Result<ChunkedBytes, BlockStoreError> {
        self.guard_against_reentrancy(id)?;
        match self.lock_table.lock_for_reading(id, true, task_id) {
            LockOutcome::Unknown => Err(BlockStoreError::UnknownBlock { id: id.clone() }),
            LockOutcome::WouldBlock => unreachable!("blocking lock request never returns WouldBlock"),
            LockOutcome::Acquired(guard) => {
                let mut index = self.index.lock();
                index.record_access(id);
                let result = match index.get(id) {
                    Some(entry) => match &entry.resident {
                        ResidentEntry::Serialized { bytes, .. } => Ok(bytes.clone()),
                        ResidentEntry::Deserialized { .. } => Err(BlockStoreError::WrongVariant { id: id.clone() }),
                    },
                    None => Err(BlockStoreError::UnknownBlock { id: id.clone() }),
                };
                drop(index);
                self.lock_table.unlock_read(&guard);
                result
            }
        }
    }

    /// Reads a resident block as deserialized values. Fails with
    /// `WrongVariant` if it is actually resident as serialized bytes.
    /// Cheap: the returned `Arc` shares the resident buffer.
    pub fn get_values(&self, id: &BlockId, task_id: TaskId) -> Result<Arc<Vec<R>>, BlockStoreError> {
        self.guard_against_reentrancy(id)?;
        match self.lock_table.lock_for_reading(id, true, task_id) {
            LockOutcome::Unknown => Err(BlockStoreError::UnknownBlock { id: id.clone() }),
            LockOutcome::WouldBlock => unreachable!("blocking lock request never returns WouldBlock"),
            LockOutcome::Acquired(guard) => {
                let mut index = self.index.lock();
                index.record_access(id);
                let result = match index.get(id) {
                    Some(entry) => match &entry.resident {
                        ResidentEntry::Deserialized { records, .. } => Ok(records.clone()),
                        ResidentEntry::Serialized { .. } => Err(BlockStoreError::WrongVariant { id: id.clone() }),
                    },
                    None => Err(BlockStoreError::UnknownBlock { id: id.clone() }),
                };
                drop(index);
                self.lock_table.unlock_read(&guard);
                result
            }
        }
    }

    /// Removes a block if present. Unlike reads, an absent id is not an
    /// error (§7): removing something that is already gone is a no-op.
    pub fn remove(&self, id: &BlockId, task_id: TaskId) -> Result<(), BlockStoreError> {
        self.guard_against_reentrancy(id)?;
        match self.lock_table.lock_for_writing(id, true, task_id) {
            LockOutcome::Unknown => Ok(()),
            LockOutcome::WouldBlock => unreachable!("blocking lock request never returns WouldBlock"),
            LockOutcome::Acquired(guard) => {
                if let Some(entry) = self.index.lock().remove(id) {
                    self.accountant.release_storage(entry.resident.size(), entry.mode);
                }
                self.lock_table.remove_block_entry(guard);
                Ok(())
            }
        }
    }

    /// Drops every resident block and releases its storage reservation.
    /// Assumes no put/get is in flight; for shutdown and test teardown.
    pub fn clear(&self) {
        let drained = self.index.lock().drain();
        for (_, entry) in drained {
            self.accountant.release_storage(entry.resident.size(), entry.mode);
        }
    }

    /// Releases every lock `task_id` holds across this store, for a
    /// cancelled or completed task attempt.
    pub fn release_all_locks_for_task(&self, task_id: TaskId) {
        self.lock_table.release_all_locks_for_task(task_id);
    }
}
