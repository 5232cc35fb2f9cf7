//! Block Lock Table (§4.2).
//!
//! Per-block read/write locks with task-affinity bookkeeping: a
//! `parking_lot::Mutex`-guarded table plus a `Condvar` for blocking
//! waiters, plus an auxiliary `task_id -> locked blocks` index (here a
//! [`dashmap::DashMap`], the same concurrent-map choice as
//! `storage::engines::hashmap`) so `release_all_locks_for_task` does not
//! need an O(n) scan of every block in the store.

use std::collections::{HashMap, HashSet};

use blockstore_core::BlockId;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

/// Identifies the task (or evicting thread) that owns a lock, for
/// `release_all_locks_for_task` bookkeeping.
pub type TaskId = u64;

#[derive(Debug, Default)]
struct LockState {
    readers: HashSet<TaskId>,
    writer: Option<TaskId>,
}

impl LockState {
    fn is_free(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

/// A held write lock. Not `Drop`-based: callers must explicitly `unlock`,
/// `downgrade_to_read`, or `remove_block_entry` it, mirroring the explicit
/// lock/unlock discipline §4.2 describes (there is no implicit scope to tie
/// a destructor to -- a write lock outlives the call that acquired it,
/// living until the put publishes or fails).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteLockGuard {
    pub id: BlockId,
    pub task_id: TaskId,
}

/// A held read lock. See [`WriteLockGuard`] for why this isn't RAII.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadLockGuard {
    pub id: BlockId,
    pub task_id: TaskId,
}

/// Result of a lock attempt: distinguishes "contended" from "no such
/// block" because §7 treats them differently (`UnknownBlock` is surfaced
/// explicitly for reads; a non-blocking contended attempt is not an error
/// at all).
#[derive(Debug)]
pub enum LockOutcome<G> {
    /// The lock was acquired.
    Acquired(G),
    /// Non-blocking attempt found the lock held incompatibly.
    WouldBlock,
    /// No lock record exists for this block id.
    Unknown,
}

impl<G> LockOutcome<G> {
    #[must_use]
    pub fn acquired(self) -> Option<G> {
        match self {
            LockOutcome::Acquired(g) => Some(g),
            _ => None,
        }
    }
}

/// Per-block read/write lock table with task-affinity release.
pub struct BlockLockTable {
    locks: Mutex<HashMap<BlockId, LockState>>,
    condvar: Condvar,
    task_index: DashMap<TaskId, HashSet<BlockId>>,
}

impl Default for BlockLockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockLockTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            condvar: Condvar::new(),
            task_index: DashMap::new(),
        }
    }

    fn track(&self, task_id: TaskId, id: &BlockId) {
        self.task_index.entry(task_id).or_default().insert(id.clone());
    }

    fn untrack(&self, task_id: TaskId, id: &BlockId) {
        if let Some(mut set) = self.task_index.get_mut(&task_id) {
            set.remove(id);
        }
    }

    /// Creates a fresh, unlocked lock record and immediately takes the
    /// write lock for `task_id` -- the discipline §4.2 requires a put to
    /// follow: acquire the write lock *before* the entry exists in the
    /// index. Fails if a lock record already exists for `id` (the block is
    /// already resident or a previous put/unroll never completed).
    pub fn start_write(&self, id: BlockId, task_id: TaskId) -> Option<WriteLockGuard> {
        let mut locks = self.locks.lock();
        if locks.contains_key(&id) {
            return None;
        }
        locks.insert(
            id.clone(),
            LockState {
                readers: HashSet::new(),
                writer: Some(task_id),
            },
        );
        drop(locks);
        self.track(task_id, &id);
        Some(WriteLockGuard { id, task_id })
    }

    /// Acquires the write lock on an existing block.
    pub fn lock_for_writing(&self, id: &BlockId, blocking: bool, task_id: TaskId) -> LockOutcome<WriteLockGuard> {
        let mut locks = self.locks.lock();
        loop {
            match locks.get(id) {
                None => return LockOutcome::Unknown,
                Some(state) if state.is_free() => {
                    locks.get_mut(id).unwrap().writer = Some(task_id);
                    drop(locks);
                    self.track(task_id, id);
                    return LockOutcome::Acquired(WriteLockGuard {
                        id: id.clone(),
                        task_id,
                    });
                }
                Some(_) if !blocking => return LockOutcome::WouldBlock,
                Some(_) => {
                    self.condvar.wait(&mut locks);
                }
            }
        }
    }

    /// Attempts the write lock without ever blocking. Used by the eviction
    /// engine's candidate scan so locked-for-reading blocks are skipped
    /// rather than stalling admission.
    pub fn try_lock_for_writing(&self, id: &BlockId, task_id: TaskId) -> LockOutcome<WriteLockGuard> {
        self.lock_for_writing(id, false, task_id)
    }

    /// Acquires a read lock on an existing block, incrementing its
    /// read-count.
    pub fn lock_for_reading(&self, id: &BlockId, blocking: bool, task_id: TaskId) -> LockOutcome<ReadLockGuard> {
        let mut locks = self.locks.lock();
        loop {
            match locks.get(id) {
                None => return LockOutcome::Unknown,
                Some(state) if state.writer.is_none() => {
                    locks.get_mut(id).unwrap().readers.insert(task_id);
                    drop(locks);
                    self.track(task_id, id);
                    return LockOutcome::Acquired(ReadLockGuard {
                        id: id.clone(),
                        task_id,
                    });
                }
                Some(_) if !blocking => return LockOutcome::WouldBlock,
                Some(_) => {
                    self.condvar.wait(&mut locks);
                }
            }
        }
    }

    /// Releases a write lock, waking any waiters.
    pub fn unlock_write(&self, guard: &WriteLockGuard) {
        let mut locks = self.locks.lock();
        if let Some(state) = locks.get_mut(&guard.id) {
            if state.writer == Some(guard.task_id) {
                state.writer = None;
            }
        }
        drop(locks);
        self.untrack(guard.task_id, &guard.id);
        self.condvar.notify_all();
    }

    /// Releases a read lock, waking any waiters.
    pub fn unlock_read(&self, guard: &ReadLockGuard) {
        let mut locks = self.locks.lock();
        if let Some(state) = locks.get_mut(&guard.id) {
            state.readers.remove(&guard.task_id);
        }
        drop(locks);
        self.untrack(guard.task_id, &guard.id);
        self.condvar.notify_all();
    }

    /// Downgrades a write lock to a read lock, publishing the block to
    /// concurrent readers without a window where the block is unlocked.
    #[must_use]
    pub fn downgrade_to_read(&self, guard: WriteLockGuard) -> ReadLockGuard {
        let mut locks = self.locks.lock();
        if let Some(state) = locks.get_mut(&guard.id) {
            if state.writer == Some(guard.task_id) {
                state.writer = None;
                state.readers.insert(guard.task_id);
            }
        }
        drop(locks);
        self.condvar.notify_all();
        ReadLockGuard {
            id: guard.id,
            task_id: guard.task_id,
        }
    }

    /// Removes the lock record for `id` entirely. Caller must hold the
    /// write lock (`guard` proves it by construction).
    pub fn remove_block_entry(&self, guard: WriteLockGuard) {
        let mut locks = self.locks.lock();
        locks.remove(&guard.id);
        drop(locks);
        self.untrack(guard.task_id, &guard.id);
        self.condvar.notify_all();
    }

    /// Releases every lock `task_id` holds, across every block. The sole
    /// mechanism preventing a cancelled or crashed task from leaking locks.
    pub fn release_all_locks_for_task(&self, task_id: TaskId) {
        let Some((_, held)) = self.task_index.remove(&task_id) else {
            return;
        };
        let mut locks = self.locks.lock();
        for id in held {
            if let Some(state) = locks.get_mut(&id) {
                if state.writer == Some(task_id) {
                    state.writer = None;
                }
                state.readers.remove(&task_id);
            }
        }
        drop(locks);
        self.condvar.notify_all();
    }

    /// Whether a lock record exists for `id` (does not indicate whether it
    /// is currently locked).
    #[must_use]
    pub fn contains(&self, id: &BlockId) -> bool {
        self.locks.lock().contains_key(id)
    }
}
