//! Memory Accountant (§4.1): pure bookkeeping, no eviction.
//!
//! Two independent pools (on-heap, off-heap), each tracking `max_total`,
//! `storage_used`, `unroll_used`, and the soft `storage_region_size`
//! boundary. Follows the same `cluster::failure_detector` pattern of a
//! `parking_lot::RwLock`/`Mutex`-guarded per-key state map -- here there
//! are exactly two keys (the two modes), so two plain
//! `parking_lot::Mutex`-guarded structs replace the map.

use std::sync::atomic::{AtomicU64, Ordering};

use blockstore_core::MemoryMode;
use parking_lot::Mutex;

use crate::config::BlockStoreConfig;

#[derive(Debug, Clone, Copy)]
struct PoolState {
    max_total: u64,
    storage_used: u64,
    unroll_used: u64,
    storage_region_size: u64,
}

/// Point-in-time view of one mode's counters, for tests and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub max_total: u64,
    pub storage_used: u64,
    pub unroll_used: u64,
    pub storage_region_size: u64,
    pub execution_used: u64,
}

/// Two-pool (on-heap / off-heap) memory accountant.
///
/// Every operation is atomic with respect to its own mode; compound
/// invariants spanning multiple calls (e.g. "evict then insert") are the
/// caller's (the Memory Store facade's) responsibility, per §4.1's
/// rationale for keeping the accountant non-evicting.
pub struct MemoryAccountant {
    on_heap: Mutex<PoolState>,
    off_heap: Mutex<PoolState>,
    on_heap_execution_used: AtomicU64,
    off_heap_execution_used: AtomicU64,
    max_unroll_fraction_of_storage_region: f64,
}

impl MemoryAccountant {
    /// Builds an accountant from the store's configuration.
    #[must_use]
    pub fn new(config: &BlockStoreConfig) -> Self {
        let region = |max_total: u64| {
            #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let size = (max_total as f64 * config.storage_region_fraction) as u64;
            size
        };
        Self {
            on_heap: Mutex::new(PoolState {
                max_total: config.max_on_heap_storage_bytes,
                storage_used: 0,
                unroll_used: 0,
                storage_region_size: region(config.max_on_heap_storage_bytes),
            }),
            off_heap: Mutex::new(PoolState {
                max_total: config.max_off_heap_storage_bytes,
                storage_used: 0,
                unroll_used: 0,
                storage_region_size: region(config.max_off_heap_storage_bytes),
            }),
            on_heap_execution_used: AtomicU64::new(0),
            off_heap_execution_used: AtomicU64::new(0),
            max_unroll_fraction_of_storage_region: config.max_unroll_fraction_of_storage_region,
        }
    }

    fn pool(&self, mode: MemoryMode) -> &Mutex<PoolState> {
        match mode {
            MemoryMode::OnHeap => &self.on_heap,
            MemoryMode::OffHeap => &self.off_heap,
        }
    }

    fn execution_used_atomic(&self, mode: MemoryMode) -> &AtomicU64 {
        match mode {
            MemoryMode::OnHeap => &self.on_heap_execution_used,
            MemoryMode::OffHeap => &self.off_heap_execution_used,
        }
    }

    /// Reports the current usage of the external execution pool this
    /// accountant shares `max_total` with. The accountant only observes
    /// this value -- it never grants or evicts execution memory.
    pub fn observe_execution_used(&self, n: u64, mode: MemoryMode) {
        self.execution_used_atomic(mode).store(n, Ordering::Relaxed);
    }

    /// `storage_used + n <= max_total - unroll_used - execution_used`.
    #[must_use]
    pub fn acquire_storage(&self, n: u64, mode: MemoryMode) -> bool {
        let mut state = self.pool(mode).lock();
        let execution_used = self.execution_used_atomic(mode).load(Ordering::Relaxed);
        let free = state
            .max_total
            .saturating_sub(state.unroll_used)
            .saturating_sub(execution_used);
        if state.storage_used.saturating_add(n) > free {
            tracing::debug!(bytes = n, ?mode, "acquire_storage refused");
            return false;
        }
        state.storage_used += n;
        true
    }

    /// Same free-space rule as [`Self::acquire_storage`], additionally
    /// capped by `max_unroll_fraction_of_storage_region` of
    /// `storage_region_size` so a single task cannot starve storage.
    #[must_use]
    pub fn acquire_unroll(&self, n: u64, mode: MemoryMode) -> bool {
        let mut state = self.pool(mode).lock();
        #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let cap = (state.storage_region_size as f64 * self.max_unroll_fraction_of_storage_region) as u64;
        if state.unroll_used.saturating_add(n) > cap {
            tracing::debug!(bytes = n, ?mode, "acquire_unroll refused: unroll cap");
            return false;
        }
        let execution_used = self.execution_used_atomic(mode).load(Ordering::Relaxed);
        let free = state
            .max_total
            .saturating_sub(state.storage_used)
            .saturating_sub(execution_used);
        if state.unroll_used.saturating_add(n) > free {
            tracing::debug!(bytes = n, ?mode, "acquire_unroll refused: no free space");
            return false;
        }
        state.unroll_used += n;
        true
    }

    /// Releases a storage reservation. Asserts against underflow.
    pub fn release_storage(&self, n: u64, mode: MemoryMode) {
        let mut state = self.pool(mode).lock();
        assert!(
            state.storage_used >= n,
            "release_storage underflow: used={}, release={}",
            state.storage_used,
            n
        );
        state.storage_used -= n;
    }

    /// Releases an unroll reservation. Asserts against underflow.
    pub fn release_unroll(&self, n: u64, mode: MemoryMode) {
        let mut state = self.pool(mode).lock();
        assert!(
            state.unroll_used >= n,
            "release_unroll underflow: used={}, release={}",
            state.unroll_used,
            n
        );
        state.unroll_used -= n;
    }

    /// Atomically converts an unroll reservation into a storage reservation
    /// (§4.3 step 3), reconciling `size_held` (what was actually reserved
    /// during unroll) against `final_size` (the measured final size).
    ///
    /// Held under the pool's mutex for the whole operation -- this is the
    /// one compound invariant the accountant itself enforces, because its
    /// purpose is precisely to make "release unroll, acquire storage" for
    /// the same block appear instantaneous to every other observer.
    ///
    /// Returns `false` (leaving all counters unchanged) if `final_size`
    /// exceeds `size_held` and the extra bytes are not available; the
    /// caller still holds `size_held` unroll bytes and must release them
    /// on the failure path.
    #[must_use]
    pub fn transfer_unroll_to_storage(&self, size_held: u64, final_size: u64, mode: MemoryMode) -> bool {
        let mut state = self.pool(mode).lock();
        if final_size > size_held {
            let extra = final_size - size_held;
            let execution_used = self.execution_used_atomic(mode).load(Ordering::Relaxed);
            let free = state
                .max_total
                .saturating_sub(state.unroll_used)
                .saturating_sub(execution_used);
            if state.storage_used.saturating_add(extra) > free {
                return false;
            }
        }
        state.unroll_used -= size_held;
        state.storage_used += final_size;
        true
    }

    /// Current counters for `mode`.
    #[must_use]
    pub fn snapshot(&self, mode: MemoryMode) -> PoolSnapshot {
        let state = self.pool(mode).lock();
        PoolSnapshot {
            max_total: state.max_total,
            storage_used: state.storage_used,
            unroll_used: state.unroll_used,
            storage_region_size: state.storage_region_size,
            execution_used: self.execution_used_atomic(mode).load(Ordering::Relaxed),
        }
    }
}
