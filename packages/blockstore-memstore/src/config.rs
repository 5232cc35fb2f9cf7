//! Numeric knobs consumed by the store (§6).
//!
//! Plain, programmatically-constructed configuration -- no `serde`, no file
//! loading. Configuration loading is an external concern (out of scope);
//! the rest of the engine is expected to build a [`BlockStoreConfig`] from
//! whatever config layer it owns and hand it to [`crate::store::MemoryStore::new`].

/// Configuration for the memory accountant, the unroll engine, and the
/// bytes-variant output stream.
#[derive(Debug, Clone)]
pub struct BlockStoreConfig {
    /// First unroll reservation requested per put, before any record is
    /// read. Default ~1 MiB.
    pub unroll_initial_threshold_bytes: u64,
    /// Records between size re-estimates in the values-variant unroll
    /// engine. The bytes variant re-estimates every record regardless.
    pub unroll_check_period_records: u64,
    /// Multiplier applied to the measured buffer size when a re-reservation
    /// is needed. Must be `> 1.0`.
    pub unroll_growth_factor: f64,
    /// Ceiling for the on-heap pool (storage + unroll + an external
    /// execution pool this store only observes).
    pub max_on_heap_storage_bytes: u64,
    /// Ceiling for the off-heap pool.
    pub max_off_heap_storage_bytes: u64,
    /// Chunk size used by the bytes-variant output stream.
    pub chunk_size_bytes: usize,
    /// Fraction of `storage_region_size` a single unroll reservation may
    /// consume, so one task cannot starve storage. `(0.0, 1.0]`.
    pub max_unroll_fraction_of_storage_region: f64,
    /// Fraction of each mode's `max_total` initially dedicated to storage
    /// (the remainder is the external execution pool's share). `(0.0, 1.0]`.
    pub storage_region_fraction: f64,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            unroll_initial_threshold_bytes: 1024 * 1024,
            unroll_check_period_records: 16,
            unroll_growth_factor: 1.5,
            max_on_heap_storage_bytes: 512 * 1024 * 1024,
            max_off_heap_storage_bytes: 0,
            chunk_size_bytes: 64 * 1024,
            max_unroll_fraction_of_storage_region: 0.2,
            storage_region_fraction: 0.6,
        }
    }
}

impl BlockStoreConfig {
    /// Ceiling for the given mode.
    #[must_use]
    pub fn max_total(&self, mode: blockstore_core::MemoryMode) -> u64 {
        match mode {
            blockstore_core::MemoryMode::OnHeap => self.max_on_heap_storage_bytes,
            blockstore_core::MemoryMode::OffHeap => self.max_off_heap_storage_bytes,
        }
    }
}
