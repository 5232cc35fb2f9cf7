//! On-heap vs. off-heap tagging.
//!
//! Every reservation, resident entry, and unroll record is tagged with
//! exactly one [`MemoryMode`]; the two modes have fully independent
//! accounting throughout the store.

/// Which memory pool a reservation or entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryMode {
    /// JVM-heap-analogous pool: deserialized object graphs and on-heap
    /// serialized buffers.
    OnHeap,
    /// Off-heap byte buffers, explicitly released on eviction/remove/clear.
    OffHeap,
}

impl MemoryMode {
    /// Both modes, in a stable order, for iterating "all pools".
    pub const ALL: [MemoryMode; 2] = [MemoryMode::OnHeap, MemoryMode::OffHeap];
}
