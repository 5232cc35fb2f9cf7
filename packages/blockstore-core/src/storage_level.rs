//! Storage level descriptor.
//!
//! Only `use_memory` and `deserialized` affect this subsystem's own
//! behavior; `use_disk` and `replication` are recorded for the benefit of
//! external collaborators (the disk tier, the replication layer) and are
//! otherwise opaque to the core.

/// Replication and persistence intent attached to a block.
///
/// The core never acts on `use_disk` or `replication` itself -- it only
/// carries them so a [`BlockEvictionHandler`](crate) (defined in
/// `blockstore-memstore`) can decide whether an evicted block survives
/// somewhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageLevel {
    /// Whether the block is (or should be) resident in this store.
    pub use_memory: bool,
    /// Whether the block is (or should be) spilled to disk.
    pub use_disk: bool,
    /// Whether the resident copy is deserialized (object graph) vs.
    /// serialized (byte buffer).
    pub deserialized: bool,
    /// Number of replicas desired across the cluster. Not interpreted here.
    pub replication: u8,
}

impl StorageLevel {
    /// In-memory, deserialized, unreplicated. The common case for cached
    /// RDD partitions.
    pub const MEMORY_ONLY: Self = Self {
        use_memory: true,
        use_disk: false,
        deserialized: true,
        replication: 1,
    };

    /// In-memory, serialized, unreplicated. The common case for shuffle
    /// blocks and broadcast chunks.
    pub const MEMORY_ONLY_SER: Self = Self {
        use_memory: true,
        use_disk: false,
        deserialized: false,
        replication: 1,
    };

    /// Disk only -- the block is not resident in this store at all. Used as
    /// the return value of a [`BlockEvictionHandler`](crate) that spilled
    /// the block instead of dropping it.
    pub const DISK_ONLY: Self = Self {
        use_memory: false,
        use_disk: true,
        deserialized: false,
        replication: 1,
    };

    /// Neither memory nor disk -- the block is gone. Used as the return
    /// value of a handler that dropped the block entirely.
    pub const NONE: Self = Self {
        use_memory: false,
        use_disk: false,
        deserialized: false,
        replication: 1,
    };

    /// Whether a block at this level is still findable somewhere after
    /// eviction from memory (i.e. the eviction engine should keep its lock
    /// record rather than removing it).
    #[must_use]
    pub fn is_retained(self) -> bool {
        self.use_memory || self.use_disk
    }
}
