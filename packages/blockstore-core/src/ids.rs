//! Block identifiers and the dataset identifier derived from them.
//!
//! A [`BlockId`] is the opaque, immutable, comparable, hashable value the
//! rest of the store keys everything on. [`BlockId::dataset_id`] derives the
//! coarser identity used only by eviction (§4.4) to refuse displacing a
//! block's own siblings.

use std::fmt;

/// Identifies the logical dataset a block was computed from.
///
/// Two blocks with the same `DatasetId` are never allowed to evict one
/// another -- see the eviction engine's same-dataset exclusion rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetId {
    /// Blocks produced by the same RDD.
    Rdd(u64),
    /// Blocks produced by the same shuffle.
    Shuffle(u64),
}

/// Opaque, immutable block identifier.
///
/// Comparable and hashable so it can key the block index and the lock
/// table. `Test` exists purely for unit tests that don't care about dataset
/// affiliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockId {
    /// A partition of a cached RDD.
    Rdd { rdd_id: u64, partition: u32 },
    /// A single map-output chunk of a shuffle.
    Shuffle {
        shuffle_id: u64,
        map_id: u64,
        reduce_id: u32,
    },
    /// A broadcast variable chunk. Broadcasts never share a dataset with
    /// anything else, including other chunks of the same broadcast --
    /// each chunk is independently evictable.
    Broadcast { broadcast_id: u64, piece: u32 },
    /// An arbitrary identifier for tests and tools that don't need the
    /// structured variants above.
    Test(String),
}

impl BlockId {
    /// Derives the dataset this block belongs to, if any.
    ///
    /// `None` means the block has no siblings the eviction engine should
    /// protect -- it competes for eviction on equal footing with everything
    /// else.
    #[must_use]
    pub fn dataset_id(&self) -> Option<DatasetId> {
        match self {
            BlockId::Rdd { rdd_id, .. } => Some(DatasetId::Rdd(*rdd_id)),
            BlockId::Shuffle { shuffle_id, .. } => Some(DatasetId::Shuffle(*shuffle_id)),
            BlockId::Broadcast { .. } | BlockId::Test(_) => None,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Rdd { rdd_id, partition } => write!(f, "rdd_{rdd_id}_{partition}"),
            BlockId::Shuffle {
                shuffle_id,
                map_id,
                reduce_id,
            } => write!(f, "shuffle_{shuffle_id}_{map_id}_{reduce_id}"),
            BlockId::Broadcast { broadcast_id, piece } => {
                write!(f, "broadcast_{broadcast_id}_piece{piece}")
            }
            BlockId::Test(name) => write!(f, "test_{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rdd_blocks_share_dataset_id() {
        let a = BlockId::Rdd { rdd_id: 1, partition: 0 };
        let b = BlockId::Rdd { rdd_id: 1, partition: 1 };
        let c = BlockId::Rdd { rdd_id: 2, partition: 0 };
        assert_eq!(a.dataset_id(), b.dataset_id());
        assert_ne!(a.dataset_id(), c.dataset_id());
    }

    #[test]
    fn shuffle_blocks_share_dataset_id_by_shuffle_id_only() {
        let a = BlockId::Shuffle { shuffle_id: 5, map_id: 0, reduce_id: 0 };
        let b = BlockId::Shuffle { shuffle_id: 5, map_id: 1, reduce_id: 9 };
        assert_eq!(a.dataset_id(), b.dataset_id());
    }

    #[test]
    fn broadcast_and_test_blocks_have_no_dataset() {
        assert_eq!(BlockId::Broadcast { broadcast_id: 1, piece: 0 }.dataset_id(), None);
        assert_eq!(BlockId::Test("x".into()).dataset_id(), None);
    }

    #[test]
    fn equality_and_hash_are_structural() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(BlockId::Rdd { rdd_id: 1, partition: 0 });
        assert!(set.contains(&BlockId::Rdd { rdd_id: 1, partition: 0 }));
        assert!(!set.contains(&BlockId::Rdd { rdd_id: 1, partition: 1 }));
    }
}
