//! Error kinds surfaced by the memory store facade (§7).

use blockstore_core::BlockId;

/// Why a put could not be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRejectedReason {
    /// Not enough memory was ever freeable for this block, even after
    /// evicting everything eligible.
    InsufficientMemory,
    /// The only candidates that could free enough memory belong to the
    /// requesting block's own dataset, which eviction refuses to touch.
    EvictionForbidden,
}

/// Errors returned by the [`crate::store::MemoryStore`] facade.
#[derive(Debug, thiserror::Error)]
pub enum BlockStoreError {
    /// The put could not be accommodated.
    #[error("block {id} rejected: {reason:?}")]
    AdmissionRejected {
        id: BlockId,
        reason: AdmissionRejectedReason,
    },

    /// `get_bytes` on a deserialized entry, or `get_values` on a serialized
    /// one. Programming error; fatal to the calling operation.
    #[error("block {id} is not stored in the requested variant")]
    WrongVariant { id: BlockId },

    /// Put for an id already resident, or re-entering the unroll engine for
    /// a block id whose previous put never completed.
    #[error("block {id} is already resident or mid-unroll")]
    DuplicateBlock { id: BlockId },

    /// Lock or remove for an id the lock table has never heard of.
    #[error("block {id} is unknown to the lock table")]
    UnknownBlock { id: BlockId },

    /// The external `BlockEvictionHandler` called back into the facade from
    /// the thread currently running eviction.
    #[error("eviction handler for block {id} re-entered the memory store")]
    ReentrantEviction { id: BlockId },

    /// The configured `RecordSerializer` failed while unrolling a block as
    /// bytes.
    #[error("failed to serialize block {id}")]
    Serialization {
        id: BlockId,
        #[source]
        source: anyhow::Error,
    },
}
