//! External collaborator contracts (§6): the disk-spill seam and the
//! serializer seam. Neither is implemented here -- the core only defines
//! the trait and calls through it, following the same "the record store
//! calls out, the implementation decides" shape as a
//! `storage::map_data_store::MapDataStore` / `storage::mutation_observer`
//! pair.
//!
//! Unlike an `#[async_trait]`-based storage trait in a tokio application,
//! these are plain synchronous trait methods: §5 is explicit that nothing
//! inside this subsystem ever suspends on an async runtime, only on
//! mutexes or on a blocking call into one of these two seams.

use std::sync::Arc;

use blockstore_core::{BlockId, StorageLevel};

use crate::chunked_bytes::{ChunkedByteSink, ChunkedBytes};

/// Approximate in-memory cost of a value, in bytes.
///
/// The values-variant unroll engine (§4.3) samples this as records are
/// appended; §9 explicitly tolerates up to ±25% error, reconciled by the
/// final storage-transfer step. There is no blanket impl: a meaningful
/// estimate is type-specific, the same way Spark's `SizeEstimator` samples
/// the actual object graph rather than assuming a fixed per-type cost.
pub trait EstimateSize {
    /// Estimated heap size of `self`, in bytes.
    fn estimated_size(&self) -> u64;
}

impl EstimateSize for Vec<u8> {
    fn estimated_size(&self) -> u64 {
        self.len() as u64
    }
}

impl EstimateSize for String {
    fn estimated_size(&self) -> u64 {
        self.len() as u64
    }
}

impl EstimateSize for i64 {
    fn estimated_size(&self) -> u64 {
        8
    }
}

/// The payload of an entry being evicted, exposed to a
/// [`BlockEvictionHandler`] without cloning it.
///
/// Matches whichever variant the entry was actually stored as; the handler
/// decides what to do with it (e.g. serialize `Values` before spilling, or
/// write `Bytes` straight to disk).
pub enum BlockPayload<'a, R> {
    /// A deserialized entry's records.
    Values(&'a [R]),
    /// A serialized entry's byte chunks.
    Bytes(&'a ChunkedBytes),
}

/// Decides the fate of a block the eviction engine has chosen to displace.
///
/// Given the evicted entry's payload, returns the [`StorageLevel`] the block
/// now has. If that level still retains the block somewhere (e.g. spilled
/// to disk), the eviction engine keeps the block's lock record so a future
/// reader can find it in the other tier; otherwise the lock record is
/// removed along with the index entry.
///
/// Implementations must not call back into the [`crate::store::MemoryStore`]
/// that invoked them on the same thread -- the store detects and rejects
/// that with [`crate::error::BlockStoreError::ReentrantEviction`].
pub trait BlockEvictionHandler<R>: Send + Sync {
    /// Called once per evicted block, with the index lock already released
    /// (§5: the index lock is never held across this call).
    fn drop_from_memory(&self, id: &BlockId, payload: BlockPayload<'_, R>) -> StorageLevel;
}

/// A handler that always drops the block with no further retention. Useful
/// for tests and for configurations with no disk tier.
pub struct DiscardEvictionHandler;

impl<R> BlockEvictionHandler<R> for DiscardEvictionHandler {
    fn drop_from_memory(&self, _id: &BlockId, _payload: BlockPayload<'_, R>) -> StorageLevel {
        StorageLevel::NONE
    }
}

/// Encodes a single record of type `R` into a [`ChunkedByteSink`].
///
/// Obtained from a [`SerializerManager`]. Actual codec selection and
/// compression framing are out of scope for this subsystem (§1) -- this
/// trait is the seam through which the rest of the engine supplies them.
pub trait RecordSerializer<R>: Send + Sync {
    /// Serializes `record`, appending its encoded bytes to `out`.
    fn serialize(&self, record: &R, out: &mut ChunkedByteSink) -> anyhow::Result<()>;
}

/// External serializer/compression seam (§6), consulted only by the
/// bytes-variant unroll engine.
pub trait SerializerManager<R>: Send + Sync {
    /// Wraps the raw chunk sink with whatever compression this block's
    /// storage level calls for. The default-configured store passes the
    /// sink through unchanged.
    fn wrap_for_compression(
        &self,
        id: &BlockId,
        output: ChunkedByteSink,
    ) -> anyhow::Result<ChunkedByteSink>;

    /// Selects a serializer for encoding records tagged `tag`.
    ///
    /// `auto_pick` mirrors Spark's own knob: when true, the implementation
    /// may choose a more specific serializer than the one named by `tag`
    /// if it knows one is available for this record type.
    fn get_serializer(
        &self,
        tag: &str,
        auto_pick: bool,
    ) -> anyhow::Result<Arc<dyn RecordSerializer<R>>>;
}

/// A serializer manager that performs no compression and delegates
/// encoding to a plain byte-copy serializer. Default for tests and for
/// record types that are already raw bytes.
pub struct PassthroughSerializerManager;

impl SerializerManager<Vec<u8>> for PassthroughSerializerManager {
    fn wrap_for_compression(
        &self,
        _id: &BlockId,
        output: ChunkedByteSink,
    ) -> anyhow::Result<ChunkedByteSink> {
        Ok(output)
    }

    fn get_serializer(
        &self,
        _tag: &str,
        _auto_pick: bool,
    ) -> anyhow::Result<Arc<dyn RecordSerializer<Vec<u8>>>> {
        Ok(Arc::new(RawBytesSerializer))
    }
}

/// Writes a `Vec<u8>` record's bytes straight through.
struct RawBytesSerializer;

impl RecordSerializer<Vec<u8>> for RawBytesSerializer {
    fn serialize(&self, record: &Vec<u8>, out: &mut ChunkedByteSink) -> anyhow::Result<()> {
        use std::io::Write;
        out.write_all(record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discard_handler_returns_none_level() {
        let handler = DiscardEvictionHandler;
        let id = BlockId::Test("x".into());
        let level = handler.drop_from_memory(&id, BlockPayload::Values::<i64>(&[]));
        assert_eq!(level, StorageLevel::NONE);
    }

    #[test]
    fn passthrough_serializer_roundtrips_bytes() {
        let manager = PassthroughSerializerManager;
        let serializer = manager.get_serializer("raw", false).unwrap();
        let mut sink = ChunkedByteSink::new(1024);
        serializer.serialize(&b"hello".to_vec(), &mut sink).unwrap();
        let bytes = sink.finish();
        assert_eq!(bytes.to_vec(), b"hello".to_vec());
    }
}
