//! In-memory block store with cooperative unroll-and-evict admission.
//!
//! Caches partitioned computation results in bounded per-mode memory,
//! admits a new block by evicting older ones when necessary, and supports
//! streaming materialization of blocks whose final size is unknown in
//! advance (the unroll-and-evict admission path).
//!
//! Composition, top to bottom: [`memory::MemoryAccountant`] tracks raw byte
//! budgets; [`locks::BlockLockTable`] arbitrates concurrent access per
//! block; [`unroll::UnrollEngine`] grows a buffer cooperatively against the
//! accountant; [`index::BlockIndex`] and [`index::EvictionEngine`] hold
//! resident blocks in access order and displace them on demand;
//! [`store::MemoryStore`] wires all four together behind one synchronous
//! API.

pub mod chunked_bytes;
pub mod config;
pub mod error;
pub mod index;
pub mod locks;
pub mod memory;
pub mod store;
pub mod traits;
pub mod unroll;

pub use chunked_bytes::{ChunkedByteSink, ChunkedBytes};
pub use config::BlockStoreConfig;
pub use error::{AdmissionRejectedReason, BlockStoreError};
pub use locks::TaskId;
pub use store::{MemoryStore, PutIteratorOutcome};
pub use traits::{BlockEvictionHandler, BlockPayload, EstimateSize, RecordSerializer, SerializerManager};

#[cfg(test)]
mod scenario_tests {
    use std::io::Write;
    use std::sync::Arc;

    use blockstore_core::{BlockId, MemoryMode, StorageLevel};

    use crate::chunked_bytes::ChunkedByteSink;
    use crate::config::BlockStoreConfig;
    use crate::error::{AdmissionRejectedReason, BlockStoreError};
    use crate::store::{MemoryStore, PutIteratorOutcome};
    use crate::traits::{DiscardEvictionHandler, PassthroughSerializerManager};
    use proptest::prelude::*;

    fn store(max_on_heap: u64) -> MemoryStore<Vec<u8>> {
        let config = BlockStoreConfig {
            max_on_heap_storage_bytes: max_on_heap,
            storage_region_fraction: 1.0,
            max_unroll_fraction_of_storage_region: 1.0,
            unroll_initial_threshold_bytes: 64,
            unroll_check_period_records: 1,
            unroll_growth_factor: 2.0,
            ..BlockStoreConfig::default()
        };
        MemoryStore::new(config, Arc::new(DiscardEvictionHandler), Arc::new(PassthroughSerializerManager))
    }

    fn bytes(len: usize) -> crate::chunked_bytes::ChunkedBytes {
        let mut sink = ChunkedByteSink::new(4096);
        sink.write_all(&vec![0u8; len]).unwrap();
        sink.finish()
    }

    /// Scenario 1: successful admission without eviction.
    #[test]
    fn scenario_successful_admission_without_eviction() {
        let s = store(1000);
        let b1 = BlockId::Test("b1".into());
        let b2 = BlockId::Test("b2".into());

        s.put_bytes(b1.clone(), bytes(400), MemoryMode::OnHeap, StorageLevel::MEMORY_ONLY, 1).unwrap();
        s.put_bytes(b2, bytes(500), MemoryMode::OnHeap, StorageLevel::MEMORY_ONLY, 2).unwrap();

        assert_eq!(s.memory_used(MemoryMode::OnHeap).storage_used, 900);
        assert_eq!(s.get_bytes(&b1, 1).unwrap().len(), 400);
    }

    /// Scenario 2: eviction picks the least-recently-accessed block.
    #[test]
    fn scenario_eviction_of_lru() {
        let s = store(1000);
        let b1 = BlockId::Test("b1".into());
        let b2 = BlockId::Test("b2".into());
        let b3 = BlockId::Test("b3".into());
        s.put_bytes(b1.clone(), bytes(400), MemoryMode::OnHeap, StorageLevel::MEMORY_ONLY, 1).unwrap();
        s.put_bytes(b2.clone(), bytes(500), MemoryMode::OnHeap, StorageLevel::MEMORY_ONLY, 2).unwrap();
        s.release_all_locks_for_task(1);
        s.release_all_locks_for_task(2);

        // Touch b2 so b1 becomes the least-recently-accessed entry.
        s.get_bytes(&b2, 3).unwrap();
        s.release_all_locks_for_task(3);

        s.put_bytes(b3, bytes(200), MemoryMode::OnHeap, StorageLevel::MEMORY_ONLY, 4).unwrap();

        assert!(!s.contains(&b1));
        assert!(s.contains(&b2));
        assert_eq!(s.memory_used(MemoryMode::OnHeap).storage_used, 700);
    }

    /// Scenario 3: a dataset that already fully occupies its mode cannot
    /// make room for one of its own further blocks.
    #[test]
    fn scenario_same_dataset_eviction_forbidden() {
        let s = store(1000);
        let b1 = BlockId::Rdd { rdd_id: 7, partition: 0 };
        let b2 = BlockId::Rdd { rdd_id: 7, partition: 1 };
        let b3 = BlockId::Rdd { rdd_id: 7, partition: 2 };
        s.put_bytes(b1.clone(), bytes(400), MemoryMode::OnHeap, StorageLevel::MEMORY_ONLY, 1).unwrap();
        s.put_bytes(b2.clone(), bytes(500), MemoryMode::OnHeap, StorageLevel::MEMORY_ONLY, 1).unwrap();

        let err = s.put_bytes(b3, bytes(200), MemoryMode::OnHeap, StorageLevel::MEMORY_ONLY, 1).unwrap_err();

        assert!(matches!(
            err,
            BlockStoreError::AdmissionRejected {
                reason: AdmissionRejectedReason::EvictionForbidden,
                ..
            }
        ));
        assert!(s.contains(&b1));
        assert!(s.contains(&b2));
    }

    /// Scenario 4: unrolling fails partway through because the growing
    /// reservation can never be satisfied. No entry is left resident and no
    /// storage reservation survives the failed attempt, but the caller gets
    /// back exactly what was unrolled and exactly what was left unread.
    #[test]
    fn scenario_partial_unroll_leaves_nothing_resident() {
        let config = BlockStoreConfig {
            max_on_heap_storage_bytes: 500,
            storage_region_fraction: 1.0,
            max_unroll_fraction_of_storage_region: 1.0,
            unroll_initial_threshold_bytes: 100,
            unroll_check_period_records: 1,
            unroll_growth_factor: 1.5,
            ..BlockStoreConfig::default()
        };
        let s = MemoryStore::new(config, Arc::new(DiscardEvictionHandler), Arc::new(PassthroughSerializerManager));
        let b = BlockId::Test("b".into());

        let records: Vec<Vec<u8>> = (0..10).map(|_| vec![0u8; 100]).collect();
        let outcome = s
            .put_iterator_as_values(b.clone(), records, MemoryMode::OnHeap, StorageLevel::MEMORY_ONLY, 1)
            .unwrap();

        match outcome {
            PutIteratorOutcome::Partial(p) => {
                assert_eq!(p.unrolled.len(), 5);
                assert_eq!(p.rest.count(), 5);
            }
            PutIteratorOutcome::Admitted => panic!("expected a partial unroll"),
        }
        assert_eq!(s.memory_used(MemoryMode::OnHeap).storage_used, 0);
        assert!(!s.contains(&b));
    }

    /// Scenario 5: eviction skips a read-locked candidate and takes the
    /// next unlocked one instead.
    #[test]
    fn scenario_locked_block_skipped_by_eviction() {
        let s = store(900);
        let b1 = BlockId::Test("b1".into());
        let b2 = BlockId::Test("b2".into());
        let b3 = BlockId::Test("b3".into());
        s.put_bytes(b1.clone(), bytes(400), MemoryMode::OnHeap, StorageLevel::MEMORY_ONLY, 1).unwrap();
        s.put_bytes(b2.clone(), bytes(500), MemoryMode::OnHeap, StorageLevel::MEMORY_ONLY, 2).unwrap();
        // Task 1 keeps holding its read lock on b1 (left over from the put's
        // downgrade); task 2's is released so b2 is evictable.
        s.release_all_locks_for_task(2);

        s.put_bytes(b3.clone(), bytes(300), MemoryMode::OnHeap, StorageLevel::MEMORY_ONLY, 3).unwrap();

        assert!(!s.contains(&b2));
        assert!(s.contains(&b1));
        assert!(s.contains(&b3));
    }

    /// Scenario 6: concurrent putters finishing unroll at the same time
    /// never push `storage_used + unroll_used` past `max_total`, and the
    /// accountant's own conservation invariant holds once both land.
    #[test]
    fn scenario_concurrent_unroll_to_storage_transfer_stays_within_budget() {
        let s = Arc::new(store(2000));
        let mut handles = Vec::new();
        for (n, id) in [(1u64, BlockId::Test("p1".into())), (2u64, BlockId::Test("p2".into()))] {
            let s = s.clone();
            handles.push(std::thread::spawn(move || {
                let records: Vec<Vec<u8>> = (0..5).map(|_| vec![0u8; 50]).collect();
                s.put_iterator_as_values(id, records, MemoryMode::OnHeap, StorageLevel::MEMORY_ONLY, n)
            }));
        }
        for h in handles {
            h.join().unwrap().unwrap();
        }

        let snap = s.memory_used(MemoryMode::OnHeap);
        assert!(snap.storage_used + snap.unroll_used <= snap.max_total);
        assert_eq!(snap.storage_used, 500);
        assert_eq!(snap.unroll_used, 0);
    }

    proptest::proptest! {
        /// For any sequence of acquire/release calls against one pool, the
        /// accountant never reports usage above capacity and never lets
        /// `storage_used + unroll_used` exceed `max_total`, after every
        /// single call -- not just at the end.
        #[test]
        fn accountant_never_overcommits_a_pool(ops in proptest::collection::vec(0u8..4, 1..50)) {
            let config = BlockStoreConfig {
                max_on_heap_storage_bytes: 1000,
                storage_region_fraction: 1.0,
                max_unroll_fraction_of_storage_region: 1.0,
                ..BlockStoreConfig::default()
            };
            let accountant = crate::memory::MemoryAccountant::new(&config);
            let mut storage_held = 0u64;
            let mut unroll_held = 0u64;

            for op in ops {
                match op {
                    0 => {
                        if accountant.acquire_storage(37, MemoryMode::OnHeap) {
                            storage_held += 37;
                        }
                    }
                    1 => {
                        if storage_held >= 37 {
                            accountant.release_storage(37, MemoryMode::OnHeap);
                            storage_held -= 37;
                        }
                    }
                    2 => {
                        if accountant.acquire_unroll(23, MemoryMode::OnHeap) {
                            unroll_held += 23;
                        }
                    }
                    _ => {
                        if unroll_held >= 23 {
                            accountant.release_unroll(23, MemoryMode::OnHeap);
                            unroll_held -= 23;
                        }
                    }
                }
                let snap = accountant.snapshot(MemoryMode::OnHeap);
                prop_assert!(snap.storage_used + snap.unroll_used <= snap.max_total);
                prop_assert_eq!(snap.storage_used, storage_held);
                prop_assert_eq!(snap.unroll_used, unroll_held);
            }
        }
    }
}
