//! Cooperative unroll-and-evict admission (§4.3).
//!
//! Materializes a lazy record sequence into a growing buffer while holding
//! an `unroll` reservation against the [`MemoryAccountant`], re-reserving
//! in growth-factor steps every `unroll_check_period_records` records
//! rather than on every single one (sampling the buffer's size the way a
//! `cluster::failure_detector` samples heartbeats on an interval instead
//! of continuously). The bytes variant re-measures its sink on every
//! record instead, since serialization already gives an exact byte count
//! for free -- there is no estimate to amortize the cost of rechecking.
//!
//! The engine never evicts anything itself: when a reservation can't be
//! granted outright it calls back into `request_more`, a closure supplied
//! by [`crate::store::MemoryStore`] that is free to run the eviction
//! engine before retrying the same reservation. This keeps unrolling
//! ignorant of eviction policy, the same way `storage::record_store` calls
//! out to a `MutationObserver` rather than embedding policy inline.
//!
//! When a sequence can't be fully materialized, the attempt stops and
//! hands back everything the caller needs to recover: the prefix already
//! unrolled and the iterator positioned at the first unconsumed record, so
//! the facade can surface both instead of silently dropping the remainder.

use blockstore_core::MemoryMode;

use crate::chunked_bytes::{ChunkedByteSink, ChunkedBytes};
use crate::config::BlockStoreConfig;
use crate::memory::MemoryAccountant;
use crate::traits::{EstimateSize, RecordSerializer};

/// A buffer that ran out of room before the source sequence was exhausted.
///
/// `bytes_held` is whatever unroll reservation was still outstanding at the
/// moment of failure; the caller (the store facade) must release it on
/// this path, since the engine itself never releases a reservation it did
/// not fully consume. `rest` is the iterator positioned right after the
/// last record folded into `unrolled`, so none of the source sequence is
/// lost -- the caller can resume from it.
#[derive(Debug)]
pub struct PartialUnroll<T, Rest> {
    pub unrolled: T,
    pub bytes_held: u64,
    pub rest: Rest,
}

/// Outcome of an unroll attempt.
pub enum UnrollOutcome<T, Rest> {
    /// The whole sequence was materialized. `bytes_held` is the live
    /// unroll reservation; `final_size` is the measured (not estimated)
    /// size the caller should hand to
    /// [`MemoryAccountant::transfer_unroll_to_storage`].
    Success {
        value: T,
        bytes_held: u64,
        final_size: u64,
    },
    Partial(PartialUnroll<T, Rest>),
}

/// Cooperative unroll engine for one block store.
pub struct UnrollEngine<'a> {
    accountant: &'a MemoryAccountant,
    config: &'a BlockStoreConfig,
}

impl<'a> UnrollEngine<'a> {
    #[must_use]
    pub fn new(accountant: &'a MemoryAccountant, config: &'a BlockStoreConfig) -> Self {
        Self { accountant, config }
    }

    fn try_acquire(&self, n: u64, mode: MemoryMode, request_more: &mut impl FnMut(u64) -> bool) -> bool {
        self.accountant.acquire_unroll(n, mode) || request_more(n)
    }

    /// Grows a held reservation of `held` bytes to cover `needed` bytes,
    /// in growth-factor steps, via `request_more`. Returns the new
    /// reservation total, or `None` (with `held` unchanged) if growth was
    /// refused.
    fn grow(&self, held: u64, needed: u64, mode: MemoryMode, request_more: &mut impl FnMut(u64) -> bool) -> Option<u64> {
        let mut target = held;
        while target < needed {
            #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let grown = ((target as f64) * self.config.unroll_growth_factor).ceil() as u64;
            target = grown.max(target + 1).max(needed);
        }
        let extra = target - held;
        if extra == 0 {
            return Some(held);
        }
        if self.try_acquire(extra, mode, request_more) {
            Some(target)
        } else {
            None
        }
    }

    /// Unrolls `records` as deserialized values, tracking size via
    /// [`EstimateSize`]. On success the buffer's estimated total size is
    /// used as `final_size`, since no separate serialization pass exists
    /// for the values variant.
    pub fn unroll_values<R, I>(
        &self,
        records: I,
        mode: MemoryMode,
        mut request_more: impl FnMut(u64) -> bool,
    ) -> UnrollOutcome<Vec<R>, I::IntoIter>
    where
        R: EstimateSize,
        I: IntoIterator<Item = R>,
    {
        let mut iter = records.into_iter();
        let initial = self.config.unroll_initial_threshold_bytes;
        if !self.try_acquire(initial, mode, &mut request_more) {
            return UnrollOutcome::Partial(PartialUnroll {
                unrolled: Vec::new(),
                bytes_held: 0,
                rest: iter,
            });
        }

        let mut buffer = Vec::new();
        let mut held = initial;
        let mut used: u64 = 0;
        let mut count: u64 = 0;

        while let Some(record) = iter.next() {
            used += record.estimated_size();
            buffer.push(record);
            count += 1;
            if count % self.config.unroll_check_period_records == 0 && used > held {
                match self.grow(held, used, mode, &mut request_more) {
                    Some(new_held) => held = new_held,
                    None => {
                        return UnrollOutcome::Partial(PartialUnroll {
                            unrolled: buffer,
                            bytes_held: held,
                            rest: iter,
                        });
                    }
                }
            }
        }

        UnrollOutcome::Success {
            value: buffer,
            bytes_held: held,
            final_size: used,
        }
    }

    /// Unrolls `records` as serialized bytes through `serializer`, writing
    /// into `sink` (already wrapped for compression by the caller's
    /// `SerializerManager`) and tracking size exactly via the sink's own
    /// write count rather than an estimate. Re-measures after every record
    /// -- unlike the values variant, there is no separate estimation pass
    /// to amortize, since the serializer already produces an exact count.
    pub fn unroll_bytes<R, I>(
        &self,
        records: I,
        sink: ChunkedByteSink,
        serializer: &dyn RecordSerializer<R>,
        mode: MemoryMode,
        mut request_more: impl FnMut(u64) -> bool,
    ) -> anyhow::Result<UnrollOutcome<ChunkedBytes, I::IntoIter>>
    where
        I: IntoIterator<Item = R>,
    {
        let mut iter = records.into_iter();
        let initial = self.config.unroll_initial_threshold_bytes;
        if !self.try_acquire(initial, mode, &mut request_more) {
            return Ok(UnrollOutcome::Partial(PartialUnroll {
                unrolled: sink.finish(),
                bytes_held: 0,
                rest: iter,
            }));
        }

        let mut sink = sink;
        let mut held = initial;

        while let Some(record) = iter.next() {
            serializer.serialize(&record, &mut sink)?;
            if sink.len() > held {
                match self.grow(held, sink.len(), mode, &mut request_more) {
                    Some(new_held) => held = new_held,
                    None => {
                        return Ok(UnrollOutcome::Partial(PartialUnroll {
                            unrolled: sink.finish(),
                            bytes_held: held,
                            rest: iter,
                        }));
                    }
                }
            }
        }

        let final_size = sink.len();
        Ok(UnrollOutcome::Success {
            value: sink.finish(),
            bytes_held: held,
            final_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockstore_core::MemoryMode;

    fn engine<'a>(config: &'a BlockStoreConfig, accountant: &'a MemoryAccountant) -> UnrollEngine<'a> {
        UnrollEngine::new(accountant, config)
    }

    #[test]
    fn unrolls_small_sequence_without_growth() {
        let config = BlockStoreConfig {
            unroll_initial_threshold_bytes: 1024,
            ..BlockStoreConfig::default()
        };
        let accountant = MemoryAccountant::new(&config);
        let eng = engine(&config, &accountant);

        let outcome = eng.unroll_values::<i64, _>(vec![1, 2, 3], MemoryMode::OnHeap, |_| false);
        match outcome {
            UnrollOutcome::Success { value, bytes_held, final_size } => {
                assert_eq!(value, vec![1, 2, 3]);
                assert_eq!(bytes_held, 1024);
                assert_eq!(final_size, 24);
            }
            UnrollOutcome::Partial(_) => panic!("expected success"),
        }
    }

    #[test]
    fn grows_reservation_past_initial_threshold() {
        let config = BlockStoreConfig {
            unroll_initial_threshold_bytes: 16,
            unroll_check_period_records: 2,
            unroll_growth_factor: 2.0,
            ..BlockStoreConfig::default()
        };
        let accountant = MemoryAccountant::new(&config);
        let eng = engine(&config, &accountant);

        let records: Vec<i64> = (0..20).collect();
        let outcome = eng.unroll_values(records.clone(), MemoryMode::OnHeap, |_| true);
        match outcome {
            UnrollOutcome::Success { value, bytes_held, final_size } => {
                assert_eq!(value, records);
                assert_eq!(final_size, 160);
                assert!(bytes_held >= final_size);
            }
            UnrollOutcome::Partial(_) => panic!("expected success"),
        }
    }

    #[test]
    fn partial_when_initial_reservation_refused() {
        let config = BlockStoreConfig {
            unroll_initial_threshold_bytes: 16,
            max_on_heap_storage_bytes: 0,
            ..BlockStoreConfig::default()
        };
        let accountant = MemoryAccountant::new(&config);
        let eng = engine(&config, &accountant);

        let outcome = eng.unroll_values::<i64, _>(vec![1, 2, 3], MemoryMode::OnHeap, |_| false);
        match outcome {
            UnrollOutcome::Partial(p) => {
                assert_eq!(p.bytes_held, 0);
                assert_eq!(p.rest.collect::<Vec<_>>(), vec![1, 2, 3]);
            }
            UnrollOutcome::Success { .. } => panic!("expected partial"),
        }
    }

    #[test]
    fn partial_when_growth_refused_midway() {
        let config = BlockStoreConfig {
            unroll_initial_threshold_bytes: 16,
            unroll_check_period_records: 2,
            unroll_growth_factor: 2.0,
            max_on_heap_storage_bytes: 16,
            storage_region_fraction: 1.0,
            max_unroll_fraction_of_storage_region: 1.0,
            ..BlockStoreConfig::default()
        };
        let accountant = MemoryAccountant::new(&config);
        let eng = engine(&config, &accountant);

        let records: Vec<i64> = (0..20).collect();
        let outcome = eng.unroll_values(records, MemoryMode::OnHeap, |_| false);
        match outcome {
            UnrollOutcome::Partial(p) => {
                assert_eq!(p.bytes_held, 16);
                assert_eq!(p.unrolled, vec![0, 1, 2, 3]);
                assert_eq!(p.rest.collect::<Vec<_>>(), (4..20).collect::<Vec<i64>>());
            }
            UnrollOutcome::Success { .. } => panic!("expected partial"),
        }
    }

    #[test]
    fn unroll_bytes_tracks_exact_size() {
        use crate::traits::{PassthroughSerializerManager, RecordSerializer, SerializerManager};

        let config = BlockStoreConfig {
            unroll_initial_threshold_bytes: 4,
            unroll_growth_factor: 2.0,
            chunk_size_bytes: 4,
            ..BlockStoreConfig::default()
        };
        let accountant = MemoryAccountant::new(&config);
        let eng = engine(&config, &accountant);
        let manager = PassthroughSerializerManager;
        let serializer = manager.get_serializer("raw", false).unwrap();

        let records: Vec<Vec<u8>> = vec![b"ab".to_vec(), b"cd".to_vec(), b"ef".to_vec()];
        let sink = ChunkedByteSink::new(config.chunk_size_bytes);
        let outcome = eng.unroll_bytes(records, sink, serializer.as_ref(), MemoryMode::OnHeap, |_| true).unwrap();
        match outcome {
            UnrollOutcome::Success { value, final_size, .. } => {
                assert_eq!(final_size, 6);
                assert_eq!(value.to_vec(), b"abcdef".to_vec());
            }
            UnrollOutcome::Partial(_) => panic!("expected success"),
        }
    }

    #[test]
    fn unroll_bytes_rechecks_every_record_not_just_on_a_period() {
        use crate::traits::{PassthroughSerializerManager, RecordSerializer, SerializerManager};

        // A check period this large would never fire for a 3-record
        // sequence if the bytes variant honored `unroll_check_period_records`
        // the way the values variant does; it must not, so the overrun is
        // still caught on the record that actually causes it.
        let config = BlockStoreConfig {
            unroll_initial_threshold_bytes: 2,
            unroll_check_period_records: 4,
            unroll_growth_factor: 2.0,
            max_on_heap_storage_bytes: 3,
            storage_region_fraction: 1.0,
            max_unroll_fraction_of_storage_region: 1.0,
            chunk_size_bytes: 8,
            ..BlockStoreConfig::default()
        };
        let accountant = MemoryAccountant::new(&config);
        let eng = engine(&config, &accountant);
        let manager = PassthroughSerializerManager;
        let serializer = manager.get_serializer("raw", false).unwrap();

        let records: Vec<Vec<u8>> = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let sink = ChunkedByteSink::new(config.chunk_size_bytes);
        let outcome = eng.unroll_bytes(records, sink, serializer.as_ref(), MemoryMode::OnHeap, |_| false).unwrap();
        match outcome {
            UnrollOutcome::Partial(p) => {
                assert_eq!(p.unrolled.to_vec(), b"abc".to_vec());
                assert!(p.rest.collect::<Vec<_>>().is_empty());
            }
            UnrollOutcome::Success { .. } => panic!("expected the per-record size check to catch the overrun"),
        }
    }
}
