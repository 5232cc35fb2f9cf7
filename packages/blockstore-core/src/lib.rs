//! Block store core -- block identifiers, dataset identifiers, storage
//! levels, and memory modes.
//!
//! This crate has no I/O and no locking: it is the vocabulary shared by the
//! in-memory block store (`blockstore-memstore`) and anything else in the
//! surrounding engine that needs to name a block or describe how it should
//! be stored, without depending on the store's concurrency machinery.

pub mod ids;
pub mod memory_mode;
pub mod storage_level;

pub use ids::{BlockId, DatasetId};
pub use memory_mode::MemoryMode;
pub use storage_level::StorageLevel;
