//! Memory Accountant (§4.1).

pub mod accountant;

pub use accountant::{MemoryAccountant, PoolSnapshot};
