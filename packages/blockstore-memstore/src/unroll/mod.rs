//! Cooperative unroll-and-evict admission (§4.3).

pub mod engine;

pub use engine::{PartialUnroll, UnrollEngine, UnrollOutcome};
