//! Block Lock Table (§4.2).

pub mod table;

pub use table::{BlockLockTable, LockOutcome, ReadLockGuard, TaskId, WriteLockGuard};
