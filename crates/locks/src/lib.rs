//! Lock manager for cross-shard admission control.

mod manager;

pub use manager::{LockManager, LockTables, SlotLocks, WRITE_LOCKED};
