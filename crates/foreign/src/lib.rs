//! Foreign-data caching for cross-shard execution.
//!
//! Worker shards pull remote read-set values before executing a
//! cross-shard-local transaction; this crate holds the per-reference-height
//! caches and the per-execution balance overlay.

mod cache;
mod registry;

pub use cache::{CrossChanges, DataCache};
pub use registry::ForeignRegistry;
