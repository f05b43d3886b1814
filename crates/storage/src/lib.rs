//! Persistent chain storage: key-value abstraction and typed schema.

mod kv;
mod schema;

pub use kv::{KeyValue, MemoryDb};
pub use schema::*;

use thiserror::Error;

/// Storage-level failures. Fatal at startup; the chain resets to genesis.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// A stored value failed to decode.
    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    /// The genesis block is missing.
    #[error("genesis not found in chain")]
    NoGenesis,

    /// The state for the head block is missing.
    #[error("head state missing for root {0}")]
    MissingState(shardline_types::Hash),

    /// The stored schema version does not match [`CHAIN_VERSION`].
    #[error("incompatible chain version: stored {stored}, expected {expected}")]
    IncompatibleVersion {
        /// Version found in the store.
        stored: u64,
        /// Version this build writes.
        expected: u64,
    },
}
