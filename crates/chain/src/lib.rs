//! Chain management: durable storage and linearisation of one shard's
//! chain, serial block execution, reorgs, and event fan-out.

mod blockchain;
mod datalog;
mod error;
mod events;
mod processor;
mod refparse;
mod shared;
mod traits;

pub use blockchain::{
    build_header, seal_and_insert, BlockChain, ChainConfig, WriteStatus, MAX_TIME_FUTURE_BLOCKS,
    TRIES_IN_MEMORY,
};
pub use datalog::{now_unix, DataLog};
pub use error::{BlockError, ExecError, InsertFailure};
pub use events::{
    ChainEvent, ChainHeadEvent, ChainSideEvent, EventHub, ForeignDataEvent, NewMinedBlockEvent,
    NewTxsEvent, RemovedLogsEvent, CHAIN_EVENT_BUFFER, FOREIGN_EVENT_BUFFER, LOGS_EVENT_BUFFER,
};
pub use processor::{apply_transaction, ExecEnv};
pub use shared::CrossShardState;
pub use traits::{DevEngine, Engine, HeaderReader, TxPool};
