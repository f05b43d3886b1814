//! Core data types for the shardline execution engine.
//!
//! Blocks, transactions, receipts, commitments and the cross-shard
//! read/write-set containers shared by every other crate.

mod address;
mod block;
mod commitment;
mod crosstx;
mod hash;
mod identifiers;
mod ordering;
mod receipt;
mod transaction;

pub use address::{reference_address, shard_address, Address};
pub use block::{Block, Body, Header};
pub use commitment::{Commitment, CommitmentMap};
pub use crosstx::{CachedAccount, ContractRwSet, CrossShardTx, KeyVal, PendingCrossTxs, ShardRwSets};
pub use hash::{Hash, HexError};
pub use identifiers::{BlockHeight, ShardId};
pub use ordering::TxsByPriceAndNonce;
pub use receipt::{merge_receipts, Log, Receipt};
pub use transaction::{Signature, Transaction, TxKind};
