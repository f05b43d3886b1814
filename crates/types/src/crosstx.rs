//! Cross-shard transaction projections and their read/write sets.

use crate::{Address, BlockHeight, Hash, ShardId, Transaction};
use sbor::prelude::*;
use std::collections::BTreeMap;

/// The storage slots one contract contributes to a cross-shard transaction.
///
/// `reads` lists every declared slot; `writes` the subset that is written.
#[derive(Debug, Clone, Default, PartialEq, Eq, BasicSbor)]
pub struct ContractRwSet {
    /// The contract address.
    pub addr: Address,

    /// All declared slots, in declaration order.
    pub reads: Vec<Hash>,

    /// Slots that are written to.
    pub writes: Vec<Hash>,
}

impl ContractRwSet {
    /// Create an empty set for a contract.
    pub fn new(addr: Address) -> Self {
        Self {
            addr,
            reads: vec![],
            writes: vec![],
        }
    }

    /// Declare a read slot.
    pub fn add_read(&mut self, key: Hash) {
        self.reads.push(key);
    }

    /// Declare a written slot. Written slots also appear in `reads`.
    pub fn add_write(&mut self, key: Hash) {
        self.writes.push(key);
    }
}

/// Per-shard read/write sets of one cross-shard transaction.
pub type ShardRwSets = BTreeMap<ShardId, Vec<ContractRwSet>>;

/// A decoded cross-shard transaction as carried on the reference chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossShardTx {
    /// Participant shards, in declaration order.
    pub shards: Vec<ShardId>,

    /// Reference-chain height the transaction was observed at.
    pub block_num: BlockHeight,

    /// Per-shard declared read/write sets.
    pub rw_sets: ShardRwSets,

    /// The derived local-execution transaction.
    pub inner: Transaction,
}

impl CrossShardTx {
    /// Whether the given shard participates.
    pub fn involves(&self, shard: ShardId) -> bool {
        self.shards.contains(&shard)
    }
}

/// The cross-shard transactions pending at one reference height, keyed by
/// their index in the reference block.
#[derive(Debug, Clone, Default)]
pub struct PendingCrossTxs {
    txs: BTreeMap<u64, CrossShardTx>,
}

impl PendingCrossTxs {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending transactions.
    pub fn tx_count(&self) -> usize {
        self.txs.len()
    }

    /// Record a cross-shard transaction under its block index.
    pub fn add(&mut self, index: u64, tx: CrossShardTx) {
        self.txs.insert(index, tx);
    }

    /// Iterate over the pending transactions in block order.
    pub fn iter(&self) -> impl Iterator<Item = &CrossShardTx> {
        self.txs.values()
    }

    /// Whether a pending transaction's inner hash matches.
    pub fn contains_inner(&self, tx_hash: &Hash) -> bool {
        self.txs.values().any(|ctx| ctx.inner.hash() == *tx_hash)
    }
}

/// Foreign account data for one contract, as gossiped between shards.
///
/// `values` pairs positionally with the requested slots of the matching
/// `ContractRwSet`.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct KeyVal {
    /// The contract address.
    pub addr: Address,

    /// Account balance at the committed root.
    pub balance: u128,

    /// Account nonce at the committed root.
    pub nonce: u64,

    /// Slot values, in request order.
    pub values: Vec<Hash>,
}

/// A cached foreign account with resolved slot values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAccount {
    /// The contract address.
    pub addr: Address,

    /// Account balance.
    pub balance: u128,

    /// Account nonce.
    pub nonce: u64,

    /// Resolved slot values.
    pub slots: BTreeMap<Hash, Hash>,
}

impl CachedAccount {
    /// Create an account with no slots.
    pub fn new(addr: Address, balance: u128, nonce: u64) -> Self {
        Self {
            addr,
            balance,
            nonce,
            slots: BTreeMap::new(),
        }
    }
}
