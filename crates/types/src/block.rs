//! Block and Header types.

use crate::{Address, BlockHeight, Hash, ShardId, Transaction};
use sbor::prelude::*;

/// Block header.
///
/// Besides the usual chain position it names the reference-chain block this
/// block was built against (`ref_number`/`ref_hash`), which drives
/// cross-shard scheduling on worker shards.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Header {
    /// Hash of parent block.
    pub parent_hash: Hash,

    /// Block height in the chain (genesis = 0).
    pub number: BlockHeight,

    /// Reference-chain height this block is built against.
    pub ref_number: BlockHeight,

    /// Hash of that reference-chain block.
    pub ref_hash: Hash,

    /// Shard this block belongs to.
    pub shard: ShardId,

    /// Beneficiary of the block.
    pub coinbase: Address,

    /// Root of the public state after executing this block.
    pub state_root: Hash,

    /// Gas limit for the block.
    pub gas_limit: u64,

    /// Gas consumed by the block's transactions.
    pub gas_used: u64,

    /// Unix timestamp (seconds) when the block was proposed.
    pub timestamp: u64,

    /// Arbitrary extra data set by the miner.
    pub extra: Vec<u8>,
}

impl Header {
    /// Compute hash of this header.
    pub fn hash(&self) -> Hash {
        let bytes = basic_encode(self).expect("Header serialization should never fail");
        Hash::from_bytes(&bytes)
    }

    /// Check if this is the genesis header.
    pub fn is_genesis(&self) -> bool {
        self.number.0 == 0
    }
}

/// Complete block with header and transactions. Immutable once hashed.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Block {
    /// Block header.
    pub header: Header,

    /// Transactions included in this block.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Every block contributes the same difficulty; the sealing engine runs
    /// a permissioned protocol, so total difficulty reduces to chain length.
    pub const DIFFICULTY: u64 = 1;

    /// Assemble a block from a header and transactions.
    pub fn new(header: Header, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// Compute hash of this block (hashes the header).
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Get block height.
    pub fn number(&self) -> BlockHeight {
        self.header.number
    }

    /// Get the reference height this block is built against.
    pub fn ref_number(&self) -> BlockHeight {
        self.header.ref_number
    }

    /// Hash of the parent block.
    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    /// Get number of transactions in this block.
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Check if this block contains a specific transaction by hash.
    pub fn contains_transaction(&self, tx_hash: &Hash) -> bool {
        self.transactions.iter().any(|tx| tx.hash() == *tx_hash)
    }

    /// Check if this is the genesis block.
    pub fn is_genesis(&self) -> bool {
        self.header.is_genesis()
    }

    /// Create a genesis block for a shard.
    pub fn genesis(shard: ShardId, gas_limit: u64) -> Self {
        Self {
            header: Header {
                parent_hash: Hash::ZERO,
                number: BlockHeight::GENESIS,
                ref_number: BlockHeight::GENESIS,
                ref_hash: Hash::ZERO,
                shard,
                coinbase: Address::ZERO,
                state_root: Hash::ZERO,
                gas_limit,
                gas_used: 0,
                timestamp: 0,
                extra: vec![],
            },
            transactions: vec![],
        }
    }
}

/// Block body as stored separately from the header.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Body {
    /// Transactions of the block.
    pub transactions: Vec<Transaction>,
}
