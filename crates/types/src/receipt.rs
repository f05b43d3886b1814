//! Execution receipts and logs.

use crate::{Address, BlockHeight, Hash};
use sbor::prelude::*;

/// A contract log entry.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Log {
    /// Contract that emitted the log.
    pub address: Address,

    /// Opaque event payload. For cross-shard and state-commit events the
    /// first 32-byte word carries the applied flag.
    pub data: Vec<u8>,

    /// Hash of the containing block, stamped once the block is sealed.
    pub block_hash: Hash,

    /// Height of the containing block.
    pub block_number: BlockHeight,

    /// Hash of the transaction that produced the log.
    pub tx_hash: Hash,

    /// Set when the log was dropped by a reorg.
    pub removed: bool,
}

/// Receipt of one executed transaction.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Receipt {
    /// Hash of the transaction.
    pub tx_hash: Hash,

    /// Whether execution succeeded.
    pub success: bool,

    /// Gas consumed by this transaction alone.
    pub gas_used: u64,

    /// Gas consumed by the block up to and including this transaction.
    pub cumulative_gas_used: u64,

    /// Address of the created contract, for creation transactions.
    pub contract_address: Option<Address>,

    /// Logs emitted during execution.
    pub logs: Vec<Log>,
}

impl Receipt {
    /// Create a receipt for a transaction.
    pub fn new(tx_hash: Hash, success: bool, gas_used: u64, cumulative_gas_used: u64) -> Self {
        Self {
            tx_hash,
            success,
            gas_used,
            cumulative_gas_used,
            contract_address: None,
            logs: vec![],
        }
    }
}

/// Merge private receipts over public ones by transaction hash.
///
/// The result keeps the public ordering; wherever a private receipt exists
/// for the same transaction it replaces the public one.
pub fn merge_receipts(public: &[Receipt], private: &[Receipt]) -> Vec<Receipt> {
    let mut merged = Vec::with_capacity(public.len());
    for receipt in public {
        match private.iter().find(|p| p.tx_hash == receipt.tx_hash) {
            Some(private_receipt) => merged.push(private_receipt.clone()),
            None => merged.push(receipt.clone()),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_prefers_private() {
        let h1 = Hash::from_bytes(b"t1");
        let h2 = Hash::from_bytes(b"t2");
        let public = vec![Receipt::new(h1, true, 10, 10), Receipt::new(h2, true, 5, 15)];
        let private = vec![Receipt::new(h2, false, 7, 17)];

        let merged = merge_receipts(&public, &private);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].tx_hash, h1);
        assert!(merged[0].success);
        assert_eq!(merged[1].tx_hash, h2);
        assert!(!merged[1].success);
        assert_eq!(merged[1].gas_used, 7);
    }
}
