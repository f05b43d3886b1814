//! Transaction envelope and kinds.

use crate::{Address, Hash, ShardId};
use sbor::prelude::*;
use std::fmt;

/// The closed set of transaction kinds, tagged with their wire ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BasicSbor)]
pub enum TxKind {
    /// State commitment from a worker shard, carried on the reference chain.
    StateCommit,
    /// Ordinary local execution.
    IntraShard,
    /// Cross-shard transaction, carried on the reference chain.
    CrossShard,
    /// One-shot contract bootstrapping in block 1.
    ContractInit,
    /// Per-shard projection of a cross-shard transaction, executed locally.
    CrossShardLocal,
}

impl TxKind {
    /// Wire tag of this kind.
    pub fn tag(self) -> u64 {
        match self {
            TxKind::StateCommit => 0,
            TxKind::IntraShard => 1,
            TxKind::CrossShard => 2,
            TxKind::ContractInit => 3,
            TxKind::CrossShardLocal => 4,
        }
    }

    /// Look up a kind by wire tag.
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(TxKind::StateCommit),
            1 => Some(TxKind::IntraShard),
            2 => Some(TxKind::CrossShard),
            3 => Some(TxKind::ContractInit),
            4 => Some(TxKind::CrossShardLocal),
            _ => None,
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxKind::StateCommit => "state-commit",
            TxKind::IntraShard => "intra-shard",
            TxKind::CrossShard => "cross-shard",
            TxKind::ContractInit => "contract-init",
            TxKind::CrossShardLocal => "cross-shard-local",
        };
        write!(f, "{}", name)
    }
}

/// Secp256k1-style signature values, recovered and validated upstream.
///
/// The core never recovers signers itself; the pool stamps the recovered
/// address into `Transaction::from` before handing transactions over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BasicSbor)]
pub struct Signature {
    pub v: u64,
    pub r: Hash,
    pub s: Hash,
}

/// A transaction with the common envelope shared by all five kinds.
///
/// Immutable once hashed: the hash covers every field except the cached
/// sender, so mutating constructors return fresh values.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Transaction {
    /// Which of the five kinds this is.
    pub kind: TxKind,

    /// Account nonce of the sender.
    pub nonce: u64,

    /// Shard the transaction originates from.
    pub shard: ShardId,

    /// Gas price. Must be zero in this system; a nonzero price is rejected
    /// at execution.
    pub gas_price: u64,

    /// Gas limit for execution.
    pub gas_limit: u64,

    /// Recipient. None means contract creation.
    pub to: Option<Address>,

    /// Sender, carried explicitly for cross-shard-local projections whose
    /// signature lives on the reference chain. None otherwise until the
    /// pool recovers it.
    pub sender: Option<Address>,

    /// Transferred value.
    pub value: u128,

    /// Input payload.
    pub payload: Vec<u8>,

    /// Signature values.
    pub signature: Signature,
}

impl Transaction {
    /// Create a transaction with a recipient.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: TxKind,
        nonce: u64,
        shard: ShardId,
        to: Address,
        value: u128,
        gas_limit: u64,
        gas_price: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            nonce,
            shard,
            gas_price,
            gas_limit,
            to: Some(to),
            sender: None,
            value,
            payload,
            signature: Signature::default(),
        }
    }

    /// Create a contract-creation transaction.
    pub fn contract_creation(
        kind: TxKind,
        nonce: u64,
        shard: ShardId,
        value: u128,
        gas_limit: u64,
        gas_price: u64,
        code: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            nonce,
            shard,
            gas_price,
            gas_limit,
            to: None,
            sender: None,
            value,
            payload: code,
            signature: Signature::default(),
        }
    }

    /// Create a cross-shard-local projection with an explicit sender.
    #[allow(clippy::too_many_arguments)]
    pub fn cross_local(
        nonce: u64,
        to: Address,
        sender: Address,
        value: u128,
        gas_limit: u64,
        gas_price: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind: TxKind::CrossShardLocal,
            nonce,
            shard: ShardId(0),
            gas_price,
            gas_limit,
            to: Some(to),
            sender: Some(sender),
            value,
            payload,
            signature: Signature::default(),
        }
    }

    /// Compute the hash identifying this transaction.
    pub fn hash(&self) -> Hash {
        let bytes = basic_encode(self).expect("Transaction serialization should never fail");
        Hash::from_bytes(&bytes)
    }

    /// The sender address.
    ///
    /// Cross-shard-local projections carry their sender explicitly; for all
    /// other kinds the pool-recovered address is used, falling back to the
    /// zero address when none was stamped.
    pub fn from(&self) -> Address {
        self.sender.unwrap_or(Address::ZERO)
    }

    /// Replace the recipient, returning the updated transaction.
    ///
    /// Used when the chain rewrites state-commit recipients to its commit
    /// address.
    pub fn with_recipient(mut self, to: Address) -> Self {
        self.to = Some(to);
        self
    }

    /// Stamp a recovered sender address.
    pub fn with_sender(mut self, sender: Address) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Whether this creates a contract.
    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }

    /// Upper bound on funds this transaction can consume:
    /// `value + gas_price * gas_limit`.
    pub fn cost(&self) -> u128 {
        self.value + (self.gas_price as u128) * (self.gas_limit as u128)
    }
}
