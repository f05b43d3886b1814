//! Error taxonomy for block validation and execution.

use shardline_codec::CodecError;
use shardline_state::StateError;
use shardline_storage::StorageError;
use shardline_types::Hash;
use thiserror::Error;

/// Per-block validation and import errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    /// Block and state are both already known.
    #[error("block already known")]
    KnownBlock,

    /// The block's hash is blacklisted.
    #[error("blacklisted hash {0}")]
    BlacklistedHash(Hash),

    /// The block's timestamp is ahead of wall-clock.
    #[error("future block")]
    FutureBlock,

    /// The parent block is unknown.
    #[error("unknown ancestor")]
    UnknownAncestor,

    /// The parent is known but its state was garbage collected.
    #[error("pruned ancestor")]
    PrunedAncestor,

    /// A batch of blocks was not contiguous.
    #[error("non contiguous insert: item {index} does not extend its predecessor")]
    NonContiguousInsert {
        /// Index of the offending block.
        index: usize,
    },

    /// Receipt and transaction counts differ.
    #[error("transaction and receipt count mismatch")]
    TxCountMismatch,

    /// Header or state validation failed.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// A non-revertible transaction failed to execute.
    #[error("transaction execution failed: {0}")]
    Execution(#[from] ExecError),

    /// Processing was aborted by shutdown.
    #[error("blocks processing aborted")]
    AbortProcessing,

    /// Reorg walked off the known chain.
    #[error("reorg failed: {0} chain is invalid")]
    ReorgFailed(&'static str),

    /// The underlying store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A state snapshot failed to open.
    #[error(transparent)]
    State(#[from] StateError),
}

/// Per-transaction execution errors.
///
/// Inside a cross-shard-local transaction these revert only that
/// transaction; elsewhere they fail the whole block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    /// Nonce below the account's.
    #[error("nonce too low")]
    NonceTooLow,

    /// Nonce above the account's.
    #[error("nonce too high")]
    NonceTooHigh,

    /// The block gas pool is exhausted.
    #[error("gas limit reached")]
    GasLimitReached,

    /// Gas limit below the transaction's intrinsic gas.
    #[error("intrinsic gas too low")]
    IntrinsicGas,

    /// Gas prices are fixed at zero in this system.
    #[error("invalid gas price")]
    InvalidGasPrice,

    /// The sender cannot cover `value + gas_price * gas_limit`.
    #[error("insufficient funds for value and gas")]
    InsufficientFunds,

    /// A reference-chain payload failed to decode.
    #[error("payload decode failed: {0}")]
    Payload(#[from] CodecError),
}

impl From<shardline_state::GasLimitReached> for ExecError {
    fn from(_: shardline_state::GasLimitReached) -> Self {
        ExecError::GasLimitReached
    }
}

/// A failed chain insertion, naming the first failing block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("insert failed at block {index}: {source}")]
pub struct InsertFailure {
    /// Index of the failing block in the batch.
    pub index: usize,

    /// What went wrong.
    pub source: BlockError,
}
