//! Interfaces of the external collaborators: transaction pool and sealing
//! engine.

use crate::datalog::now_unix;
use crate::error::BlockError;
use shardline_state::StateDb;
use shardline_types::{Address, Block, BlockHeight, Hash, Header, Transaction};
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Read access to headers, as much of the chain as the engine needs.
pub trait HeaderReader: Send + Sync {
    /// The header of a block by hash.
    fn header_by_hash(&self, hash: &Hash) -> Option<Header>;

    /// The current head header.
    fn current_header(&self) -> Header;
}

/// The transaction pool interface the core is written against.
///
/// Signature checking, replacement rules and gossip live behind it; the
/// core only splits and drains what the pool reports as pending.
pub trait TxPool: Send + Sync {
    /// Pending transactions per sender, nonce-sorted.
    fn pending(&self) -> HashMap<Address, Vec<Transaction>>;

    /// Accounts treated as local to this node.
    fn locals(&self) -> Vec<Address>;

    /// The per-shard commit addresses (reference shard only): pending
    /// transactions from these accounts are state commitments.
    fn shards(&self) -> Vec<Address>;

    /// Rewind the pool to a chain height after a forced rollback.
    fn reset_head(&self, height: BlockHeight);
}

/// The consensus sealing engine.
///
/// Sealing is fire-and-forget: each task gets a fresh stop signal and
/// delivers its sealed block on the shared result channel.
pub trait Engine: Send + Sync {
    /// Validate a header against its parent.
    fn verify_header(&self, chain: &dyn HeaderReader, header: &Header) -> Result<(), BlockError>;

    /// Fill in the engine-owned header fields before building.
    fn prepare(&self, chain: &dyn HeaderReader, header: &mut Header) -> Result<(), BlockError>;

    /// Run post-transaction state modifications and assemble the block.
    fn finalize(&self, header: Header, state: &mut StateDb, txs: Vec<Transaction>) -> Block;

    /// The hash a seal is computed over, stable across resubmits of the
    /// same work.
    fn seal_hash(&self, header: &Header) -> Hash;

    /// Start sealing a block, delivering on `results` unless `stop` fires.
    fn seal(&self, block: Block, results: mpsc::Sender<Block>, stop: watch::Receiver<bool>);
}

/// Instant-sealing engine backing tests and the dev node.
#[derive(Debug, Default)]
pub struct DevEngine;

impl DevEngine {
    /// Create the engine.
    pub fn new() -> Self {
        Self
    }
}

impl Engine for DevEngine {
    fn verify_header(&self, chain: &dyn HeaderReader, header: &Header) -> Result<(), BlockError> {
        let parent = chain
            .header_by_hash(&header.parent_hash)
            .ok_or(BlockError::UnknownAncestor)?;

        if header.number != parent.number.next() {
            return Err(BlockError::ValidationFailed(format!(
                "height {} does not extend parent {}",
                header.number, parent.number
            )));
        }
        if header.timestamp <= parent.timestamp && header.number.0 > 1 {
            return Err(BlockError::ValidationFailed(
                "timestamp not after parent".into(),
            ));
        }
        if header.gas_used > header.gas_limit {
            return Err(BlockError::ValidationFailed(format!(
                "gas used {} above limit {}",
                header.gas_used, header.gas_limit
            )));
        }
        if header.timestamp > now_unix() {
            return Err(BlockError::FutureBlock);
        }
        Ok(())
    }

    fn prepare(&self, _chain: &dyn HeaderReader, _header: &mut Header) -> Result<(), BlockError> {
        Ok(())
    }

    fn finalize(&self, mut header: Header, state: &mut StateDb, txs: Vec<Transaction>) -> Block {
        header.state_root = state.root();
        Block::new(header, txs)
    }

    fn seal_hash(&self, header: &Header) -> Hash {
        // The extra field carries the seal; exclude it so resubmits of the
        // same work dedupe.
        let mut sealed = header.clone();
        sealed.extra = vec![];
        sealed.hash()
    }

    fn seal(&self, block: Block, results: mpsc::Sender<Block>, stop: watch::Receiver<bool>) {
        tokio::spawn(async move {
            if *stop.borrow() {
                debug!(number = block.number().0, "sealing aborted before start");
                return;
            }
            let _ = results.send(block).await;
        });
    }
}
