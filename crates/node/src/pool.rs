//! In-process transaction pool backing the dev node.
//!
//! The production pool (signature checks, replacement rules, gossip) is an
//! external collaborator; this one implements just the interface the core
//! consumes, for single-process runs and tests.

use parking_lot::Mutex;
use shardline_chain::{NewTxsEvent, TxPool};
use shardline_types::{shard_address, Address, BlockHeight, ShardId, Transaction};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::debug;

/// A minimal pending-transaction pool.
pub struct DevPool {
    pending: Mutex<HashMap<Address, Vec<Transaction>>>,
    locals: Mutex<HashSet<Address>>,
    shard_addrs: Vec<Address>,
    feed: mpsc::Sender<NewTxsEvent>,
}

impl DevPool {
    /// Create a pool feeding new-transaction events into `feed`.
    ///
    /// On the reference shard the per-shard commit addresses are
    /// registered so state commitments split correctly.
    pub fn new(my_shard: ShardId, num_shards: u64, feed: mpsc::Sender<NewTxsEvent>) -> Self {
        let mut shard_addrs = vec![];
        if my_shard.is_reference() {
            for shard in 1..num_shards {
                shard_addrs.push(shard_address(ShardId(shard)));
            }
        }
        Self {
            pending: Mutex::new(HashMap::new()),
            locals: Mutex::new(HashSet::new()),
            shard_addrs,
            feed,
        }
    }

    /// Mark an account as local to this node.
    pub fn add_local(&self, addr: Address) {
        self.locals.lock().insert(addr);
    }

    /// Queue a transaction and announce it.
    pub fn add_transaction(&self, tx: Transaction) {
        let from = tx.from();
        {
            let mut pending = self.pending.lock();
            let txs = pending.entry(from).or_default();
            txs.push(tx.clone());
            txs.sort_by_key(|tx| tx.nonce);
        }
        let _ = self.feed.try_send(NewTxsEvent { txs: vec![tx] });
    }

    /// Number of pending transactions.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().values().map(Vec::len).sum()
    }
}

impl TxPool for DevPool {
    fn pending(&self) -> HashMap<Address, Vec<Transaction>> {
        self.pending.lock().clone()
    }

    fn locals(&self) -> Vec<Address> {
        self.locals.lock().iter().copied().collect()
    }

    fn shards(&self) -> Vec<Address> {
        self.shard_addrs.clone()
    }

    fn reset_head(&self, height: BlockHeight) {
        // Queued transactions stay; nonce checks re-validate them against
        // the rewound state on the next build.
        debug!(height = height.0, "transaction pool rewound");
    }
}
