//! Typed publish/subscribe for chain events.
//!
//! Each event kind has its own sink with a bounded buffer; delivery is
//! at-least-once to live subscribers with no replay. Slow subscribers see
//! lagged receives, never block the chain.

use shardline_types::{Block, BlockHeight, Hash, Log, Transaction};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the head/side/chain sinks.
pub const CHAIN_EVENT_BUFFER: usize = 10;

/// Capacity of the log sinks.
pub const LOGS_EVENT_BUFFER: usize = 256;

/// Capacity of the foreign-data sink.
pub const FOREIGN_EVENT_BUFFER: usize = 64;

/// A canonical block was inserted.
#[derive(Debug, Clone)]
pub struct ChainEvent {
    /// The inserted block.
    pub block: Arc<Block>,
    /// Its hash.
    pub hash: Hash,
    /// Logs produced by its transactions.
    pub logs: Vec<Log>,
}

/// The canonical head moved.
#[derive(Debug, Clone)]
pub struct ChainHeadEvent {
    /// The new head.
    pub block: Arc<Block>,
}

/// A block landed on a side chain.
#[derive(Debug, Clone)]
pub struct ChainSideEvent {
    /// The side block.
    pub block: Arc<Block>,
}

/// Logs dropped by a reorg.
#[derive(Debug, Clone)]
pub struct RemovedLogsEvent {
    /// The removed logs, flagged `removed`.
    pub logs: Vec<Log>,
}

/// A locally mined block was written.
#[derive(Debug, Clone)]
pub struct NewMinedBlockEvent {
    /// The mined block.
    pub block: Arc<Block>,
}

/// The foreign-data cache for a reference height became ready.
#[derive(Debug, Clone, Copy)]
pub struct ForeignDataEvent {
    /// The ready reference height.
    pub ref_num: BlockHeight,
}

/// New transactions entered the pool.
#[derive(Debug, Clone)]
pub struct NewTxsEvent {
    /// The added transactions.
    pub txs: Vec<Transaction>,
}

/// Per-chain event hub.
///
/// Senders are retained for the lifetime of the chain; posting without
/// subscribers is a no-op.
#[derive(Debug)]
pub struct EventHub {
    chain: broadcast::Sender<ChainEvent>,
    head: broadcast::Sender<ChainHeadEvent>,
    side: broadcast::Sender<ChainSideEvent>,
    removed_logs: broadcast::Sender<RemovedLogsEvent>,
    logs: broadcast::Sender<Vec<Log>>,
    mined: broadcast::Sender<NewMinedBlockEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    /// Create a hub with the standard buffer sizes.
    pub fn new() -> Self {
        Self {
            chain: broadcast::channel(CHAIN_EVENT_BUFFER).0,
            head: broadcast::channel(CHAIN_EVENT_BUFFER).0,
            side: broadcast::channel(CHAIN_EVENT_BUFFER).0,
            removed_logs: broadcast::channel(CHAIN_EVENT_BUFFER).0,
            logs: broadcast::channel(LOGS_EVENT_BUFFER).0,
            mined: broadcast::channel(CHAIN_EVENT_BUFFER).0,
        }
    }

    /// Subscribe to canonical insertions.
    pub fn subscribe_chain(&self) -> broadcast::Receiver<ChainEvent> {
        self.chain.subscribe()
    }

    /// Subscribe to head changes.
    pub fn subscribe_chain_head(&self) -> broadcast::Receiver<ChainHeadEvent> {
        self.head.subscribe()
    }

    /// Subscribe to side-chain insertions.
    pub fn subscribe_chain_side(&self) -> broadcast::Receiver<ChainSideEvent> {
        self.side.subscribe()
    }

    /// Subscribe to logs removed by reorgs.
    pub fn subscribe_removed_logs(&self) -> broadcast::Receiver<RemovedLogsEvent> {
        self.removed_logs.subscribe()
    }

    /// Subscribe to the log stream.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<Vec<Log>> {
        self.logs.subscribe()
    }

    /// Subscribe to locally mined blocks.
    pub fn subscribe_mined(&self) -> broadcast::Receiver<NewMinedBlockEvent> {
        self.mined.subscribe()
    }

    /// Post a canonical insertion.
    pub fn post_chain(&self, event: ChainEvent) {
        let _ = self.chain.send(event);
    }

    /// Post a head change.
    pub fn post_chain_head(&self, event: ChainHeadEvent) {
        let _ = self.head.send(event);
    }

    /// Post a side-chain insertion.
    pub fn post_chain_side(&self, event: ChainSideEvent) {
        let _ = self.side.send(event);
    }

    /// Post removed logs.
    pub fn post_removed_logs(&self, event: RemovedLogsEvent) {
        let _ = self.removed_logs.send(event);
    }

    /// Post a batch of logs.
    pub fn post_logs(&self, logs: Vec<Log>) {
        if !logs.is_empty() {
            let _ = self.logs.send(logs);
        }
    }

    /// Post a locally mined block.
    pub fn post_mined(&self, event: NewMinedBlockEvent) {
        let _ = self.mined.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_types::ShardId;

    #[tokio::test]
    async fn test_post_and_receive() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe_chain_head();

        let block = Arc::new(Block::genesis(ShardId(1), 1_000));
        hub.post_chain_head(ChainHeadEvent {
            block: Arc::clone(&block),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.block.hash(), block.hash());
    }

    #[tokio::test]
    async fn test_post_without_subscribers_is_noop() {
        let hub = EventHub::new();
        hub.post_logs(vec![]);
        hub.post_chain_side(ChainSideEvent {
            block: Arc::new(Block::genesis(ShardId(0), 1)),
        });
    }
}
