//! State shared between a worker's local chain, its reference mirror and
//! the mining worker.
//!
//! On worker shards two chain instances run side by side; everything the
//! mirror learns from the reference chain (pending cross-shard
//! transactions, commitments, the shard's own latest commit) is consumed by
//! the local chain's processor and the miner through this shared structure.
//! On the reference shard it additionally tracks the per-shard commit and
//! cross-tx high-water marks feeding the state-commit filter.

use crate::events::{ForeignDataEvent, FOREIGN_EVENT_BUFFER};
use parking_lot::RwLock;
use shardline_foreign::ForeignRegistry;
use shardline_locks::LockManager;
use shardline_types::{
    BlockHeight, Commitment, CommitmentMap, CrossShardTx, Hash, KeyVal, PendingCrossTxs, ShardId,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::broadcast;

/// Process-wide cross-shard bookkeeping.
#[derive(Debug)]
pub struct CrossShardState {
    /// Global and tentative lock tables.
    pub locks: LockManager,

    /// Foreign-data caches per reference height.
    pub foreign: ForeignRegistry,

    /// Pending cross-shard transactions per reference height.
    pending: RwLock<BTreeMap<BlockHeight, PendingCrossTxs>>,

    /// Known commitments per reference height.
    commitments: RwLock<BTreeMap<BlockHeight, CommitmentMap>>,

    /// This shard's latest commitment carried on the reference chain.
    my_latest_commit: RwLock<Commitment>,

    /// Reference shard: last accepted commit per worker shard.
    last_commit: RwLock<HashMap<ShardId, Commitment>>,

    /// Reference shard: reference height of the last cross-shard
    /// transaction touching each worker shard.
    last_ctx: RwLock<HashMap<ShardId, BlockHeight>>,

    /// Cross-shard transactions already carried by the reference chain.
    processed: RwLock<HashSet<Hash>>,

    /// Readiness notifications for foreign-data caches.
    foreign_events: broadcast::Sender<ForeignDataEvent>,
}

impl Default for CrossShardState {
    fn default() -> Self {
        Self::new()
    }
}

impl CrossShardState {
    /// Create empty shared state.
    pub fn new() -> Self {
        Self {
            locks: LockManager::new(),
            foreign: ForeignRegistry::new(),
            pending: RwLock::new(BTreeMap::new()),
            commitments: RwLock::new(BTreeMap::new()),
            my_latest_commit: RwLock::new(Commitment::genesis(
                ShardId(0),
                Hash::ZERO,
                Hash::ZERO,
            )),
            last_commit: RwLock::new(HashMap::new()),
            last_ctx: RwLock::new(HashMap::new()),
            processed: RwLock::new(HashSet::new()),
            foreign_events: broadcast::channel(FOREIGN_EVENT_BUFFER).0,
        }
    }

    /// Seed the genesis commitments, as the chains do at startup.
    ///
    /// The reference shard seeds its per-shard filter state; worker shards
    /// seed the height-0 commitment map and their own latest commit.
    pub fn init_genesis(
        &self,
        my_shard: ShardId,
        num_shards: u64,
        genesis_root: Hash,
        genesis_hash: Hash,
    ) {
        if my_shard.is_reference() {
            let mut last_commit = self.last_commit.write();
            let mut last_ctx = self.last_ctx.write();
            for shard in 1..num_shards {
                let shard = ShardId(shard);
                last_ctx.insert(shard, BlockHeight::GENESIS);
                last_commit.insert(
                    shard,
                    Commitment::genesis(shard, genesis_root, genesis_hash),
                );
            }
        } else {
            let mut commitments = self.commitments.write();
            let mut map = CommitmentMap::new();
            for shard in 0..num_shards {
                let shard = ShardId(shard);
                map.add(shard, Commitment::genesis(shard, genesis_root, genesis_hash));
            }
            commitments.insert(BlockHeight::GENESIS, map);
            self.foreign.get_or_insert(BlockHeight::GENESIS, true);

            let mut mine = self.my_latest_commit.write();
            *mine = Commitment::genesis(my_shard, genesis_root, genesis_hash);
        }
    }

    // ── Pending cross-shard transactions ────────────────────────────────

    /// Whether a reference height carries cross-shard transactions for this
    /// shard.
    pub fn ctx_exists(&self, ref_num: BlockHeight) -> bool {
        self.pending
            .read()
            .get(&ref_num)
            .map(|p| p.tx_count() > 0)
            .unwrap_or(false)
    }

    /// The pending cross-shard transactions at a reference height.
    pub fn pending_at(&self, ref_num: BlockHeight) -> Option<PendingCrossTxs> {
        self.pending.read().get(&ref_num).cloned()
    }

    /// Whether a pending cross-shard-local transaction with this hash is
    /// registered at a reference height.
    pub fn pending_contains(&self, ref_num: BlockHeight, tx_hash: &Hash) -> bool {
        self.pending
            .read()
            .get(&ref_num)
            .map(|p| p.contains_inner(tx_hash))
            .unwrap_or(false)
    }

    /// Register a cross-shard transaction under its reference height and
    /// block index.
    pub fn add_pending(&self, ref_num: BlockHeight, index: u64, ctx: CrossShardTx) {
        self.pending
            .write()
            .entry(ref_num)
            .or_default()
            .add(index, ctx);
    }

    // ── Commitments ─────────────────────────────────────────────────────

    /// The commitment map at a reference height, creating it by carrying
    /// the previous height's entries forward when absent.
    pub fn commitments_at(&self, ref_num: BlockHeight, num_shards: u64) -> CommitmentMap {
        let mut commitments = self.commitments.write();
        if !commitments.contains_key(&ref_num) && ref_num.0 > 0 {
            let mut map = CommitmentMap::new();
            if let Some(prev) = commitments.get(&BlockHeight(ref_num.0 - 1)) {
                map.copy_from(num_shards, prev);
            }
            commitments.insert(ref_num, map);
        }
        commitments.get(&ref_num).cloned().unwrap_or_default()
    }

    /// Record a remote shard's commitment at a reference height.
    pub fn add_commitment(&self, ref_num: BlockHeight, shard: ShardId, commit: Commitment) {
        self.commitments
            .write()
            .entry(ref_num)
            .or_default()
            .add(shard, commit);
    }

    /// This shard's latest commitment.
    pub fn my_latest_commit(&self) -> Commitment {
        *self.my_latest_commit.read()
    }

    /// The height of this shard's latest committed block.
    pub fn commit_num(&self) -> BlockHeight {
        self.my_latest_commit.read().block_num
    }

    /// Update this shard's latest commitment and prune every map below the
    /// reported reference height.
    pub fn update_my_commit(
        &self,
        block_num: BlockHeight,
        ref_num: BlockHeight,
        state_root: Hash,
        block_hash: Hash,
    ) {
        self.my_latest_commit
            .write()
            .update(block_num, ref_num, state_root, block_hash);
        self.clean_below(ref_num);
    }

    /// Drop pending cross-txs, commitment maps and foreign-data entries
    /// strictly below a reference height.
    pub fn clean_below(&self, height: BlockHeight) {
        {
            let mut pending = self.pending.write();
            *pending = pending.split_off(&height);
        }
        {
            let mut commitments = self.commitments.write();
            *commitments = commitments.split_off(&height);
        }
        self.foreign.prune_below(height);
    }

    // ── Reference-shard filter state ────────────────────────────────────

    /// Last accepted commit of a worker shard.
    pub fn last_commit(&self, shard: ShardId) -> Option<Commitment> {
        self.last_commit.read().get(&shard).copied()
    }

    /// Record a worker shard's accepted commit.
    pub fn set_last_commit(&self, shard: ShardId, commit: Commitment) {
        self.last_commit.write().insert(shard, commit);
    }

    /// Reference height of the last cross-shard transaction touching a
    /// shard.
    pub fn last_ctx(&self, shard: ShardId) -> BlockHeight {
        self.last_ctx
            .read()
            .get(&shard)
            .copied()
            .unwrap_or(BlockHeight::GENESIS)
    }

    /// Record a cross-shard transaction touching a shard at a height.
    pub fn set_last_ctx(&self, shard: ShardId, height: BlockHeight) {
        self.last_ctx.write().insert(shard, height);
    }

    /// Whether a cross-shard transaction was already carried.
    pub fn is_processed(&self, tx_hash: &Hash) -> bool {
        self.processed.read().contains(tx_hash)
    }

    /// Mark a cross-shard transaction as carried.
    pub fn mark_processed(&self, tx_hash: Hash) {
        self.processed.write().insert(tx_hash);
    }

    // ── Foreign data ────────────────────────────────────────────────────

    /// Subscribe to foreign-data readiness events.
    pub fn subscribe_foreign(&self) -> broadcast::Receiver<ForeignDataEvent> {
        self.foreign_events.subscribe()
    }

    /// Announce that a reference height's cache became ready.
    pub fn post_foreign_ready(&self, ref_num: BlockHeight) {
        let _ = self.foreign_events.send(ForeignDataEvent { ref_num });
    }

    /// Insert one shard's delivered foreign data for a reference height,
    /// firing the readiness event when it completes the cache.
    pub fn add_foreign_data(&self, ref_num: BlockHeight, shard: ShardId, vals: &[KeyVal]) {
        if let Some((cache, _)) = self.foreign.get(ref_num) {
            if cache.add_data(shard, vals) {
                self.post_foreign_ready(ref_num);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_types::{Address, ShardRwSets, Transaction, TxKind};

    fn ctx(shards: &[u64]) -> CrossShardTx {
        CrossShardTx {
            shards: shards.iter().map(|&s| ShardId(s)).collect(),
            block_num: BlockHeight(1),
            rw_sets: ShardRwSets::new(),
            inner: Transaction::new(
                TxKind::CrossShardLocal,
                0,
                ShardId(0),
                Address([1u8; 20]),
                0,
                21_000,
                0,
                vec![],
            ),
        }
    }

    #[test]
    fn test_ctx_exists() {
        let state = CrossShardState::new();
        assert!(!state.ctx_exists(BlockHeight(5)));
        state.add_pending(BlockHeight(5), 0, ctx(&[1, 2]));
        assert!(state.ctx_exists(BlockHeight(5)));
    }

    #[test]
    fn test_commitments_carry_forward() {
        let state = CrossShardState::new();
        state.add_commitment(
            BlockHeight(3),
            ShardId(2),
            Commitment::genesis(ShardId(2), Hash::ZERO, Hash::ZERO),
        );

        let at4 = state.commitments_at(BlockHeight(4), 3);
        assert!(at4.get(ShardId(2)).is_some());
    }

    #[test]
    fn test_update_my_commit_prunes() {
        let state = CrossShardState::new();
        for h in 1..=6u64 {
            state.add_pending(BlockHeight(h), 0, ctx(&[1]));
            state.foreign.get_or_insert(BlockHeight(h), true);
        }

        state.update_my_commit(
            BlockHeight(9),
            BlockHeight(4),
            Hash::from_bytes(b"root"),
            Hash::from_bytes(b"hash"),
        );

        assert!(!state.ctx_exists(BlockHeight(3)));
        assert!(state.ctx_exists(BlockHeight(4)));
        assert!(state.foreign.get(BlockHeight(3)).is_none());
        assert_eq!(state.commit_num(), BlockHeight(9));
    }

    #[tokio::test]
    async fn test_foreign_ready_event() {
        let state = CrossShardState::new();
        let mut rx = state.subscribe_foreign();
        state.post_foreign_ready(BlockHeight(6));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.ref_num, BlockHeight(6));
    }
}
