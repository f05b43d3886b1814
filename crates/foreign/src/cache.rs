//! Per-reference-height cache of remote shards' read-set values.
//!
//! Before a worker shard can execute the cross-shard-local transactions of
//! a reference height it needs the slot values, balances and nonces the
//! other participant shards declared. One `DataCache` collects them for one
//! height: created when the reference block is parsed, filled by
//! gossip-driven `add_data` calls, read during local execution, dropped
//! when the shard's own commit advances past the height.

use parking_lot::RwLock;
use shardline_types::{
    Address, BlockHeight, CachedAccount, Commitment, CommitmentMap, ContractRwSet, Hash, KeyVal,
    PendingCrossTxs, ShardId,
};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Default)]
struct CacheInner {
    /// Readiness: `received == required`. Monotone.
    ready: bool,

    /// Remote shards whose data is needed.
    required: usize,

    /// Remote shards whose data has arrived.
    received: usize,

    /// Requested slots per contract.
    keyval: HashMap<Address, ContractRwSet>,

    /// Which shard owns each contract.
    addr_to_shard: HashMap<Address, ShardId>,

    /// Arrival status per shard. The local shard starts satisfied.
    shard_status: HashMap<ShardId, bool>,

    /// The remote shards' pre-conditions: their latest commitments at the
    /// time the reference block was parsed.
    commits: HashMap<ShardId, Commitment>,

    /// Arrived account data per contract.
    values: HashMap<Address, CachedAccount>,
}

/// Foreign data for one reference height. Individually locked and shared
/// via `Arc`; the owner fans out a single `ForeignDataEvent` when the cache
/// flips ready.
#[derive(Debug)]
pub struct DataCache {
    ref_num: BlockHeight,
    inner: RwLock<CacheInner>,
}

impl DataCache {
    /// Create a cache for a reference height. `ready` starts true when the
    /// height has nothing for this shard.
    pub fn new(ref_num: BlockHeight, ready: bool) -> Self {
        Self {
            ref_num,
            inner: RwLock::new(CacheInner {
                ready,
                ..CacheInner::default()
            }),
        }
    }

    /// The reference height this cache serves.
    pub fn ref_num(&self) -> BlockHeight {
        self.ref_num
    }

    /// Whether every required shard has delivered.
    pub fn is_ready(&self) -> bool {
        self.inner.read().ready
    }

    /// `(received, required)` counters.
    pub fn progress(&self) -> (usize, usize) {
        let inner = self.inner.read();
        (inner.received, inner.required)
    }

    /// Pre-register the union of read/write sets the shard needs at this
    /// height. Counts one `required` per distinct remote shard and snapshots
    /// that shard's commitment as the fetch pre-condition.
    ///
    /// Returns the resulting readiness (true when there is nothing to
    /// fetch).
    pub fn init_keys(
        &self,
        my_shard: ShardId,
        pending: &PendingCrossTxs,
        commits: &CommitmentMap,
    ) -> bool {
        let mut inner = self.inner.write();
        inner.received = 0;
        inner.required = 0;

        for ctx in pending.iter() {
            if !ctx.involves(my_shard) {
                continue;
            }
            for (&shard, sets) in &ctx.rw_sets {
                if !inner.shard_status.contains_key(&shard) {
                    if shard == my_shard {
                        inner.shard_status.insert(shard, true);
                    } else {
                        inner.required += 1;
                        inner.shard_status.insert(shard, false);
                        if let Some(commit) = commits.get(shard) {
                            inner.commits.insert(shard, *commit);
                        }
                    }
                }
                for set in sets {
                    if !inner.addr_to_shard.contains_key(&set.addr) {
                        inner.addr_to_shard.insert(set.addr, shard);
                    }
                    let requested = inner
                        .keyval
                        .entry(set.addr)
                        .or_insert_with(|| ContractRwSet::new(set.addr));
                    for key in &set.reads {
                        requested.add_read(*key);
                    }
                }
            }
        }

        if inner.received == inner.required {
            inner.ready = true;
        }
        inner.ready
    }

    /// Insert one shard's delivered account data. Idempotent per shard: a
    /// second delivery is ignored and leaves `received` unchanged.
    ///
    /// Arrived values pair positionally with the requested slots. Returns
    /// true when this delivery flipped the cache ready; the owner must fan
    /// out exactly one `ForeignDataEvent` in that case.
    pub fn add_data(&self, shard: ShardId, vals: &[KeyVal]) -> bool {
        let mut inner = self.inner.write();
        if *inner.shard_status.get(&shard).unwrap_or(&true) || vals.is_empty() {
            return false;
        }

        for val in vals {
            let mut account = CachedAccount::new(val.addr, val.balance, val.nonce);
            if let Some(requested) = inner.keyval.get(&val.addr) {
                for (key, value) in requested.reads.iter().zip(val.values.iter()) {
                    account.slots.insert(*key, *value);
                }
            }
            inner.values.insert(val.addr, account);
        }

        inner.shard_status.insert(shard, true);
        inner.received += 1;
        if inner.received == inner.required {
            inner.ready = true;
            debug!(ref_num = self.ref_num.0, "foreign data complete");
            return true;
        }
        false
    }

    /// Which shard owns a contract at this height, if declared.
    pub fn shard_of(&self, addr: &Address) -> Option<ShardId> {
        self.inner.read().addr_to_shard.get(addr).copied()
    }

    /// The cached account for a contract. A missing entry means a
    /// zero-balance fresh account at the remote shard.
    pub fn account(&self, addr: &Address) -> Option<CachedAccount> {
        self.inner.read().values.get(addr).cloned()
    }

    /// The cached balance of a contract, zero when no data arrived.
    pub fn balance_of(&self, addr: &Address) -> u128 {
        self.inner
            .read()
            .values
            .get(addr)
            .map(|account| account.balance)
            .unwrap_or(0)
    }

    /// A cached slot value, if delivered.
    pub fn slot(&self, addr: &Address, key: &Hash) -> Option<Hash> {
        self.inner
            .read()
            .values
            .get(addr)
            .and_then(|account| account.slots.get(key))
            .copied()
    }

    /// The commitment snapshot taken for a remote shard.
    pub fn commit_of(&self, shard: ShardId) -> Option<Commitment> {
        self.inner.read().commits.get(&shard).copied()
    }

    /// The requested slots for a contract, for serving remote fetches.
    pub fn requested(&self, addr: &Address) -> Option<ContractRwSet> {
        self.inner.read().keyval.get(addr).cloned()
    }
}

/// Per-execution overlay of foreign balances.
///
/// Debits and credits against remote accounts land here during
/// cross-shard-local execution, never in the public state.
#[derive(Debug, Default)]
pub struct CrossChanges {
    changes: HashMap<Address, CachedAccount>,
}

impl CrossChanges {
    /// Create an empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure an entry exists, seeding it lazily from the supplied account.
    pub fn ensure(&mut self, addr: Address, seed: impl FnOnce() -> CachedAccount) {
        self.changes.entry(addr).or_insert_with(seed);
    }

    /// Subtract from a tracked account's balance, saturating at zero.
    pub fn sub_balance(&mut self, addr: &Address, amount: u128) {
        if let Some(account) = self.changes.get_mut(addr) {
            account.balance = account.balance.saturating_sub(amount);
        }
    }

    /// Add to a tracked account's balance.
    pub fn add_balance(&mut self, addr: &Address, amount: u128) {
        if let Some(account) = self.changes.get_mut(addr) {
            account.balance = account.balance.saturating_add(amount);
        }
    }

    /// The tracked account, if any.
    pub fn get(&self, addr: &Address) -> Option<&CachedAccount> {
        self.changes.get(addr)
    }

    /// Iterate over the tracked accounts.
    pub fn iter(&self) -> impl Iterator<Item = (&Address, &CachedAccount)> {
        self.changes.iter()
    }

    /// Number of touched accounts.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether no account was touched.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_types::{CrossShardTx, ShardRwSets, Transaction, TxKind};

    fn cross_tx(shards: &[u64], contracts: &[(u64, Address, &[Hash])]) -> CrossShardTx {
        let mut rw_sets = ShardRwSets::new();
        for (shard, addr, keys) in contracts {
            let mut set = ContractRwSet::new(*addr);
            for key in *keys {
                set.add_read(*key);
            }
            rw_sets.entry(ShardId(*shard)).or_default().push(set);
        }
        CrossShardTx {
            shards: shards.iter().map(|&s| ShardId(s)).collect(),
            block_num: BlockHeight(5),
            rw_sets,
            inner: Transaction::new(
                TxKind::CrossShardLocal,
                0,
                ShardId(0),
                Address([1u8; 20]),
                1,
                21_000,
                0,
                vec![],
            ),
        }
    }

    fn slot(byte: u8) -> Hash {
        Hash::from_hash_bytes(&[byte; 32])
    }

    #[test]
    fn test_init_keys_counts_remote_shards() {
        let my_contract = Address([0x10; 20]);
        let remote_contract = Address([0x20; 20]);
        let ctx = cross_tx(
            &[1, 2],
            &[
                (1, my_contract, &[slot(1)]),
                (2, remote_contract, &[slot(2)]),
            ],
        );
        let mut pending = PendingCrossTxs::new();
        pending.add(0, ctx);

        let cache = DataCache::new(BlockHeight(5), false);
        let ready = cache.init_keys(ShardId(1), &pending, &CommitmentMap::new());

        assert!(!ready);
        assert_eq!(cache.progress(), (0, 1));
        assert_eq!(cache.shard_of(&remote_contract), Some(ShardId(2)));
        assert_eq!(cache.shard_of(&my_contract), Some(ShardId(1)));
    }

    #[test]
    fn test_init_keys_ignores_uninvolved() {
        let ctx = cross_tx(&[2, 3], &[(2, Address([0x20; 20]), &[slot(1)])]);
        let mut pending = PendingCrossTxs::new();
        pending.add(0, ctx);

        let cache = DataCache::new(BlockHeight(5), false);
        let ready = cache.init_keys(ShardId(1), &pending, &CommitmentMap::new());

        assert!(ready);
        assert_eq!(cache.progress(), (0, 0));
    }

    #[test]
    fn test_add_data_idempotent_and_flips_ready() {
        let remote = Address([0x20; 20]);
        let ctx = cross_tx(
            &[1, 2],
            &[(1, Address([0x10; 20]), &[slot(1)]), (2, remote, &[slot(2)])],
        );
        let mut pending = PendingCrossTxs::new();
        pending.add(0, ctx);

        let cache = DataCache::new(BlockHeight(5), false);
        cache.init_keys(ShardId(1), &pending, &CommitmentMap::new());

        let vals = vec![KeyVal {
            addr: remote,
            balance: 77,
            nonce: 3,
            values: vec![slot(0xFF)],
        }];

        assert!(cache.add_data(ShardId(2), &vals));
        assert!(cache.is_ready());
        assert_eq!(cache.balance_of(&remote), 77);
        assert_eq!(cache.slot(&remote, &slot(2)), Some(slot(0xFF)));

        // A second delivery changes nothing.
        assert!(!cache.add_data(ShardId(2), &vals));
        assert_eq!(cache.progress(), (1, 1));
        assert!(cache.is_ready());
    }

    #[test]
    fn test_ready_iff_received_equals_required() {
        let ctx = cross_tx(
            &[1, 2, 3],
            &[
                (2, Address([0x20; 20]), &[slot(1)]),
                (3, Address([0x30; 20]), &[slot(2)]),
            ],
        );
        let mut pending = PendingCrossTxs::new();
        pending.add(0, ctx);

        let cache = DataCache::new(BlockHeight(7), false);
        cache.init_keys(ShardId(1), &pending, &CommitmentMap::new());
        assert_eq!(cache.progress(), (0, 2));

        let vals = |addr: Address| {
            vec![KeyVal {
                addr,
                balance: 1,
                nonce: 0,
                values: vec![slot(0)],
            }]
        };
        assert!(!cache.add_data(ShardId(2), &vals(Address([0x20; 20]))));
        assert!(!cache.is_ready());
        assert!(cache.add_data(ShardId(3), &vals(Address([0x30; 20]))));
        assert!(cache.is_ready());
    }

    #[test]
    fn test_missing_account_is_fresh() {
        let cache = DataCache::new(BlockHeight(1), true);
        let nobody = Address([0x99; 20]);
        assert_eq!(cache.balance_of(&nobody), 0);
        assert!(cache.account(&nobody).is_none());
    }

    #[test]
    fn test_cross_changes_overlay() {
        let addr = Address([0x42; 20]);
        let mut changes = CrossChanges::new();
        changes.ensure(addr, || CachedAccount::new(addr, 100, 1));
        changes.sub_balance(&addr, 30);
        changes.add_balance(&addr, 5);
        assert_eq!(changes.get(&addr).unwrap().balance, 75);

        // Seeding again leaves the tracked value alone.
        changes.ensure(addr, || CachedAccount::new(addr, 999, 9));
        assert_eq!(changes.get(&addr).unwrap().balance, 75);
    }
}
