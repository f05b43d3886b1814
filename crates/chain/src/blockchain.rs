//! Canonical chain management: storage, execution, reorgs, events.

use crate::datalog::{now_unix, DataLog};
use crate::error::{BlockError, InsertFailure};
use crate::events::{
    ChainEvent, ChainHeadEvent, ChainSideEvent, EventHub, RemovedLogsEvent,
};
use crate::processor::{apply_transaction, ExecEnv};
use crate::shared::CrossShardState;
use crate::traits::{Engine, HeaderReader};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use shardline_foreign::CrossChanges;
use shardline_state::{GasPool, StateDb};
use shardline_storage as schema;
use shardline_storage::KeyValue;
use shardline_types::{
    Address, Block, BlockHeight, Body, ContractRwSet, Hash, Header, KeyVal, Log, Receipt, ShardId,
    Transaction, TxKind,
};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const BODY_CACHE_LIMIT: usize = 256;
const BLOCK_CACHE_LIMIT: usize = 256;
const RECEIPTS_CACHE_LIMIT: usize = 32;
const MAX_FUTURE_BLOCKS: usize = 256;
const BAD_BLOCK_LIMIT: usize = 10;

/// Seconds a future block may run ahead of wall-clock before rejection.
pub const MAX_TIME_FUTURE_BLOCKS: u64 = 30;

/// Recent state snapshots kept in memory on non-archive nodes.
pub const TRIES_IN_MEMORY: u64 = 128;

/// Janitor tick promoting buffered future blocks.
const FUTURE_BLOCK_TICK: Duration = Duration::from_secs(5);

/// Outcome of writing a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The block extended or became the canonical chain.
    Canonical,
    /// The block landed on a side chain.
    Side,
}

/// Static configuration of one chain instance.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// The shard this node operates.
    pub shard: ShardId,

    /// Number of shards in the system.
    pub num_shards: u64,

    /// Whether this instance is a worker's read-only mirror of the
    /// reference chain.
    pub ref_mirror: bool,

    /// Archive mode flushes state for every block and never prunes.
    pub archive: bool,
}

impl ChainConfig {
    /// Shard id the blocks of this chain must carry.
    pub fn expected_shard(&self) -> ShardId {
        if self.ref_mirror {
            ShardId::REFERENCE
        } else {
            self.shard
        }
    }

    /// Whether this instance runs the reference shard's own chain.
    pub fn is_reference_chain(&self) -> bool {
        self.shard.is_reference() && !self.ref_mirror
    }
}

/// The canonical chain of one shard.
///
/// Manages durable storage and linearisation, executes blocks serially,
/// reorganises on total-difficulty changes and fans out events. Worker
/// shards run two instances: their own chain and a reference mirror
/// sharing one [`CrossShardState`].
pub struct BlockChain {
    config: ChainConfig,
    db: Arc<dyn KeyValue>,
    engine: Arc<dyn Engine>,
    shared: Arc<CrossShardState>,
    events: Arc<EventHub>,
    datalog: DataLog,

    genesis: Block,
    current: RwLock<Arc<Block>>,
    current_fast: RwLock<Arc<Block>>,

    block_cache: Mutex<LruCache<Hash, Arc<Block>>>,
    body_cache: Mutex<LruCache<Hash, Body>>,
    receipts_cache: Mutex<LruCache<Hash, Vec<Receipt>>>,
    future_blocks: Mutex<LruCache<Hash, Block>>,
    bad_blocks: Mutex<LruCache<Hash, Block>>,
    bad_hashes: RwLock<HashSet<Hash>>,

    /// Retention queue of `(height, root)` pairs awaiting garbage
    /// collection, lowest height first.
    triegc: Mutex<BinaryHeap<Reverse<(u64, Hash)>>>,

    /// Address of the deployed coordination contract.
    commit_address: RwLock<Option<Address>>,

    /// Preference callback for total-difficulty ties.
    should_preserve: Option<Arc<dyn Fn(&Block) -> bool + Send + Sync>>,

    /// Serialises whole-chain mutations (insertions, rewinds).
    chain_mu: tokio::sync::Mutex<()>,

    /// Guards head-pointer updates within one insertion.
    head_mu: Mutex<()>,

    proc_interrupt: AtomicBool,
    quit: watch::Sender<bool>,
}

impl BlockChain {
    /// Open a chain over a database that already holds a genesis block.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<dyn KeyValue>,
        config: ChainConfig,
        engine: Arc<dyn Engine>,
        shared: Arc<CrossShardState>,
        events: Arc<EventHub>,
        datalog: DataLog,
        should_preserve: Option<Arc<dyn Fn(&Block) -> bool + Send + Sync>>,
    ) -> Result<Arc<Self>, BlockError> {
        match schema::read_chain_version(db.as_ref())? {
            None => schema::write_chain_version(db.as_ref(), schema::CHAIN_VERSION),
            Some(version) if version != schema::CHAIN_VERSION => {
                return Err(schema::StorageError::IncompatibleVersion {
                    stored: version,
                    expected: schema::CHAIN_VERSION,
                }
                .into());
            }
            Some(_) => {}
        }

        let genesis_hash = schema::read_canonical_hash(db.as_ref(), BlockHeight::GENESIS)?
            .ok_or(schema::StorageError::NoGenesis)?;
        let genesis = schema::read_block(db.as_ref(), &genesis_hash)?
            .ok_or(schema::StorageError::NoGenesis)?;

        let chain = Arc::new(Self {
            genesis: genesis.clone(),
            current: RwLock::new(Arc::new(genesis.clone())),
            current_fast: RwLock::new(Arc::new(genesis.clone())),
            block_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(BLOCK_CACHE_LIMIT).expect("nonzero"),
            )),
            body_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(BODY_CACHE_LIMIT).expect("nonzero"),
            )),
            receipts_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(RECEIPTS_CACHE_LIMIT).expect("nonzero"),
            )),
            future_blocks: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_FUTURE_BLOCKS).expect("nonzero"),
            )),
            bad_blocks: Mutex::new(LruCache::new(
                NonZeroUsize::new(BAD_BLOCK_LIMIT).expect("nonzero"),
            )),
            bad_hashes: RwLock::new(HashSet::new()),
            triegc: Mutex::new(BinaryHeap::new()),
            commit_address: RwLock::new(None),
            should_preserve,
            chain_mu: tokio::sync::Mutex::new(()),
            head_mu: Mutex::new(()),
            proc_interrupt: AtomicBool::new(false),
            quit: watch::channel(false).0,
            config,
            db,
            engine,
            shared,
            events,
            datalog,
        });

        if chain.config.is_reference_chain() || chain.config.ref_mirror {
            chain.shared.init_genesis(
                chain.config.shard,
                chain.config.num_shards,
                chain.genesis.header.state_root,
                chain.genesis.hash(),
            );
        }

        chain.load_last_state()?;
        Ok(chain)
    }

    /// Write a genesis block, its state tables and the version tag into a
    /// fresh database.
    pub fn write_genesis(db: &dyn KeyValue, genesis: &Block) {
        let hash = genesis.hash();
        schema::write_block(db, genesis);
        schema::write_canonical_hash(db, &hash, BlockHeight::GENESIS);
        schema::write_td(db, &hash, Block::DIFFICULTY);
        schema::write_head_block_hash(db, &hash);
        schema::write_head_header_hash(db, &hash);
        schema::write_head_fast_hash(db, &hash);
        schema::write_chain_version(db, schema::CHAIN_VERSION);
    }

    fn load_last_state(&self) -> Result<(), BlockError> {
        let Some(head_hash) = schema::read_head_block_hash(self.db.as_ref())? else {
            warn!(shard = %self.config.shard, "empty database, resetting chain");
            return self.reset();
        };
        let Some(mut head) = self.get_block(&head_hash) else {
            warn!(shard = %self.config.shard, hash = %head_hash, "head block missing, resetting chain");
            return self.reset();
        };

        if !self.has_state(&head.header.state_root) {
            warn!(
                number = head.number().0,
                hash = %head.hash(),
                "head state missing, repairing chain"
            );
            head = self.repair(head)?;
        }

        *self.current.write() = Arc::clone(&head);
        *self.current_fast.write() = Arc::clone(&head);
        if let Some(fast_hash) = schema::read_head_fast_hash(self.db.as_ref())? {
            if let Some(fast) = self.get_block(&fast_hash) {
                *self.current_fast.write() = fast;
            }
        }

        debug!(
            shard = %self.config.shard,
            number = head.number().0,
            hash = %head.hash(),
            "loaded most recent local block"
        );
        Ok(())
    }

    /// Roll the head back until a block with surviving state is found.
    fn repair(&self, mut head: Arc<Block>) -> Result<Arc<Block>, BlockError> {
        loop {
            if self.has_state(&head.header.state_root) {
                info!(number = head.number().0, hash = %head.hash(), "rewound chain to past state");
                schema::write_head_block_hash(self.db.as_ref(), &head.hash());
                return Ok(head);
            }
            head = self
                .get_block(&head.parent_hash())
                .ok_or(schema::StorageError::NoGenesis)?;
        }
    }

    /// Purge the chain back to genesis. Fatal-error recovery path.
    pub fn reset(&self) -> Result<(), BlockError> {
        let genesis = Arc::new(self.genesis.clone());
        Self::write_genesis(self.db.as_ref(), &genesis);
        *self.current.write() = Arc::clone(&genesis);
        *self.current_fast.write() = genesis;
        self.purge_caches();
        Ok(())
    }

    fn purge_caches(&self) {
        self.block_cache.lock().clear();
        self.body_cache.lock().clear();
        self.receipts_cache.lock().clear();
        self.future_blocks.lock().clear();
    }

    // ── Accessors ───────────────────────────────────────────────────────

    /// Chain configuration.
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// The shared cross-shard state.
    pub fn shared(&self) -> &Arc<CrossShardState> {
        &self.shared
    }

    /// The event hub of this chain instance.
    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// The sealing engine.
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// The backing store.
    pub fn db(&self) -> &Arc<dyn KeyValue> {
        &self.db
    }

    /// The measurement log.
    pub fn datalog(&self) -> &DataLog {
        &self.datalog
    }

    /// The genesis block.
    pub fn genesis(&self) -> &Block {
        &self.genesis
    }

    /// Hash of the genesis block.
    pub fn genesis_hash(&self) -> Hash {
        self.genesis.hash()
    }

    /// Current canonical head.
    pub fn current_block(&self) -> Arc<Block> {
        Arc::clone(&self.current.read())
    }

    /// Gas limit of the chain, fixed at genesis.
    pub fn gas_limit(&self) -> u64 {
        self.genesis.header.gas_limit
    }

    /// Height of this shard's latest committed block.
    pub fn commit_num(&self) -> BlockHeight {
        self.shared.commit_num()
    }

    /// Whether a reference height carries cross-shard transactions for
    /// this shard.
    pub fn ctx_exists(&self, ref_num: BlockHeight) -> bool {
        self.shared.ctx_exists(ref_num)
    }

    /// Address of the deployed coordination contract.
    pub fn commit_address(&self) -> Option<Address> {
        *self.commit_address.read()
    }

    /// Record the coordination contract address after deployment.
    pub fn set_commit_address(&self, addr: Address) {
        *self.commit_address.write() = Some(addr);
    }

    /// Blacklist a hash.
    pub fn ban_hash(&self, hash: Hash) {
        self.bad_hashes.write().insert(hash);
    }

    /// Whether a block is fully present.
    pub fn has_block(&self, hash: &Hash) -> bool {
        if self.block_cache.lock().contains(hash) {
            return true;
        }
        schema::has_body(self.db.as_ref(), hash)
    }

    /// Whether the state under a root survives.
    pub fn has_state(&self, root: &Hash) -> bool {
        StateDb::exists_at(self.db.as_ref(), root)
    }

    /// Whether a block and its state are both present.
    pub fn has_block_and_state(&self, hash: &Hash) -> bool {
        match self.get_block(hash) {
            Some(block) => self.has_state(&block.header.state_root),
            None => false,
        }
    }

    /// Fetch a block by hash, through the cache.
    pub fn get_block(&self, hash: &Hash) -> Option<Arc<Block>> {
        if let Some(block) = self.block_cache.lock().get(hash) {
            return Some(Arc::clone(block));
        }
        let block = Arc::new(schema::read_block(self.db.as_ref(), hash).ok()??);
        self.block_cache.lock().put(*hash, Arc::clone(&block));
        Some(block)
    }

    /// Fetch the canonical block at a height.
    pub fn get_block_by_number(&self, number: BlockHeight) -> Option<Arc<Block>> {
        let hash = schema::read_canonical_hash(self.db.as_ref(), number).ok()??;
        self.get_block(&hash)
    }

    /// Fetch a block body by hash, through the cache.
    pub fn get_body(&self, hash: &Hash) -> Option<Body> {
        if let Some(body) = self.body_cache.lock().get(hash) {
            return Some(body.clone());
        }
        let body = schema::read_body(self.db.as_ref(), hash).ok()??;
        self.body_cache.lock().put(*hash, body.clone());
        Some(body)
    }

    /// Fetch a header by hash.
    pub fn get_header(&self, hash: &Hash) -> Option<Header> {
        self.get_block(hash).map(|b| b.header.clone())
    }

    /// Fetch the receipts of a block, through the cache.
    pub fn get_receipts(&self, hash: &Hash) -> Option<Vec<Receipt>> {
        if let Some(receipts) = self.receipts_cache.lock().get(hash) {
            return Some(receipts.clone());
        }
        let receipts = schema::read_receipts(self.db.as_ref(), hash).ok()??;
        self.receipts_cache.lock().put(*hash, receipts.clone());
        Some(receipts)
    }

    /// A block's total difficulty.
    pub fn get_td(&self, hash: &Hash) -> Option<u64> {
        schema::read_td(self.db.as_ref(), hash).ok()?
    }

    /// The last `n` blocks ending at `hash`, following parent pointers.
    pub fn get_blocks_from_hash(&self, hash: Hash, n: usize) -> Vec<Arc<Block>> {
        let mut blocks = Vec::with_capacity(n);
        let mut hash = hash;
        for _ in 0..n {
            let Some(block) = self.get_block(&hash) else {
                break;
            };
            hash = block.parent_hash();
            let done = block.is_genesis();
            blocks.push(block);
            if done {
                break;
            }
        }
        blocks
    }

    /// Whether the block with this hash was reported bad.
    pub fn has_bad_block(&self, hash: &Hash) -> bool {
        self.bad_blocks.lock().contains(hash)
    }

    // ── State access ────────────────────────────────────────────────────

    /// Open the public and private states at a public root.
    pub fn state_at(&self, root: &Hash) -> Result<(StateDb, StateDb), BlockError> {
        let public = StateDb::open(self.db.as_ref(), root)?;
        let private = match schema::read_private_state_root(self.db.as_ref(), root)? {
            Some(private_root) => StateDb::open(self.db.as_ref(), &private_root)?,
            None => StateDb::new(),
        };
        Ok((public, private))
    }

    /// Open the states at the current head.
    pub fn state(&self) -> Result<(StateDb, StateDb), BlockError> {
        self.state_at(&self.current_block().header.state_root)
    }

    /// Serve the requested account data at a root, for a remote shard's
    /// foreign-data fetch.
    pub fn state_data(&self, root: &Hash, requests: &[ContractRwSet]) -> Vec<KeyVal> {
        let Ok(state) = StateDb::open(self.db.as_ref(), root) else {
            error!(%root, "state not found serving foreign data");
            return vec![];
        };
        requests
            .iter()
            .map(|request| KeyVal {
                addr: request.addr,
                balance: state.balance(&request.addr),
                nonce: state.nonce(&request.addr),
                values: request
                    .reads
                    .iter()
                    .map(|key| state.storage(&request.addr, key))
                    .collect(),
            })
            .collect()
    }

    // ── Writing ─────────────────────────────────────────────────────────

    /// Inject a block as the new canonical head. Assumes the head guard is
    /// held.
    fn insert(&self, block: Arc<Block>) {
        let db = self.db.as_ref();
        let hash = block.hash();
        let update_heads =
            schema::read_canonical_hash(db, block.number()).ok().flatten() != Some(hash);

        schema::write_canonical_hash(db, &hash, block.number());
        schema::write_head_block_hash(db, &hash);
        *self.current.write() = Arc::clone(&block);

        if update_heads {
            schema::write_head_header_hash(db, &hash);
            schema::write_head_fast_hash(db, &hash);
            *self.current_fast.write() = block;
        }
    }

    /// Write a block and its executed state, deciding canonical status by
    /// total difficulty. Ties prefer the preserved (locally mined) block,
    /// falling back to a coin flip.
    pub fn write_block_with_state(
        &self,
        block: &Block,
        receipts: &[Receipt],
        state: &mut StateDb,
        private: Option<&mut StateDb>,
    ) -> Result<WriteStatus, BlockError> {
        let db = self.db.as_ref();
        let hash = block.hash();
        let parent_td = self
            .get_td(&block.parent_hash())
            .ok_or(BlockError::UnknownAncestor)?;

        let _guard = self.head_mu.lock();
        let current = self.current_block();
        let local_td = self.get_td(&current.hash()).unwrap_or(0);
        let extern_td = parent_td + Block::DIFFICULTY;

        schema::write_td(db, &hash, extern_td);
        schema::write_block(db, block);

        let root = state.commit(db);
        if let Some(private) = private {
            let private_root = private.commit(db);
            schema::write_private_state_root(db, &root, &private_root);
        }

        if !self.config.archive {
            let number = block.number().0;
            let mut triegc = self.triegc.lock();
            triegc.push(Reverse((number, root)));
            if number > TRIES_IN_MEMORY {
                let chosen = number - TRIES_IN_MEMORY;
                while let Some(Reverse((height, stale_root))) = triegc.peek().copied() {
                    if height > chosen {
                        break;
                    }
                    triegc.pop();
                    if stale_root != self.genesis.header.state_root {
                        StateDb::delete(db, &stale_root);
                    }
                }
            }
        }

        schema::write_receipts(db, &hash, receipts);

        let mut reorg = extern_td > local_td;
        if !reorg && extern_td == local_td {
            if block.number() < current.number() {
                reorg = true;
            } else if block.number() == current.number() {
                let (current_preserve, block_preserve) = match &self.should_preserve {
                    Some(preserve) => (preserve(&current), preserve(block)),
                    None => (false, false),
                };
                reorg = !current_preserve && (block_preserve || rand::random::<f64>() < 0.5);
            }
        }

        let status = if reorg {
            if block.parent_hash() != current.hash() {
                self.reorg(&current, block)?;
            }
            self.insert(Arc::new(block.clone()));
            WriteStatus::Canonical
        } else {
            WriteStatus::Side
        };

        self.future_blocks.lock().pop(&hash);
        Ok(status)
    }

    /// Reorganise from `old` onto the chain ending at `new`.
    ///
    /// Walks both chains back to the common ancestor, re-inserts the new
    /// chain forward, announces removed logs and demoted blocks. Fails
    /// closed when either chain walks off known blocks.
    fn reorg(&self, old: &Arc<Block>, new: &Block) -> Result<(), BlockError> {
        let mut old_chain: Vec<Arc<Block>> = vec![];
        let mut new_chain: Vec<Arc<Block>> = vec![];
        let mut deleted_logs: Vec<Log> = vec![];

        let mut old_block = Arc::clone(old);
        let mut new_block = Arc::new(new.clone());

        let mut collect_logs = |chain: &Self, hash: &Hash| {
            if let Some(receipts) = chain.get_receipts(hash) {
                for receipt in receipts {
                    for mut log in receipt.logs {
                        log.removed = true;
                        deleted_logs.push(log);
                    }
                }
            }
        };

        while old_block.number() > new_block.number() {
            collect_logs(self, &old_block.hash());
            old_chain.push(Arc::clone(&old_block));
            old_block = self
                .get_block(&old_block.parent_hash())
                .ok_or(BlockError::ReorgFailed("old"))?;
        }
        while new_block.number() > old_block.number() {
            new_chain.push(Arc::clone(&new_block));
            new_block = self
                .get_block(&new_block.parent_hash())
                .ok_or(BlockError::ReorgFailed("new"))?;
        }
        while old_block.hash() != new_block.hash() {
            collect_logs(self, &old_block.hash());
            old_chain.push(Arc::clone(&old_block));
            new_chain.push(Arc::clone(&new_block));

            old_block = self
                .get_block(&old_block.parent_hash())
                .ok_or(BlockError::ReorgFailed("old"))?;
            new_block = self
                .get_block(&new_block.parent_hash())
                .ok_or(BlockError::ReorgFailed("new"))?;
        }

        if !old_chain.is_empty() && !new_chain.is_empty() {
            info!(
                number = old_block.number().0,
                hash = %old_block.hash(),
                drop = old_chain.len(),
                add = new_chain.len(),
                "chain split detected"
            );
        }

        for block in new_chain.iter().rev() {
            self.insert(Arc::clone(block));
        }
        // Clear stale canonical assignments above the new head.
        let new_head = new.number().0;
        for number in (new_head + 1)..=old.number().0 {
            schema::delete_canonical_hash(self.db.as_ref(), BlockHeight(number));
        }

        if !deleted_logs.is_empty() {
            self.events.post_removed_logs(RemovedLogsEvent {
                logs: deleted_logs,
            });
        }
        for block in old_chain {
            self.events.post_chain_side(ChainSideEvent { block });
        }
        Ok(())
    }

    /// Rewind the canonical chain to a height. Used by the mining worker's
    /// forced rollback when the reference chain invalidates local blocks.
    pub fn set_head(&self, height: BlockHeight) -> Result<(), BlockError> {
        warn!(target = height.0, "rewinding blockchain");
        let _guard = self.head_mu.lock();

        let current = self.current_block();
        for number in (height.0 + 1)..=current.number().0 {
            if let Ok(Some(hash)) = schema::read_canonical_hash(self.db.as_ref(), BlockHeight(number))
            {
                schema::delete_body(self.db.as_ref(), &hash);
            }
            schema::delete_canonical_hash(self.db.as_ref(), BlockHeight(number));
        }
        self.purge_caches();

        let head_hash = schema::read_canonical_hash(self.db.as_ref(), height)?
            .ok_or(BlockError::UnknownAncestor)?;
        let mut head = schema::read_block(self.db.as_ref(), &head_hash)?
            .map(Arc::new)
            .ok_or(BlockError::UnknownAncestor)?;
        if !self.has_state(&head.header.state_root) {
            head = self.repair(head)?;
        }

        schema::write_head_block_hash(self.db.as_ref(), &head.hash());
        schema::write_head_header_hash(self.db.as_ref(), &head.hash());
        schema::write_head_fast_hash(self.db.as_ref(), &head.hash());
        *self.current.write() = Arc::clone(&head);
        *self.current_fast.write() = head;
        Ok(())
    }

    // ── Insertion ───────────────────────────────────────────────────────

    /// Insert a batch of contiguous blocks, executing each against its
    /// parent state. On failure reports the index of the first bad block.
    pub async fn insert_chain(&self, blocks: Vec<Block>) -> Result<(), InsertFailure> {
        let _guard = self.chain_mu.lock().await;
        self.insert_chain_locked(blocks).await
    }

    async fn insert_chain_locked(&self, blocks: Vec<Block>) -> Result<(), InsertFailure> {
        if blocks.is_empty() {
            return Ok(());
        }
        for i in 1..blocks.len() {
            if blocks[i].number() != blocks[i - 1].number().next()
                || blocks[i].parent_hash() != blocks[i - 1].hash()
            {
                error!(
                    number = blocks[i].number().0,
                    hash = %blocks[i].hash(),
                    parent = %blocks[i].parent_hash(),
                    prev = %blocks[i - 1].hash(),
                    "non contiguous block insert"
                );
                return Err(InsertFailure {
                    index: i,
                    source: BlockError::NonContiguousInsert { index: i },
                });
            }
        }

        let mut last_canon: Option<Arc<Block>> = None;
        let mut coalesced_logs: Vec<Log> = vec![];

        for (index, block) in blocks.iter().enumerate() {
            match self
                .insert_one(block, &mut last_canon, &mut coalesced_logs)
                .await
            {
                Ok(()) => {}
                Err(BlockError::KnownBlock) => continue,
                Err(err) => {
                    return Err(InsertFailure { index, source: err });
                }
            }
        }

        self.events.post_logs(coalesced_logs);
        if let Some(block) = last_canon {
            if self.current_block().hash() == block.hash() {
                self.events.post_chain_head(ChainHeadEvent { block });
            }
        }
        Ok(())
    }

    async fn insert_one(
        &self,
        block: &Block,
        last_canon: &mut Option<Arc<Block>>,
        coalesced_logs: &mut Vec<Log>,
    ) -> Result<(), BlockError> {
        if self.proc_interrupt.load(Ordering::Acquire) {
            debug!("premature abort during blocks processing");
            return Err(BlockError::AbortProcessing);
        }
        let hash = block.hash();
        if self.bad_hashes.read().contains(&hash) {
            self.report_block(block, &[], &BlockError::BlacklistedHash(hash));
            return Err(BlockError::BlacklistedHash(hash));
        }
        if self.has_block(&hash) && self.current_block().number() >= block.number() {
            return Err(BlockError::KnownBlock);
        }
        if block.header.shard != self.config.expected_shard() {
            let err = BlockError::ValidationFailed(format!(
                "block of shard {} on chain of shard {}",
                block.header.shard,
                self.config.expected_shard()
            ));
            self.report_block(block, &[], &err);
            return Err(err);
        }

        match self.engine.verify_header(self, &block.header) {
            Ok(()) => {}
            Err(BlockError::FutureBlock) => {
                // Tolerate blocks up to the future window; buffer for the
                // janitor to retry.
                if block.header.timestamp > now_unix() + MAX_TIME_FUTURE_BLOCKS {
                    return Err(BlockError::FutureBlock);
                }
                self.future_blocks.lock().put(hash, block.clone());
                return Ok(());
            }
            Err(BlockError::UnknownAncestor) => {
                if self.future_blocks.lock().contains(&block.parent_hash()) {
                    self.future_blocks.lock().put(hash, block.clone());
                    return Ok(());
                }
                self.report_block(block, &[], &BlockError::UnknownAncestor);
                return Err(BlockError::UnknownAncestor);
            }
            Err(err) => {
                self.report_block(block, &[], &err);
                return Err(err);
            }
        }

        let parent = self
            .get_block(&block.parent_hash())
            .ok_or(BlockError::UnknownAncestor)?;

        if !self.has_state(&parent.header.state_root) {
            // The ancestor's state was pruned: catch up by re-inserting the
            // winning side chain from the last state-bearing ancestor.
            let mut winner = vec![parent.as_ref().clone()];
            let mut ancestor = Arc::clone(&parent);
            loop {
                ancestor = self
                    .get_block(&ancestor.parent_hash())
                    .ok_or(BlockError::PrunedAncestor)?;
                if self.has_state(&ancestor.header.state_root) {
                    break;
                }
                winner.push(ancestor.as_ref().clone());
            }
            winner.reverse();
            debug!(blocks = winner.len(), "importing pruned side chain");
            Box::pin(self.insert_chain_locked(winner))
                .await
                .map_err(|failure| failure.source)?;
        }

        let (mut state, mut private) = self.state_at(&parent.header.state_root)?;

        let start_ref = parent.ref_number().next();
        let end_ref = block.ref_number();

        let outcome = self
            .execute_block(block, start_ref, end_ref, &mut state, &mut private)
            .await;
        let (receipts, private_receipts, logs, used_gas) = match outcome {
            Ok(result) => result,
            Err(err) => {
                self.report_block(block, &[], &err);
                return Err(err);
            }
        };

        if let Err(err) = self.validate_state(block, &receipts, &state, used_gas) {
            self.report_block(block, &receipts, &err);
            return Err(err);
        }

        let merged = shardline_types::merge_receipts(&receipts, &private_receipts);
        let status =
            self.write_block_with_state(block, &merged, &mut state, Some(&mut private))?;
        schema::write_private_bloom(
            self.db.as_ref(),
            block.number(),
            &private_bloom(&private_receipts),
        );

        match status {
            WriteStatus::Canonical => {
                debug!(
                    number = block.number().0,
                    hash = %hash,
                    txs = block.transaction_count(),
                    gas = used_gas,
                    "inserted new block"
                );
                let arc_block = Arc::new(block.clone());
                coalesced_logs.extend(logs.clone());
                if !self.config.ref_mirror {
                    self.events.post_chain(ChainEvent {
                        block: Arc::clone(&arc_block),
                        hash,
                        logs,
                    });
                }
                *last_canon = Some(Arc::clone(&arc_block));

                // The coordination contract deploys in block 1.
                if block.number().0 == 1 {
                    if let Some(receipt) = receipts.first() {
                        if let Some(addr) = receipt.contract_address {
                            self.set_commit_address(addr);
                        }
                    }
                }

                if self.config.is_reference_chain() {
                    self.update_ref_status(block, &receipts);
                } else if self.config.ref_mirror {
                    self.parse_ref_block(block, &receipts);
                } else {
                    self.log_block_data(false, block, &receipts);
                }
            }
            WriteStatus::Side => {
                debug!(
                    number = block.number().0,
                    hash = %hash,
                    "inserted forked block"
                );
                if !self.config.ref_mirror {
                    self.events.post_chain_side(ChainSideEvent {
                        block: Arc::new(block.clone()),
                    });
                }
            }
        }
        Ok(())
    }

    /// Execute a block's transactions serially against the given states.
    ///
    /// `start_ref..=end_ref` is the reference window inherited from the
    /// parent. Cross-shard-local transactions advance a cursor through the
    /// window until the foreign-data cache serving them is ready,
    /// suspending on the readiness channel; this is the only suspension
    /// point in execution.
    pub async fn execute_block(
        &self,
        block: &Block,
        start_ref: BlockHeight,
        end_ref: BlockHeight,
        state: &mut StateDb,
        private: &mut StateDb,
    ) -> Result<(Vec<Receipt>, Vec<Receipt>, Vec<Log>, u64), BlockError> {
        let mut gas_pool = GasPool::new(block.header.gas_limit);
        let mut gas_used = 0u64;
        let mut receipts: Vec<Receipt> = vec![];
        let mut private_receipts: Vec<Receipt> = vec![];
        let mut all_logs: Vec<Log> = vec![];
        let mut curr = start_ref;
        let mut foreign_rx = self.shared.subscribe_foreign();

        for tx in &block.transactions {
            let mut dc = None;
            if tx.kind == TxKind::CrossShardLocal {
                let tx_hash = tx.hash();
                'resolve: loop {
                    let mut scan = curr;
                    while scan <= end_ref {
                        if self.shared.pending_contains(scan, &tx_hash) {
                            match self.shared.foreign.get(scan) {
                                Some((cache, true)) => {
                                    curr = scan;
                                    dc = Some(cache);
                                    debug!(hash = %tx_hash, ref_num = scan.0, "cross shard transaction ready");
                                    break 'resolve;
                                }
                                _ => {
                                    use tokio::sync::broadcast::error::RecvError;
                                    match foreign_rx.recv().await {
                                        Ok(_) | Err(RecvError::Lagged(_)) => {
                                            if self.proc_interrupt.load(Ordering::Acquire) {
                                                return Err(BlockError::AbortProcessing);
                                            }
                                            continue 'resolve;
                                        }
                                        Err(RecvError::Closed) => break 'resolve,
                                    }
                                }
                            }
                        }
                        scan = scan.next();
                    }
                    // Not registered in the window: execute without cache.
                    break 'resolve;
                }
            }

            let snap = state.snapshot();
            let private_snap = private.snapshot();
            let mut changes = CrossChanges::new();

            let mut env = ExecEnv {
                header: &block.header,
                state: &mut *state,
                private: &mut *private,
                gas_pool: &mut gas_pool,
                gas_used: &mut gas_used,
                commit_address: self.commit_address(),
                my_shard: self.config.shard,
            };

            match apply_transaction(&mut env, dc.as_deref(), &mut changes, tx) {
                Ok((receipt, private_receipt)) => {
                    all_logs.extend(receipt.logs.clone());
                    receipts.push(receipt);
                    if let Some(private_receipt) = private_receipt {
                        all_logs.extend(private_receipt.logs.clone());
                        private_receipts.push(private_receipt);
                    }
                }
                Err(err) if tx.kind == TxKind::CrossShardLocal => {
                    state.revert_to(snap);
                    private.revert_to(private_snap);
                    warn!(hash = %tx.hash(), from = %tx.from(), %err, "skipping transaction");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok((receipts, private_receipts, all_logs, gas_used))
    }

    fn validate_state(
        &self,
        block: &Block,
        receipts: &[Receipt],
        state: &StateDb,
        used_gas: u64,
    ) -> Result<(), BlockError> {
        if block.header.gas_used != used_gas {
            return Err(BlockError::ValidationFailed(format!(
                "invalid gas used: have {}, want {}",
                used_gas, block.header.gas_used
            )));
        }
        if receipts.len() > block.transactions.len() {
            return Err(BlockError::TxCountMismatch);
        }
        let root = state.root();
        if root != block.header.state_root {
            return Err(BlockError::ValidationFailed(format!(
                "invalid state root: have {}, want {}",
                root, block.header.state_root
            )));
        }
        Ok(())
    }

    /// Dump a structured report for a bad block and remember its hash.
    fn report_block(&self, block: &Block, receipts: &[Receipt], err: &BlockError) {
        self.bad_blocks.lock().put(block.hash(), block.clone());
        error!(
            number = block.number().0,
            hash = %block.hash(),
            shard = %block.header.shard,
            receipts = receipts.len(),
            %err,
            "########## BAD BLOCK #########"
        );
    }

    // ── Export / import ─────────────────────────────────────────────────

    /// The canonical blocks in `[first, last]`.
    pub fn export_blocks(
        &self,
        first: BlockHeight,
        last: BlockHeight,
    ) -> Result<Vec<Block>, BlockError> {
        if first > last {
            return Err(BlockError::ValidationFailed(format!(
                "export failed: first ({}) is greater than last ({})",
                first.0, last.0
            )));
        }
        let mut blocks = Vec::with_capacity((last.0 - first.0 + 1) as usize);
        for number in first.0..=last.0 {
            let block = self
                .get_block_by_number(BlockHeight(number))
                .ok_or_else(|| {
                    BlockError::ValidationFailed(format!("export failed on #{}: not found", number))
                })?;
            blocks.push(block.as_ref().clone());
        }
        Ok(blocks)
    }

    /// Export the whole active chain, genesis excluded.
    pub fn export(&self) -> Result<Vec<Block>, BlockError> {
        let head = self.current_block().number();
        if head == BlockHeight::GENESIS {
            return Ok(vec![]);
        }
        self.export_blocks(BlockHeight(1), head)
    }

    // ── Background maintenance ──────────────────────────────────────────

    /// Promote buffered future blocks whose time has come.
    pub async fn proc_future_blocks(&self) {
        let mut blocks: Vec<Block> = {
            let future = self.future_blocks.lock();
            future.iter().map(|(_, block)| block.clone()).collect()
        };
        if blocks.is_empty() {
            return;
        }
        blocks.sort_by_key(|block| block.number());
        for block in blocks {
            // One by one: insertion needs contiguous ancestry.
            let _ = self.insert_chain(vec![block]).await;
        }
    }

    /// Spawn the 5-second janitor promoting future blocks.
    pub fn spawn_janitor(chain: &Arc<BlockChain>) {
        let mut quit = chain.quit.subscribe();
        let chain = Arc::downgrade(chain);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FUTURE_BLOCK_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(chain) = chain.upgrade() else { return };
                        chain.proc_future_blocks().await;
                    }
                    _ = quit.changed() => return,
                }
            }
        });
    }

    /// Stop background processing and abort in-flight imports.
    pub fn stop(&self) {
        self.proc_interrupt.store(true, Ordering::Release);
        let _ = self.quit.send(true);
        info!(shard = %self.config.shard, "blockchain manager stopped");
    }
}

impl HeaderReader for BlockChain {
    fn header_by_hash(&self, hash: &Hash) -> Option<Header> {
        self.get_header(hash)
    }

    fn current_header(&self) -> Header {
        self.current_block().header.clone()
    }
}

/// Derive the stored private bloom from the private receipts.
///
/// The real filter lives with the external RPC layer; the chain stores a
/// compact digest so the schema matches.
fn private_bloom(private_receipts: &[Receipt]) -> Vec<u8> {
    let mut data = Vec::with_capacity(private_receipts.len() * Hash::BYTES);
    for receipt in private_receipts {
        data.extend_from_slice(receipt.tx_hash.as_bytes());
    }
    Hash::from_bytes(&data).to_bytes().to_vec()
}

/// Convenience: build the next header over a parent.
pub fn build_header(
    parent: &Block,
    ref_number: BlockHeight,
    ref_hash: Hash,
    shard: ShardId,
    gas_limit: u64,
    extra: Vec<u8>,
    timestamp: u64,
) -> Header {
    Header {
        parent_hash: parent.hash(),
        number: parent.number().next(),
        ref_number,
        ref_hash,
        shard,
        coinbase: Address::ZERO,
        state_root: Hash::ZERO,
        gas_limit,
        gas_used: 0,
        timestamp,
        extra,
    }
}

/// Assemble and execute a block directly against a chain, used by tests
/// and the dev tooling to drive chains without a full miner.
pub async fn seal_and_insert(
    chain: &Arc<BlockChain>,
    transactions: Vec<Transaction>,
    ref_number: BlockHeight,
    ref_hash: Hash,
) -> Result<Arc<Block>, BlockError> {
    let parent = chain.current_block();
    let (mut state, mut private) = chain.state_at(&parent.header.state_root)?;
    let timestamp = std::cmp::max(parent.header.timestamp + 1, now_unix());
    // Hold back until the timestamp is no longer ahead of wall-clock, the
    // same discipline the mining worker applies.
    let now = now_unix();
    if timestamp > now {
        tokio::time::sleep(Duration::from_secs(timestamp - now)).await;
    }
    let header = build_header(
        &parent,
        ref_number,
        ref_hash,
        chain.config().expected_shard(),
        chain.gas_limit(),
        vec![],
        timestamp,
    );

    let block_probe = Block::new(header.clone(), transactions.clone());
    let (_receipts, _, _, used_gas) = chain
        .execute_block(
            &block_probe,
            parent.ref_number().next(),
            ref_number,
            &mut state,
            &mut private,
        )
        .await?;

    let mut header = header;
    header.gas_used = used_gas;
    header.state_root = state.root();
    let block = Block::new(header, transactions);

    chain
        .insert_chain(vec![block.clone()])
        .await
        .map_err(|failure| failure.source)?;
    Ok(Arc::new(block))
}
