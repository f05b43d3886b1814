//! The mining worker: builds, interrupts and reseals blocks.
//!
//! Four cooperating tasks drive the worker:
//!
//! - `new_work_loop` turns head events, reference-chain progress and the
//!   adaptive resubmit timer into build requests, managing the shared
//!   interrupt flag of the in-flight build;
//! - `main_loop` executes build requests against a fresh environment;
//! - `task_loop` hands finished environments to the sealing engine,
//!   deduplicating by seal hash and aborting superseded seals;
//! - `result_loop` writes sealed blocks and fans out events.

use crate::recommit::{
    recalc_recommit, sanitize_recommit, IntervalAdjust, MIN_RECOMMIT_INTERVAL,
};
use crate::unconfirmed::UnconfirmedBlocks;
use parking_lot::Mutex;
use shardline_chain::{
    now_unix, BlockChain, ChainEvent, ChainHeadEvent, ChainSideEvent, CrossShardState, DataLog,
    Engine, NewMinedBlockEvent, NewTxsEvent, TxPool, WriteStatus,
};
use shardline_state::{GasPool, StateDb};
use shardline_storage as schema;
use shardline_types::{
    Address, Block, BlockHeight, Hash, Header, Receipt, ShardId, Transaction, TxsByPriceAndNonce,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Size of the channel listening to sealing results.
pub const RESULT_QUEUE_SIZE: usize = 10;

/// Size of the channel listening to new-transaction events.
pub const TX_CHAN_SIZE: usize = 4096;

/// Size of the resubmit-interval adjustment channel.
pub const RESUBMIT_ADJUST_CHAN_SIZE: usize = 10;

/// Confirmation depth before a mined block's canonicalness is logged.
pub const MINING_LOG_AT_DEPTH: u64 = 7;

/// Maximum depth of an acceptable stale sealing task.
pub const STALE_THRESHOLD: u64 = 7;

/// Backoff after a reference-driven rollback, desynchronising the worker
/// from the reference cadence.
const REORG_BACKOFF: Duration = Duration::from_secs(2);

pub(crate) const INTERRUPT_NONE: i32 = 0;
pub(crate) const INTERRUPT_NEW_HEAD: i32 = 1;
pub(crate) const INTERRUPT_RESUBMIT: i32 = 2;

/// A request for new sealing work with its interrupt flag.
pub(crate) struct NewWorkReq {
    pub reorg: bool,
    pub interrupt: Arc<AtomicI32>,
    pub no_empty: bool,
    pub timestamp: u64,
}

/// The environment of one build attempt.
pub(crate) struct Environment {
    pub state: StateDb,
    pub private: StateDb,
    pub gas_pool: GasPool,
    pub gas_used: u64,
    pub header: Header,
    pub tcount: usize,
    pub txs: Vec<Transaction>,
    pub receipts: Vec<Receipt>,
    pub private_receipts: Vec<Receipt>,
}

/// A finished build handed to the sealing engine.
#[derive(Clone)]
pub(crate) struct Task {
    pub receipts: Vec<Receipt>,
    pub private_receipts: Vec<Receipt>,
    pub state: StateDb,
    pub private: StateDb,
    pub block: Block,
    pub created_at: Instant,
}

/// A consistent snapshot of the last completed build.
pub(crate) struct PendingSnapshot {
    pub block: Block,
    pub state: StateDb,
    pub private: StateDb,
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// The shard this worker mines.
    pub shard: ShardId,

    /// Number of shards in the system.
    pub num_shards: u64,

    /// Initial resubmit interval.
    pub recommit: Duration,

    /// Directory holding `init-contracts<shard>.json`.
    pub init_contracts_dir: PathBuf,
}

pub(crate) struct Inner {
    pub shard: ShardId,
    pub chain: Arc<BlockChain>,
    pub ref_chain: Option<Arc<BlockChain>>,
    pub pool: Arc<dyn TxPool>,
    pub engine: Arc<dyn Engine>,
    pub shared: Arc<CrossShardState>,
    pub datalog: DataLog,
    pub gas_limit: u64,
    pub init_contracts_dir: PathBuf,

    pub coinbase: Mutex<Address>,
    pub extra: Mutex<Vec<u8>>,
    /// Last known reference head `(height, hash)`.
    pub ref_head: Mutex<(BlockHeight, Hash)>,
    /// Commit address to shard mapping (reference shard only).
    pub addr_shard_map: HashMap<Address, ShardId>,

    pub running: AtomicBool,
    pub new_txs: AtomicI32,

    pub new_work_tx: mpsc::Sender<NewWorkReq>,
    pub task_tx: mpsc::Sender<Task>,
    pub result_tx: mpsc::Sender<Block>,
    pub resubmit_interval_tx: mpsc::Sender<Duration>,
    pub resubmit_adjust_tx: mpsc::Sender<IntervalAdjust>,
    pub start_tx: mpsc::Sender<()>,
    pub exit: watch::Sender<bool>,

    pub pending_tasks: Mutex<HashMap<Hash, Task>>,
    pub snapshot: Mutex<Option<PendingSnapshot>>,
    pub unconfirmed: Mutex<UnconfirmedBlocks>,
}

impl Inner {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn send_adjust(&self, adjust: IntervalAdjust) {
        if self.resubmit_adjust_tx.try_send(adjust).is_err() {
            debug!("resubmit adjustment channel full, dropping feedback");
        }
    }

    /// Drop sealing tasks older than the stale threshold.
    pub(crate) fn clear_pending(&self, number: BlockHeight) {
        self.pending_tasks
            .lock()
            .retain(|_, task| task.block.number().0 + STALE_THRESHOLD > number.0);
    }

    /// Publish the current environment as the pending snapshot.
    pub(crate) fn update_snapshot(&self, env: &Environment) {
        let mut header = env.header.clone();
        header.gas_used = env.gas_used;
        *self.snapshot.lock() = Some(PendingSnapshot {
            block: Block::new(header, env.txs.clone()),
            state: env.state.clone(),
            private: env.private.clone(),
        });
    }
}

/// The mining worker. Owns its current environment exclusively and shares
/// only immutable snapshots for queries.
pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    /// Create a worker and spawn its four loops. Must be called inside a
    /// tokio runtime.
    ///
    /// `ref_chain` is the worker shard's reference mirror; the reference
    /// shard itself passes `None`. `txs_rx` is the pool's new-transaction
    /// feed, sized [`TX_CHAN_SIZE`] by the node.
    pub fn new(
        config: WorkerConfig,
        chain: Arc<BlockChain>,
        ref_chain: Option<Arc<BlockChain>>,
        pool: Arc<dyn TxPool>,
        txs_rx: mpsc::Receiver<NewTxsEvent>,
        datalog: DataLog,
    ) -> Self {
        let recommit = config.recommit;
        if recommit < MIN_RECOMMIT_INTERVAL {
            warn!(
                provided = ?recommit,
                updated = ?MIN_RECOMMIT_INTERVAL,
                "sanitizing miner recommit interval"
            );
        }
        let recommit = sanitize_recommit(recommit);

        let (new_work_tx, new_work_rx) = mpsc::channel(1);
        let (task_tx, task_rx) = mpsc::channel(1);
        let (result_tx, result_rx) = mpsc::channel(RESULT_QUEUE_SIZE);
        let (resubmit_interval_tx, resubmit_interval_rx) = mpsc::channel(1);
        let (resubmit_adjust_tx, resubmit_adjust_rx) = mpsc::channel(RESUBMIT_ADJUST_CHAN_SIZE);
        let (start_tx, start_rx) = mpsc::channel(1);
        let exit = watch::channel(false).0;

        let mut addr_shard_map = HashMap::new();
        if config.shard.is_reference() {
            for shard in 1..config.num_shards {
                let shard = ShardId(shard);
                addr_shard_map.insert(shardline_types::shard_address(shard), shard);
            }
        }

        let ref_genesis_hash = ref_chain
            .as_ref()
            .map(|c| c.genesis_hash())
            .unwrap_or_else(|| chain.genesis_hash());

        let inner = Arc::new(Inner {
            shard: config.shard,
            engine: Arc::clone(chain.engine()),
            shared: Arc::clone(chain.shared()),
            gas_limit: chain.gas_limit(),
            init_contracts_dir: config.init_contracts_dir,
            coinbase: Mutex::new(Address::ZERO),
            extra: Mutex::new(vec![]),
            ref_head: Mutex::new((BlockHeight::GENESIS, ref_genesis_hash)),
            addr_shard_map,
            running: AtomicBool::new(false),
            new_txs: AtomicI32::new(0),
            new_work_tx,
            task_tx,
            result_tx,
            resubmit_interval_tx,
            resubmit_adjust_tx,
            start_tx,
            exit,
            pending_tasks: Mutex::new(HashMap::new()),
            snapshot: Mutex::new(None),
            unconfirmed: Mutex::new(UnconfirmedBlocks::new(
                Arc::clone(&chain),
                MINING_LOG_AT_DEPTH,
            )),
            datalog,
            pool,
            ref_chain: ref_chain.clone(),
            chain,
        });

        let head_rx = inner.chain.events().subscribe_chain_head();
        // The reference shard has no mirror; keep a never-firing channel in
        // its place.
        let (ref_head_rx, _ref_head_keepalive) = match &ref_chain {
            Some(mirror) => (mirror.events().subscribe_chain_head(), None),
            None => {
                let (tx, rx) = broadcast::channel(1);
                (rx, Some(tx))
            }
        };

        tokio::spawn(new_work_loop(
            Arc::clone(&inner),
            recommit,
            start_rx,
            head_rx,
            ref_head_rx,
            _ref_head_keepalive,
            resubmit_interval_rx,
            resubmit_adjust_rx,
        ));
        tokio::spawn(main_loop(Arc::clone(&inner), new_work_rx, txs_rx));
        tokio::spawn(task_loop(Arc::clone(&inner), task_rx));
        tokio::spawn(result_loop(Arc::clone(&inner), result_rx));

        let worker = Self { inner };
        // Submit first work to initialize the pending state.
        let _ = worker.inner.start_tx.try_send(());
        worker
    }

    /// Set the running status and trigger new work.
    pub fn start(&self) {
        self.inner.running.store(true, Ordering::Release);
        let _ = self.inner.start_tx.try_send(());
    }

    /// Clear the running status.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
    }

    /// Whether the worker is mining.
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Terminate all background loops.
    pub fn close(&self) {
        let _ = self.inner.exit.send(true);
    }

    /// Set the coinbase for built blocks.
    pub fn set_coinbase(&self, addr: Address) {
        *self.inner.coinbase.lock() = addr;
    }

    /// Set the extra data for built blocks.
    pub fn set_extra(&self, extra: Vec<u8>) {
        *self.inner.extra.lock() = extra;
    }

    /// Update the resubmit interval, clamped into the supported range.
    pub async fn set_recommit_interval(&self, interval: Duration) {
        let _ = self.inner.resubmit_interval_tx.send(interval).await;
    }

    /// The pending block and state copies of the last completed build.
    pub fn pending(&self) -> Option<(Block, StateDb, StateDb)> {
        self.inner
            .snapshot
            .lock()
            .as_ref()
            .map(|snap| (snap.block.clone(), snap.state.clone(), snap.private.clone()))
    }

    /// The pending block of the last completed build.
    pub fn pending_block(&self) -> Option<Block> {
        self.inner.snapshot.lock().as_ref().map(|s| s.block.clone())
    }
}

/// Submit a new work request, aborting the in-flight build with `signal`.
async fn submit_work(
    inner: &Arc<Inner>,
    interrupt_slot: &mut Option<Arc<AtomicI32>>,
    signal: i32,
    reorg: bool,
    no_empty: bool,
    timestamp: u64,
) {
    if let Some(prev) = interrupt_slot {
        prev.store(signal, Ordering::Release);
    }
    let fresh = Arc::new(AtomicI32::new(INTERRUPT_NONE));
    *interrupt_slot = Some(Arc::clone(&fresh));
    let _ = inner
        .new_work_tx
        .send(NewWorkReq {
            reorg,
            interrupt: fresh,
            no_empty,
            timestamp,
        })
        .await;
    inner.new_txs.store(0, Ordering::Relaxed);
}

#[allow(clippy::too_many_arguments)]
async fn new_work_loop(
    inner: Arc<Inner>,
    initial_recommit: Duration,
    mut start_rx: mpsc::Receiver<()>,
    mut head_rx: broadcast::Receiver<ChainHeadEvent>,
    mut ref_head_rx: broadcast::Receiver<ChainHeadEvent>,
    _ref_head_keepalive: Option<broadcast::Sender<ChainHeadEvent>>,
    mut interval_rx: mpsc::Receiver<Duration>,
    mut adjust_rx: mpsc::Receiver<IntervalAdjust>,
) {
    let mut interrupt: Option<Arc<AtomicI32>> = None;
    // Minimal resubmit interval specified by the user.
    let mut min_recommit_user = initial_recommit;
    let mut recommit = initial_recommit;
    let mut timestamp = now_unix();
    let mut exit = inner.exit.subscribe();

    let timer = tokio::time::sleep(recommit);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            Some(()) = start_rx.recv() => {
                inner.clear_pending(inner.chain.current_block().number());
                timestamp = now_unix();
                submit_work(&inner, &mut interrupt, INTERRUPT_NEW_HEAD, false, false, timestamp).await;
                timer.as_mut().reset(tokio::time::Instant::now() + recommit);
            }

            head = head_rx.recv() => {
                let Ok(head) = head else { continue };
                inner.clear_pending(head.block.number());
                timestamp = now_unix();
                submit_work(&inner, &mut interrupt, INTERRUPT_NEW_HEAD, false, false, timestamp).await;
                timer.as_mut().reset(tokio::time::Instant::now() + recommit);
            }

            ref_head = ref_head_rx.recv() => {
                let Ok(ref_head) = ref_head else { continue };
                let block = ref_head.block;
                *inner.ref_head.lock() = (block.number(), block.hash());

                let parent = inner.chain.current_block();
                let parent_num = parent.number();
                let commit_num = inner.shared.commit_num();

                // Cross-shard work only makes sense once the last committed
                // block is already known locally.
                if parent_num >= commit_num {
                    let new_ref_num = block.number();
                    let mut reorg = false;
                    let mut cur_ref = parent.ref_number().next();
                    while cur_ref <= new_ref_num {
                        if inner.shared.ctx_exists(cur_ref) {
                            reorg = true;
                            break;
                        }
                        cur_ref = cur_ref.next();
                    }
                    timestamp = now_unix();
                    if reorg {
                        if parent_num > commit_num {
                            inner.datalog.append(
                                "reorg",
                                format_args!("{} {} {}", new_ref_num.0, parent_num.0, commit_num.0),
                            );
                            info!(
                                new_ref = new_ref_num.0,
                                local = parent_num.0,
                                commit = commit_num.0,
                                "reference chain forces rollback"
                            );
                            inner.pool.reset_head(commit_num);
                            if let Err(err) = inner.chain.set_head(commit_num) {
                                error!(%err, "failed to rewind chain to committed height");
                            }
                        }
                        // Desynchronise from the reference cadence before
                        // rebuilding.
                        tokio::time::sleep(REORG_BACKOFF).await;
                        submit_work(&inner, &mut interrupt, INTERRUPT_NEW_HEAD, true, false, timestamp).await;
                        timer.as_mut().reset(tokio::time::Instant::now() + recommit);
                    }
                }
            }

            () = &mut timer => {
                // Resubmit periodically to pull in higher-priced
                // transactions, but only when something new arrived.
                if inner.is_running() && inner.new_txs.load(Ordering::Relaxed) > 0 {
                    submit_work(&inner, &mut interrupt, INTERRUPT_RESUBMIT, false, true, timestamp).await;
                }
                timer.as_mut().reset(tokio::time::Instant::now() + recommit);
            }

            Some(interval) = interval_rx.recv() => {
                let sanitized = sanitize_recommit(interval);
                if sanitized != interval {
                    warn!(provided = ?interval, updated = ?sanitized, "sanitizing miner recommit interval");
                }
                info!(from = ?min_recommit_user, to = ?sanitized, "miner recommit interval update");
                min_recommit_user = sanitized;
                recommit = sanitized;
            }

            Some(adjust) = adjust_rx.recv() => {
                let before = recommit;
                if adjust.inc {
                    let target = recommit.as_nanos() as f64 / adjust.ratio;
                    recommit = recalc_recommit(recommit, min_recommit_user, target, true);
                    debug!(from = ?before, to = ?recommit, "increase miner recommit interval");
                } else {
                    let target = min_recommit_user.as_nanos() as f64;
                    recommit = recalc_recommit(recommit, min_recommit_user, target, false);
                    debug!(from = ?before, to = ?recommit, "decrease miner recommit interval");
                }
            }

            _ = exit.changed() => return,
        }
    }
}

async fn main_loop(
    inner: Arc<Inner>,
    mut new_work_rx: mpsc::Receiver<NewWorkReq>,
    mut txs_rx: mpsc::Receiver<NewTxsEvent>,
) {
    let mut current: Option<Environment> = None;
    let mut exit = inner.exit.subscribe();

    loop {
        tokio::select! {
            Some(req) = new_work_rx.recv() => {
                inner.commit_new_work(&mut current, req).await;
            }

            Some(event) = txs_rx.recv() => {
                let count = event.txs.len() as i32;
                // Apply arrivals to the pending state when not mining so
                // queries stay fresh; when mining the resubmit timer picks
                // them up.
                if !inner.is_running() {
                    if let Some(env) = current.as_mut() {
                        let mut grouped: HashMap<Address, Vec<Transaction>> = HashMap::new();
                        for tx in event.txs {
                            grouped.entry(tx.from()).or_default().push(tx);
                        }
                        let mut set = TxsByPriceAndNonce::new(grouped);
                        inner.commit_transactions(env, &mut set, None);
                        inner.update_snapshot(env);
                    }
                }
                inner.new_txs.fetch_add(count, Ordering::Relaxed);
            }

            _ = exit.changed() => return,
        }
    }
}

async fn task_loop(inner: Arc<Inner>, mut task_rx: mpsc::Receiver<Task>) {
    let mut stop: Option<watch::Sender<bool>> = None;
    let mut prev: Option<Hash> = None;
    let mut exit = inner.exit.subscribe();

    loop {
        tokio::select! {
            Some(task) = task_rx.recv() => {
                let seal_hash = inner.engine.seal_hash(&task.block.header);
                // Reject duplicate sealing work due to resubmitting.
                if prev == Some(seal_hash) {
                    continue;
                }
                // Interrupt the previous sealing operation.
                if let Some(stop) = stop.take() {
                    let _ = stop.send(true);
                }
                let (stop_tx, stop_rx) = watch::channel(false);
                stop = Some(stop_tx);
                prev = Some(seal_hash);

                let block = task.block.clone();
                inner.pending_tasks.lock().insert(seal_hash, task);
                inner.engine.seal(block, inner.result_tx.clone(), stop_rx);
            }

            _ = exit.changed() => {
                if let Some(stop) = stop.take() {
                    let _ = stop.send(true);
                }
                return;
            }
        }
    }
}

async fn result_loop(inner: Arc<Inner>, mut result_rx: mpsc::Receiver<Block>) {
    let mut exit = inner.exit.subscribe();

    loop {
        tokio::select! {
            Some(block) = result_rx.recv() => {
                let hash = block.hash();
                // Short circuit duplicate results caused by resubmitting.
                if inner.chain.has_block(&hash) {
                    continue;
                }
                let seal_hash = inner.engine.seal_hash(&block.header);
                let task = inner.pending_tasks.lock().get(&seal_hash).cloned();
                let Some(task) = task else {
                    error!(number = block.number().0, %seal_hash, %hash, "block found but no relative pending task");
                    continue;
                };

                // Stamp the now-known block hash into every receipt log.
                let mut receipts = task.receipts.clone();
                let mut private_receipts = task.private_receipts.clone();
                let mut logs = vec![];
                for receipt in receipts.iter_mut().chain(private_receipts.iter_mut()) {
                    for log in receipt.logs.iter_mut() {
                        log.block_hash = hash;
                    }
                    logs.extend(receipt.logs.iter().cloned());
                }

                // Commit the private state root separately.
                let db = inner.chain.db();
                let mut private = task.private.clone();
                let private_root = private.commit(db.as_ref());
                schema::write_private_state_root(
                    db.as_ref(),
                    &block.header.state_root,
                    &private_root,
                );

                let merged = shardline_types::merge_receipts(&receipts, &private_receipts);
                let mut state = task.state.clone();
                let status = match inner
                    .chain
                    .write_block_with_state(&block, &merged, &mut state, None)
                {
                    Ok(status) => status,
                    Err(err) => {
                        error!(%err, "failed writing block to chain");
                        continue;
                    }
                };
                schema::write_private_bloom(
                    db.as_ref(),
                    block.number(),
                    private_bloom(&private_receipts).as_slice(),
                );

                if inner.shard.is_reference() {
                    inner.chain.update_ref_status(&block, &receipts);
                } else {
                    inner.chain.log_block_data(true, &block, &receipts);
                }

                info!(
                    number = block.number().0,
                    %seal_hash,
                    %hash,
                    root = %block.header.state_root,
                    elapsed = ?task.created_at.elapsed(),
                    "successfully sealed new block"
                );

                let arc_block = Arc::new(block.clone());
                let events = inner.chain.events();
                events.post_mined(NewMinedBlockEvent {
                    block: Arc::clone(&arc_block),
                });
                match status {
                    WriteStatus::Canonical => {
                        events.post_chain(ChainEvent {
                            block: Arc::clone(&arc_block),
                            hash,
                            logs: logs.clone(),
                        });
                        events.post_chain_head(ChainHeadEvent {
                            block: Arc::clone(&arc_block),
                        });
                        events.post_logs(logs);
                    }
                    WriteStatus::Side => {
                        events.post_chain_side(ChainSideEvent { block: arc_block });
                    }
                }

                inner.unconfirmed.lock().insert(block.number(), hash);
            }

            _ = exit.changed() => return,
        }
    }
}

/// Digest of the private receipts stored as the block's private bloom.
fn private_bloom(private_receipts: &[Receipt]) -> Vec<u8> {
    let mut data = Vec::with_capacity(private_receipts.len() * Hash::BYTES);
    for receipt in private_receipts {
        data.extend_from_slice(receipt.tx_hash.as_bytes());
    }
    Hash::from_bytes(&data).to_bytes().to_vec()
}
