//! Worker tests: admission, commit filtering, contract bootstrapping and
//! the reference-driven rollback.

use crate::worker::{Environment, Inner, Worker, WorkerConfig, MINING_LOG_AT_DEPTH};
use crate::unconfirmed::UnconfirmedBlocks;
use parking_lot::Mutex;
use shardline_chain::{
    build_header, now_unix, seal_and_insert, BlockChain, ChainConfig, ChainHeadEvent,
    CrossShardState, DataLog, DevEngine, EventHub, TxPool,
};
use shardline_codec::{encode_cross_payload, encode_state_commit, CrossPayload};
use shardline_locks::WRITE_LOCKED;
use shardline_state::{GasPool, StateDb};
use shardline_types::{
    shard_address, Address, Block, BlockHeight, Commitment, ContractRwSet, CrossShardTx, Hash,
    ShardId, ShardRwSets, Transaction, TxKind,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Default)]
struct StubPool {
    resets: Mutex<Vec<BlockHeight>>,
}

impl TxPool for StubPool {
    fn pending(&self) -> HashMap<Address, Vec<Transaction>> {
        HashMap::new()
    }

    fn locals(&self) -> Vec<Address> {
        vec![]
    }

    fn shards(&self) -> Vec<Address> {
        vec![]
    }

    fn reset_head(&self, height: BlockHeight) {
        self.resets.lock().push(height);
    }
}

fn addr(byte: u8) -> Address {
    Address([byte; 20])
}

fn slot(byte: u8) -> Hash {
    Hash::from_hash_bytes(&[byte; 32])
}

fn test_chain(
    shard: u64,
    ref_mirror: bool,
    funded: &[(Address, u128)],
    shared: Arc<CrossShardState>,
) -> Arc<BlockChain> {
    let db = Arc::new(shardline_storage::MemoryDb::new());
    let mut state = StateDb::new();
    for (account, balance) in funded {
        state.add_balance(*account, *balance);
    }
    let root = state.commit(db.as_ref());

    let block_shard = if ref_mirror { ShardId(0) } else { ShardId(shard) };
    let mut genesis = Block::genesis(block_shard, 80_000_000);
    genesis.header.state_root = root;
    BlockChain::write_genesis(db.as_ref(), &genesis);

    BlockChain::new(
        db,
        ChainConfig {
            shard: ShardId(shard),
            num_shards: 3,
            ref_mirror,
            archive: true,
        },
        Arc::new(DevEngine::new()),
        shared,
        Arc::new(EventHub::new()),
        DataLog::disabled(),
        None,
    )
    .unwrap()
}

/// Build a bare `Inner` without spawning the loops.
fn test_inner(chain: Arc<BlockChain>, pool: Arc<StubPool>, datalog: DataLog) -> Arc<Inner> {
    let shard = chain.config().shard;
    let mut addr_shard_map = HashMap::new();
    if shard.is_reference() {
        for worker in 1..chain.config().num_shards {
            addr_shard_map.insert(shard_address(ShardId(worker)), ShardId(worker));
        }
    }
    Arc::new(Inner {
        shard,
        engine: Arc::clone(chain.engine()),
        shared: Arc::clone(chain.shared()),
        gas_limit: chain.gas_limit(),
        init_contracts_dir: PathBuf::from("."),
        coinbase: Mutex::new(addr(0xEE)),
        extra: Mutex::new(vec![]),
        ref_head: Mutex::new((BlockHeight::GENESIS, chain.genesis_hash())),
        addr_shard_map,
        running: AtomicBool::new(false),
        new_txs: AtomicI32::new(0),
        new_work_tx: mpsc::channel(1).0,
        task_tx: mpsc::channel(1).0,
        result_tx: mpsc::channel(1).0,
        resubmit_interval_tx: mpsc::channel(1).0,
        resubmit_adjust_tx: mpsc::channel(10).0,
        start_tx: mpsc::channel(1).0,
        exit: watch::channel(false).0,
        pending_tasks: Mutex::new(HashMap::new()),
        snapshot: Mutex::new(None),
        unconfirmed: Mutex::new(UnconfirmedBlocks::new(Arc::clone(&chain), MINING_LOG_AT_DEPTH)),
        datalog,
        pool,
        ref_chain: None,
        chain,
    })
}

fn test_env(chain: &BlockChain) -> Environment {
    let parent = chain.current_block();
    let (state, private) = chain.state_at(&parent.header.state_root).unwrap();
    Environment {
        state,
        private,
        gas_pool: GasPool::new(chain.gas_limit()),
        gas_used: 0,
        header: build_header(
            &parent,
            BlockHeight(0),
            Hash::ZERO,
            chain.config().expected_shard(),
            chain.gas_limit(),
            vec![],
            now_unix(),
        ),
        tcount: 0,
        txs: vec![],
        receipts: vec![],
        private_receipts: vec![],
    }
}

fn cross_tx(sender: Address, contract: Address, reads: &[Hash], writes: &[Hash]) -> Transaction {
    let mut set = ContractRwSet::new(contract);
    for key in reads {
        set.add_read(*key);
    }
    for key in writes {
        set.add_read(*key);
        set.add_write(*key);
    }
    let mut rw_sets = ShardRwSets::new();
    rw_sets.insert(ShardId(1), vec![set]);

    let payload = CrossPayload {
        shards: vec![ShardId(1)],
        rw_sets,
        inner: Transaction::cross_local(0, addr(0x01), addr(0x02), 1, 50_000, 0, vec![]),
    };
    Transaction::new(
        TxKind::CrossShard,
        0,
        ShardId(0),
        addr(0xCC),
        0,
        500_000,
        0,
        encode_cross_payload(&payload),
    )
    .with_sender(sender)
}

fn commit_tx(shard: u64, ref_num: u64, block_num: u64) -> Transaction {
    Transaction::new(
        TxKind::StateCommit,
        block_num, // distinct nonces so the candidates are distinct
        ShardId(shard),
        addr(0xCC),
        0,
        100_000,
        0,
        encode_state_commit(&Commitment {
            shard: ShardId(shard),
            block_num: BlockHeight(block_num),
            ref_num: BlockHeight(ref_num),
            state_root: Hash::from_bytes(b"root"),
            block_hash: Hash::from_bytes(b"hash"),
        }),
    )
    .with_sender(shard_address(ShardId(shard)))
}

/// Admission conflict: a write on (A, 0x01) admits, the following read on
/// the same slot is rejected, leaving the tentative write lock in place.
#[test]
fn test_admission_conflict() {
    let shared = Arc::new(CrossShardState::new());
    let chain = test_chain(0, false, &[], shared);
    let inner = test_inner(chain, Arc::new(StubPool::default()), DataLog::disabled());

    let contract = addr(0xA0);
    let creator = addr(0x10);
    let t1 = cross_tx(creator, contract, &[], &[slot(0x01)]);
    let t2 = cross_tx(addr(0x11), contract, &[slot(0x01)], &[]);
    // Distinct hashes despite the shared shape.
    assert_ne!(t1.hash(), t2.hash());

    let mut pending = HashMap::new();
    pending.insert(creator, vec![t1.clone(), t2.clone()]);

    let mut tables = inner.shared.locks.write();
    tables.reset_tentative();
    let admitted = inner.new_valid_cross_transactions(pending, &mut tables);

    let txs = admitted.get(&creator).unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].hash(), t1.hash());
    assert_eq!(
        tables.tentative_status(&contract, &slot(0x01)),
        Some(WRITE_LOCKED)
    );
}

/// Already-carried cross-shard transactions never re-enter a block.
#[test]
fn test_processed_cross_tx_excluded() {
    let shared = Arc::new(CrossShardState::new());
    let chain = test_chain(0, false, &[], Arc::clone(&shared));
    let inner = test_inner(chain, Arc::new(StubPool::default()), DataLog::disabled());

    let creator = addr(0x10);
    let tx = cross_tx(creator, addr(0xA0), &[], &[slot(0x05)]);
    shared.mark_processed(tx.hash());

    let mut pending = HashMap::new();
    pending.insert(creator, vec![tx]);

    let mut tables = inner.shared.locks.write();
    let admitted = inner.new_valid_cross_transactions(pending, &mut tables);
    assert!(admitted.is_empty());
}

/// Monotone state-commit filter: with lastCommit = (ref 3, block 5) and
/// lastCtx = 4, candidates (ref 4, block 6) and (ref 5, block 5) reduce to
/// the latter.
#[test]
fn test_monotone_state_commit_filter() {
    let shared = Arc::new(CrossShardState::new());
    let chain = test_chain(0, false, &[], Arc::clone(&shared));
    let inner = test_inner(chain, Arc::new(StubPool::default()), DataLog::disabled());

    shared.set_last_commit(
        ShardId(2),
        Commitment {
            shard: ShardId(2),
            block_num: BlockHeight(5),
            ref_num: BlockHeight(3),
            state_root: Hash::ZERO,
            block_hash: Hash::ZERO,
        },
    );
    shared.set_last_ctx(ShardId(2), BlockHeight(4));

    let commit_addr = shard_address(ShardId(2));
    let c1 = commit_tx(2, 4, 6);
    let c2 = commit_tx(2, 5, 5);
    let mut pending = HashMap::new();
    pending.insert(commit_addr, vec![c1, c2.clone()]);

    let mut tables = inner.shared.locks.write();
    let commits = inner.new_valid_state_commitments(pending, &mut tables);

    let txs = commits.get(&commit_addr).unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].hash(), c2.hash());
}

/// A commit reporting a reference height below the shard's last cross-tx
/// is never accepted.
#[test]
fn test_commit_below_last_ctx_rejected() {
    let shared = Arc::new(CrossShardState::new());
    let chain = test_chain(0, false, &[], Arc::clone(&shared));
    let inner = test_inner(chain, Arc::new(StubPool::default()), DataLog::disabled());

    shared.set_last_ctx(ShardId(2), BlockHeight(8));
    let commit_addr = shard_address(ShardId(2));
    let mut pending = HashMap::new();
    pending.insert(commit_addr, vec![commit_tx(2, 7, 20)]);

    let mut tables = inner.shared.locks.write();
    let commits = inner.new_valid_state_commitments(pending, &mut tables);
    assert!(commits.is_empty());
}

/// Block 1 deploys the init-contracts bundle from disk exactly once.
#[test]
fn test_init_contracts_deploy() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = serde_json::json!({
        "contracts": [
            { "nonce": 0, "balance": 500u64, "code_hex": "6060" },
            { "nonce": 1, "balance": 0u64, "code_hex": "0x6000" },
        ]
    });
    std::fs::write(
        dir.path().join("init-contracts1.json"),
        serde_json::to_vec(&bundle).unwrap(),
    )
    .unwrap();

    let shared = Arc::new(CrossShardState::new());
    let chain = test_chain(1, false, &[], shared);
    let mut inner = test_inner(
        Arc::clone(&chain),
        Arc::new(StubPool::default()),
        DataLog::disabled(),
    );
    Arc::get_mut(&mut inner).unwrap().init_contracts_dir = dir.path().to_path_buf();

    let mut env = test_env(&chain);
    assert_eq!(env.header.number, BlockHeight(1));

    let aborted = inner.commit_init_contracts(&mut env, None);
    assert!(!aborted);
    assert_eq!(env.tcount, 2);
    assert_eq!(env.txs.len(), 2);

    let first_contract = env.receipts[0].contract_address.unwrap();
    assert_eq!(env.state.balance(&first_contract), 500);
    assert_eq!(env.state.code(&first_contract), vec![0x60, 0x60]);
    assert_eq!(
        env.state.code(&env.receipts[1].contract_address.unwrap()),
        vec![0x60, 0x00]
    );
}

/// A missing bundle abandons the block-1 build.
#[test]
fn test_init_contracts_missing_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let shared = Arc::new(CrossShardState::new());
    let chain = test_chain(1, false, &[], shared);
    let mut inner = test_inner(
        Arc::clone(&chain),
        Arc::new(StubPool::default()),
        DataLog::disabled(),
    );
    Arc::get_mut(&mut inner).unwrap().init_contracts_dir = dir.path().to_path_buf();

    let mut env = test_env(&chain);
    assert!(inner.commit_init_contracts(&mut env, None));
    assert_eq!(env.tcount, 0);
}

/// Reorg trigger: a reference head whose window carries a cross-shard tx
/// for this shard rolls the local chain back to the committed height,
/// appends the reorg record, and resubmits work.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reference_head_forces_rollback() {
    let logdir = tempfile::tempdir().unwrap();
    let shared = Arc::new(CrossShardState::new());

    let alice = addr(0x0A);
    let chain = test_chain(1, false, &[(alice, 1_000)], Arc::clone(&shared));
    let mirror = test_chain(1, true, &[], Arc::clone(&shared));

    // One local block above the (genesis) commit height.
    seal_and_insert(
        &chain,
        vec![Transaction::new(
            TxKind::IntraShard,
            0,
            ShardId(1),
            addr(0x0B),
            10,
            21_000,
            0,
            vec![],
        )
        .with_sender(alice)],
        BlockHeight(0),
        chain.genesis_hash(),
    )
    .await
    .unwrap();
    assert_eq!(chain.current_block().number(), BlockHeight(1));

    let pool = Arc::new(StubPool::default());
    let (_txs_tx, txs_rx) = mpsc::channel(16);
    let worker = Worker::new(
        WorkerConfig {
            shard: ShardId(1),
            num_shards: 3,
            recommit: Duration::from_secs(3),
            init_contracts_dir: logdir.path().to_path_buf(),
        },
        Arc::clone(&chain),
        Some(Arc::clone(&mirror)),
        Arc::clone(&pool) as Arc<dyn TxPool>,
        txs_rx,
        DataLog::new(logdir.path()),
    );

    // A cross-shard transaction for this shard at reference height 6.
    shared.add_pending(
        BlockHeight(6),
        0,
        CrossShardTx {
            shards: vec![ShardId(1), ShardId(2)],
            block_num: BlockHeight(6),
            rw_sets: ShardRwSets::new(),
            inner: Transaction::cross_local(0, addr(0x01), addr(0x02), 1, 50_000, 0, vec![]),
        },
    );

    // The reference chain reaches height 7.
    let mut ref_head = Block::genesis(ShardId(0), 80_000_000);
    ref_head.header.number = BlockHeight(7);
    mirror.events().post_chain_head(ChainHeadEvent {
        block: Arc::new(ref_head),
    });

    // Rollback happens before the 2-second desynchronisation sleep ends.
    let mut rolled_back = false;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if chain.current_block().number() == BlockHeight(0) {
            rolled_back = true;
            break;
        }
    }
    assert!(rolled_back, "chain was not rewound to the committed height");
    assert_eq!(pool.resets.lock().as_slice(), &[BlockHeight(0)]);

    let record = std::fs::read_to_string(logdir.path().join("reorg")).unwrap();
    assert!(record.starts_with("7 1 0 "), "unexpected record: {record}");

    worker.close();
    chain.stop();
}

/// Reference segments carrying no cross-shard transaction for this shard
/// never trigger a rollback.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reference_head_without_ctx_keeps_head() {
    let shared = Arc::new(CrossShardState::new());
    let alice = addr(0x0A);
    let chain = test_chain(1, false, &[(alice, 1_000)], Arc::clone(&shared));
    let mirror = test_chain(1, true, &[], Arc::clone(&shared));

    seal_and_insert(
        &chain,
        vec![Transaction::new(
            TxKind::IntraShard,
            0,
            ShardId(1),
            addr(0x0B),
            10,
            21_000,
            0,
            vec![],
        )
        .with_sender(alice)],
        BlockHeight(0),
        chain.genesis_hash(),
    )
    .await
    .unwrap();

    let pool = Arc::new(StubPool::default());
    let (_txs_tx, txs_rx) = mpsc::channel(16);
    let worker = Worker::new(
        WorkerConfig {
            shard: ShardId(1),
            num_shards: 3,
            recommit: Duration::from_secs(3),
            init_contracts_dir: PathBuf::from("."),
        },
        Arc::clone(&chain),
        Some(Arc::clone(&mirror)),
        Arc::clone(&pool) as Arc<dyn TxPool>,
        txs_rx,
        DataLog::disabled(),
    );

    // Reference heights 1..=7 exist but none carries work for shard 1.
    let mut ref_head = Block::genesis(ShardId(0), 80_000_000);
    ref_head.header.number = BlockHeight(7);
    mirror.events().post_chain_head(ChainHeadEvent {
        block: Arc::new(ref_head),
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(chain.current_block().number(), BlockHeight(1));
    assert!(pool.resets.lock().is_empty());

    worker.close();
    chain.stop();
}

/// A freshly started worker seals block 1 from the init bundle and keeps
/// the chain advancing.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_seals_first_block() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = serde_json::json!({
        "contracts": [{ "nonce": 0, "balance": 42u64, "code_hex": "6001" }]
    });
    std::fs::write(
        dir.path().join("init-contracts1.json"),
        serde_json::to_vec(&bundle).unwrap(),
    )
    .unwrap();

    let shared = Arc::new(CrossShardState::new());
    let chain = test_chain(1, false, &[], shared);
    let pool = Arc::new(StubPool::default());
    let (_txs_tx, txs_rx) = mpsc::channel(16);

    let worker = Worker::new(
        WorkerConfig {
            shard: ShardId(1),
            num_shards: 3,
            recommit: Duration::from_secs(3),
            init_contracts_dir: dir.path().to_path_buf(),
        },
        Arc::clone(&chain),
        None,
        Arc::clone(&pool) as Arc<dyn TxPool>,
        txs_rx,
        DataLog::disabled(),
    );
    worker.set_coinbase(addr(0xEE));
    worker.start();
    assert!(worker.is_running());

    let mut sealed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if chain.current_block().number() >= BlockHeight(1) {
            sealed = true;
            break;
        }
    }
    assert!(sealed, "worker never sealed block 1");

    let block_one = chain.get_block_by_number(BlockHeight(1)).unwrap();
    assert_eq!(block_one.transaction_count(), 1);
    let receipts = chain.get_receipts(&block_one.hash()).unwrap();
    let contract = receipts[0].contract_address.unwrap();
    let (state, _) = chain.state_at(&block_one.header.state_root).unwrap();
    assert_eq!(state.balance(&contract), 42);

    // The deployment happened exactly once.
    assert_eq!(state.nonce(&Address::ZERO), 1);

    worker.stop();
    worker.close();
    chain.stop();
}
