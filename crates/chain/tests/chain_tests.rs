//! End-to-end tests of the chain manager.

use shardline_chain::{
    now_unix, seal_and_insert, BlockChain, BlockError, ChainConfig, CrossShardState, DataLog,
    DevEngine, EventHub,
};
use shardline_codec::{applied_event_data, encode_cross_payload, encode_state_commit, CrossPayload};
use shardline_state::StateDb;
use shardline_storage::MemoryDb;
use shardline_types::{
    Address, Block, BlockHeight, Commitment, ContractRwSet, CrossShardTx, Hash, KeyVal, Log,
    Receipt, ShardId, ShardRwSets, Transaction, TxKind,
};
use std::sync::Arc;

fn addr(byte: u8) -> Address {
    Address([byte; 20])
}

fn slot(byte: u8) -> Hash {
    Hash::from_hash_bytes(&[byte; 32])
}

/// A fresh chain over a funded genesis.
fn new_chain(shard: u64, ref_mirror: bool, funded: &[(Address, u128)]) -> Arc<BlockChain> {
    let shared = Arc::new(CrossShardState::new());
    new_chain_with_shared(shard, ref_mirror, funded, shared)
}

fn new_chain_with_shared(
    shard: u64,
    ref_mirror: bool,
    funded: &[(Address, u128)],
    shared: Arc<CrossShardState>,
) -> Arc<BlockChain> {
    let db = Arc::new(MemoryDb::new());
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

fn transfer_tx(nonce: u64, from: Address, to: Address, value: u128) -> Transaction {
    Transaction::new(
        TxKind::IntraShard,
        nonce,
        ShardId(1),
        to,
        value,
        21_000,
        0,
        vec![],
    )
    .with_sender(from)
}

#[tokio::test]
async fn test_insert_transfers_and_head_moves() {
    let alice = addr(1);
    let bob = addr(2);
    let chain = new_chain(1, false, &[(alice, 1_000)]);

    let block = seal_and_insert(
        &chain,
        vec![transfer_tx(0, alice, bob, 300)],
        BlockHeight(0),
        chain.genesis_hash(),
    )
    .await
    .unwrap();

    assert_eq!(chain.current_block().hash(), block.hash());
    assert_eq!(chain.current_block().number(), BlockHeight(1));

    let (state, _) = chain.state().unwrap();
    assert_eq!(state.balance(&bob), 300);
    assert_eq!(state.balance(&alice), 700);

    let receipts = chain.get_receipts(&block.hash()).unwrap();
    assert_eq!(receipts.len(), 1);
    assert!(receipts[0].success);
}

#[tokio::test]
async fn test_export_import_reproduces_head_and_root() {
    let alice = addr(1);
    let chain = new_chain(1, false, &[(alice, 1_000)]);

    for nonce in 0..3 {
        seal_and_insert(
            &chain,
            vec![transfer_tx(nonce, alice, addr(9), 10)],
            BlockHeight(0),
            chain.genesis_hash(),
        )
        .await
        .unwrap();
    }

    let exported = chain.export().unwrap();
    assert_eq!(exported.len(), 3);

    let other = new_chain(1, false, &[(alice, 1_000)]);
    other.insert_chain(exported).await.unwrap();

    assert_eq!(other.current_block().hash(), chain.current_block().hash());
    assert_eq!(
        other.current_block().header.state_root,
        chain.current_block().header.state_root
    );
}

#[tokio::test]
async fn test_non_contiguous_insert_rejected() {
    let chain = new_chain(1, false, &[(addr(1), 100)]);
    let genesis = chain.genesis().clone();

    let block_one = Block::new(
        shardline_chain::build_header(
            &genesis,
            BlockHeight(0),
            Hash::ZERO,
            ShardId(1),
            chain.gas_limit(),
            vec![],
            now_unix(),
        ),
        vec![],
    );
    // Skip a height.
    let mut far_header = shardline_chain::build_header(
        &block_one,
        BlockHeight(0),
        Hash::ZERO,
        ShardId(1),
        chain.gas_limit(),
        vec![],
        now_unix() + 1,
    );
    far_header.number = BlockHeight(5);
    let far_block = Block::new(far_header, vec![]);

    let failure = chain
        .insert_chain(vec![block_one, far_block])
        .await
        .unwrap_err();
    assert_eq!(failure.index, 1);
    assert!(matches!(
        failure.source,
        BlockError::NonContiguousInsert { index: 1 }
    ));
}

#[tokio::test]
async fn test_future_block_buffered_within_window() {
    let chain = new_chain(1, false, &[]);
    let genesis = chain.genesis().clone();

    let near_future = Block::new(
        shardline_chain::build_header(
            &genesis,
            BlockHeight(0),
            Hash::ZERO,
            ShardId(1),
            chain.gas_limit(),
            vec![],
            now_unix() + 5,
        ),
        vec![],
    );
    // Accepted into the future buffer, head unchanged.
    chain.insert_chain(vec![near_future]).await.unwrap();
    assert_eq!(chain.current_block().number(), BlockHeight(0));

    let far_future = Block::new(
        shardline_chain::build_header(
            &genesis,
            BlockHeight(0),
            Hash::ZERO,
            ShardId(1),
            chain.gas_limit(),
            vec![],
            now_unix() + 120,
        ),
        vec![],
    );
    let failure = chain.insert_chain(vec![far_future]).await.unwrap_err();
    assert!(matches!(failure.source, BlockError::FutureBlock));
}

#[tokio::test]
async fn test_incompatible_version_forces_resync() {
    let db = Arc::new(MemoryDb::new());
    let genesis = Block::genesis(ShardId(1), 1_000_000);
    BlockChain::write_genesis(db.as_ref(), &genesis);
    shardline_storage::write_chain_version(db.as_ref(), 2);

    let result = BlockChain::new(
        db,
        ChainConfig {
            shard: ShardId(1),
            num_shards: 2,
            ref_mirror: false,
            archive: true,
        },
        Arc::new(DevEngine::new()),
        Arc::new(CrossShardState::new()),
        Arc::new(EventHub::new()),
        DataLog::disabled(),
        None,
    );
    assert!(matches!(result, Err(BlockError::Storage(_))));
}

fn applied_receipt(tx: &Transaction) -> Receipt {
    let mut receipt = Receipt::new(tx.hash(), true, 21_000, 21_000);
    receipt.logs.push(Log {
        address: addr(0xCC),
        data: applied_event_data(true),
        block_hash: Hash::ZERO,
        block_number: BlockHeight(7),
        tx_hash: tx.hash(),
        removed: false,
    });
    receipt
}

#[test]
fn test_state_commit_releases_locks() {
    // GlobalLocks[A] = {0x01: WRITE} under shard 2; a successful commit
    // from shard 2 at reference height 7 empties both tables.
    let chain = new_chain(0, false, &[]);
    let shared = chain.shared();

    let contract = addr(0xA0);
    let mut set = ContractRwSet::new(contract);
    set.add_read(slot(0x01));
    set.add_write(slot(0x01));
    let mut rw_sets = ShardRwSets::new();
    rw_sets.insert(ShardId(2), vec![set]);
    shared.locks.write().add_global(&rw_sets);
    assert!(shared.locks.read().global_contains(&contract));

    let commit = Commitment {
        shard: ShardId(2),
        block_num: BlockHeight(9),
        ref_num: BlockHeight(5),
        state_root: Hash::from_bytes(b"R"),
        block_hash: Hash::from_bytes(b"H"),
    };
    let tx = Transaction::new(
        TxKind::StateCommit,
        0,
        ShardId(2),
        addr(0xCC),
        0,
        100_000,
        0,
        encode_state_commit(&commit),
    )
    .with_sender(addr(0x77));

    let mut ref_block = Block::genesis(ShardId(0), 80_000_000);
    ref_block.header.number = BlockHeight(7);
    ref_block.transactions = vec![tx.clone()];

    chain.update_ref_status(&ref_block, &[applied_receipt(&tx)]);

    let tables = shared.locks.read();
    assert!(!tables.global_contains(&contract));
    assert!(tables.shard_contracts(ShardId(2)).is_none());
    drop(tables);
    assert_eq!(shared.last_commit(ShardId(2)).unwrap().block_num, BlockHeight(9));
}

#[test]
fn test_cross_tx_adds_global_locks() {
    let chain = new_chain(0, false, &[]);
    let shared = chain.shared();

    let contract = addr(0xB0);
    let mut set = ContractRwSet::new(contract);
    set.add_read(slot(0x02));
    set.add_write(slot(0x02));
    let mut rw_sets = ShardRwSets::new();
    rw_sets.insert(ShardId(2), vec![set]);

    let payload = CrossPayload {
        shards: vec![ShardId(1), ShardId(2)],
        rw_sets,
        inner: Transaction::cross_local(0, addr(1), addr(2), 5, 50_000, 0, vec![]),
    };
    let tx = Transaction::new(
        TxKind::CrossShard,
        0,
        ShardId(0),
        addr(0xCC),
        0,
        500_000,
        0,
        encode_cross_payload(&payload),
    )
    .with_sender(addr(0x88));

    let mut ref_block = Block::genesis(ShardId(0), 80_000_000);
    ref_block.header.number = BlockHeight(4);
    ref_block.transactions = vec![tx.clone()];

    chain.update_ref_status(&ref_block, &[applied_receipt(&tx)]);

    assert!(shared.locks.read().global_contains(&contract));
    assert_eq!(shared.last_ctx(ShardId(1)), BlockHeight(4));
    assert_eq!(shared.last_ctx(ShardId(2)), BlockHeight(4));
    assert!(shared.is_processed(&tx.hash()));
}

/// Foreign-data gating: two cross-shard-locals for reference heights 5 and
/// 6 suspend execution until shard 2's data arrives, then both land in the
/// local block in order.
#[tokio::test]
async fn test_foreign_data_gates_execution() {
    let shared = Arc::new(CrossShardState::new());
    let chain = new_chain_with_shared(1, false, &[], Arc::clone(&shared));

    let remote_sender = addr(0x51);
    let local_recipient = addr(0x52);

    let make_ctx = |ref_num: u64, value: u128| {
        let mut rw_sets = ShardRwSets::new();
        let mut remote = ContractRwSet::new(remote_sender);
        remote.add_read(slot(ref_num as u8));
        rw_sets.insert(ShardId(2), vec![remote]);
        rw_sets.insert(ShardId(1), vec![ContractRwSet::new(local_recipient)]);
        CrossShardTx {
            shards: vec![ShardId(1), ShardId(2)],
            block_num: BlockHeight(ref_num),
            rw_sets,
            inner: Transaction::cross_local(
                ref_num, // distinct nonce per height
                local_recipient,
                remote_sender,
                value,
                50_000,
                0,
                vec![],
            ),
        }
    };

    let ctx5 = make_ctx(5, 10);
    let ctx6 = make_ctx(6, 20);
    let tx5 = ctx5.inner.clone();
    let tx6 = ctx6.inner.clone();

    for (height, ctx) in [(5u64, ctx5), (6u64, ctx6)] {
        let ref_num = BlockHeight(height);
        shared.add_pending(ref_num, 0, ctx);
        let cache = shared.foreign.get_or_insert(ref_num, false);
        let pending = shared.pending_at(ref_num).unwrap();
        let ready = cache.init_keys(ShardId(1), &pending, &Default::default());
        assert!(!ready);
    }

    let build = {
        let chain = Arc::clone(&chain);
        tokio::spawn(async move {
            seal_and_insert(&chain, vec![tx5, tx6], BlockHeight(6), Hash::ZERO).await
        })
    };

    // Give the build a moment to reach the suspension point.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!build.is_finished());

    for height in [5u64, 6u64] {
        shared.add_foreign_data(
            BlockHeight(height),
            ShardId(2),
            &[KeyVal {
                addr: remote_sender,
                balance: 1_000,
                nonce: 0,
                values: vec![Hash::ZERO],
            }],
        );
    }

    let block = build.await.unwrap().unwrap();
    assert_eq!(block.transaction_count(), 2);

    let receipts = chain.get_receipts(&block.hash()).unwrap();
    assert_eq!(receipts.len(), 2);
    assert!(receipts.iter().all(|r| r.success));

    let (state, _) = chain.state().unwrap();
    assert_eq!(state.balance(&local_recipient), 30);
}

/// Mirror parsing registers pending cross-txs, commitments, and prunes on
/// the shard's own commit.
#[test]
fn test_parse_ref_block_tracks_pending_and_commits() {
    let shared = Arc::new(CrossShardState::new());
    let mirror = new_chain_with_shared(1, true, &[], Arc::clone(&shared));

    let mut rw_sets = ShardRwSets::new();
    rw_sets.insert(ShardId(1), vec![ContractRwSet::new(addr(0x31))]);
    rw_sets.insert(ShardId(2), vec![ContractRwSet::new(addr(0x32))]);
    let cross = Transaction::new(
        TxKind::CrossShard,
        0,
        ShardId(0),
        addr(0xCC),
        0,
        500_000,
        0,
        encode_cross_payload(&CrossPayload {
            shards: vec![ShardId(1), ShardId(2)],
            rw_sets,
            inner: Transaction::cross_local(0, addr(0x31), addr(0x32), 5, 50_000, 0, vec![]),
        }),
    )
    .with_sender(addr(0x12));

    let other_commit = Transaction::new(
        TxKind::StateCommit,
        0,
        ShardId(2),
        addr(0xCC),
        0,
        100_000,
        0,
        encode_state_commit(&Commitment {
            shard: ShardId(2),
            block_num: BlockHeight(4),
            ref_num: BlockHeight(2),
            state_root: Hash::from_bytes(b"other"),
            block_hash: Hash::from_bytes(b"otherh"),
        }),
    )
    .with_sender(addr(0x13));

    let mut ref_block = Block::genesis(ShardId(0), 80_000_000);
    ref_block.header.number = BlockHeight(3);
    ref_block.transactions = vec![cross.clone(), other_commit.clone()];

    mirror.parse_ref_block(
        &ref_block,
        &[applied_receipt(&cross), applied_receipt(&other_commit)],
    );

    assert!(shared.ctx_exists(BlockHeight(3)));
    // The cache was created and needs shard 2's data.
    let (cache, ready) = shared.foreign.get(BlockHeight(3)).unwrap();
    assert!(!ready);
    assert_eq!(cache.progress(), (0, 1));

    // Our own commit at a later height prunes everything below it.
    let own_commit = Transaction::new(
        TxKind::StateCommit,
        0,
        ShardId(1),
        addr(0xCC),
        0,
        100_000,
        0,
        encode_state_commit(&Commitment {
            shard: ShardId(1),
            block_num: BlockHeight(8),
            ref_num: BlockHeight(5),
            state_root: Hash::from_bytes(b"mine"),
            block_hash: Hash::from_bytes(b"mineh"),
        }),
    )
    .with_sender(addr(0x14));

    let mut later_block = Block::genesis(ShardId(0), 80_000_000);
    later_block.header.number = BlockHeight(6);
    later_block.transactions = vec![own_commit.clone()];
    mirror.parse_ref_block(&later_block, &[applied_receipt(&own_commit)]);

    assert_eq!(shared.commit_num(), BlockHeight(8));
    assert!(!shared.ctx_exists(BlockHeight(3)));
    assert!(shared.foreign.get(BlockHeight(3)).is_none());
}
