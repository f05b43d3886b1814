//! Role-dependent post-insert processing.
//!
//! The reference shard walks its own receipts to maintain the global lock
//! tables and the per-shard commit/cross-tx high-water marks. Worker
//! shards walk their mirror of the reference chain to learn about new
//! cross-shard transactions and commitments, and keep their local chain's
//! measurement files.

use crate::blockchain::BlockChain;
use shardline_codec::{decode_cross_payload, decode_state_commit, receipt_applied};
use shardline_types::{Block, CrossShardTx, Receipt, TxKind};
use tracing::{debug, info, warn};

impl BlockChain {
    /// Reference shard: update lock tables and commit/cross-tx marks from
    /// an executed reference block.
    pub fn update_ref_status(&self, block: &Block, receipts: &[Receipt]) {
        let shared = self.shared();
        let mut tables = shared.locks.write();
        let block_num = block.number();

        for (tx, receipt) in block.transactions.iter().zip(receipts) {
            self.datalog().append(
                "tdata",
                format_args!(
                    "{} {} {} {} {}",
                    block_num.0,
                    tx.hash(),
                    tx.kind.tag(),
                    receipt.success,
                    receipt.gas_used
                ),
            );

            if !receipt_applied(receipt) {
                debug!(hash = %tx.hash(), kind = %tx.kind, success = receipt.success, "skipping transaction");
                continue;
            }

            match tx.kind {
                TxKind::CrossShard => {
                    shared.mark_processed(tx.hash());
                    match decode_cross_payload(&tx.payload) {
                        Ok(payload) => {
                            for shard in &payload.shards {
                                shared.set_last_ctx(*shard, block_num);
                            }
                            tables.add_global(&payload.rw_sets);
                            self.datalog().append(
                                "ctxtime",
                                format_args!(
                                    "{} {} {}",
                                    block_num.0,
                                    tx.hash(),
                                    payload.shards.len()
                                ),
                            );
                        }
                        Err(err) => {
                            warn!(hash = %tx.hash(), %err, "undecodable cross-shard payload")
                        }
                    }
                }
                TxKind::StateCommit => match decode_state_commit(&tx.payload) {
                    Ok(commit) => {
                        tables.release(commit.shard);
                        let accept = shared
                            .last_commit(commit.shard)
                            .map(|last| commit.ref_num >= last.ref_num)
                            .unwrap_or(true);
                        if accept {
                            shared.set_last_commit(commit.shard, commit);
                            self.datalog().append(
                                "sctime",
                                format_args!(
                                    "{} {} {} {} {} {}",
                                    commit.shard.0,
                                    commit.block_num.0,
                                    commit.ref_num.0,
                                    commit.state_root,
                                    commit.block_hash,
                                    tx.hash()
                                ),
                            );
                        }
                    }
                    Err(err) => {
                        warn!(hash = %tx.hash(), %err, "undecodable state commit")
                    }
                },
                _ => {
                    debug!(hash = %tx.hash(), kind = %tx.kind, "not a coordination transaction");
                }
            }
        }

        self.datalog().append(
            "rtime",
            format_args!(
                "{} {} {} {} {} {}",
                block_num.0,
                block.transaction_count(),
                block.hash(),
                block.header.state_root,
                block.header.gas_limit,
                block.header.gas_used
            ),
        );
    }

    /// Worker mirror: extract commitments and cross-shard transactions
    /// from a reference block, then initialise the foreign-data cache for
    /// its height.
    pub fn parse_ref_block(&self, block: &Block, receipts: &[Receipt]) {
        let shared = self.shared();
        let my_shard = self.config().shard;
        let num_shards = self.config().num_shards;
        let ref_num = block.number();
        let mut untouched = true;

        // Carry the previous height's commitments forward.
        let _ = shared.commitments_at(ref_num, num_shards);

        for (index, (tx, receipt)) in block.transactions.iter().zip(receipts).enumerate() {
            self.datalog().append(
                "tdata",
                format_args!(
                    "{} {} {} {} {}",
                    ref_num.0,
                    tx.hash(),
                    tx.kind.tag(),
                    receipt.success,
                    receipt.gas_used
                ),
            );

            if !receipt_applied(receipt) {
                if matches!(tx.kind, TxKind::CrossShard | TxKind::StateCommit) {
                    info!(
                        hash = %tx.hash(),
                        kind = %tx.kind,
                        success = receipt.success,
                        "unsuccessful transaction execution"
                    );
                }
                continue;
            }

            match tx.kind {
                TxKind::CrossShard => match decode_cross_payload(&tx.payload) {
                    Ok(payload) => {
                        if !payload.shards.contains(&my_shard) {
                            continue;
                        }
                        untouched = false;
                        let ctx = CrossShardTx {
                            shards: payload.shards.clone(),
                            block_num: ref_num,
                            rw_sets: payload.rw_sets,
                            inner: payload.inner,
                        };
                        let inner_hash = ctx.inner.hash();
                        debug!(
                            ref_num = ref_num.0,
                            shards = ?payload.shards,
                            "new cross shard transaction added"
                        );
                        shared.add_pending(ref_num, index as u64, ctx);
                        self.datalog().append(
                            "ctxtime",
                            format_args!(
                                "{} {} {} {}",
                                ref_num.0,
                                tx.hash(),
                                inner_hash,
                                payload.shards.len()
                            ),
                        );
                    }
                    Err(err) => {
                        warn!(hash = %tx.hash(), %err, "undecodable cross-shard payload")
                    }
                },
                TxKind::StateCommit => match decode_state_commit(&tx.payload) {
                    Ok(commit) => {
                        if commit.shard == my_shard {
                            shared.update_my_commit(
                                commit.block_num,
                                commit.ref_num,
                                commit.state_root,
                                commit.block_hash,
                            );
                            info!(
                                commit = commit.block_num.0,
                                report = commit.ref_num.0,
                                reporting = ref_num.0,
                                root = %commit.state_root,
                                "updated latest commit"
                            );
                        } else {
                            shared.add_commitment(ref_num, commit.shard, commit);
                            debug!(
                                shard = %commit.shard,
                                committed = commit.block_num.0,
                                reporting = ref_num.0,
                                "new commit added"
                            );
                        }
                        self.datalog().append(
                            "sctime",
                            format_args!(
                                "{} {} {} {} {} {}",
                                commit.shard.0,
                                commit.block_num.0,
                                commit.ref_num.0,
                                commit.state_root,
                                commit.block_hash,
                                tx.hash()
                            ),
                        );
                    }
                    Err(err) => {
                        warn!(hash = %tx.hash(), %err, "undecodable state commit")
                    }
                },
                _ => {}
            }
        }

        let cache = shared.foreign.get_or_insert(ref_num, untouched);
        if let Some(pending) = shared.pending_at(ref_num) {
            let commits = shared.commitments_at(ref_num, num_shards);
            if cache.init_keys(my_shard, &pending, &commits) {
                shared.post_foreign_ready(ref_num);
            }
        }

        self.datalog().append(
            "rtime",
            format_args!(
                "{} {} {} {} {} {}",
                ref_num.0,
                block.transaction_count(),
                block.hash(),
                block.header.state_root,
                block.header.gas_limit,
                block.header.gas_used
            ),
        );
    }

    /// Worker shard: append the local-chain measurement records for an
    /// inserted or self-mined block.
    pub fn log_block_data(&self, self_mined: bool, block: &Block, receipts: &[Receipt]) {
        let block_num = block.number();
        let ref_num = block.ref_number();
        let block_hash = block.hash();

        for (tx, receipt) in block.transactions.iter().zip(receipts) {
            self.datalog().append(
                "ltdata",
                format_args!(
                    "{} {} {} {} {} {} {}",
                    block_num.0,
                    block_hash,
                    ref_num.0,
                    tx.hash(),
                    tx.kind.tag(),
                    receipt.success,
                    receipt.gas_used
                ),
            );
            if tx.kind == TxKind::CrossShardLocal {
                self.datalog().append(
                    "csltime",
                    format_args!("{} {}", block_num.0, tx.hash()),
                );
            }
        }

        self.datalog().append(
            "lbtime",
            format_args!(
                "{} {} {} {} {} {} {}",
                block_num.0,
                ref_num.0,
                block_hash,
                block.header.state_root,
                block.header.gas_used,
                block.transaction_count(),
                self_mined
            ),
        );
    }
}
