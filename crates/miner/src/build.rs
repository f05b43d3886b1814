//! Block assembly: environment construction, transaction commitment,
//! state-commit filtering and cross-shard admission.

use crate::recommit::IntervalAdjust;
use crate::worker::{
    Environment, Inner, NewWorkReq, Task, INTERRUPT_NEW_HEAD, INTERRUPT_NONE, INTERRUPT_RESUBMIT,
};
use serde::Deserialize;
use shardline_chain::{apply_transaction, build_header, now_unix, ExecEnv, ExecError};
use shardline_codec::{decode_cross_rw_sets, decode_state_commit};
use shardline_foreign::{CrossChanges, DataCache};
use shardline_locks::LockTables;
use shardline_state::{GasPool, TX_GAS};
use shardline_types::{
    Address, BlockHeight, Receipt, Transaction, TxKind, TxsByPriceAndNonce,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// The on-disk init-contracts bundle deployed in block 1.
#[derive(Debug, Deserialize)]
struct InitContracts {
    contracts: Vec<InitContract>,
}

#[derive(Debug, Deserialize)]
struct InitContract {
    nonce: u64,
    balance: u128,
    #[serde(rename = "code_hex")]
    code: String,
}

impl Inner {
    /// Generate a new sealing task based on the current parent block.
    pub(crate) async fn commit_new_work(
        &self,
        current: &mut Option<Environment>,
        req: NewWorkReq,
    ) {
        let tstart = Instant::now();
        let parent = self.chain.current_block();

        let mut timestamp = req.timestamp;
        if parent.header.timestamp >= timestamp {
            timestamp = parent.header.timestamp + 1;
        }
        // Don't run off into the future.
        let now = now_unix();
        if timestamp > now + 1 {
            let wait = Duration::from_secs(timestamp - now);
            info!(?wait, "mining too far in the future");
            tokio::time::sleep(wait).await;
        }

        let (ref_number, ref_hash) = *self.ref_head.lock();
        let mut header = build_header(
            &parent,
            ref_number,
            ref_hash,
            self.shard,
            self.gas_limit,
            self.extra.lock().clone(),
            timestamp,
        );

        // Only set the coinbase if the engine is running, avoiding
        // spurious rewards.
        if self.is_running() {
            let coinbase = *self.coinbase.lock();
            if coinbase == Address::ZERO {
                error!("refusing to mine without etherbase");
                return;
            }
            header.coinbase = coinbase;
        }
        if let Err(err) = self.engine.prepare(self.chain.as_ref(), &mut header) {
            error!(%err, "failed to prepare header for mining");
            return;
        }

        let (state, private) = match self.chain.state_at(&parent.header.state_root) {
            Ok(states) => states,
            Err(err) => {
                error!(%err, "failed to create mining context");
                return;
            }
        };
        let env = current.insert(Environment {
            state,
            private,
            gas_pool: GasPool::new(self.gas_limit),
            gas_used: 0,
            header,
            tcount: 0,
            txs: vec![],
            receipts: vec![],
            private_receipts: vec![],
        });

        // Re-execute every covered reference height's pending cross-shard
        // locals, waiting for foreign data where it has not arrived.
        if !self.shard.is_reference() {
            let start = parent.ref_number().next();
            let end = env.header.ref_number;
            let mut curr = start;
            let mut foreign_rx = self.shared.subscribe_foreign();
            while curr <= end {
                let cache = 'wait: loop {
                    match self.shared.foreign.get(curr) {
                        Some((cache, true)) => break 'wait Some(cache),
                        Some((_, false)) => {
                            use tokio::sync::broadcast::error::RecvError;
                            match foreign_rx.recv().await {
                                Ok(_) | Err(RecvError::Lagged(_)) => continue 'wait,
                                Err(RecvError::Closed) => break 'wait None,
                            }
                        }
                        None => break 'wait None,
                    }
                };
                if let Some(cache) = cache {
                    self.commit_pending_block(env, curr, &cache);
                }
                curr = curr.next();
            }
            debug!(ref_num = end.0, "finished processing pending cross-shard work");
        }

        // The first block deploys the init-contracts bundle.
        if env.header.number.0 == 1 {
            if self.commit_init_contracts(env, Some(req.interrupt.as_ref())) {
                return;
            }
            self.commit_work(env, tstart, true).await;
            return;
        }

        if !req.no_empty {
            // Issue an empty block first so sealing can start without
            // waiting for transaction execution.
            self.commit_work(env, tstart, false).await;
        }

        let mut pending = self.pool.pending();
        pending.retain(|_, txs| !txs.is_empty());
        if pending.is_empty() {
            self.update_snapshot(env);
            return;
        }

        if self.shard.is_reference() {
            // The admission test and its tentative locks must be atomic
            // with reference-chain commit processing.
            let mut tables = self.shared.locks.write();
            tables.reset_tentative();

            let mut state_txs: HashMap<Address, Vec<Transaction>> = HashMap::new();
            let mut cross_txs = pending;
            for addr in self.pool.shards() {
                if let Some(txs) = cross_txs.remove(&addr) {
                    if !txs.is_empty() {
                        state_txs.insert(addr, txs);
                    }
                }
            }

            if !state_txs.is_empty() {
                let commits = self.new_valid_state_commitments(state_txs, &mut tables);
                let mut set = TxsByPriceAndNonce::new(commits);
                if self.commit_transactions(env, &mut set, Some(req.interrupt.as_ref())) {
                    return;
                }
            }
            if !cross_txs.is_empty() {
                let ctxs = self.new_valid_cross_transactions(cross_txs, &mut tables);
                let mut set = TxsByPriceAndNonce::new(ctxs);
                if self.commit_transactions(env, &mut set, Some(req.interrupt.as_ref())) {
                    error!("cross-shard commitment interrupted by new head");
                    return;
                }
            }
            drop(tables);
        } else {
            let mut local_txs: HashMap<Address, Vec<Transaction>> = HashMap::new();
            let mut remote_txs = pending;
            for addr in self.pool.locals() {
                if let Some(txs) = remote_txs.remove(&addr) {
                    if !txs.is_empty() {
                        local_txs.insert(addr, txs);
                    }
                }
            }
            if !local_txs.is_empty() {
                let mut set = TxsByPriceAndNonce::new(local_txs);
                if self.commit_transactions(env, &mut set, Some(req.interrupt.as_ref())) {
                    return;
                }
            }
            if !remote_txs.is_empty() {
                let mut set = TxsByPriceAndNonce::new(remote_txs);
                if self.commit_transactions(env, &mut set, Some(req.interrupt.as_ref())) {
                    return;
                }
            }
        }

        self.commit_work(env, tstart, true).await;
    }

    /// Apply the pending cross-shard-local transactions of one reference
    /// height to the environment.
    pub(crate) fn commit_pending_block(
        &self,
        env: &mut Environment,
        ref_num: BlockHeight,
        cache: &DataCache,
    ) {
        let Some(pending) = self.shared.pending_at(ref_num) else {
            return;
        };
        for ctx in pending.iter() {
            let tx = ctx.inner.clone();
            self.commit_pending_transaction(env, tx, cache);
            env.tcount += 1;
        }
        debug!(num = ref_num.0, "finished processing block");
    }

    fn commit_pending_transaction(&self, env: &mut Environment, tx: Transaction, cache: &DataCache) {
        let snap = env.state.snapshot();
        let private_snap = env.private.snapshot();
        let mut changes = CrossChanges::new();

        let mut exec_env = ExecEnv {
            header: &env.header,
            state: &mut env.state,
            private: &mut env.private,
            gas_pool: &mut env.gas_pool,
            gas_used: &mut env.gas_used,
            commit_address: self.chain.commit_address(),
            my_shard: self.shard,
        };

        match apply_transaction(&mut exec_env, Some(cache), &mut changes, &tx) {
            Ok((receipt, private_receipt)) => {
                env.txs.push(tx);
                env.receipts.push(receipt);
                if let Some(private_receipt) = private_receipt {
                    env.private_receipts.push(private_receipt);
                }
            }
            Err(err) => {
                env.state.revert_to(snap);
                env.private.revert_to(private_snap);
                debug!(hash = %tx.hash(), %err, "skipping pending transaction");

                // Record the failure so the block carries the attempt.
                let receipt = Receipt::new(tx.hash(), false, tx.gas_limit, env.gas_used);
                env.txs.push(tx);
                env.receipts.push(receipt);
            }
        }
    }

    /// Commit transactions from the ordered set until gas or the set runs
    /// out, polling the interrupt flag between transactions.
    ///
    /// Returns true when the build was aborted by a new head; resubmit
    /// interrupts submit the partial work and return false after sending
    /// interval feedback.
    pub(crate) fn commit_transactions(
        &self,
        env: &mut Environment,
        txs: &mut TxsByPriceAndNonce,
        interrupt: Option<&AtomicI32>,
    ) -> bool {
        loop {
            if let Some(flag) = interrupt {
                let signal = flag.load(Ordering::Acquire);
                if signal != INTERRUPT_NONE {
                    if signal == INTERRUPT_RESUBMIT {
                        let ratio = (env.header.gas_limit - env.gas_pool.gas()) as f64
                            / env.header.gas_limit as f64;
                        self.send_adjust(IntervalAdjust {
                            ratio: ratio.max(0.1),
                            inc: true,
                        });
                    }
                    return signal == INTERRUPT_NEW_HEAD;
                }
            }
            if env.gas_pool.gas() < TX_GAS {
                debug!(have = env.gas_pool.gas(), want = TX_GAS, "not enough gas for further transactions");
                break;
            }
            let Some(tx) = txs.peek().cloned() else {
                break;
            };
            let from = tx.from();

            let snap = env.state.snapshot();
            let private_snap = env.private.snapshot();
            let mut changes = CrossChanges::new();
            let mut exec_env = ExecEnv {
                header: &env.header,
                state: &mut env.state,
                private: &mut env.private,
                gas_pool: &mut env.gas_pool,
                gas_used: &mut env.gas_used,
                commit_address: self.chain.commit_address(),
                my_shard: self.shard,
            };

            match apply_transaction(&mut exec_env, None, &mut changes, &tx) {
                Ok((receipt, private_receipt)) => {
                    env.txs.push(tx);
                    env.receipts.push(receipt);
                    if let Some(private_receipt) = private_receipt {
                        env.private_receipts.push(private_receipt);
                    }
                    env.tcount += 1;
                    txs.shift();
                }
                Err(ExecError::GasLimitReached) => {
                    // Pop the out-of-gas account without shifting in the
                    // next nonce.
                    env.state.revert_to(snap);
                    env.private.revert_to(private_snap);
                    debug!(sender = %from, "gas limit exceeded for current block");
                    txs.pop();
                }
                Err(ExecError::NonceTooLow) => {
                    // Head-notification race with the pool, shift.
                    env.state.revert_to(snap);
                    env.private.revert_to(private_snap);
                    debug!(sender = %from, nonce = tx.nonce, "skipping transaction with low nonce");
                    txs.shift();
                }
                Err(ExecError::NonceTooHigh) => {
                    // Reorg race with the pool, skip the account.
                    env.state.revert_to(snap);
                    env.private.revert_to(private_snap);
                    debug!(sender = %from, nonce = tx.nonce, "skipping account with high nonce");
                    txs.pop();
                }
                Err(err) => {
                    env.state.revert_to(snap);
                    env.private.revert_to(private_snap);
                    debug!(hash = %tx.hash(), %err, "transaction failed, account skipped");
                    txs.shift();
                }
            }
        }

        // Ask the resubmit loop to shrink back toward the user minimum.
        if interrupt.is_some() {
            self.send_adjust(IntervalAdjust {
                ratio: 0.0,
                inc: false,
            });
        }
        false
    }

    /// Filter competing state commitments down to the admissible best per
    /// shard: strictly newer reference height, or the same height with a
    /// strictly higher committed block, and never reporting a reference
    /// height below the shard's last cross-shard transaction.
    pub(crate) fn new_valid_state_commitments(
        &self,
        state_txs: HashMap<Address, Vec<Transaction>>,
        tables: &mut LockTables,
    ) -> HashMap<Address, Vec<Transaction>> {
        let mut new_commits = HashMap::new();

        for (addr, txs) in state_txs {
            let Some(&shard) = self.addr_shard_map.get(&addr) else {
                warn!(%addr, "state commitment from unknown shard address");
                continue;
            };
            let last_ctx = self.shared.last_ctx(shard);
            let (mut max_ref, mut max_com) = match self.shared.last_commit(shard) {
                Some(commit) => (commit.ref_num, commit.block_num),
                None => (BlockHeight::GENESIS, BlockHeight::GENESIS),
            };

            let mut best: Option<Transaction> = None;
            for tx in txs {
                let Ok(commit) = decode_state_commit(&tx.payload) else {
                    continue;
                };
                // No commit may skip over an unexecuted cross-shard tx.
                if commit.ref_num < last_ctx {
                    continue;
                }
                if commit.ref_num > max_ref {
                    max_ref = commit.ref_num;
                    max_com = commit.block_num;
                    best = Some(tx);
                } else if commit.ref_num == max_ref && commit.block_num > max_com {
                    max_com = commit.block_num;
                    best = Some(tx);
                }
            }

            if let Some(tx) = best {
                debug!(
                    shard = %shard,
                    report = max_ref.0,
                    commit = max_com.0,
                    "adding state commit"
                );
                // The accepted commit will unlock this shard; stop its
                // global locks from conflicting within this attempt.
                tables.mark_released(shard);
                new_commits.insert(addr, vec![tx]);
            }
        }
        new_commits
    }

    /// Admission-check pending cross-shard transactions against the merged
    /// lock view, tentatively locking the sets of everything included.
    pub(crate) fn new_valid_cross_transactions(
        &self,
        cross_txs: HashMap<Address, Vec<Transaction>>,
        tables: &mut LockTables,
    ) -> HashMap<Address, Vec<Transaction>> {
        let mut admissible: HashMap<Address, Vec<Transaction>> = HashMap::new();
        let (mut seen, mut included, mut others) = (0usize, 0usize, 0usize);

        for (creator, txs) in cross_txs {
            seen += txs.len();
            for tx in txs {
                if tx.kind != TxKind::CrossShard {
                    others += 1;
                    continue;
                }
                if self.shared.is_processed(&tx.hash()) {
                    others += 1;
                    continue;
                }
                let rw_sets = match decode_cross_rw_sets(&tx.payload) {
                    Ok(rw_sets) => rw_sets,
                    Err(err) => {
                        warn!(hash = %tx.hash(), %err, "undecodable cross-shard payload");
                        others += 1;
                        continue;
                    }
                };

                let include = !tables.is_conflicted(&rw_sets);
                if include {
                    tables.admit(&rw_sets);
                    admissible.entry(creator).or_default().push(tx.clone());
                    included += 1;
                }
                self.datalog
                    .append("attempt", format_args!("{} {}", tx.hash(), include));
            }
        }
        info!(seen, included, others, "selected admissible cross-shard transactions");
        admissible
    }

    /// Deploy the on-disk init-contracts bundle into the environment.
    /// Returns true when the build must be abandoned.
    pub(crate) fn commit_init_contracts(
        &self,
        env: &mut Environment,
        interrupt: Option<&AtomicI32>,
    ) -> bool {
        let path = self
            .init_contracts_dir
            .join(format!("init-contracts{}.json", self.shard.0));
        let bundle = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(path = %path.display(), %err, "failed to read init-contracts file");
                return true;
            }
        };
        let contracts: InitContracts = match serde_json::from_slice(&bundle) {
            Ok(contracts) => contracts,
            Err(err) => {
                error!(path = %path.display(), %err, "invalid init-contracts file");
                return true;
            }
        };

        let deploy_gas = env.header.gas_limit / 2;
        for contract in &contracts.contracts {
            if let Some(flag) = interrupt {
                let signal = flag.load(Ordering::Acquire);
                if signal != INTERRUPT_NONE {
                    if signal == INTERRUPT_RESUBMIT {
                        let ratio = (env.header.gas_limit - env.gas_pool.gas()) as f64
                            / env.header.gas_limit as f64;
                        self.send_adjust(IntervalAdjust {
                            ratio: ratio.max(0.1),
                            inc: true,
                        });
                    }
                    return signal == INTERRUPT_NEW_HEAD;
                }
            }

            let code = match hex::decode(contract.code.trim_start_matches("0x")) {
                Ok(code) => code,
                Err(err) => {
                    error!(%err, "invalid contract code in init bundle");
                    continue;
                }
            };
            let tx = Transaction::contract_creation(
                TxKind::ContractInit,
                contract.nonce,
                self.shard,
                contract.balance,
                deploy_gas,
                0,
                code,
            );

            let snap = env.state.snapshot();
            let private_snap = env.private.snapshot();
            let mut changes = CrossChanges::new();
            let mut exec_env = ExecEnv {
                header: &env.header,
                state: &mut env.state,
                private: &mut env.private,
                gas_pool: &mut env.gas_pool,
                gas_used: &mut env.gas_used,
                commit_address: self.chain.commit_address(),
                my_shard: self.shard,
            };

            match apply_transaction(&mut exec_env, None, &mut changes, &tx) {
                Ok((receipt, _)) => {
                    env.txs.push(tx);
                    env.receipts.push(receipt);
                    env.tcount += 1;
                }
                Err(err) => {
                    env.state.revert_to(snap);
                    env.private.revert_to(private_snap);
                    error!(%err, "contract initialization failed");
                }
            }
        }

        if self.shard.is_reference() && env.tcount > 0 {
            if let Some(addr) = env.receipts.first().and_then(|r| r.contract_address) {
                self.chain.set_commit_address(addr);
            }
        }
        if interrupt.is_some() {
            self.send_adjust(IntervalAdjust {
                ratio: 0.0,
                inc: false,
            });
        }
        false
    }

    /// Assemble the final block from the environment, hand it to the
    /// sealing engine and optionally refresh the pending snapshot.
    pub(crate) async fn commit_work(&self, env: &Environment, start: Instant, update: bool) {
        // Deep copies: the sealing task must not race the next attempt.
        let receipts = env.receipts.clone();
        let private_receipts = env.private_receipts.clone();
        let mut state = env.state.clone();
        let private = env.private.clone();

        let mut header = env.header.clone();
        header.gas_used = env.gas_used;
        let block = self.engine.finalize(header, &mut state, env.txs.clone());

        if self.is_running() {
            let number = block.number();
            let task = Task {
                receipts,
                private_receipts,
                state,
                private,
                block: block.clone(),
                created_at: Instant::now(),
            };
            if self.task_tx.send(task).await.is_ok() {
                self.unconfirmed
                    .lock()
                    .shift(BlockHeight(number.0.saturating_sub(1)));
                info!(
                    number = number.0,
                    sealhash = %self.engine.seal_hash(&block.header),
                    root = %block.header.state_root,
                    txs = env.tcount,
                    gas = block.header.gas_used,
                    elapsed = ?start.elapsed(),
                    "commit new mining work"
                );
            }
        }
        if update {
            self.update_snapshot(env);
        }
    }
}
