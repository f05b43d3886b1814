//! Transaction application and serial block execution.
//!
//! Execution is deliberately narrow: value transfer, nonces, gas
//! accounting, contract bootstrapping, and the reference-chain
//! coordination calls. Bytecode execution is an external collaborator;
//! the coordination contract's observable behaviour (the applied-flag
//! event) is produced here at its pinned interface.

use crate::error::ExecError;
use shardline_codec::{
    applied_event_data, decode_cross_shards, decode_state_commit,
};
use shardline_foreign::{CrossChanges, DataCache};
use shardline_state::{intrinsic_gas, GasPool, StateDb};
use shardline_types::{
    Address, CachedAccount, Hash, Header, Log, Receipt, ShardId, Transaction, TxKind,
};

/// Mutable execution context threaded through one block's transactions.
pub struct ExecEnv<'a> {
    /// Header of the block under execution.
    pub header: &'a Header,

    /// Public state.
    pub state: &'a mut StateDb,

    /// Private state.
    pub private: &'a mut StateDb,

    /// Remaining block gas.
    pub gas_pool: &'a mut GasPool,

    /// Cumulative gas used so far.
    pub gas_used: &'a mut u64,

    /// Recipient for state-commit transactions, once deployed.
    pub commit_address: Option<Address>,

    /// The executing shard.
    pub my_shard: ShardId,
}

/// Whether an address lives on a remote shard per the foreign-data cache.
fn is_remote(dc: Option<&DataCache>, my_shard: ShardId, addr: &Address) -> Option<bool> {
    dc.map(|cache| match cache.shard_of(addr) {
        Some(shard) => shard != my_shard,
        // Undeclared addresses cannot move funds in a cross-shard context.
        None => true,
    })
}

/// Check whether `addr` can cover `amount`, consulting the foreign cache
/// for remote addresses.
fn can_transfer(
    dc: Option<&DataCache>,
    my_shard: ShardId,
    state: &StateDb,
    addr: &Address,
    amount: u128,
) -> bool {
    match dc {
        Some(cache) => match cache.shard_of(addr) {
            Some(shard) if shard != my_shard => cache.balance_of(addr) >= amount,
            Some(_) => state.balance(addr) >= amount,
            None => false,
        },
        None => state.balance(addr) >= amount,
    }
}

/// Move `amount` from `sender` to `recipient`. Remote balances are debited
/// and credited in the per-execution `changes` overlay, never in public
/// state.
fn transfer(
    dc: Option<&DataCache>,
    changes: &mut CrossChanges,
    my_shard: ShardId,
    state: &mut StateDb,
    sender: Address,
    recipient: Address,
    amount: u128,
) -> Result<(), ExecError> {
    let seed = |cache: &DataCache, state: &StateDb, addr: Address| {
        cache
            .account(&addr)
            .unwrap_or_else(|| CachedAccount::new(addr, state.balance(&addr), state.nonce(&addr)))
    };

    match dc {
        Some(cache) => {
            if is_remote(dc, my_shard, &sender).unwrap_or(false) {
                changes.ensure(sender, || seed(cache, state, sender));
                changes.sub_balance(&sender, amount);
            } else if !state.sub_balance(sender, amount) {
                return Err(ExecError::InsufficientFunds);
            }

            if is_remote(dc, my_shard, &recipient).unwrap_or(false) {
                changes.ensure(recipient, || seed(cache, state, recipient));
                changes.add_balance(&recipient, amount);
            } else {
                state.add_balance(recipient, amount);
            }
        }
        None => {
            if !state.sub_balance(sender, amount) {
                return Err(ExecError::InsufficientFunds);
            }
            state.add_balance(recipient, amount);
        }
    }
    Ok(())
}

/// Synthesize the coordination contract's applied event.
fn coordination_log(env: &ExecEnv<'_>, tx: &Transaction, to: Address, applied: bool) -> Log {
    Log {
        address: to,
        data: applied_event_data(applied),
        block_hash: Hash::ZERO,
        block_number: env.header.number,
        tx_hash: tx.hash(),
        removed: false,
    }
}

/// Apply one transaction against the environment.
///
/// Returns the public receipt and, for private transactions, a private
/// receipt; this system carries no private payloads in-core, so the
/// private slot is always `None` here and exists for the write path's
/// merge discipline.
pub fn apply_transaction(
    env: &mut ExecEnv<'_>,
    dc: Option<&DataCache>,
    changes: &mut CrossChanges,
    tx: &Transaction,
) -> Result<(Receipt, Option<Receipt>), ExecError> {
    if tx.gas_price > 0 {
        return Err(ExecError::InvalidGasPrice);
    }

    // State commitments always call the chain's commit contract.
    let mut tx = tx.clone();
    if tx.kind == TxKind::StateCommit {
        if let Some(addr) = env.commit_address {
            tx = tx.with_recipient(addr);
        }
    }

    let sender = tx.from();
    let remote_sender = tx.kind == TxKind::CrossShardLocal
        && is_remote(dc, env.my_shard, &sender).unwrap_or(false);

    env.gas_pool.sub(tx.gas_limit)?;

    let creation = tx.is_contract_creation();
    let intrinsic = intrinsic_gas(creation, &tx.payload);
    if tx.gas_limit < intrinsic {
        env.gas_pool.add(tx.gas_limit);
        return Err(ExecError::IntrinsicGas);
    }

    // The signature already pins the sender; the nonce orders its
    // transactions. Remote senders are ordered by their home shard.
    if !remote_sender && tx.kind != TxKind::ContractInit {
        let expected = env.state.nonce(&sender);
        if tx.nonce < expected {
            env.gas_pool.add(tx.gas_limit);
            return Err(ExecError::NonceTooLow);
        }
        if tx.nonce > expected {
            env.gas_pool.add(tx.gas_limit);
            return Err(ExecError::NonceTooHigh);
        }
    }

    let gas_used = intrinsic;
    let mut receipt = Receipt::new(tx.hash(), true, 0, 0);

    match tx.kind {
        TxKind::ContractInit => {
            // Genesis bootstrapping mints the declared balance.
            let contract = Address::of_contract(&sender, tx.nonce);
            env.state.set_code(contract, tx.payload.clone());
            env.state.add_balance(contract, tx.value);
            receipt.contract_address = Some(contract);
        }
        _ if creation => {
            if !can_transfer(dc, env.my_shard, env.state, &sender, tx.cost()) {
                env.gas_pool.add(tx.gas_limit);
                return Err(ExecError::InsufficientFunds);
            }
            let contract = Address::of_contract(&sender, tx.nonce);
            transfer(dc, changes, env.my_shard, env.state, sender, contract, tx.value)?;
            env.state.set_code(contract, tx.payload.clone());
            receipt.contract_address = Some(contract);
        }
        _ => {
            if !can_transfer(dc, env.my_shard, env.state, &sender, tx.cost()) {
                env.gas_pool.add(tx.gas_limit);
                return Err(ExecError::InsufficientFunds);
            }
            let to = tx.to.expect("non-creation transaction has a recipient");
            transfer(dc, changes, env.my_shard, env.state, sender, to, tx.value)?;

            // The coordination contract reports through its applied event.
            match tx.kind {
                TxKind::StateCommit => {
                    let applied = decode_state_commit(&tx.payload).is_ok();
                    receipt.success = applied;
                    receipt.logs.push(coordination_log(env, &tx, to, applied));
                }
                TxKind::CrossShard => {
                    let applied = decode_cross_shards(&tx.payload)
                        .map(|shards| !shards.is_empty())
                        .unwrap_or(false);
                    receipt.success = applied;
                    receipt.logs.push(coordination_log(env, &tx, to, applied));
                }
                _ => {}
            }
        }
    }

    if !remote_sender {
        env.state.set_nonce(sender, tx.nonce + 1);
    }

    env.gas_pool.add(tx.gas_limit - gas_used);
    *env.gas_used += gas_used;
    receipt.gas_used = gas_used;
    receipt.cumulative_gas_used = *env.gas_used;

    Ok((receipt, None))
}
