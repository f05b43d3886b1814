//! Price-then-nonce transaction ordering for block assembly.

use crate::{Address, Transaction};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};

/// Head transaction of one account inside the price heap.
struct HeadTx {
    tx: Transaction,
    from: Address,
}

impl PartialEq for HeadTx {
    fn eq(&self, other: &Self) -> bool {
        self.tx.gas_price == other.tx.gas_price
    }
}

impl Eq for HeadTx {}

impl PartialOrd for HeadTx {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeadTx {
    fn cmp(&self, other: &Self) -> Ordering {
        // Highest price first; ties broken by sender for determinism.
        self.tx
            .gas_price
            .cmp(&other.tx.gas_price)
            .then_with(|| other.from.cmp(&self.from))
    }
}

/// A set of transactions that yields them in profit-maximising order while
/// honouring per-account nonces.
///
/// Accounts contribute their transactions in nonce order; across accounts
/// the next transaction is the one with the highest gas price. `pop`
/// abandons an account (used when its head cannot be executed, so later
/// nonces cannot either); `shift` advances it.
pub struct TxsByPriceAndNonce {
    txs: HashMap<Address, VecDeque<Transaction>>,
    heads: BinaryHeap<HeadTx>,
}

impl TxsByPriceAndNonce {
    /// Build the ordered set from per-account nonce-sorted transactions.
    pub fn new(pending: HashMap<Address, Vec<Transaction>>) -> Self {
        let mut txs = HashMap::with_capacity(pending.len());
        let mut heads = BinaryHeap::with_capacity(pending.len());

        for (from, account_txs) in pending {
            let mut queue: VecDeque<Transaction> = account_txs.into();
            if let Some(head) = queue.pop_front() {
                heads.push(HeadTx { tx: head, from });
                txs.insert(from, queue);
            }
        }

        Self { txs, heads }
    }

    /// Peek at the next transaction by price.
    pub fn peek(&self) -> Option<&Transaction> {
        self.heads.peek().map(|head| &head.tx)
    }

    /// Number of accounts still contributing transactions.
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    /// Whether the set is drained.
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Replace the current best head with the next one from the same account.
    pub fn shift(&mut self) {
        if let Some(head) = self.heads.pop() {
            if let Some(queue) = self.txs.get_mut(&head.from) {
                if let Some(next) = queue.pop_front() {
                    self.heads.push(HeadTx {
                        tx: next,
                        from: head.from,
                    });
                }
            }
        }
    }

    /// Remove the best transaction without replacing it, discarding the
    /// whole account.
    pub fn pop(&mut self) {
        if let Some(head) = self.heads.pop() {
            self.txs.remove(&head.from);
        }
    }
}
