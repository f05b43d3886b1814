//! In-memory account state with snapshot/revert and a deterministic root.
//!
//! Stands in for the external state trie: the engine only needs balances,
//! nonces, code and storage slots, plus the ability to snapshot around a
//! transaction and to persist/reopen a state by its root.

use sbor::prelude::*;
use shardline_storage::KeyValue;
use shardline_types::{Address, Hash};
use std::collections::BTreeMap;
use thiserror::Error;

const STATE_PREFIX: &[u8] = b"st";

/// One account's state.
#[derive(Debug, Clone, Default, PartialEq, Eq, BasicSbor)]
pub struct Account {
    /// Balance in the smallest unit.
    pub balance: u128,

    /// Transaction count.
    pub nonce: u64,

    /// Contract code, empty for plain accounts.
    pub code: Vec<u8>,

    /// Storage slots.
    pub storage: BTreeMap<Hash, Hash>,
}

/// State errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// No state stored under the requested root.
    #[error("no state stored under root {0}")]
    UnknownRoot(Hash),

    /// A stored state failed to decode.
    #[error("corrupt state under root {0}")]
    Corrupt(Hash),
}

/// A snapshot handle returned by [`StateDb::snapshot`].
pub type Snapshot = usize;

/// Mutable account state with a pre-image journal for revert.
///
/// Every mutation records the touched account's previous value; reverting
/// replays the journal backwards to the snapshot mark.
#[derive(Debug, Clone, Default)]
pub struct StateDb {
    accounts: BTreeMap<Address, Account>,
    journal: Vec<(Address, Option<Account>)>,
}

impl StateDb {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the state stored under a root.
    pub fn open(db: &dyn KeyValue, root: &Hash) -> Result<Self, StateError> {
        // The empty state is addressable without having been stored.
        let empty = StateDb::new();
        if *root == empty.root() {
            return Ok(empty);
        }
        let mut key = STATE_PREFIX.to_vec();
        key.extend_from_slice(root.as_bytes());
        let bytes = db.get(&key).ok_or(StateError::UnknownRoot(*root))?;
        let accounts: BTreeMap<Address, Account> =
            basic_decode(&bytes).map_err(|_| StateError::Corrupt(*root))?;
        Ok(Self {
            accounts,
            journal: vec![],
        })
    }

    /// Persist the state under its root and return the root.
    pub fn commit(&mut self, db: &dyn KeyValue) -> Hash {
        self.journal.clear();
        let root = self.root();
        let mut key = STATE_PREFIX.to_vec();
        key.extend_from_slice(root.as_bytes());
        let bytes =
            basic_encode(&self.accounts).expect("state serialization should never fail");
        db.put(&key, &bytes);
        root
    }

    /// Remove the state stored under a root. Used by the retention GC.
    pub fn delete(db: &dyn KeyValue, root: &Hash) {
        let mut key = STATE_PREFIX.to_vec();
        key.extend_from_slice(root.as_bytes());
        db.delete(&key);
    }

    /// Whether a state is stored under a root.
    pub fn exists_at(db: &dyn KeyValue, root: &Hash) -> bool {
        if *root == StateDb::new().root() {
            return true;
        }
        let mut key = STATE_PREFIX.to_vec();
        key.extend_from_slice(root.as_bytes());
        db.has(&key)
    }

    /// Deterministic root over the full account contents.
    pub fn root(&self) -> Hash {
        let bytes =
            basic_encode(&self.accounts).expect("state serialization should never fail");
        Hash::from_bytes(&bytes)
    }

    fn touch(&mut self, addr: Address) -> &mut Account {
        self.journal.push((addr, self.accounts.get(&addr).cloned()));
        self.accounts.entry(addr).or_default()
    }

    /// Mark the current journal position.
    pub fn snapshot(&self) -> Snapshot {
        self.journal.len()
    }

    /// Undo every mutation after a snapshot mark.
    pub fn revert_to(&mut self, snapshot: Snapshot) {
        while self.journal.len() > snapshot {
            let (addr, prev) = self.journal.pop().expect("journal length checked");
            match prev {
                Some(account) => {
                    self.accounts.insert(addr, account);
                }
                None => {
                    self.accounts.remove(&addr);
                }
            }
        }
    }

    /// Whether an account exists.
    pub fn exists(&self, addr: &Address) -> bool {
        self.accounts.contains_key(addr)
    }

    /// Account balance, zero for fresh accounts.
    pub fn balance(&self, addr: &Address) -> u128 {
        self.accounts.get(addr).map(|a| a.balance).unwrap_or(0)
    }

    /// Account nonce, zero for fresh accounts.
    pub fn nonce(&self, addr: &Address) -> u64 {
        self.accounts.get(addr).map(|a| a.nonce).unwrap_or(0)
    }

    /// Contract code.
    pub fn code(&self, addr: &Address) -> Vec<u8> {
        self.accounts
            .get(addr)
            .map(|a| a.code.clone())
            .unwrap_or_default()
    }

    /// Storage slot value, zero hash for unset slots.
    pub fn storage(&self, addr: &Address, key: &Hash) -> Hash {
        self.accounts
            .get(addr)
            .and_then(|a| a.storage.get(key))
            .copied()
            .unwrap_or(Hash::ZERO)
    }

    /// Credit an account.
    pub fn add_balance(&mut self, addr: Address, amount: u128) {
        let account = self.touch(addr);
        account.balance = account.balance.saturating_add(amount);
    }

    /// Debit an account. Returns false (leaving state untouched) on
    /// insufficient funds.
    pub fn sub_balance(&mut self, addr: Address, amount: u128) -> bool {
        if self.balance(&addr) < amount {
            return false;
        }
        let account = self.touch(addr);
        account.balance -= amount;
        true
    }

    /// Set an account's nonce.
    pub fn set_nonce(&mut self, addr: Address, nonce: u64) {
        self.touch(addr).nonce = nonce;
    }

    /// Increment an account's nonce.
    pub fn increment_nonce(&mut self, addr: Address) {
        let account = self.touch(addr);
        account.nonce += 1;
    }

    /// Install contract code.
    pub fn set_code(&mut self, addr: Address, code: Vec<u8>) {
        self.touch(addr).code = code;
    }

    /// Write a storage slot.
    pub fn set_storage(&mut self, addr: Address, key: Hash, value: Hash) {
        self.touch(addr).storage.insert(key, value);
    }

    /// Number of accounts.
    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_storage::MemoryDb;

    fn addr(byte: u8) -> Address {
        Address([byte; 20])
    }

    #[test]
    fn test_snapshot_revert() {
        let mut state = StateDb::new();
        state.add_balance(addr(1), 100);

        let snap = state.snapshot();
        state.sub_balance(addr(1), 40);
        state.add_balance(addr(2), 40);
        state.increment_nonce(addr(1));
        assert_eq!(state.balance(&addr(1)), 60);

        state.revert_to(snap);
        assert_eq!(state.balance(&addr(1)), 100);
        assert_eq!(state.nonce(&addr(1)), 0);
        assert!(!state.exists(&addr(2)));
    }

    #[test]
    fn test_root_depends_on_contents() {
        let mut a = StateDb::new();
        let mut b = StateDb::new();
        assert_eq!(a.root(), b.root());

        a.add_balance(addr(1), 1);
        assert_ne!(a.root(), b.root());

        b.add_balance(addr(1), 1);
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn test_commit_open_roundtrip() {
        let db = MemoryDb::new();
        let mut state = StateDb::new();
        state.add_balance(addr(1), 55);
        state.set_storage(addr(1), Hash::from_bytes(b"k"), Hash::from_bytes(b"v"));
        let root = state.commit(&db);

        let reopened = StateDb::open(&db, &root).unwrap();
        assert_eq!(reopened.balance(&addr(1)), 55);
        assert_eq!(
            reopened.storage(&addr(1), &Hash::from_bytes(b"k")),
            Hash::from_bytes(b"v")
        );
        assert_eq!(reopened.root(), root);
    }

    #[test]
    fn test_open_empty_root_without_store() {
        let db = MemoryDb::new();
        let empty_root = StateDb::new().root();
        assert!(StateDb::open(&db, &empty_root).is_ok());
        assert!(StateDb::open(&db, &Hash::from_bytes(b"nope")).is_err());
    }

    #[test]
    fn test_sub_balance_insufficient() {
        let mut state = StateDb::new();
        state.add_balance(addr(1), 10);
        assert!(!state.sub_balance(addr(1), 11));
        assert_eq!(state.balance(&addr(1)), 10);
    }
}
