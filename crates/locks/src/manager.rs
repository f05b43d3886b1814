//! Cross-shard concurrency control over `(contract, storage-slot)` keys.
//!
//! Two tables track lock state:
//!
//! 1. **Global locks** are durable decisions derived from reference-chain
//!    execution: a committed cross-shard transaction locks its declared
//!    read/write set until the touched shards publish a state commit.
//!
//! 2. **Tentative locks** are held only for the duration of one
//!    block-assembly attempt, admitting non-conflicting cross-shard
//!    transactions into the block under construction.
//!
//! A shard index maps each shard to the contracts it has locks under, so a
//! state commit releases everything for that shard in one sweep.

use shardline_types::{Address, Hash, ShardId, ShardRwSets};
use std::collections::{HashMap, HashSet};

/// A held write lock. Non-negative values are read counts.
pub const WRITE_LOCKED: i32 = -1;

/// Per-contract slot lock states: read count `>= 0` or [`WRITE_LOCKED`].
pub type SlotLocks = HashMap<Hash, i32>;

/// The lock tables. All mutation happens through [`LockManager`]'s single
/// exclusive guard; holding the guard across a whole admission session makes
/// `check; admit` sequences atomic with reference-chain commit processing.
#[derive(Debug, Default)]
pub struct LockTables {
    /// Durable locks from reference-chain execution.
    global: HashMap<Address, SlotLocks>,

    /// Locks taken during the current block-assembly attempt.
    tentative: HashMap<Address, SlotLocks>,

    /// Which contracts each shard holds global locks under.
    shard_index: HashMap<ShardId, HashSet<Address>>,

    /// Contracts whose shard had a state commit accepted during the current
    /// attempt: their global locks no longer conflict within the attempt.
    released: HashSet<Address>,
}

impl LockTables {
    /// Check a proposed read/write set against both tables.
    ///
    /// Returns `true` when the set conflicts: a requested read meets a held
    /// write, or a requested write meets any held lock.
    pub fn is_conflicted(&self, rw_sets: &ShardRwSets) -> bool {
        for sets in rw_sets.values() {
            for set in sets {
                let mut requested: HashMap<Hash, bool> = HashMap::new();
                for key in &set.reads {
                    requested.insert(*key, false);
                }
                for key in &set.writes {
                    requested.insert(*key, true);
                }
                if self.contract_conflicted(&set.addr, &requested) {
                    return true;
                }
            }
        }
        false
    }

    fn contract_conflicted(&self, addr: &Address, requested: &HashMap<Hash, bool>) -> bool {
        let tentatively_locked = self.tentative.get(addr);
        let globally_locked = self.global.get(addr);

        if tentatively_locked.is_none() && globally_locked.is_none() {
            return false;
        }

        if let Some(slots) = tentatively_locked {
            for (key, requested_write) in requested {
                if let Some(&held) = slots.get(key) {
                    if held < 0 || *requested_write {
                        return true;
                    }
                }
            }
        }

        // Contracts of a shard whose commit was accepted this attempt are
        // treated as already unlocked.
        if !self.released.contains(addr) {
            if let Some(slots) = globally_locked {
                for (key, requested_write) in requested {
                    if let Some(&held) = slots.get(key) {
                        if held < 0 || *requested_write {
                            return true;
                        }
                    }
                }
            }
        }

        false
    }

    /// Take tentative locks for an admitted read/write set: reads increment
    /// the count, writes pin the slot to [`WRITE_LOCKED`].
    pub fn admit(&mut self, rw_sets: &ShardRwSets) {
        for sets in rw_sets.values() {
            for set in sets {
                let slots = self.tentative.entry(set.addr).or_default();
                for key in &set.reads {
                    let status = slots.entry(*key).or_insert(0);
                    *status += 1;
                }
                for key in &set.writes {
                    slots.insert(*key, WRITE_LOCKED);
                }
            }
        }
    }

    /// Record durable locks from a committed cross-shard transaction and
    /// index the touched contracts under their shards. Idempotent per
    /// distinct write slot; read counts accumulate across retries exactly as
    /// the reference chain replays them.
    pub fn add_global(&mut self, rw_sets: &ShardRwSets) {
        for (shard, sets) in rw_sets {
            let index = self.shard_index.entry(*shard).or_default();
            for set in sets {
                index.insert(set.addr);
                let slots = self.global.entry(set.addr).or_default();
                for key in &set.reads {
                    let status = slots.entry(*key).or_insert(0);
                    *status += 1;
                }
                for key in &set.writes {
                    slots.insert(*key, WRITE_LOCKED);
                }
            }
        }
    }

    /// Drop every global lock under a shard's contracts and remove the
    /// shard from the index. Called when the shard's state commit executes.
    pub fn release(&mut self, shard: ShardId) {
        if let Some(addrs) = self.shard_index.remove(&shard) {
            for addr in addrs {
                self.global.remove(&addr);
            }
        }
    }

    /// Mark a shard's contracts as released within the current attempt,
    /// without touching the durable tables. Used when a state commit is
    /// accepted into the block under construction but has not executed yet.
    pub fn mark_released(&mut self, shard: ShardId) {
        if let Some(addrs) = self.shard_index.get(&shard) {
            self.released.extend(addrs.iter().copied());
        }
    }

    /// Clear the per-attempt state. Called at the start of every
    /// block-assembly attempt.
    pub fn reset_tentative(&mut self) {
        self.tentative.clear();
        self.released.clear();
    }

    /// Tentative lock status of a slot, if held.
    pub fn tentative_status(&self, addr: &Address, key: &Hash) -> Option<i32> {
        self.tentative.get(addr).and_then(|s| s.get(key)).copied()
    }

    /// Global lock status of a slot, if held.
    pub fn global_status(&self, addr: &Address, key: &Hash) -> Option<i32> {
        self.global.get(addr).and_then(|s| s.get(key)).copied()
    }

    /// Whether any global lock exists under a contract.
    pub fn global_contains(&self, addr: &Address) -> bool {
        self.global.contains_key(addr)
    }

    /// The contracts a shard holds global locks under.
    pub fn shard_contracts(&self, shard: ShardId) -> Option<&HashSet<Address>> {
        self.shard_index.get(&shard)
    }
}

/// Process-wide owner of the lock tables.
///
/// All mutators go through [`write`](Self::write); the guard is held for the
/// whole admission session or reference-block post-processing pass.
#[derive(Debug, Default)]
pub struct LockManager {
    inner: parking_lot::RwLock<LockTables>,
}

impl LockManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive guard.
    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, LockTables> {
        self.inner.write()
    }

    /// Acquire a shared guard for read-only inspection.
    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, LockTables> {
        self.inner.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_types::ContractRwSet;

    fn rw(shard: u64, addr: Address, reads: &[Hash], writes: &[Hash]) -> ShardRwSets {
        let mut set = ContractRwSet::new(addr);
        for key in reads {
            set.add_read(*key);
        }
        for key in writes {
            set.add_read(*key);
            set.add_write(*key);
        }
        let mut sets = ShardRwSets::new();
        sets.insert(ShardId(shard), vec![set]);
        sets
    }

    fn slot(byte: u8) -> Hash {
        Hash::from_hash_bytes(&[byte; 32])
    }

    #[test]
    fn test_admission_conflict_write_then_read() {
        // T1 writes (A, 0x01); T2 then reads (A, 0x01).
        let a = Address([0xA0; 20]);
        let t1 = rw(2, a, &[], &[slot(0x01)]);
        let t2 = rw(2, a, &[slot(0x01)], &[]);

        let manager = LockManager::new();
        let mut tables = manager.write();

        assert!(!tables.is_conflicted(&t1));
        tables.admit(&t1);

        assert!(tables.is_conflicted(&t2));
        assert_eq!(tables.tentative_status(&a, &slot(0x01)), Some(WRITE_LOCKED));
    }

    #[test]
    fn test_concurrent_reads_coexist() {
        let a = Address([0xA0; 20]);
        let read = rw(1, a, &[slot(0x02)], &[]);

        let manager = LockManager::new();
        let mut tables = manager.write();

        tables.admit(&read);
        assert!(!tables.is_conflicted(&read));
        tables.admit(&read);
        assert_eq!(tables.tentative_status(&a, &slot(0x02)), Some(2));

        // A write against the read-held slot conflicts.
        let write = rw(1, a, &[], &[slot(0x02)]);
        assert!(tables.is_conflicted(&write));
    }

    #[test]
    fn test_state_commit_unlocks_shard() {
        // GlobalLocks[A] = {0x01: WRITE}, shard_index[2] = {A}; a commit
        // from shard 2 empties both.
        let a = Address([0xA0; 20]);
        let locks = rw(2, a, &[], &[slot(0x01)]);

        let manager = LockManager::new();
        let mut tables = manager.write();
        tables.add_global(&locks);
        assert_eq!(tables.global_status(&a, &slot(0x01)), Some(WRITE_LOCKED));
        assert!(tables.shard_contracts(ShardId(2)).is_some());

        tables.release(ShardId(2));
        assert!(!tables.global_contains(&a));
        assert!(tables.shard_contracts(ShardId(2)).is_none());
    }

    #[test]
    fn test_mark_released_bypasses_global_within_attempt() {
        let a = Address([0xA0; 20]);
        let locks = rw(2, a, &[], &[slot(0x01)]);
        let read = rw(2, a, &[slot(0x01)], &[]);

        let manager = LockManager::new();
        let mut tables = manager.write();
        tables.add_global(&locks);
        assert!(tables.is_conflicted(&read));

        tables.mark_released(ShardId(2));
        assert!(!tables.is_conflicted(&read));

        // The marker does not survive the next attempt.
        tables.reset_tentative();
        assert!(tables.is_conflicted(&read));
        // And the durable lock is untouched.
        assert_eq!(tables.global_status(&a, &slot(0x01)), Some(WRITE_LOCKED));
    }

    #[test]
    fn test_reset_tentative_clears_only_tentative() {
        let a = Address([0xA0; 20]);
        let tentative = rw(1, a, &[], &[slot(0x05)]);
        let global = rw(1, Address([0xB0; 20]), &[], &[slot(0x06)]);

        let manager = LockManager::new();
        let mut tables = manager.write();
        tables.admit(&tentative);
        tables.add_global(&global);

        tables.reset_tentative();
        assert_eq!(tables.tentative_status(&a, &slot(0x05)), None);
        assert!(tables.global_contains(&Address([0xB0; 20])));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_slot() -> impl Strategy<Value = Hash> {
            any::<u8>().prop_map(slot)
        }

        proptest! {
            // A write on (a, k) makes any subsequent check on (a, k)
            // conflicted, whatever else was admitted before.
            #[test]
            fn write_then_check_conflicts(
                key in arb_slot(),
                other_reads in proptest::collection::vec(arb_slot(), 0..8),
            ) {
                let a = Address([0x11; 20]);
                let manager = LockManager::new();
                let mut tables = manager.write();

                for read in &other_reads {
                    tables.admit(&rw(1, a, &[*read], &[]));
                }
                tables.admit(&rw(1, a, &[], &[key]));

                prop_assert!(tables.is_conflicted(&rw(1, a, &[key], &[])));
                prop_assert!(tables.is_conflicted(&rw(1, a, &[], &[key])));
            }

            // After releasing shard s, no key of its contracts remains in
            // the global table.
            #[test]
            fn release_empties_shard(
                keys in proptest::collection::vec(arb_slot(), 1..8),
                shard in 1u64..5,
            ) {
                let a = Address([0x22; 20]);
                let manager = LockManager::new();
                let mut tables = manager.write();

                for key in &keys {
                    tables.add_global(&rw(shard, a, &[], &[*key]));
                }
                tables.release(ShardId(shard));

                prop_assert!(!tables.global_contains(&a));
                prop_assert!(tables.shard_contracts(ShardId(shard)).is_none());
            }
        }
    }
}
