//! Registry of foreign-data caches keyed by reference height.

use crate::DataCache;
use parking_lot::RwLock;
use shardline_types::BlockHeight;
use std::collections::BTreeMap;
use std::sync::Arc;

/// All live [`DataCache`] entries, keyed by reference height.
///
/// Entries are created while parsing the reference chain and pruned once
/// the shard's own commit advances past them.
#[derive(Debug, Default)]
pub struct ForeignRegistry {
    entries: RwLock<BTreeMap<BlockHeight, Arc<DataCache>>>,
}

impl ForeignRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache at a reference height together with its readiness.
    pub fn get(&self, ref_num: BlockHeight) -> Option<(Arc<DataCache>, bool)> {
        self.entries
            .read()
            .get(&ref_num)
            .map(|cache| (Arc::clone(cache), cache.is_ready()))
    }

    /// The cache at a height, inserting a fresh one when absent.
    pub fn get_or_insert(&self, ref_num: BlockHeight, ready: bool) -> Arc<DataCache> {
        let mut entries = self.entries.write();
        Arc::clone(
            entries
                .entry(ref_num)
                .or_insert_with(|| Arc::new(DataCache::new(ref_num, ready))),
        )
    }

    /// Whether a height's cache exists and is ready.
    pub fn is_ready(&self, ref_num: BlockHeight) -> bool {
        self.entries
            .read()
            .get(&ref_num)
            .map(|cache| cache.is_ready())
            .unwrap_or(false)
    }

    /// Drop every entry strictly below a height.
    pub fn prune_below(&self, height: BlockHeight) {
        let mut entries = self.entries.write();
        *entries = entries.split_off(&height);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_insert_reuses_entry() {
        let registry = ForeignRegistry::new();
        let first = registry.get_or_insert(BlockHeight(4), false);
        let second = registry.get_or_insert(BlockHeight(4), true);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!second.is_ready());
    }

    #[test]
    fn test_prune_below() {
        let registry = ForeignRegistry::new();
        for height in 1..=5 {
            registry.get_or_insert(BlockHeight(height), true);
        }
        registry.prune_below(BlockHeight(4));
        assert_eq!(registry.len(), 2);
        assert!(registry.get(BlockHeight(3)).is_none());
        assert!(registry.get(BlockHeight(4)).is_some());
    }

    #[test]
    fn test_missing_entry_is_not_ready() {
        let registry = ForeignRegistry::new();
        assert!(!registry.is_ready(BlockHeight(9)));
    }
}
