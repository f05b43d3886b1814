//! Key-value store abstraction.
//!
//! The production store is an external collaborator; the core only pins
//! this interface. All operations are synchronous blocking I/O.

use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Minimal key-value interface the chain schema is written against.
pub trait KeyValue: Send + Sync {
    /// Read a value.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Write a value.
    fn put(&self, key: &[u8], value: &[u8]);

    /// Delete a value.
    fn delete(&self, key: &[u8]);

    /// Whether a key exists.
    fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }
}

/// In-memory store backing tests and the dev node.
#[derive(Debug, Default)]
pub struct MemoryDb {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDb {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValue for MemoryDb {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.read().get(key).cloned()
    }

    fn put(&self, key: &[u8], value: &[u8]) {
        self.entries.write().insert(key.to_vec(), value.to_vec());
    }

    fn delete(&self, key: &[u8]) {
        self.entries.write().remove(key);
    }

    fn has(&self, key: &[u8]) -> bool {
        self.entries.read().contains_key(key)
    }
}
