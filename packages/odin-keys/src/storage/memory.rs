//! In-memory key/value store.

use parking_lot::RwLock;
use std::collections::HashMap;

use super::KeyValueStore;
use crate::error::Result;

/// A [`KeyValueStore`] backed by a locked `HashMap`
///
/// `delete` takes the write lock for the whole read-and-remove, so racing
/// deletes of one key see exactly one `Some`.
#[derive(Default)]
pub struct MemoryStore {
    memory: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.memory.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.memory.read().is_empty()
    }

    /// Check if a key exists
    pub fn exists(&self, key: &str) -> bool {
        self.memory.read().contains_key(key)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let storage = self.memory.read();
        Ok(storage.get(key).cloned())
    }

    fn upsert(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut storage = self.memory.write();
        storage.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut storage = self.memory.write();
        Ok(storage.remove(key))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.len())
            .finish()
    }
}
