//! In-memory key-value storage owned by the active role context.

use std::collections::BTreeMap;

/// The key-value map a master serves from and a slave replicates into.
///
/// Exactly one worker task owns the context holding this store, so no
/// synchronization is needed. BTreeMap keeps snapshots in a deterministic
/// order, which makes status output and tests stable.
#[derive(Debug, Default, Clone)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a key-value pair, overwriting any existing value.
    pub fn put(&mut self, key: String, value: String) {
        self.data.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a copy of the whole map for status reporting.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }
}
