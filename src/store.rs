//! In-memory key-value storage for the keys this node owns
//!
//! `LocalStore` is the plain map. `IndexedStore` pairs it with the range
//! index behind a single lock so every mutation and its index rebuild are
//! observed together.

use crate::index::RangeIndex;
use std::collections::hash_map::{self, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Authoritative key/value map of the local node
#[derive(Debug, Clone, Default)]
pub struct LocalStore {
    data: HashMap<String, String>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite
    pub fn put(&mut self, key: String, value: String) {
        self.data.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.data.get(key)
    }

    /// Returns true iff the key was present
    pub fn remove(&mut self, key: &str) -> bool {
        self.data.remove(key).is_some()
    }

    pub fn keys(&self) -> hash_map::Keys<'_, String, String> {
        self.data.keys()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Default)]
struct StoreState {
    store: LocalStore,
    index: RangeIndex,
}

impl StoreState {
    fn rebuild_index(&mut self) {
        self.index = RangeIndex::build(&self.store);
    }
}

/// Thread-safe local store with a range index kept in step with it
#[derive(Debug, Clone, Default)]
pub struct IndexedStore {
    state: Arc<RwLock<StoreState>>,
}

impl IndexedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a pair; the index reflects it once this returns
    pub async fn put(&self, key: String, value: String) {
        let mut state = self.state.write().await;
        state.store.put(key, value);
        state.rebuild_index();
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let state = self.state.read().await;
        state.store.get(key).cloned()
    }

    /// Remove a key, rebuilding the index only if something was removed
    pub async fn remove(&self, key: &str) -> bool {
        let mut state = self.state.write().await;
        let removed = state.store.remove(key);
        if removed {
            state.rebuild_index();
        }
        removed
    }

    pub async fn range_query(&self, start: &str, end: &str) -> Vec<String> {
        self.state.read().await.index.range_query(start, end)
    }

    pub async fn prefix_scan(&self, prefix: &str) -> Vec<String> {
        self.state.read().await.index.prefix_scan(prefix)
    }

    /// Copy of the current index snapshot
    pub async fn index_snapshot(&self) -> RangeIndex {
        self.state.read().await.index.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.store.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.store.is_empty()
    }
}
