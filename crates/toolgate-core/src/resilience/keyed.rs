//! Per-key state map with one lock per entry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Lazily populated map of independently locked per-key states.
///
/// The outer lock is only held to look up or insert an entry, so work on one
/// key never blocks another.
pub(crate) struct Keyed<S> {
    map: RwLock<HashMap<String, Arc<Mutex<S>>>>,
}

impl<S> Keyed<S> {
    pub(crate) fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn get_or_insert_with(&self, key: &str, init: impl FnOnce() -> S) -> Arc<Mutex<S>> {
        if let Some(state) = self.map.read().get(key) {
            return state.clone();
        }
        self.map
            .write()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .clone()
    }

    pub(crate) fn get(&self, key: &str) -> Option<Arc<Mutex<S>>> {
        self.map.read().get(key).cloned()
    }

    pub(crate) fn remove(&self, key: &str) {
        self.map.write().remove(key);
    }

    pub(crate) fn clear(&self) {
        self.map.write().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Known keys, sorted.
    pub(crate) fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.map.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}
