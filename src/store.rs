use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The Store keeps the whole dataset in memory: plain string values and hashes, each living in
/// its own keyspace. It is thread-safe and cheap to clone, every clone shares the same data.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    strings: HashMap<Key, Bytes>,
    hashes: HashMap<Key, HashMap<Key, Bytes>>,
}

type Key = String;

impl Store {
    pub fn new() -> Store {
        Self::default()
    }

    pub fn lock(&self) -> StoreLocked<'_> {
        // A panic while holding the lock can't leave a map half updated, so the data is still
        // consistent and the lock can be recovered.
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        StoreLocked { state }
    }
}

pub struct StoreLocked<'a> {
    state: MutexGuard<'a, State>,
}

impl<'a> StoreLocked<'a> {
    pub fn set(&mut self, key: String, data: Bytes) {
        self.state.strings.insert(key, data);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.state.strings.get(key).cloned()
    }

    /// Sets `field` in the hash stored at `key`, creating the hash if needed. Returns `true`
    /// when the field did not exist before.
    pub fn hset(&mut self, key: &str, field: String, data: Bytes) -> bool {
        self.state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field, data)
            .is_none()
    }

    pub fn hget(&self, key: &str, field: &str) -> Option<Bytes> {
        self.state
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned()
    }

    pub fn hgetall(&self, key: &str) -> impl Iterator<Item = (&String, &Bytes)> {
        self.state.hashes.get(key).into_iter().flat_map(|hash| hash.iter())
    }

    pub fn size(&self) -> usize {
        self.state.strings.len() + self.state.hashes.len()
    }
}
