//! Lazily created per-key async mutexes.
//!
//! Tasks locking the same key are serialized; tasks locking different keys
//! never contend beyond the brief map lookup. An entry is dropped from the
//! map when its last guard is released and nobody is waiting on it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Arena of mutexes keyed by `K`.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &K) -> KeyedGuard<'_, K> {
        let mutex = {
            let mut locks = self.locks.lock();
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = mutex.lock_owned().await;
        KeyedGuard {
            owner: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys with a live mutex.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

/// Exclusive access to one key, released on drop.
pub struct KeyedGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a KeyedLocks<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        drop(self.guard.take());

        // Clones are only handed out under the map lock, so a count of one
        // means no holder and no waiter remain.
        let mut locks = self.owner.locks.lock();
        if locks
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(&self.key);
        }
    }
}
