use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Entries above this count trigger a sweep of idle locks
const PRUNE_THRESHOLD: usize = 1024;

/// Async mutual exclusion per key
///
/// Used to serialize mutating calls against one external object name,
/// and to keep two reconciles of the same Kubernetes object from
/// overlapping.
#[derive(Debug)]
pub struct KeyedLocks<K: Eq + Hash = String> {
    locks: StdMutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: StdMutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<K, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutex_for(&self, key: &K) -> Arc<Mutex<()>> {
        let mut table = self.table();
        if table.len() > PRUNE_THRESHOLD {
            table.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        }
        table
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `key`; released when the guard drops
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let mutex = self.mutex_for(key);
        mutex.lock_owned().await
    }

    /// Take the lock only if nobody holds it
    pub fn try_lock(&self, key: &K) -> Option<OwnedMutexGuard<()>> {
        self.mutex_for(key).try_lock_owned().ok()
    }

    /// Drop locks nobody is holding or waiting on
    pub fn prune(&self) {
        self.table().retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}
