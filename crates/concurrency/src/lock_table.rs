//! Keyed lock table
//!
//! Guards are `tokio::sync::OwnedMutexGuard`s so they can be held across
//! provider calls (`.await` points) and moved between tasks.

use dashmap::DashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Table of per-key exclusive locks
pub struct LockTable<K> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K> Default for LockTable<K>
where
    K: Eq + Hash + Ord + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> LockTable<K>
where
    K: Eq + Hash + Ord + Clone + Debug,
{
    /// Create an empty lock table
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn slot(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the lock for a single key, waiting if it is held
    pub async fn lock(&self, key: K) -> LockGuard<K> {
        self.lock_many([key]).await
    }

    /// Acquire the locks for several keys
    ///
    /// Duplicates are collapsed and keys are locked in ascending order.
    pub async fn lock_many(&self, keys: impl IntoIterator<Item = K>) -> LockGuard<K> {
        let mut keys: Vec<K> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let slot = self.slot(key);
            guards.push(slot.lock_owned().await);
            trace!(target: "timelines::locks", key = ?key, "Acquired lock");
        }
        LockGuard {
            keys,
            _guards: guards,
        }
    }

    /// Acquire the lock for a key only if it is free right now
    pub fn try_lock(&self, key: K) -> Option<LockGuard<K>> {
        let guard = self.slot(&key).try_lock_owned().ok()?;
        Some(LockGuard {
            keys: vec![key],
            _guards: vec![guard],
        })
    }

    /// Forget the lock for a key that will never be used again
    ///
    /// The entry is only removed when nobody holds or waits on it.
    /// Returns whether it was removed.
    pub fn remove(&self, key: &K) -> bool {
        self.locks
            .remove_if(key, |_, slot| Arc::strong_count(slot) == 1)
            .is_some()
    }

    /// Number of keys with a lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Check if the table has no entries
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive hold on one or more keys
///
/// Dropping the guard releases every key.
#[must_use = "the locks are released as soon as the guard is dropped"]
pub struct LockGuard<K> {
    keys: Vec<K>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl<K> LockGuard<K> {
    /// Keys held by this guard, in acquisition order
    pub fn keys(&self) -> &[K] {
        &self.keys
    }
}

impl<K: Debug> Debug for LockGuard<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("keys", &self.keys).finish()
    }
}
