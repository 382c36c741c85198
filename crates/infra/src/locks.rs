//! In-process keyed lock table.
//!
//! One mutex per key (stock item, order, period), created on first use and
//! dropped once nobody holds or waits for it. Acquisition is bounded by a
//! timeout; running out of time is a retryable failure, never a partial write.
//!
//! Several keys of one table are always taken in ascending key order, so two
//! callers locking overlapping key sets cannot deadlock.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("timed out after {waited:?} waiting for lock on {resource}")]
pub struct LockTimeout {
    pub resource: String,
    pub waited: Duration,
}

#[derive(Debug)]
pub struct KeyedLocks<K> {
    table: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Ord + Clone + core::fmt::Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    ///
    /// Locks are not reentrant: calling `with_lock` for a key already held by
    /// the current thread waits for the full timeout and fails.
    pub fn with_lock<R>(
        &self,
        key: &K,
        timeout: Duration,
        f: impl FnOnce() -> R,
    ) -> Result<R, LockTimeout> {
        let slot = self.slot(key);

        let result = match slot.try_lock_for(timeout) {
            Some(_guard) => Ok(f()),
            None => Err(LockTimeout {
                resource: key.to_string(),
                waited: timeout,
            }),
        };

        drop(slot);
        self.prune(key);
        result
    }

    /// Run `f` while holding the locks of every key in `keys`.
    ///
    /// Duplicates are locked once. The timeout bounds the whole acquisition;
    /// on failure every lock already taken is given back before returning.
    pub fn with_locks<R>(
        &self,
        keys: &[K],
        timeout: Duration,
        f: impl FnOnce() -> R,
    ) -> Result<R, LockTimeout> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let deadline = Instant::now() + timeout;
        let slots: Vec<Arc<Mutex<()>>> = keys.iter().map(|key| self.slot(key)).collect();

        let result = {
            let mut guards = Vec::with_capacity(slots.len());
            let mut missed = None;
            for (key, slot) in keys.iter().zip(&slots) {
                match slot.try_lock_until(deadline) {
                    Some(guard) => guards.push(guard),
                    None => {
                        missed = Some(key);
                        break;
                    }
                }
            }
            match missed {
                Some(key) => Err(LockTimeout {
                    resource: key.to_string(),
                    waited: timeout,
                }),
                None => Ok(f()),
            }
        };

        drop(slots);
        for key in &keys {
            self.prune(key);
        }
        result
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &K) -> Arc<Mutex<()>> {
        self.table.lock().entry(key.clone()).or_default().clone()
    }

    fn prune(&self, key: &K) {
        let mut table = self.table.lock();
        // Only the table's own reference left: nobody holds or waits.
        if table.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            table.remove(key);
        }
    }
}
