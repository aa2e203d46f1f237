//! Memoising caches (component C4).
//!
//! [`OnceCache`] ports the original's `once_cache` decorator: at most one computation per key
//! runs at a time, concurrent callers for the same key block on the first caller's result, and a
//! failed computation is never cached (the next caller retries from scratch). [`DiffCache`] is a
//! bounded LRU wrapper for the package-diff memoisation, a pure/bounded lookup that doesn't need
//! once-cache's in-flight coordination.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Condvar, Mutex};

use anyhow::{anyhow, Result};
use lru::LruCache;

enum Slot<V> {
    Pending,
    Done(V),
}

/// At-most-one-in-flight-per-key memoising cache. `V` must be `Clone` so concurrent waiters can
/// each get their own copy of the completed value.
pub struct OnceCache<K, V> {
    state: Mutex<HashMap<K, Slot<V>>>,
    condvar: Condvar,
}

impl<K, V> Default for OnceCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        OnceCache {
            state: Mutex::new(HashMap::new()),
            condvar: Condvar::new(),
        }
    }
}

impl<K, V> OnceCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cached value for `key`, computing it with `compute` if this is the first caller to
    /// ask. Concurrent callers for the same key block until the first caller's computation
    /// finishes; if it fails, the error is returned to all current waiters and the slot is
    /// cleared so a later caller may retry.
    pub fn get_or_compute(&self, key: K, compute: impl FnOnce() -> Result<V>) -> Result<V> {
        let mut guard = self.state.lock().expect("once-cache mutex poisoned");
        loop {
            match guard.get(&key) {
                Some(Slot::Done(value)) => return Ok(value.clone()),
                Some(Slot::Pending) => {
                    guard = self
                        .condvar
                        .wait(guard)
                        .expect("once-cache condvar wait poisoned");
                }
                None => {
                    guard.insert(key.clone(), Slot::Pending);
                    break;
                }
            }
        }
        drop(guard);

        let result = compute();

        let mut guard = self.state.lock().expect("once-cache mutex poisoned");
        match &result {
            Ok(value) => {
                guard.insert(key.clone(), Slot::Done(value.clone()));
            }
            Err(_) => {
                guard.remove(&key);
            }
        }
        drop(guard);
        self.condvar.notify_all();

        result
    }
}

/// A bounded LRU memoisation cache, used for the package-diff computation (at most one entry per
/// version pair, ~n² but small enough to bound rather than keep unbounded).
pub struct DiffCache<K, V> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K, V> DiffCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        DiffCache {
            inner: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(capacity.max(1)).expect("capacity.max(1) is nonzero"),
            )),
        }
    }

    pub fn get_or_compute(&self, key: K, compute: impl FnOnce() -> V) -> V {
        if let Some(value) = self.inner.lock().expect("diff cache mutex poisoned").get(&key) {
            return value.clone();
        }
        let value = compute();
        self.inner
            .lock()
            .expect("diff cache mutex poisoned")
            .put(key, value.clone());
        value
    }
}
