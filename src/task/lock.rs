//! Per-key async locks.
//!
//! Serializes work on one key (an addressable id, a remote process) without
//! blocking unrelated keys. Each key gets its own `tokio` mutex, created on
//! first use and dropped again once nobody holds or waits for it.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable<K> = DashMap<K, Arc<Mutex<()>>>;

/// Table of async mutexes keyed by `K`.
pub struct KeyedLock<K: Eq + Hash + Clone> {
    locks: Arc<LockTable<K>>,
}

impl<K: Eq + Hash + Clone> Clone for KeyedLock<K> {
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
        }
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    fn mutex(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let mutex = self.mutex(&key);
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Take the lock only if it is free right now.
    pub fn try_lock(&self, key: K) -> Option<KeyedGuard<K>> {
        let mutex = self.mutex(&key);
        match mutex.try_lock_owned() {
            Ok(guard) => Some(KeyedGuard {
                key,
                guard: Some(guard),
                locks: self.locks.clone(),
            }),
            Err(_) => None,
        }
    }

    /// True while somebody holds `key`.
    pub fn is_locked(&self, key: &K) -> bool {
        self.locks
            .get(key)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Keys with a live mutex.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no key is held or awaited.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

fn prune<K: Eq + Hash>(locks: &LockTable<K>, key: &K) {
    locks.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
}

/// Exclusive hold on one key. Released on drop.
pub struct KeyedGuard<K: Eq + Hash + Clone> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable<K>>,
}

impl<K: Eq + Hash + Clone> KeyedGuard<K> {
    /// Locked key.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        // The guard holds a clone of the mutex Arc; release it before pruning.
        self.guard.take();
        prune(&self.locks, &self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serialized() {
        let locks = KeyedLock::new();
        let guard = locks.lock(1u64).await;
        assert!(locks.is_locked(&1));
        assert!(locks.try_lock(1).is_none());

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(1u64).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_independent() {
        let locks = KeyedLock::new();
        let _a = locks.lock("a").await;
        let b = locks.try_lock("b");
        assert!(b.is_some());
        assert_eq!(locks.len(), 2);
        drop(b);
        assert_eq!(locks.len(), 1);
    }
}
