//! Keyed mutex registry
//!
//! Every key maps to its own `tokio::sync::Mutex`, created on first use and kept
//! for the lifetime of the registry. Waiters on one key are granted in FIFO
//! order; different keys never contend.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Key that gates allocation for every address
pub const GLOBAL_LOCK_KEY: &str = "global";

/// Registry of lazily created per-key mutexes
#[derive(Default)]
pub struct KeyedMutex {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Exclusive access to one key, released on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct KeyGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Wait for exclusive access to `key`
    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let mutex = self.lookup(key);
        let started = Instant::now();
        let guard = mutex.lock_owned().await;
        crate::metrics::record_lock_wait(key == GLOBAL_LOCK_KEY, started.elapsed().as_secs_f64());
        trace!("Acquired lock {}", key);

        KeyGuard {
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Get or insert the mutex for a key
    ///
    /// The shard reference is dropped before returning so no map lock is held
    /// while the caller awaits the mutex.
    fn lookup(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(existing) = self.locks.get(key) {
            return existing.clone();
        }
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Number of keys ever locked
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock explicitly
    pub fn release(self) {
        trace!("Released lock {}", self.key);
    }
}

impl std::fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let registry = KeyedMutex::new();
        let first = registry.acquire("0xabc").await;

        let mut contender = task::spawn(registry.acquire("0xabc"));
        assert_pending!(contender.poll());

        first.release();
        assert!(contender.is_woken());
        let second = assert_ready!(contender.poll());
        assert_eq!(second.key(), "0xabc");
    }

    #[tokio::test]
    async fn test_different_keys_are_independent() {
        let registry = KeyedMutex::new();
        let _a = registry.acquire("0xaaa").await;
        let b = timeout(Duration::from_millis(200), registry.acquire("0xbbb")).await;
        assert!(b.is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_waiters_are_granted_in_fifo_order() {
        let registry = Arc::new(KeyedMutex::new());
        let holder = registry.acquire("key").await;
        let (order_tx, mut order_rx) = mpsc::unbounded_channel();

        let mut handles = Vec::new();
        for i in 0..3 {
            let registry = registry.clone();
            let order_tx = order_tx.clone();
            handles.push(tokio::spawn(async move {
                let guard = registry.acquire("key").await;
                order_tx.send(i).unwrap();
                drop(guard);
            }));
            // let each waiter enqueue before the next one
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(holder);
        for handle in handles {
            handle.await.unwrap();
        }

        let mut order = Vec::new();
        while let Ok(i) = order_rx.try_recv() {
            order.push(i);
        }
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_guard_released_on_error_path() {
        async fn fails_while_locked(registry: &KeyedMutex) -> Result<(), &'static str> {
            let _guard = registry.acquire("key").await;
            Err("boom")
        }

        let registry = KeyedMutex::new();
        assert!(fails_while_locked(&registry).await.is_err());
        assert!(timeout(Duration::from_millis(200), registry.acquire("key"))
            .await
            .is_ok());
    }
}
