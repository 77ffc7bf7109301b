//! Per-path async locks with reclaimed idle entries
//!
//! Each key maps to a shared `tokio::sync::Mutex`. The entry is removed when
//! the last guard (or waiter) for the key goes away, so the table only holds
//! keys that are currently in use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

type Entries = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Clone, Default)]
pub struct LockTable {
    entries: Entries,
}

/// Held lock on one key; dropping it releases the lock
pub struct PathGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    entries: Entries,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> PathGuard {
        let mutex = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        PathGuard {
            key: key.to_string(),
            guard: Some(guard),
            entries: self.entries.clone(),
        }
    }

    /// Number of keys currently locked or awaited
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        // The owned guard keeps its own reference to the mutex; release it
        // first so the count below only sees the table and other waiters.
        self.guard.take();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mutex) = entries.get(&self.key) {
            if Arc::strong_count(mutex) == 1 {
                entries.remove(&self.key);
            }
        }
    }
}
