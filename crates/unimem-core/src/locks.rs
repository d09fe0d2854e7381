//! Per-id write serialization.
//!
//! Every write to one object or relation id holds that id's lock across all
//! three adapter calls. Entries are dropped once no writer references them.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slots = DashMap<String, Arc<Mutex<()>>>;

/// Lock key of an object id.
pub fn object_key(id: &str) -> String {
    format!("obj:{id}")
}

/// Lock key of a relation id.
pub fn relation_key(id: &str) -> String {
    format!("rel:{id}")
}

#[derive(Default)]
pub struct LockTable {
    slots: Arc<Slots>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: String) -> KeyGuard {
        let slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = slot.lock_owned().await;
        KeyGuard {
            key,
            slots: self.slots.clone(),
            guard: Some(guard),
        }
    }

    /// Lock several keys, always in sorted order so batches cannot deadlock.
    pub async fn lock_all(&self, keys: impl IntoIterator<Item = String>) -> Vec<KeyGuard> {
        let sorted: BTreeSet<String> = keys.into_iter().collect();
        let mut guards = Vec::with_capacity(sorted.len());
        for key in sorted {
            guards.push(self.lock(key).await);
        }
        guards
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Held for the duration of one write; releases on drop.
pub struct KeyGuard {
    key: String,
    slots: Arc<Slots>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the table's own reference left: nobody holds or waits for it.
        self.slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let table = Arc::new(LockTable::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let (table, inside, max_seen) = (table.clone(), inside.clone(), max_seen.clone());
            handles.push(tokio::spawn(async move {
                let _g = table.lock(object_key("x")).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let table = LockTable::new();
        let _a = table.lock(object_key("a")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), table.lock(object_key("b"))).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_lock_all_dedups() {
        let table = LockTable::new();
        let guards = table
            .lock_all(vec![object_key("b"), object_key("a"), object_key("b")])
            .await;
        assert_eq!(guards.len(), 2);
        assert_eq!(table.len(), 2);
        drop(guards);
        assert!(table.is_empty());
    }
}
