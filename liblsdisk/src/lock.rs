//! Keyed admission locks.
//!
//! Every operation touching a volume's scratch mount, image file or loop
//! binding first takes the lock for that resource's key.  Keys are plain
//! strings so the same table serves controller keys
//! (`{storage_model}-{volume_id}`), node keys (`volume_id`), probe keys
//! (`probe:{device}`) and format keys (`format:{device path}`).  Idle
//! entries are dropped with their last guard.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slots = DashMap<String, Arc<Mutex<()>>>;

#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    slots: Arc<Slots>,
}

/// Holds one key until dropped.
#[derive(Debug)]
pub struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    slots: Arc<Slots>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free and take it.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let slot = self.slots.entry(key.to_owned()).or_default().clone();
        let guard = slot.lock_owned().await;
        KeyGuard {
            guard: Some(guard),
            key: key.to_owned(),
            slots: self.slots.clone(),
        }
    }

    /// Number of keys currently held or waited on.
    pub fn active(&self) -> usize {
        self.slots.len()
    }
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map itself still references an idle slot.
        self.slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}
