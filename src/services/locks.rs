//! Per-reference mutual exclusion.
//!
//! Entries are weak so the map only holds references that someone is waiting on or
//! holding; dead entries are pruned lazily.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};

const PRUNE_THRESHOLD: usize = 256;

#[derive(Clone, Default)]
pub struct ReferenceLocks {
    locks: Arc<Mutex<HashMap<String, Weak<Mutex<()>>>>>,
}

impl ReferenceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn handle(&self, reference: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        if let Some(existing) = locks.get(reference).and_then(Weak::upgrade) {
            return existing;
        }

        if locks.len() >= PRUNE_THRESHOLD {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        let lock = Arc::new(Mutex::new(()));
        locks.insert(reference.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Waits for exclusive access to `reference`. Released when the guard drops.
    pub async fn acquire(&self, reference: &str) -> OwnedMutexGuard<()> {
        self.handle(reference).await.lock_owned().await
    }

    /// Exclusive access only if nobody else holds the reference right now.
    pub async fn try_acquire(&self, reference: &str) -> Option<OwnedMutexGuard<()>> {
        self.handle(reference).await.try_lock_owned().ok()
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.locks
            .lock()
            .await
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
