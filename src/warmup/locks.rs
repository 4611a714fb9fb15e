//! Per-account mutual exclusion for warmup cycles and state changes.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Lock arena keyed by account id. At most one cycle or toggle per account
/// runs at a time; different accounts never block each other.
#[derive(Debug, Default)]
pub struct AccountLocks {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `account_id`.
    pub async fn acquire(&self, account_id: &str) -> OwnedMutexGuard<()> {
        let existing = self.locks.read().await.get(account_id).cloned();
        let lock = match existing {
            Some(lock) => lock,
            None => self
                .locks
                .write()
                .await
                .entry(account_id.to_string())
                .or_default()
                .clone(),
        };
        lock.lock_owned().await
    }

    /// Try to take the lock without waiting.
    pub async fn try_acquire(&self, account_id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .write()
            .await
            .entry(account_id.to_string())
            .or_default()
            .clone();
        lock.try_lock_owned().ok()
    }

    /// Drop entries nobody holds or waits on.
    pub async fn prune(&self) {
        let mut locks = self.locks.write().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let pruned = before - locks.len();
        if pruned > 0 {
            tracing::trace!(pruned, "pruned idle account locks");
        }
    }

    pub async fn tracked(&self) -> usize {
        self.locks.read().await.len()
    }
}
