//! Per-instance serialization. Two operations against the same instance
//! id (a rollback racing a redeploy, say) must not interleave; distinct
//! ids proceed concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct InstanceLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `id`, creating it on first use. The guard is
    /// owned so it can cross `tokio::spawn` boundaries with the
    /// background half of a deployment.
    pub async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the map entry for `id`, so deleted instances do not leave a
    /// lock behind forever. Live guards keep their own clone of the
    /// mutex; a later acquire simply recreates the entry.
    pub async fn evict(&self, id: &str) {
        self.locks.lock().await.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn evict_drops_the_entry() {
        let locks = InstanceLocks::new();
        let guard = locks.acquire("app1").await;
        drop(guard);
        assert_eq!(locks.locks.lock().await.len(), 1);

        locks.evict("app1").await;
        assert!(locks.locks.lock().await.is_empty());

        let _guard = locks.acquire("app1").await;
        assert_eq!(locks.locks.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn distinct_ids_do_not_block_each_other() {
        let locks = InstanceLocks::new();
        let _a = locks.acquire("a").await;
        // Must not deadlock while "a" is held.
        let _b = locks.acquire("b").await;
    }
}
