//! Per-destination operation locks.
//!
//! Backup, restore, delete, repair and compact hold the lock for their
//! destination across the whole list-then-mutate sequence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
pub struct DestinationLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DestinationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance shared by every controller.
    pub fn global() -> &'static DestinationLocks {
        static LOCKS: OnceLock<DestinationLocks> = OnceLock::new();
        LOCKS.get_or_init(DestinationLocks::new)
    }

    fn handle(&self, destination_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(destination_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn acquire(&self, destination_id: &str) -> OwnedMutexGuard<()> {
        let handle = self.handle(destination_id);
        if let Ok(guard) = handle.clone().try_lock_owned() {
            return guard;
        }
        debug!("Waiting for lock on destination {}", destination_id);
        handle.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_destination_serializes() {
        let locks = Arc::new(DestinationLocks::new());
        let guard = locks.acquire("file:///a").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.acquire("file:///a").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // A different destination is independent
        let _b = locks.acquire("file:///b").await;

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
