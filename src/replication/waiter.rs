//! Read-your-writes waiter
//!
//! Tracks the highest applied sequential among operations that originated
//! on the local node. A client thread that submitted an operation blocks
//! here until that sequential (or a later one) has been applied.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{Error, Result};

/// Blocks callers until their own operation has been applied locally
#[derive(Debug, Default)]
pub struct SessionOperationIdWaiter {
    /// Highest applied sequential, `None` before the first apply
    applied: Mutex<Option<u64>>,
    condition: Condvar,
}

impl SessionOperationIdWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `sequential` has been applied and wake waiters
    pub fn notify(&self, sequential: u64) {
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        if applied.map_or(true, |current| sequential > current) {
            *applied = Some(sequential);
            trace!("Applied sequential advanced to {}", sequential);
        }
        self.condition.notify_all();
    }

    /// Highest applied sequential so far
    pub fn applied(&self) -> Option<u64> {
        *self.applied.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until `sequential` or a later one has been applied
    pub fn wait_if_needed(&self, sequential: u64) {
        let applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        let _applied = self
            .condition
            .wait_while(applied, |applied| applied.map_or(true, |a| a < sequential))
            .unwrap_or_else(|e| e.into_inner());
    }

    /// Like [`wait_if_needed`](Self::wait_if_needed), giving up after
    /// `timeout`. Returns whether the sequential was applied.
    pub fn wait_timeout(&self, sequential: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if applied.is_some_and(|a| a >= sequential) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            applied = self
                .condition
                .wait_timeout(applied, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Wait from async code without blocking the runtime
    pub async fn wait_for(self: &Arc<Self>, sequential: u64, timeout: Duration) -> Result<()> {
        let waiter = Arc::clone(self);
        let applied = tokio::task::spawn_blocking(move || waiter.wait_timeout(sequential, timeout))
            .await
            .map_err(|e| Error::Internal(format!("waiter task failed: {}", e)))?;

        if applied {
            Ok(())
        } else {
            Err(Error::Replication(format!(
                "sequential {} not applied within {:?}",
                sequential, timeout
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_returns_immediately_when_applied() {
        let waiter = SessionOperationIdWaiter::new();
        waiter.notify(5);
        waiter.wait_if_needed(5);
        waiter.wait_if_needed(3);
        assert_eq!(waiter.applied(), Some(5));

        // Never moves backwards
        waiter.notify(4);
        assert_eq!(waiter.applied(), Some(5));
    }

    #[test]
    fn test_blocks_until_notified() {
        let waiter = Arc::new(SessionOperationIdWaiter::new());

        let blocked = {
            let waiter = waiter.clone();
            thread::spawn(move || waiter.wait_if_needed(7))
        };

        thread::sleep(Duration::from_millis(20));
        waiter.notify(6);
        thread::sleep(Duration::from_millis(20));
        assert!(!blocked.is_finished());

        // A later sequential also satisfies the wait
        waiter.notify(9);
        blocked.join().unwrap();
    }

    #[test]
    fn test_wait_timeout() {
        let waiter = SessionOperationIdWaiter::new();
        assert!(!waiter.wait_timeout(1, Duration::from_millis(20)));
        waiter.notify(1);
        assert!(waiter.wait_timeout(1, Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_async_wait() {
        let waiter = Arc::new(SessionOperationIdWaiter::new());
        let notifier = waiter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            notifier.notify(3);
        });

        waiter.wait_for(3, Duration::from_secs(2)).await.unwrap();
        assert!(waiter.wait_for(4, Duration::from_millis(20)).await.is_err());
    }
}
