//! Resource Locks
//!
//! Exclusive named locks serializing structural mutations. The leader
//! takes the [`CONFIGURATION_LOCK`] before proposing and releases it once
//! the operation has been applied or abandoned.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tracing::trace;

/// Name of the lock held across every structural mutation
pub const CONFIGURATION_LOCK: &str = "Configuration";

/// Future returned by [`LockManager::lock_resource`]
pub type LockFuture<'a> = Pin<Box<dyn Future<Output = ResourceGuard> + Send + 'a>>;

/// Exclusive lock on a named resource, released on drop
pub struct ResourceGuard {
    resource: String,
    _guard: OwnedMutexGuard<()>,
}

impl ResourceGuard {
    /// Name of the locked resource
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("resource", &self.resource)
            .finish()
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        trace!("Released lock on {}", self.resource);
    }
}

/// Lock manager contract
pub trait LockManager: Send + Sync {
    /// Wait for exclusive ownership of `resource`
    fn lock_resource<'a>(&'a self, resource: &'a str) -> LockFuture<'a>;

    /// Release a lock taken with [`lock_resource`](Self::lock_resource)
    fn unlock(&self, guard: ResourceGuard) {
        drop(guard);
    }
}

/// Process-local lock manager with one async mutex per resource name
#[derive(Default)]
pub struct LocalLockManager {
    resources: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn resource(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut resources = self.resources.lock().unwrap_or_else(|e| e.into_inner());
        resources
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl LockManager for LocalLockManager {
    fn lock_resource<'a>(&'a self, resource: &'a str) -> LockFuture<'a> {
        let mutex = self.resource(resource);
        Box::pin(async move {
            let guard = mutex.lock_owned().await;
            trace!("Acquired lock on {}", resource);
            ResourceGuard {
                resource: resource.to_string(),
                _guard: guard,
            }
        })
    }
}
