//! Cluster State Module
//!
//! The cluster state the replication layer mutates: the shared structural
//! configuration plus the storage engine entry points invoked when a
//! database is created or dropped.

mod shared;
mod tracker;

pub use shared::{DatabaseDescriptor, SharedConfiguration};
pub use tracker::SqliteClusterContext;

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use crate::error::Result;

/// Access to the cluster state of the local node.
///
/// Implementations must be safe to call from the leader and follower
/// actors as well as from client request threads.
pub trait ClusterContext: Send + Sync {
    /// Snapshot of the shared configuration
    fn read_shared_configuration(&self) -> SharedConfiguration;

    /// Update the shared configuration in place
    fn modify_shared_configuration(
        &self,
        update: &mut dyn FnMut(&mut SharedConfiguration),
    ) -> Result<()>;

    /// Replace the whole shared configuration (full transfer from the leader)
    fn replace_shared_configuration(&self, configuration: SharedConfiguration) -> Result<()>;

    /// Storage engine: create the database locally
    fn internal_create_database(
        &self,
        name: &str,
        db_type: &str,
        config: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Storage engine: drop the database locally
    fn internal_drop_database(&self, name: &str) -> Result<()>;
}

/// Storage engine call recorded by [`InMemoryClusterContext`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Created(String),
    Dropped(String),
}

/// Cluster context kept entirely in memory.
///
/// Engine calls are recorded instead of executed, which makes double
/// application of an operation observable.
#[derive(Default)]
pub struct InMemoryClusterContext {
    shared: RwLock<SharedConfiguration>,
    events: Mutex<Vec<EngineEvent>>,
}

impl InMemoryClusterContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context starting from the given configuration
    pub fn with_configuration(configuration: SharedConfiguration) -> Self {
        Self {
            shared: RwLock::new(configuration),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Engine calls made so far, in order
    pub fn engine_events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn record(&self, event: EngineEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

impl ClusterContext for InMemoryClusterContext {
    fn read_shared_configuration(&self) -> SharedConfiguration {
        self.shared.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn modify_shared_configuration(
        &self,
        update: &mut dyn FnMut(&mut SharedConfiguration),
    ) -> Result<()> {
        let mut shared = self.shared.write().unwrap_or_else(|e| e.into_inner());
        update(&mut shared);
        Ok(())
    }

    fn replace_shared_configuration(&self, configuration: SharedConfiguration) -> Result<()> {
        *self.shared.write().unwrap_or_else(|e| e.into_inner()) = configuration;
        Ok(())
    }

    fn internal_create_database(
        &self,
        name: &str,
        _db_type: &str,
        _config: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.record(EngineEvent::Created(name.to_string()));
        Ok(())
    }

    fn internal_drop_database(&self, name: &str) -> Result<()> {
        self.record(EngineEvent::Dropped(name.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::LogId;

    #[test]
    fn test_in_memory_context() {
        let ctx = InMemoryClusterContext::with_configuration(SharedConfiguration::new(2));
        assert_eq!(ctx.read_shared_configuration().quorum(), 2);

        ctx.modify_shared_configuration(&mut |shared| {
            shared.set_last_update_id(Some(LogId::new(3)));
        })
        .unwrap();
        assert_eq!(
            ctx.read_shared_configuration().last_update_id(),
            Some(LogId::new(3))
        );

        ctx.internal_create_database("X", "document", &BTreeMap::new())
            .unwrap();
        ctx.internal_drop_database("X").unwrap();
        assert_eq!(
            ctx.engine_events(),
            vec![
                EngineEvent::Created("X".into()),
                EngineEvent::Dropped("X".into())
            ]
        );
    }
}
