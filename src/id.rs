//! Cluster Identifiers
//!
//! Value types used as keys throughout the replication layer:
//!
//! - [`LogId`]: position of an operation in the structural log
//! - [`NodeIdentity`]: stable identity of a cluster member
//! - [`SessionOperationId`]: one client-originated call, ordered per origin node

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2024-01-01 00:00:00 UTC
const WOLFMETA_EPOCH: u64 = 1704067200000;

/// Sequentials reserved per millisecond when seeding a generator
const SEQUENCE_BITS: u64 = 12;

/// Identifier of an entry in the structural operation log.
///
/// Assigned by the log on append, strictly increasing and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId(u64);

impl LogId {
    /// The id of the first entry ever appended
    pub const FIRST: LogId = LogId(1);

    /// Create from raw value
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The id directly following this one
    pub fn next(&self) -> LogId {
        LogId(self.0 + 1)
    }

    /// The id expected after `last`, where `None` means an empty log
    pub fn after(last: Option<LogId>) -> LogId {
        last.map(|id| id.next()).unwrap_or(LogId::FIRST)
    }
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for LogId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Stable identity of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique id (a uuid for generated identities)
    pub id: String,
    /// Human readable node name, unique within the cluster
    pub name: String,
}

impl NodeIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Create an identity with a fresh random id
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), name)
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Identifies one client-originated call.
///
/// Sequentials are ordered per origin node only; ids from different nodes
/// are not comparable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionOperationId {
    /// Id of the node the call originated on
    pub node_id: String,
    /// Sequence number scoped to the origin node
    pub sequential: u64,
}

impl SessionOperationId {
    pub fn new(node_id: impl Into<String>, sequential: u64) -> Self {
        Self {
            node_id: node_id.into(),
            sequential,
        }
    }

    /// Check if this call originated on the given node
    pub fn originated_on(&self, node: &NodeIdentity) -> bool {
        self.node_id == node.id
    }
}

impl std::fmt::Display for SessionOperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node_id, self.sequential)
    }
}

/// Session operation id generator
///
/// Thread-safe generator of strictly increasing sequentials for one node.
/// The counter is seeded from the wall clock so a restarted node does not
/// hand out sequentials it already used before the restart.
pub struct SessionOperationIdGenerator {
    node_id: String,
    next: AtomicU64,
}

impl SessionOperationIdGenerator {
    /// Create a generator seeded from the current time
    pub fn new(node_id: impl Into<String>) -> Self {
        Self::starting_at(node_id, Self::current_time_millis() << SEQUENCE_BITS)
    }

    /// Create a generator whose first sequential is `first`
    pub fn starting_at(node_id: impl Into<String>, first: u64) -> Self {
        Self {
            node_id: node_id.into(),
            next: AtomicU64::new(first),
        }
    }

    /// Generate a new session operation id
    pub fn generate(&self) -> SessionOperationId {
        let sequential = self.next.fetch_add(1, Ordering::SeqCst);
        SessionOperationId::new(self.node_id.clone(), sequential)
    }

    /// Get the node id this generator hands out ids for
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn current_time_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(WOLFMETA_EPOCH)
            .saturating_sub(WOLFMETA_EPOCH)
    }
}
