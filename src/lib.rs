//! WolfMeta - Structural Metadata Replication
//!
//! Replicates cluster-level structural changes (database create/drop, node
//! join) from a statically designated leader to every follower through an
//! ordered, acknowledged operation log.
//!
//! # Architecture
//!
//! The leader appends each structural operation to its operation log,
//! propagates it to the members and applies it once a quorum has
//! acknowledged. Followers log what they receive, acknowledge it and apply
//! in log order when the leader confirms. Gaps are repaired by resending
//! from the leader's log or, failing that, by transferring the whole shared
//! configuration.
//!
//! # Features
//!
//! - Segmented, CRC-checked operation log with optional LZ4 compression
//! - Quorum tracking with per-operation timeouts
//! - Gap detection and self-healing resync
//! - Read-your-writes for clients through a per-node waiter
//! - SQLite-backed shared configuration that survives restarts

pub mod config;
pub mod error;
pub mod id;
pub mod lock;
pub mod network;
pub mod node;
pub mod operation;
pub mod oplog;
pub mod replication;
pub mod state;

pub use config::WolfMetaConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfMetaConfig;
    pub use crate::error::{Error, Result};
    pub use crate::id::{LogId, NodeIdentity, SessionOperationId};
    pub use crate::node::StructuralNode;
    pub use crate::operation::{RaftOperation, SubmitRequest, SubmitResponse};
    pub use crate::oplog::{OperationLog, PersistentOperationLog};
    pub use crate::state::{ClusterContext, SharedConfiguration, SqliteClusterContext};
}
