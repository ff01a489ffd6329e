//! Replication Module
//!
//! Structural replication between the statically designated leader and
//! its followers. Each role is a single task draining a command queue, so
//! the log, the pending entries and the membership set are only ever
//! touched from one place.

mod context;
mod follower;
mod leader;
mod submit;
mod waiter;

pub use context::{ProposalOutcome, RequestContext};
pub use follower::{FollowerHandle, FollowerStatus, StructuralFollower, SyncState};
pub use leader::{LeaderHandle, LeaderStatus, StructuralLeader};
pub use submit::SubmitContext;
pub use waiter::SessionOperationIdWaiter;

use std::time::Duration;

/// Capacity of each actor's command queue
const COMMAND_QUEUE_SIZE: usize = 1024;

/// Configuration for replication
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// How long the leader waits for a quorum
    pub operation_timeout: Duration,
    /// Interval of the leader's last-operation announcement
    pub ping_interval: Duration,
    /// How long a client request waits for its answer and local apply
    pub submit_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_millis(5000),
            ping_interval: Duration::from_millis(1000),
            submit_timeout: Duration::from_millis(10000),
        }
    }
}
