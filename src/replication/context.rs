//! Quorum tracking for in-flight operations.

use std::collections::HashSet;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::id::{LogId, NodeIdentity};
use crate::lock::ResourceGuard;
use crate::operation::RaftOperation;
use crate::state::ClusterContext;

/// How a proposed operation ended on the leader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalOutcome {
    /// Quorum reached and the operation applied
    Applied(LogId),
    /// Quorum reached but applying the operation failed
    Failed(LogId, String),
    /// No quorum before the operation timeout; bookkeeping abandoned
    TimedOut(LogId),
}

impl ProposalOutcome {
    pub fn log_id(&self) -> LogId {
        match self {
            ProposalOutcome::Applied(id)
            | ProposalOutcome::Failed(id, _)
            | ProposalOutcome::TimedOut(id) => *id,
        }
    }
}

/// Leader-side state of one in-flight operation
pub struct RequestContext {
    log_id: LogId,
    operation: RaftOperation,
    quorum: usize,
    acks: HashSet<NodeIdentity>,
    completed: bool,
    on_finished: Option<oneshot::Sender<ProposalOutcome>>,
    /// Structural lock held until the operation completes
    guard: Option<ResourceGuard>,
    timer: Option<JoinHandle<()>>,
}

impl RequestContext {
    pub fn new(
        log_id: LogId,
        operation: RaftOperation,
        quorum: usize,
        on_finished: Option<oneshot::Sender<ProposalOutcome>>,
        guard: Option<ResourceGuard>,
    ) -> Self {
        Self {
            log_id,
            operation,
            quorum: quorum.max(1),
            acks: HashSet::new(),
            completed: false,
            on_finished,
            guard,
            timer: None,
        }
    }

    /// Attach the timeout timer, aborted once the context completes
    pub fn set_timer(&mut self, timer: JoinHandle<()>) {
        self.timer = Some(timer);
    }

    /// Count an ack from `node`.
    ///
    /// Returns `true` exactly once: on the ack that completes the quorum,
    /// after the operation has been applied and the completion reported.
    pub fn ack(&mut self, node: NodeIdentity, cluster: &dyn ClusterContext) -> bool {
        if self.completed {
            return false;
        }

        self.acks.insert(node);
        if self.acks.len() < self.quorum {
            debug!(
                "{} has {}/{} acks",
                self.log_id,
                self.acks.len(),
                self.quorum
            );
            return false;
        }

        self.completed = true;
        let log_id = self.log_id;
        let outcome = match self.operation.apply(cluster, log_id) {
            Ok(Ok(())) => ProposalOutcome::Applied(log_id),
            Ok(Err(e)) | Err(e) => {
                warn!("Applying {} {} failed: {}", self.operation.type_name(), log_id, e);
                ProposalOutcome::Failed(log_id, e.to_string())
            }
        };
        self.finish(outcome);
        true
    }

    /// Abandon the operation; the context may always be removed afterwards
    pub fn timeout(&mut self) -> bool {
        if !self.completed {
            self.completed = true;
            self.finish(ProposalOutcome::TimedOut(self.log_id));
        }
        true
    }

    fn finish(&mut self, outcome: ProposalOutcome) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(on_finished) = self.on_finished.take() {
            let _ = on_finished.send(outcome);
        }
        // Release the structural lock
        self.guard.take();
    }

    pub fn log_id(&self) -> LogId {
        self.log_id
    }

    pub fn operation(&self) -> &RaftOperation {
        &self.operation
    }

    pub fn ack_count(&self) -> usize {
        self.acks.len()
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
