//! Structural Leader
//!
//! Proposes structural operations, fans them out to the members, counts
//! acks and confirms commits. Lagging members are caught up from the log
//! or, when the log no longer reaches back far enough, with a copy of the
//! whole shared configuration.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::context::{ProposalOutcome, RequestContext};
use super::waiter::SessionOperationIdWaiter;
use super::{ReplicationConfig, COMMAND_QUEUE_SIZE};
use crate::error::{Error, Result};
use crate::id::{LogId, NodeIdentity, SessionOperationId};
use crate::lock::{LockManager, ResourceGuard, CONFIGURATION_LOCK};
use crate::network::Outbox;
use crate::operation::{RaftOperation, SubmitRequest, SubmitResponse};
use crate::oplog::OperationLog;
use crate::state::ClusterContext;

/// Commands processed by the leader task
enum LeaderCommand {
    Propose {
        operation: RaftOperation,
        guard: Option<ResourceGuard>,
        on_finished: oneshot::Sender<ProposalOutcome>,
    },
    ReceiveAck {
        node: NodeIdentity,
        log_id: LogId,
    },
    OperationTimeout {
        log_id: LogId,
    },
    Resync {
        member: NodeIdentity,
        last_known: Option<LogId>,
    },
    SendFullConfiguration {
        member: NodeIdentity,
    },
    Connected(NodeIdentity),
    Disconnected(NodeIdentity),
    Status(oneshot::Sender<LeaderStatus>),
}

/// Snapshot of the leader's bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderStatus {
    pub last_log: Option<LogId>,
    pub last_confirmed: Option<LogId>,
    pub members: Vec<NodeIdentity>,
    pub in_flight: usize,
}

/// Leader state, owned by its task
pub struct StructuralLeader {
    identity: NodeIdentity,
    oplog: Arc<dyn OperationLog>,
    cluster: Arc<dyn ClusterContext>,
    outbox: Outbox,
    waiter: Arc<SessionOperationIdWaiter>,
    config: ReplicationConfig,
    /// Connected members, this node excluded
    members: HashSet<NodeIdentity>,
    /// In-flight operations
    contexts: HashMap<LogId, RequestContext>,
    /// Highest committed id
    last_confirmed: Option<LogId>,
    commands: mpsc::Receiver<LeaderCommand>,
    /// Re-entry point for timers
    timer_tx: mpsc::WeakSender<LeaderCommand>,
}

/// Cloneable handle to the leader task
#[derive(Clone)]
pub struct LeaderHandle {
    identity: NodeIdentity,
    sender: mpsc::Sender<LeaderCommand>,
    cluster: Arc<dyn ClusterContext>,
    locks: Arc<dyn LockManager>,
    outbox: Outbox,
}

impl StructuralLeader {
    /// Start the leader task.
    ///
    /// The task ends when every handle has been dropped, or with an error
    /// when the operation log fails.
    pub fn spawn(
        identity: NodeIdentity,
        oplog: Arc<dyn OperationLog>,
        cluster: Arc<dyn ClusterContext>,
        locks: Arc<dyn LockManager>,
        outbox: Outbox,
        waiter: Arc<SessionOperationIdWaiter>,
        config: ReplicationConfig,
    ) -> (LeaderHandle, JoinHandle<Result<()>>) {
        let (sender, commands) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let last_confirmed = cluster.read_shared_configuration().last_update_id();

        let leader = StructuralLeader {
            identity: identity.clone(),
            oplog,
            cluster: cluster.clone(),
            outbox: outbox.clone(),
            waiter,
            config,
            members: HashSet::new(),
            contexts: HashMap::new(),
            last_confirmed,
            commands,
            timer_tx: sender.downgrade(),
        };

        let task = tokio::spawn(leader.run());
        let handle = LeaderHandle {
            identity,
            sender,
            cluster,
            locks,
            outbox,
        };
        (handle, task)
    }

    async fn run(mut self) -> Result<()> {
        info!(
            "Structural leader {} started, last confirmed {:?}",
            self.identity, self.last_confirmed
        );

        let mut ping = interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    if let Err(e) = self.handle(command) {
                        if e.is_fatal() {
                            error!("Structural leader stopping: {}", e);
                            return Err(e);
                        }
                        warn!("Structural leader error: {}", e);
                    }
                }
                _ = ping.tick() => self.ping(),
            }
        }

        info!("Structural leader {} stopped", self.identity);
        Ok(())
    }

    fn handle(&mut self, command: LeaderCommand) -> Result<()> {
        match command {
            LeaderCommand::Propose {
                operation,
                guard,
                on_finished,
            } => self.propagate_and_apply(operation, guard, on_finished),
            LeaderCommand::ReceiveAck { node, log_id } => {
                self.receive_ack(node, log_id);
                Ok(())
            }
            LeaderCommand::OperationTimeout { log_id } => {
                self.operation_timeout(log_id);
                Ok(())
            }
            LeaderCommand::Resync { member, last_known } => {
                if !self.try_resend(&member, LogId::after(last_known))? {
                    self.send_full_configuration(&member)?;
                }
                Ok(())
            }
            LeaderCommand::SendFullConfiguration { member } => {
                self.send_full_configuration(&member)
            }
            LeaderCommand::Connected(identity) => {
                self.connected(identity);
                Ok(())
            }
            LeaderCommand::Disconnected(identity) => {
                self.disconnected(&identity);
                Ok(())
            }
            LeaderCommand::Status(reply) => {
                let _ = reply.send(self.status());
                Ok(())
            }
        }
    }

    /// Log, track and fan out a new operation, then ack it ourselves
    fn propagate_and_apply(
        &mut self,
        operation: RaftOperation,
        guard: Option<ResourceGuard>,
        on_finished: oneshot::Sender<ProposalOutcome>,
    ) -> Result<()> {
        let log_id = self.oplog.log(&operation)?;
        let quorum = self.cluster.read_shared_configuration().quorum();
        debug!(
            "Proposing {} {} to {} members (quorum {})",
            operation.type_name(),
            log_id,
            self.members.len(),
            quorum
        );

        let mut context = RequestContext::new(log_id, operation, quorum, Some(on_finished), guard);
        context.set_timer(self.schedule_timeout(log_id));

        if let Err(e) = self
            .outbox
            .propagate(self.members.iter(), log_id, context.operation())
        {
            warn!("Failed to propagate {}: {}", log_id, e);
        }
        self.contexts.insert(log_id, context);

        let me = self.identity.clone();
        self.receive_ack(me, log_id);
        Ok(())
    }

    fn schedule_timeout(&self, log_id: LogId) -> JoinHandle<()> {
        let timer_tx = self.timer_tx.clone();
        let timeout = self.config.operation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(sender) = timer_tx.upgrade() {
                let _ = sender.send(LeaderCommand::OperationTimeout { log_id }).await;
            }
        })
    }

    fn receive_ack(&mut self, node: NodeIdentity, log_id: LogId) {
        let reached = match self.contexts.get_mut(&log_id) {
            Some(context) => context.ack(node, self.cluster.as_ref()),
            None => {
                trace!("Ignoring ack for {} from {}: not in flight", log_id, node);
                return;
            }
        };

        if reached {
            if let Some(context) = self.contexts.remove(&log_id) {
                self.committed(log_id, context.operation());
            }
        }
    }

    /// Bookkeeping after an operation reached quorum and was applied
    fn committed(&mut self, log_id: LogId, operation: &RaftOperation) {
        if self.last_confirmed.map_or(true, |last| log_id > last) {
            self.last_confirmed = Some(log_id);
        }

        if let RaftOperation::NodeJoin { identity } = operation {
            if *identity != self.identity {
                self.members.insert(identity.clone());
            }
        }

        if let Some(requester) = operation.requester_sequential() {
            if requester.originated_on(&self.identity) {
                self.waiter.notify(requester.sequential);
            }
        }

        if let Err(e) = self.outbox.confirm(self.members.iter(), log_id) {
            warn!("Failed to confirm {}: {}", log_id, e);
        }
        info!("Committed {} {}", operation.type_name(), log_id);
    }

    fn operation_timeout(&mut self, log_id: LogId) {
        if let Some(mut context) = self.contexts.remove(&log_id) {
            warn!(
                "{} {} timed out with {} acks, abandoning",
                context.operation().type_name(),
                log_id,
                context.ack_count()
            );
            context.timeout();
        }
    }

    /// Replay the log from `from` to one member.
    ///
    /// Returns `false` when `from` is no longer retained.
    fn try_resend(&self, member: &NodeIdentity, from: LogId) -> Result<bool> {
        let Some(entries) = self.oplog.search_from(from)? else {
            debug!("{} no longer retained, cannot resend to {}", from, member);
            return Ok(false);
        };

        let mut count = 0usize;
        for entry in entries {
            let committed = self.last_confirmed.is_some_and(|last| entry.log_id <= last);
            let sent = if committed {
                self.outbox.recover(member, entry.log_id, &entry.operation)
            } else {
                self.outbox
                    .propagate(std::iter::once(member), entry.log_id, &entry.operation)
            };
            if let Err(e) = sent {
                warn!("Resend of {} to {} failed: {}", entry.log_id, member, e);
                return Ok(true);
            }
            count += 1;
        }

        if let Some(last) = self.last_confirmed {
            if let Err(e) = self.outbox.confirm(std::iter::once(member), last) {
                warn!("Failed to confirm {} to {}: {}", last, member, e);
            }
        }

        info!("Resent {} entries from {} to {}", count, from, member);
        Ok(true)
    }

    /// Send the whole shared configuration, followed by anything in flight
    fn send_full_configuration(&self, member: &NodeIdentity) -> Result<()> {
        let configuration = self.cluster.read_shared_configuration();
        let after = LogId::after(configuration.last_update_id());
        info!(
            "Sending full configuration to {} (last update {:?})",
            member,
            configuration.last_update_id()
        );
        self.outbox.send_full_configuration(member, configuration)?;

        if let Some(entries) = self.oplog.search_from(after)? {
            for entry in entries {
                self.outbox
                    .propagate(std::iter::once(member), entry.log_id, &entry.operation)?;
            }
        }
        Ok(())
    }

    fn connected(&mut self, identity: NodeIdentity) {
        if identity == self.identity {
            return;
        }
        if !self
            .cluster
            .read_shared_configuration()
            .can_add_node(&identity)
        {
            warn!("Refusing member {}: name already taken", identity);
            return;
        }
        if self.members.insert(identity.clone()) {
            info!("Member {} connected", identity);
            let _ = self.outbox.notify_last_structural_operation(
                std::iter::once(&identity),
                self.oplog.last_persistent_log(),
                self.last_confirmed,
            );
        }
    }

    fn disconnected(&mut self, identity: &NodeIdentity) {
        if self.members.remove(identity) {
            info!("Member {} disconnected", identity);
        }
    }

    /// Announce the last persisted id to every member
    fn ping(&self) {
        if self.members.is_empty() {
            return;
        }
        if let Err(e) = self.outbox.notify_last_structural_operation(
            self.members.iter(),
            self.oplog.last_persistent_log(),
            self.last_confirmed,
        ) {
            warn!("Ping failed: {}", e);
        }
    }

    fn status(&self) -> LeaderStatus {
        let mut members: Vec<_> = self.members.iter().cloned().collect();
        members.sort();
        LeaderStatus {
            last_log: self.oplog.last_persistent_log(),
            last_confirmed: self.last_confirmed,
            members,
            in_flight: self.contexts.len(),
        }
    }
}

impl LeaderHandle {
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    async fn send(&self, command: LeaderCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| Error::Replication("Structural leader stopped".into()))
    }

    /// Propose an operation and wait until it is applied or abandoned
    pub async fn propagate_and_apply(
        &self,
        operation: RaftOperation,
        guard: Option<ResourceGuard>,
    ) -> Result<ProposalOutcome> {
        let (on_finished, finished) = oneshot::channel();
        self.send(LeaderCommand::Propose {
            operation,
            guard,
            on_finished,
        })
        .await?;
        finished
            .await
            .map_err(|_| Error::Replication("Structural leader stopped".into()))
    }

    /// Count an ack from a member
    pub async fn receive_ack(&self, node: NodeIdentity, log_id: LogId) -> Result<()> {
        self.send(LeaderCommand::ReceiveAck { node, log_id }).await
    }

    /// Create a database cluster-wide.
    ///
    /// A remote `requester` gets the response as a reply message.
    pub async fn create_database(
        &self,
        requester: Option<&NodeIdentity>,
        operation_id: SessionOperationId,
        name: &str,
        db_type: &str,
        config: BTreeMap<String, String>,
    ) -> Result<SubmitResponse> {
        let guard = self.locks.lock_resource(CONFIGURATION_LOCK).await;
        let result = if self
            .cluster
            .read_shared_configuration()
            .exists_database(name)
        {
            self.locks.unlock(guard);
            Ok(SubmitResponse::failure(format!(
                "Database '{}' already exists",
                name
            )))
        } else {
            let operation = RaftOperation::CreateDatabase {
                operation_id: operation_id.clone(),
                database: name.to_string(),
                db_type: db_type.to_string(),
                config,
            };
            self.propagate_and_apply(operation, Some(guard))
                .await
                .map(|outcome| outcome_response(outcome, format!("Database '{}' created", name)))
        };

        self.reply(requester, operation_id, &result);
        result
    }

    /// Drop a database cluster-wide
    pub async fn drop_database(
        &self,
        requester: Option<&NodeIdentity>,
        operation_id: SessionOperationId,
        name: &str,
    ) -> Result<SubmitResponse> {
        let guard = self.locks.lock_resource(CONFIGURATION_LOCK).await;
        let result = if !self
            .cluster
            .read_shared_configuration()
            .exists_database(name)
        {
            self.locks.unlock(guard);
            Ok(SubmitResponse::failure(format!(
                "Database '{}' does not exist",
                name
            )))
        } else {
            let operation = RaftOperation::DropDatabase {
                operation_id: operation_id.clone(),
                database: name.to_string(),
            };
            self.propagate_and_apply(operation, Some(guard))
                .await
                .map(|outcome| outcome_response(outcome, format!("Database '{}' dropped", name)))
        };

        self.reply(requester, operation_id, &result);
        result
    }

    /// Run a client request
    pub async fn submit(
        &self,
        requester: Option<&NodeIdentity>,
        operation_id: SessionOperationId,
        request: SubmitRequest,
    ) -> Result<SubmitResponse> {
        match request {
            SubmitRequest::CreateDatabase {
                name,
                db_type,
                config,
            } => {
                self.create_database(requester, operation_id, &name, &db_type, config)
                    .await
            }
            SubmitRequest::DropDatabase { name } => {
                self.drop_database(requester, operation_id, &name).await
            }
        }
    }

    /// Register a node in the shared configuration.
    ///
    /// Returns `None` when the node is already registered.
    pub async fn join(&self, identity: NodeIdentity) -> Result<Option<ProposalOutcome>> {
        let guard = self.locks.lock_resource(CONFIGURATION_LOCK).await;
        let shared = self.cluster.read_shared_configuration();
        if !shared.can_add_node(&identity) {
            return Err(Error::NodeNotEligible(identity.to_string()));
        }
        if shared.exists_node(&identity) {
            return Ok(None);
        }

        info!("Node {} joining", identity);
        let outcome = self
            .propagate_and_apply(RaftOperation::NodeJoin { identity }, Some(guard))
            .await?;
        Ok(Some(outcome))
    }

    /// Catch a member up from after `last_known`
    pub async fn resync(&self, member: NodeIdentity, last_known: Option<LogId>) -> Result<()> {
        self.send(LeaderCommand::Resync { member, last_known }).await
    }

    /// Send the whole shared configuration to a member
    pub async fn send_full_configuration(&self, member: NodeIdentity) -> Result<()> {
        self.send(LeaderCommand::SendFullConfiguration { member })
            .await
    }

    pub async fn connected(&self, identity: NodeIdentity) -> Result<()> {
        self.send(LeaderCommand::Connected(identity)).await
    }

    pub async fn disconnected(&self, identity: NodeIdentity) -> Result<()> {
        self.send(LeaderCommand::Disconnected(identity)).await
    }

    pub async fn status(&self) -> Result<LeaderStatus> {
        let (reply, status) = oneshot::channel();
        self.send(LeaderCommand::Status(reply)).await?;
        status
            .await
            .map_err(|_| Error::Replication("Structural leader stopped".into()))
    }

    fn reply(
        &self,
        requester: Option<&NodeIdentity>,
        operation_id: SessionOperationId,
        result: &Result<SubmitResponse>,
    ) {
        let Some(requester) = requester else { return };
        let response = match result {
            Ok(response) => response.clone(),
            Err(e) => SubmitResponse::failure(e.to_string()),
        };
        if let Err(e) = self.outbox.reply(requester, operation_id, response) {
            warn!("Failed to reply to {}: {}", requester, e);
        }
    }
}

fn outcome_response(outcome: ProposalOutcome, success: String) -> SubmitResponse {
    match outcome {
        ProposalOutcome::Applied(_) => SubmitResponse::success(success),
        ProposalOutcome::Failed(_, reason) => SubmitResponse::failure(reason),
        ProposalOutcome::TimedOut(log_id) => {
            SubmitResponse::failure(Error::QuorumTimeout(log_id).to_string())
        }
    }
}
