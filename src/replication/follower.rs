//! Structural Follower
//!
//! Logs operations received from the leader, acknowledges them and applies
//! them in log order once the leader confirms. Any hole in the sequence is
//! repaired by asking the leader for a resync.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::waiter::SessionOperationIdWaiter;
use super::{ReplicationConfig, COMMAND_QUEUE_SIZE};
use crate::error::{Error, Result};
use crate::id::{LogId, NodeIdentity, SessionOperationId};
use crate::network::Outbox;
use crate::operation::RaftOperation;
use crate::oplog::OperationLog;
use crate::state::{ClusterContext, SharedConfiguration};

/// Missed pings after which the follower announces itself again
const LEADER_SILENCE_PINGS: u32 = 3;

/// Follower synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Started, no contact with the leader yet
    Unsynced,
    /// Waiting for a requested resync
    Syncing,
    /// Caught up with everything received
    Synced,
    /// Applying confirmed entries
    Applying,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Unsynced => write!(f, "UNSYNCED"),
            SyncState::Syncing => write!(f, "SYNCING"),
            SyncState::Synced => write!(f, "SYNCED"),
            SyncState::Applying => write!(f, "APPLYING"),
        }
    }
}

/// Snapshot of the follower's bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowerStatus {
    pub state: SyncState,
    pub last_log: Option<LogId>,
    pub last_applied: Option<LogId>,
    pub pending: usize,
}

enum FollowerCommand {
    Log {
        leader: NodeIdentity,
        log_id: LogId,
        operation: RaftOperation,
    },
    Confirm {
        leader: NodeIdentity,
        log_id: LogId,
    },
    Recover {
        leader: NodeIdentity,
        log_id: LogId,
        operation: RaftOperation,
    },
    Ping {
        leader: NodeIdentity,
        last_log: Option<LogId>,
        last_confirmed: Option<LogId>,
    },
    FullConfiguration {
        leader: NodeIdentity,
        configuration: SharedConfiguration,
    },
    Status(oneshot::Sender<FollowerStatus>),
}

impl FollowerCommand {
    fn sender(&self) -> Option<&NodeIdentity> {
        match self {
            FollowerCommand::Log { leader, .. }
            | FollowerCommand::Confirm { leader, .. }
            | FollowerCommand::Recover { leader, .. }
            | FollowerCommand::Ping { leader, .. }
            | FollowerCommand::FullConfiguration { leader, .. } => Some(leader),
            FollowerCommand::Status(_) => None,
        }
    }
}

/// Follower state, owned by its task
pub struct StructuralFollower {
    identity: NodeIdentity,
    leader: NodeIdentity,
    oplog: Arc<dyn OperationLog>,
    cluster: Arc<dyn ClusterContext>,
    outbox: Outbox,
    waiter: Arc<SessionOperationIdWaiter>,
    config: ReplicationConfig,
    /// Logged but not yet applied
    pending: BTreeMap<LogId, RaftOperation>,
    /// Last applied id
    last_state_id: Option<LogId>,
    state: SyncState,
    resync_requested_at: Option<Instant>,
    join_requested_at: Option<Instant>,
    /// Last message accepted from the leader
    last_contact: Instant,
    commands: mpsc::Receiver<FollowerCommand>,
}

/// Cloneable handle to the follower task
#[derive(Clone)]
pub struct FollowerHandle {
    identity: NodeIdentity,
    sender: mpsc::Sender<FollowerCommand>,
    waiter: Arc<SessionOperationIdWaiter>,
}

impl StructuralFollower {
    /// Start the follower task.
    ///
    /// Entries logged but never applied before a restart are reloaded as
    /// pending and applied once the leader confirms them again.
    pub fn spawn(
        identity: NodeIdentity,
        leader: NodeIdentity,
        oplog: Arc<dyn OperationLog>,
        cluster: Arc<dyn ClusterContext>,
        outbox: Outbox,
        waiter: Arc<SessionOperationIdWaiter>,
        config: ReplicationConfig,
    ) -> Result<(FollowerHandle, JoinHandle<Result<()>>)> {
        let last_state_id = cluster.read_shared_configuration().last_update_id();

        let mut pending = BTreeMap::new();
        match oplog.search_from(LogId::after(last_state_id))? {
            Some(entries) => {
                for entry in entries {
                    pending.insert(entry.log_id, entry.operation);
                }
            }
            None => warn!(
                "Operation log does not reach back to {:?}, waiting for a resync",
                last_state_id
            ),
        }
        if !pending.is_empty() {
            info!("Reloaded {} unapplied entries", pending.len());
        }

        let (sender, commands) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let follower = StructuralFollower {
            identity: identity.clone(),
            leader,
            oplog,
            cluster,
            outbox,
            waiter: waiter.clone(),
            config,
            pending,
            last_state_id,
            state: SyncState::Unsynced,
            resync_requested_at: None,
            join_requested_at: None,
            last_contact: Instant::now(),
            commands,
        };

        let task = tokio::spawn(follower.run());
        Ok((
            FollowerHandle {
                identity,
                sender,
                waiter,
            },
            task,
        ))
    }

    async fn run(mut self) -> Result<()> {
        info!(
            "Structural follower {} started, leader {}, last applied {:?}",
            self.identity, self.leader, self.last_state_id
        );

        let mut watchdog = interval(self.config.ping_interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    if let Err(e) = self.handle(command) {
                        if e.is_fatal() {
                            error!("Structural follower stopping: {}", e);
                            return Err(e);
                        }
                        warn!("Structural follower error: {}", e);
                    }
                }
                _ = watchdog.tick() => self.check_leader_contact(),
            }
        }

        info!("Structural follower {} stopped", self.identity);
        Ok(())
    }

    fn handle(&mut self, command: FollowerCommand) -> Result<()> {
        match command.sender() {
            Some(sender) if !self.from_leader(sender) => return Ok(()),
            Some(_) => self.last_contact = Instant::now(),
            None => {}
        }

        match command {
            FollowerCommand::Status(reply) => {
                let _ = reply.send(self.status());
                Ok(())
            }
            FollowerCommand::Log {
                log_id, operation, ..
            } => self.log(log_id, operation),
            FollowerCommand::Confirm { log_id, .. } => self.confirm(log_id),
            FollowerCommand::Recover {
                log_id, operation, ..
            } => self.recover(log_id, operation),
            FollowerCommand::Ping {
                last_log,
                last_confirmed,
                ..
            } => self.ping(last_log, last_confirmed),
            FollowerCommand::FullConfiguration { configuration, .. } => {
                self.full_configuration(configuration)
            }
        }
    }

    fn from_leader(&self, sender: &NodeIdentity) -> bool {
        if *sender == self.leader {
            true
        } else {
            warn!("Ignoring structural message from non-leader {}", sender);
            false
        }
    }

    fn applied(&self, log_id: LogId) -> bool {
        self.last_state_id.is_some_and(|last| log_id <= last)
    }

    /// Persist a proposed operation and acknowledge it
    fn log(&mut self, log_id: LogId, operation: RaftOperation) -> Result<()> {
        if self.applied(log_id) {
            trace!("{} already applied, ignoring", log_id);
            return Ok(());
        }

        if !self.oplog.log_received(log_id, &operation)? {
            debug!(
                "Gap before {} (last logged {:?})",
                log_id,
                self.oplog.last_persistent_log()
            );
            return self.resync_oplog();
        }

        self.pending.entry(log_id).or_insert(operation);
        if let Err(e) = self.outbox.ack(&self.leader, log_id) {
            warn!("Failed to ack {}: {}", log_id, e);
        }
        self.mark_synced();
        Ok(())
    }

    /// Apply everything up to `log_id`
    fn confirm(&mut self, log_id: LogId) -> Result<()> {
        if self.applied(log_id) {
            trace!("Confirm {} already applied", log_id);
            return Ok(());
        }
        self.enqueue_from(log_id)
    }

    /// Accept a committed operation replayed during a resync
    fn recover(&mut self, log_id: LogId, operation: RaftOperation) -> Result<()> {
        if self.applied(log_id) {
            return Ok(());
        }
        if !self.oplog.log_received(log_id, &operation)? {
            return self.resync_oplog();
        }
        self.pending.entry(log_id).or_insert(operation);
        self.enqueue_from(log_id)
    }

    fn enqueue_from(&mut self, upto: LogId) -> Result<()> {
        let previous = self.state;
        self.state = SyncState::Applying;
        let mut next = LogId::after(self.last_state_id);

        while next <= upto {
            let Some(operation) = self.pending.remove(&next) else {
                warn!("Missing {} while applying up to {}", next, upto);
                self.state = previous;
                return self.resync_oplog();
            };
            self.apply(next, &operation)?;
            next = next.next();
        }

        self.mark_synced();
        Ok(())
    }

    fn apply(&mut self, log_id: LogId, operation: &RaftOperation) -> Result<()> {
        if let Err(e) = operation.apply(self.cluster.as_ref(), log_id)? {
            // Position still advances; the operation is never retried
            warn!("Applying {} {} failed: {}", operation.type_name(), log_id, e);
        }
        self.last_state_id = Some(log_id);

        if let Some(requester) = operation.requester_sequential() {
            if requester.originated_on(&self.identity) {
                self.waiter.notify(requester.sequential);
            }
        }
        debug!("Applied {} {}", operation.type_name(), log_id);
        Ok(())
    }

    /// React to the leader's periodic announcement
    fn ping(&mut self, last_log: Option<LogId>, last_confirmed: Option<LogId>) -> Result<()> {
        if !self
            .cluster
            .read_shared_configuration()
            .exists_node(&self.identity)
        {
            self.request_join("not registered yet");
        }

        let local = self.oplog.last_persistent_log();
        if last_log > local {
            debug!("Behind leader: local {:?}, leader {:?}", local, last_log);
            return self.resync_oplog();
        }
        if last_confirmed > self.last_state_id {
            if let Some(confirmed) = last_confirmed {
                return self.enqueue_from(confirmed);
            }
        }
        if self.state == SyncState::Unsynced {
            self.mark_synced();
        }
        Ok(())
    }

    /// Replace local state with the leader's shared configuration
    fn full_configuration(&mut self, configuration: SharedConfiguration) -> Result<()> {
        let last = configuration.last_update_id();
        if last < self.last_state_id {
            warn!(
                "Ignoring full configuration at {:?}, already applied {:?}",
                last, self.last_state_id
            );
            return Ok(());
        }
        info!("Installing full configuration at {:?}", last);

        let current = self.cluster.read_shared_configuration();
        for name in current.databases().keys() {
            if !configuration.exists_database(name) {
                if let Err(e) = self.cluster.internal_drop_database(name) {
                    warn!("Failed to drop database '{}': {}", name, e);
                }
            }
        }
        for (name, descriptor) in configuration.databases() {
            if !current.exists_database(name) {
                if let Err(e) = self.cluster.internal_create_database(
                    name,
                    &descriptor.db_type,
                    &descriptor.config,
                ) {
                    warn!("Failed to create database '{}': {}", name, e);
                }
            }
        }

        let reflected = configuration.applied_sequential(&self.identity.id);
        self.cluster.replace_shared_configuration(configuration)?;
        self.oplog.rebase(last)?;
        self.pending.clear();
        self.last_state_id = last;
        if let Some(sequential) = reflected {
            self.waiter.notify(sequential);
        }
        self.mark_synced();
        Ok(())
    }

    /// Re-announce when the leader has gone quiet
    fn check_leader_contact(&mut self) {
        let silence = self.config.ping_interval * LEADER_SILENCE_PINGS;
        if self.last_contact.elapsed() >= silence {
            self.request_join("leader silent");
        }
    }

    /// Ask the leader to (re)admit this node, at most once per operation timeout
    fn request_join(&mut self, reason: &str) {
        let throttled = self
            .join_requested_at
            .is_some_and(|at| at.elapsed() < self.config.operation_timeout);
        if throttled {
            return;
        }

        info!("Announcing {} to {} ({})", self.identity, self.leader, reason);
        self.join_requested_at = Some(Instant::now());
        if let Err(e) = self.outbox.join(&self.leader) {
            warn!("Failed to announce to {}: {}", self.leader, e);
        }
    }

    /// Ask the leader for everything after our last logged entry
    fn resync_oplog(&mut self) -> Result<()> {
        let in_progress = self.state == SyncState::Syncing
            && self
                .resync_requested_at
                .is_some_and(|at| at.elapsed() < self.config.operation_timeout);
        if in_progress {
            trace!("Resync already requested");
            return Ok(());
        }

        let last_known = self.oplog.last_persistent_log();
        info!("Requesting resync from {} after {:?}", self.leader, last_known);
        self.state = SyncState::Syncing;
        self.resync_requested_at = Some(Instant::now());
        if let Err(e) = self.outbox.request_resync(&self.leader, last_known) {
            warn!("Failed to request resync: {}", e);
        }
        Ok(())
    }

    fn mark_synced(&mut self) {
        if self.state != SyncState::Synced {
            debug!("Follower {} -> {}", self.state, SyncState::Synced);
        }
        self.state = SyncState::Synced;
        self.resync_requested_at = None;
    }

    fn status(&self) -> FollowerStatus {
        FollowerStatus {
            state: self.state,
            last_log: self.oplog.last_persistent_log(),
            last_applied: self.last_state_id,
            pending: self.pending.len(),
        }
    }
}

impl FollowerHandle {
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    async fn send(&self, command: FollowerCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| Error::Replication("Structural follower stopped".into()))
    }

    /// A proposed operation from the leader
    pub async fn log(
        &self,
        leader: NodeIdentity,
        log_id: LogId,
        operation: RaftOperation,
    ) -> Result<()> {
        self.send(FollowerCommand::Log {
            leader,
            log_id,
            operation,
        })
        .await
    }

    /// Operations up to `log_id` are committed
    pub async fn confirm(&self, leader: NodeIdentity, log_id: LogId) -> Result<()> {
        self.send(FollowerCommand::Confirm { leader, log_id }).await
    }

    /// A committed operation replayed by the leader
    pub async fn recover(
        &self,
        leader: NodeIdentity,
        log_id: LogId,
        operation: RaftOperation,
    ) -> Result<()> {
        self.send(FollowerCommand::Recover {
            leader,
            log_id,
            operation,
        })
        .await
    }

    /// The leader's last logged and last committed ids
    pub async fn ping(
        &self,
        leader: NodeIdentity,
        last_log: Option<LogId>,
        last_confirmed: Option<LogId>,
    ) -> Result<()> {
        self.send(FollowerCommand::Ping {
            leader,
            last_log,
            last_confirmed,
        })
        .await
    }

    pub async fn full_configuration(
        &self,
        leader: NodeIdentity,
        configuration: SharedConfiguration,
    ) -> Result<()> {
        self.send(FollowerCommand::FullConfiguration {
            leader,
            configuration,
        })
        .await
    }

    pub async fn status(&self) -> Result<FollowerStatus> {
        let (reply, status) = oneshot::channel();
        self.send(FollowerCommand::Status(reply)).await?;
        status
            .await
            .map_err(|_| Error::Replication("Structural follower stopped".into()))
    }

    /// Wait until an operation submitted from this node has been applied here
    pub async fn wait_for_execution(
        &self,
        operation_id: &SessionOperationId,
        timeout: Duration,
    ) -> Result<()> {
        if !operation_id.originated_on(&self.identity) {
            return Err(Error::Replication(format!(
                "{} did not originate on {}",
                operation_id, self.identity
            )));
        }
        self.waiter.wait_for(operation_id.sequential, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Message, Outbound};
    use crate::oplog::InMemoryOperationLog;
    use crate::state::{EngineEvent, InMemoryClusterContext};

    struct Fixture {
        handle: FollowerHandle,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        cluster: Arc<InMemoryClusterContext>,
        oplog: Arc<InMemoryOperationLog>,
    }

    fn me() -> NodeIdentity {
        NodeIdentity::new("id-b", "b")
    }

    fn leader() -> NodeIdentity {
        NodeIdentity::new("id-l", "leader")
    }

    fn create(name: &str, node_id: &str, sequential: u64) -> RaftOperation {
        RaftOperation::CreateDatabase {
            operation_id: SessionOperationId::new(node_id, sequential),
            database: name.to_string(),
            db_type: "graph".to_string(),
            config: BTreeMap::new(),
        }
    }

    fn start_with(cluster: Arc<InMemoryClusterContext>, oplog: Arc<InMemoryOperationLog>) -> Fixture {
        start_configured(cluster, oplog, ReplicationConfig::default())
    }

    fn start_configured(
        cluster: Arc<InMemoryClusterContext>,
        oplog: Arc<InMemoryOperationLog>,
        config: ReplicationConfig,
    ) -> Fixture {
        let (outbox, outbound) = Outbox::new(me());
        let (handle, _task) = StructuralFollower::spawn(
            me(),
            leader(),
            oplog.clone(),
            cluster.clone(),
            outbox,
            Arc::new(SessionOperationIdWaiter::new()),
            config,
        )
        .unwrap();
        Fixture {
            handle,
            outbound,
            cluster,
            oplog,
        }
    }

    fn start() -> Fixture {
        start_with(
            Arc::new(InMemoryClusterContext::new()),
            Arc::new(InMemoryOperationLog::new()),
        )
    }

    fn drain(outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok((target, envelope)) = outbound.try_recv() {
            assert_eq!(target, leader());
            messages.push(envelope.message);
        }
        messages
    }

    #[tokio::test]
    async fn test_log_ack_then_apply_on_confirm() {
        let mut f = start();
        f.handle
            .log(leader(), LogId::new(1), create("X", "id-l", 1))
            .await
            .unwrap();
        let status = f.handle.status().await.unwrap();
        assert_eq!(status.pending, 1);
        assert_eq!(status.state, SyncState::Synced);
        assert!(f.cluster.engine_events().is_empty());
        assert_eq!(
            drain(&mut f.outbound),
            vec![Message::OperationAck { log_id: LogId::new(1) }]
        );

        f.handle.confirm(leader(), LogId::new(1)).await.unwrap();
        let status = f.handle.status().await.unwrap();
        assert_eq!(status.last_applied, Some(LogId::new(1)));
        assert_eq!(status.pending, 0);
        assert_eq!(f.cluster.engine_events(), vec![EngineEvent::Created("X".into())]);

        // Duplicate confirm and duplicate proposal change nothing
        f.handle.confirm(leader(), LogId::new(1)).await.unwrap();
        f.handle
            .log(leader(), LogId::new(1), create("X", "id-l", 1))
            .await
            .unwrap();
        f.handle.status().await.unwrap();
        assert_eq!(f.cluster.engine_events().len(), 1);
    }

    #[tokio::test]
    async fn test_gap_requests_resync_once() {
        let mut f = start();
        f.handle
            .log(leader(), LogId::new(1), create("A", "id-l", 1))
            .await
            .unwrap();
        f.handle
            .log(leader(), LogId::new(3), create("C", "id-l", 3))
            .await
            .unwrap();
        f.handle
            .log(leader(), LogId::new(4), create("D", "id-l", 4))
            .await
            .unwrap();
        let status = f.handle.status().await.unwrap();
        assert_eq!(status.state, SyncState::Syncing);
        assert_eq!(status.last_log, Some(LogId::new(1)));

        let messages = drain(&mut f.outbound);
        assert_eq!(
            messages,
            vec![
                Message::OperationAck { log_id: LogId::new(1) },
                Message::ResyncRequest { last_known: Some(LogId::new(1)) },
            ]
        );
    }

    #[tokio::test]
    async fn test_recover_applies_in_order() {
        let f = start();
        f.handle
            .recover(leader(), LogId::new(1), create("A", "id-l", 1))
            .await
            .unwrap();
        f.handle
            .recover(leader(), LogId::new(2), create("B", "id-l", 2))
            .await
            .unwrap();
        let status = f.handle.status().await.unwrap();
        assert_eq!(status.last_applied, Some(LogId::new(2)));
        assert_eq!(
            f.cluster.engine_events(),
            vec![EngineEvent::Created("A".into()), EngineEvent::Created("B".into())]
        );
    }

    #[tokio::test]
    async fn test_ping_applies_missed_confirm() {
        let mut f = start();
        f.handle
            .log(leader(), LogId::new(1), create("A", "id-l", 1))
            .await
            .unwrap();
        f.handle
            .ping(leader(), Some(LogId::new(1)), Some(LogId::new(1)))
            .await
            .unwrap();
        assert_eq!(
            f.handle.status().await.unwrap().last_applied,
            Some(LogId::new(1))
        );

        // Leader is ahead: ask for a resync
        drain(&mut f.outbound);
        f.handle
            .ping(leader(), Some(LogId::new(5)), Some(LogId::new(5)))
            .await
            .unwrap();
        f.handle.status().await.unwrap();
        assert_eq!(
            drain(&mut f.outbound),
            vec![Message::ResyncRequest { last_known: Some(LogId::new(1)) }]
        );
    }

    #[tokio::test]
    async fn test_full_configuration_reconciles_engine() {
        let f = start();
        f.handle
            .recover(leader(), LogId::new(1), create("Old", "id-l", 1))
            .await
            .unwrap();

        let mut configuration = SharedConfiguration::new(0);
        configuration.add_database("New", "document", BTreeMap::new());
        configuration.set_last_update_id(Some(LogId::new(40)));
        f.handle
            .full_configuration(leader(), configuration.clone())
            .await
            .unwrap();

        let status = f.handle.status().await.unwrap();
        assert_eq!(status.last_applied, Some(LogId::new(40)));
        assert_eq!(status.last_log, Some(LogId::new(40)));
        assert_eq!(f.cluster.read_shared_configuration(), configuration);
        assert_eq!(
            f.cluster.engine_events(),
            vec![
                EngineEvent::Created("Old".into()),
                EngineEvent::Dropped("Old".into()),
                EngineEvent::Created("New".into()),
            ]
        );

        // Numbering continues after the snapshot
        assert!(f.oplog.log_received(LogId::new(41), &create("Z", "id-l", 9)).unwrap());
    }

    #[tokio::test]
    async fn test_messages_from_non_leader_ignored() {
        let mut f = start();
        let stranger = NodeIdentity::new("id-x", "x");
        f.handle
            .log(stranger.clone(), LogId::new(1), create("A", "id-x", 1))
            .await
            .unwrap();
        f.handle.confirm(stranger, LogId::new(1)).await.unwrap();
        let status = f.handle.status().await.unwrap();
        assert_eq!(status.pending, 0);
        assert_eq!(status.last_log, None);
        assert!(drain(&mut f.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_restart_reloads_pending() {
        let oplog = Arc::new(InMemoryOperationLog::new());
        oplog.log_received(LogId::new(1), &create("A", "id-l", 1)).unwrap();
        oplog.log_received(LogId::new(2), &create("B", "id-l", 2)).unwrap();

        let mut shared = SharedConfiguration::new(0);
        shared.add_database("A", "graph", BTreeMap::new());
        shared.set_last_update_id(Some(LogId::new(1)));
        let cluster = Arc::new(InMemoryClusterContext::with_configuration(shared));

        let f = start_with(cluster, oplog);
        let status = f.handle.status().await.unwrap();
        assert_eq!(status.last_applied, Some(LogId::new(1)));
        assert_eq!(status.pending, 1);

        f.handle.confirm(leader(), LogId::new(2)).await.unwrap();
        f.handle.status().await.unwrap();
        assert_eq!(f.cluster.engine_events(), vec![EngineEvent::Created("B".into())]);
    }

    #[tokio::test]
    async fn test_wait_for_execution() {
        let f = start();
        let mine = SessionOperationId::new("id-b", 5);
        f.handle
            .log(leader(), LogId::new(1), create("A", "id-b", 5))
            .await
            .unwrap();
        f.handle.confirm(leader(), LogId::new(1)).await.unwrap();
        f.handle
            .wait_for_execution(&mine, Duration::from_secs(1))
            .await
            .unwrap();

        let foreign = SessionOperationId::new("id-l", 5);
        assert!(f
            .handle
            .wait_for_execution(&foreign, Duration::from_millis(10))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_single_confirm_applies_backlog_in_order() {
        let mut f = start();
        for (i, name) in ["A", "B", "C"].iter().enumerate() {
            let id = i as u64 + 1;
            f.handle
                .log(leader(), LogId::new(id), create(name, "id-l", id))
                .await
                .unwrap();
        }
        assert!(f.cluster.engine_events().is_empty());

        f.handle.confirm(leader(), LogId::new(3)).await.unwrap();
        let status = f.handle.status().await.unwrap();
        assert_eq!(status.last_applied, Some(LogId::new(3)));
        assert_eq!(status.pending, 0);
        assert_eq!(status.state, SyncState::Synced);
        assert_eq!(
            f.cluster.engine_events(),
            vec![
                EngineEvent::Created("A".into()),
                EngineEvent::Created("B".into()),
                EngineEvent::Created("C".into()),
            ]
        );
        assert_eq!(
            f.cluster.read_shared_configuration().last_update_id(),
            Some(LogId::new(3))
        );
        assert!(!drain(&mut f.outbound)
            .iter()
            .any(|m| matches!(m, Message::ResyncRequest { .. })));
    }

    #[tokio::test]
    async fn test_confirm_past_missing_entry_stops_and_resyncs() {
        let mut f = start();
        f.handle
            .log(leader(), LogId::new(1), create("A", "id-l", 1))
            .await
            .unwrap();

        // Entry 2 never arrived
        f.handle.confirm(leader(), LogId::new(3)).await.unwrap();
        let status = f.handle.status().await.unwrap();
        assert_eq!(status.last_applied, Some(LogId::new(1)));
        assert_eq!(status.state, SyncState::Syncing);
        assert_eq!(f.cluster.engine_events(), vec![EngineEvent::Created("A".into())]);
        assert_eq!(
            drain(&mut f.outbound),
            vec![
                Message::OperationAck { log_id: LogId::new(1) },
                Message::ResyncRequest { last_known: Some(LogId::new(1)) },
            ]
        );

        // A second confirm while the resync is outstanding asks nothing new
        f.handle.confirm(leader(), LogId::new(3)).await.unwrap();
        f.handle.status().await.unwrap();
        assert!(drain(&mut f.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_follower_rejoins_on_ping() {
        let mut f = start();
        f.handle.ping(leader(), None, None).await.unwrap();
        f.handle.ping(leader(), None, None).await.unwrap();
        f.handle.status().await.unwrap();
        // Throttled to one announcement per operation timeout
        assert_eq!(drain(&mut f.outbound), vec![Message::Join]);

        let mut shared = SharedConfiguration::new(0);
        shared.add_node(me());
        let f = start_with(
            Arc::new(InMemoryClusterContext::with_configuration(shared)),
            Arc::new(InMemoryOperationLog::new()),
        );
        let mut outbound = f.outbound;
        f.handle.ping(leader(), None, None).await.unwrap();
        f.handle.status().await.unwrap();
        assert!(drain(&mut outbound).is_empty());
    }

    #[tokio::test]
    async fn test_silent_leader_triggers_announcement() {
        let config = ReplicationConfig {
            ping_interval: Duration::from_millis(20),
            ..ReplicationConfig::default()
        };
        let mut f = start_configured(
            Arc::new(InMemoryClusterContext::new()),
            Arc::new(InMemoryOperationLog::new()),
            config,
        );

        let (target, envelope) = tokio::time::timeout(Duration::from_secs(2), f.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(target, leader());
        assert_eq!(envelope.message, Message::Join);
    }

    #[tokio::test]
    async fn test_full_configuration_releases_waiting_submitter() {
        let f = start();
        let mine = SessionOperationId::new("id-b", 12);
        let handle = f.handle.clone();
        let waiting = tokio::spawn(async move {
            handle
                .wait_for_execution(&mine, Duration::from_secs(2))
                .await
        });

        let mut configuration = SharedConfiguration::new(0);
        configuration.add_database("R", "graph", BTreeMap::new());
        configuration.record_applied(&SessionOperationId::new("id-b", 12));
        configuration.set_last_update_id(Some(LogId::new(9)));
        f.handle
            .full_configuration(leader(), configuration)
            .await
            .unwrap();

        waiting.await.unwrap().unwrap();
        assert!(f.cluster.read_shared_configuration().exists_database("R"));
    }
}
