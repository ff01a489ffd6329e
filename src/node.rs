//! Structural Node
//!
//! One cluster member: either the structural leader or a follower, plus the
//! submit context clients go through. Inbound envelopes are decoded and
//! routed to the role's task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::id::NodeIdentity;
use crate::lock::LockManager;
use crate::network::{Envelope, Message, Outbox};
use crate::operation::{SubmitRequest, SubmitResponse};
use crate::oplog::OperationLog;
use crate::replication::{
    FollowerHandle, LeaderHandle, ProposalOutcome, ReplicationConfig, SessionOperationIdWaiter,
    StructuralFollower, StructuralLeader, SubmitContext,
};
use crate::state::{ClusterContext, SharedConfiguration};

/// The replication role this node plays
#[derive(Clone)]
pub enum Role {
    Leader(LeaderHandle),
    Follower(FollowerHandle),
}

/// A running cluster member
#[derive(Clone)]
pub struct StructuralNode {
    identity: NodeIdentity,
    leader: NodeIdentity,
    role: Role,
    submit: Arc<SubmitContext>,
    waiter: Arc<SessionOperationIdWaiter>,
    cluster: Arc<dyn ClusterContext>,
    outbox: Outbox,
    /// Pause before re-proposing a failed self registration
    retry_interval: Duration,
}

impl StructuralNode {
    /// Start the role task for this node.
    ///
    /// The node leads when `leader` is its own identity.
    pub fn start(
        identity: NodeIdentity,
        leader: NodeIdentity,
        oplog: Arc<dyn OperationLog>,
        cluster: Arc<dyn ClusterContext>,
        locks: Arc<dyn LockManager>,
        outbox: Outbox,
        config: ReplicationConfig,
    ) -> Result<(Self, JoinHandle<Result<()>>)> {
        let waiter = Arc::new(SessionOperationIdWaiter::new());
        let submit_timeout = config.submit_timeout;
        let retry_interval = config.ping_interval;

        let (role, submit, task) = if identity == leader {
            let (handle, task) = StructuralLeader::spawn(
                identity.clone(),
                oplog,
                cluster.clone(),
                locks,
                outbox.clone(),
                waiter.clone(),
                config,
            );
            let submit = SubmitContext::local(&identity, handle.clone(), waiter.clone(), submit_timeout);
            (Role::Leader(handle), submit, task)
        } else {
            let (handle, task) = StructuralFollower::spawn(
                identity.clone(),
                leader.clone(),
                oplog,
                cluster.clone(),
                outbox.clone(),
                waiter.clone(),
                config,
            )?;
            let submit = SubmitContext::remote(
                &identity,
                leader.clone(),
                outbox.clone(),
                waiter.clone(),
                submit_timeout,
            );
            (Role::Follower(handle), submit, task)
        };

        info!(
            "Node {} started as {}",
            identity,
            if matches!(role, Role::Leader(_)) { "leader" } else { "follower" }
        );

        let node = StructuralNode {
            identity,
            leader,
            role,
            submit: Arc::new(submit),
            waiter,
            cluster,
            outbox,
            retry_interval,
        };
        Ok((node, task))
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn leader(&self) -> &NodeIdentity {
        &self.leader
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn waiter(&self) -> &Arc<SessionOperationIdWaiter> {
        &self.waiter
    }

    /// This node's copy of the shared configuration
    pub fn shared_configuration(&self) -> SharedConfiguration {
        self.cluster.read_shared_configuration()
    }

    /// Introduce this node to the cluster.
    ///
    /// The leader registers itself and treats `peers` as connected members;
    /// a follower asks the leader to admit it.
    pub async fn announce(&self, peers: &[NodeIdentity]) -> Result<()> {
        match &self.role {
            Role::Leader(leader) => {
                for peer in peers {
                    leader.connected(peer.clone()).await?;
                }
                let leader = leader.clone();
                let identity = self.identity.clone();
                let retry = self.retry_interval;
                tokio::spawn(async move {
                    loop {
                        match leader.join(identity.clone()).await {
                            Ok(Some(ProposalOutcome::Applied(log_id))) => {
                                info!("Leader {} registered at {}", identity, log_id);
                                break;
                            }
                            Ok(None) => {
                                debug!("Leader {} already registered", identity);
                                break;
                            }
                            Ok(Some(outcome)) => {
                                warn!(
                                    "Leader {} registration ended with {:?}, retrying",
                                    identity, outcome
                                );
                            }
                            Err(e) => {
                                warn!("Leader {} failed to register: {}", identity, e);
                                break;
                            }
                        }
                        tokio::time::sleep(retry).await;
                    }
                });
                Ok(())
            }
            Role::Follower(_) => self.outbox.join(&self.leader),
        }
    }

    /// Submit a client request and wait until its effect is visible here
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse> {
        self.submit.submit(request).await
    }

    pub async fn create_database(
        &self,
        name: &str,
        db_type: &str,
        config: BTreeMap<String, String>,
    ) -> Result<SubmitResponse> {
        self.submit(SubmitRequest::CreateDatabase {
            name: name.to_string(),
            db_type: db_type.to_string(),
            config,
        })
        .await
    }

    pub async fn drop_database(&self, name: &str) -> Result<SubmitResponse> {
        self.submit(SubmitRequest::DropDatabase {
            name: name.to_string(),
        })
        .await
    }

    /// Remove a member from the leader's quorum-eligible set
    pub async fn disconnected(&self, identity: NodeIdentity) -> Result<()> {
        match &self.role {
            Role::Leader(leader) => leader.disconnected(identity).await,
            Role::Follower(_) => Err(Error::NotLeader(self.leader.to_string())),
        }
    }

    /// Turn transport delivery failures into membership changes.
    ///
    /// On the leader every reported peer is disconnected until it announces
    /// itself again; followers only log them.
    pub fn watch_failures(&self, mut failures: mpsc::UnboundedReceiver<NodeIdentity>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(peer) = failures.recv().await {
                match &node.role {
                    Role::Leader(leader) => {
                        if let Err(e) = leader.disconnected(peer.clone()).await {
                            warn!("Failed to disconnect {}: {}", peer, e);
                            break;
                        }
                    }
                    Role::Follower(_) => debug!("Delivery to {} failed", peer),
                }
            }
        })
    }

    /// Dispatch envelopes from `inbox` until it closes
    pub fn spawn(&self, mut inbox: mpsc::UnboundedReceiver<Envelope>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                let kind = envelope.message.type_name();
                let from = envelope.from.clone();
                if let Err(e) = node.dispatch(envelope).await {
                    warn!("Failed to handle {} from {}: {}", kind, from, e);
                }
            }
            debug!("Inbox of {} closed", node.identity);
        })
    }

    /// Route one inbound envelope to the role task
    pub async fn dispatch(&self, envelope: Envelope) -> Result<()> {
        let Envelope { from, message } = envelope;
        match &self.role {
            Role::Leader(leader) => self.dispatch_leader(leader, from, message).await,
            Role::Follower(follower) => self.dispatch_follower(follower, from, message).await,
        }
    }

    async fn dispatch_leader(
        &self,
        leader: &LeaderHandle,
        from: NodeIdentity,
        message: Message,
    ) -> Result<()> {
        match message {
            Message::OperationAck { log_id } => leader.receive_ack(from, log_id).await,
            Message::ResyncRequest { last_known } => leader.resync(from, last_known).await,
            Message::Submit {
                operation_id,
                request,
            } => {
                // Runs a whole consensus round; acks must keep flowing meanwhile
                let leader = leader.clone();
                tokio::spawn(async move {
                    if let Err(e) = leader.submit(Some(&from), operation_id, request).await {
                        warn!("Relayed request from {} failed: {}", from, e);
                    }
                });
                Ok(())
            }
            Message::Join => {
                leader.connected(from.clone()).await?;
                let leader = leader.clone();
                tokio::spawn(async move {
                    match leader.join(from.clone()).await {
                        Ok(Some(ProposalOutcome::Applied(log_id))) => {
                            info!("Node {} joined at {}", from, log_id)
                        }
                        Ok(Some(outcome)) => warn!("Join of {} ended with {:?}", from, outcome),
                        Ok(None) => debug!("Node {} rejoined", from),
                        Err(e) => warn!("Join of {} rejected: {}", from, e),
                    }
                });
                Ok(())
            }
            other => {
                debug!("Leader ignoring {} from {}", other.type_name(), from);
                Ok(())
            }
        }
    }

    async fn dispatch_follower(
        &self,
        follower: &FollowerHandle,
        from: NodeIdentity,
        message: Message,
    ) -> Result<()> {
        match message {
            Message::OperationRequest { log_id, operation } => {
                follower.log(from, log_id, operation.decode()?).await
            }
            Message::Confirm { log_id } => follower.confirm(from, log_id).await,
            Message::Recover { log_id, operation } => {
                follower.recover(from, log_id, operation.decode()?).await
            }
            Message::LastOperation {
                last_log,
                last_confirmed,
            } => follower.ping(from, last_log, last_confirmed).await,
            Message::FullConfiguration { configuration } => {
                follower.full_configuration(from, configuration).await
            }
            Message::SubmitResponse {
                operation_id,
                response,
            } => {
                self.submit.receive_response(operation_id, response);
                Ok(())
            }
            Message::Submit { operation_id, .. } => {
                let refusal = SubmitResponse::failure(Error::NotLeader(self.leader.to_string()).to_string());
                self.outbox.reply(&from, operation_id, refusal)
            }
            other => {
                debug!("Follower ignoring {} from {}", other.type_name(), from);
                Ok(())
            }
        }
    }
}
