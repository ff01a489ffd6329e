//! Client request entry point
//!
//! Routes a structural request to the leader (in-process or over the
//! network), waits for the answer and then for the local apply, so the
//! caller can read its own write on this node.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info};

use super::leader::LeaderHandle;
use super::waiter::SessionOperationIdWaiter;
use crate::error::{Error, Result};
use crate::id::{NodeIdentity, SessionOperationId, SessionOperationIdGenerator};
use crate::network::Outbox;
use crate::operation::{SubmitRequest, SubmitResponse};

enum Route {
    /// This node is the leader
    Local(LeaderHandle),
    /// Requests are relayed to a remote leader
    Remote { leader: NodeIdentity, outbox: Outbox },
}

/// Submits client requests and tracks their answers
pub struct SubmitContext {
    generator: SessionOperationIdGenerator,
    waiter: Arc<SessionOperationIdWaiter>,
    route: Route,
    timeout: Duration,
    pending: Mutex<HashMap<SessionOperationId, oneshot::Sender<SubmitResponse>>>,
}

impl SubmitContext {
    /// Submit through the leader running in this process
    pub fn local(
        identity: &NodeIdentity,
        leader: LeaderHandle,
        waiter: Arc<SessionOperationIdWaiter>,
        timeout: Duration,
    ) -> Self {
        Self::with_route(identity, Route::Local(leader), waiter, timeout)
    }

    /// Submit by relaying to a remote leader
    pub fn remote(
        identity: &NodeIdentity,
        leader: NodeIdentity,
        outbox: Outbox,
        waiter: Arc<SessionOperationIdWaiter>,
        timeout: Duration,
    ) -> Self {
        Self::with_route(identity, Route::Remote { leader, outbox }, waiter, timeout)
    }

    fn with_route(
        identity: &NodeIdentity,
        route: Route,
        waiter: Arc<SessionOperationIdWaiter>,
        timeout: Duration,
    ) -> Self {
        Self {
            generator: SessionOperationIdGenerator::new(identity.id.clone()),
            waiter,
            route,
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Submit a request and wait until a successful result is visible here
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse> {
        let operation_id = self.generator.generate();
        info!("Submitting {:?} as {}", request, operation_id);

        let response = match &self.route {
            Route::Local(leader) => leader.submit(None, operation_id.clone(), request).await?,
            Route::Remote { leader, outbox } => {
                self.relay(leader, outbox, operation_id.clone(), request)
                    .await?
            }
        };

        if response.success {
            self.waiter
                .wait_for(operation_id.sequential, self.timeout)
                .await?;
        }
        Ok(response)
    }

    async fn relay(
        &self,
        leader: &NodeIdentity,
        outbox: &Outbox,
        operation_id: SessionOperationId,
        request: SubmitRequest,
    ) -> Result<SubmitResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending_requests().insert(operation_id.clone(), tx);

        if let Err(e) = outbox.submit(leader, operation_id.clone(), request) {
            self.pending_requests().remove(&operation_id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.pending_requests().remove(&operation_id);
                Err(Error::ConnectionTimeout(leader.to_string()))
            }
        }
    }

    /// Deliver the leader's answer to the waiting submitter
    pub fn receive_response(&self, operation_id: SessionOperationId, response: SubmitResponse) {
        match self.pending_requests().remove(&operation_id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!("No submitter waiting for {}", operation_id),
        }
    }

    /// Number of relayed requests still waiting for an answer
    pub fn pending_count(&self) -> usize {
        self.pending_requests().len()
    }

    fn pending_requests(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SessionOperationId, oneshot::Sender<SubmitResponse>>>
    {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
