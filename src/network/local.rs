//! In-process transport connecting nodes that live in the same runtime.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::trace;

use super::{Envelope, Outbox};
use crate::id::NodeIdentity;

#[derive(Default)]
struct RouterInner {
    inboxes: RwLock<HashMap<NodeIdentity, mpsc::UnboundedSender<Envelope>>>,
    /// Directed links that currently drop everything
    blocked: RwLock<HashSet<(NodeIdentity, NodeIdentity)>>,
    /// Deliver every envelope twice
    duplicate: AtomicBool,
}

/// Routes envelopes between in-process nodes.
///
/// Delivery is ordered per sender. Links can be cut and envelopes
/// duplicated to exercise the catch-up and idempotency paths.
#[derive(Clone, Default)]
pub struct LocalRouter {
    inner: Arc<RouterInner>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node, returning its outbox and inbox.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, identity: NodeIdentity) -> (Outbox, mpsc::UnboundedReceiver<Envelope>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        self.inner
            .inboxes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(identity.clone(), inbox_tx);

        let (outbox, mut outbound) = Outbox::new(identity);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some((target, envelope)) = outbound.recv().await {
                inner.deliver(&target, envelope);
            }
        });

        (outbox, inbox_rx)
    }

    /// Drop everything `from` sends to `to`
    pub fn block(&self, from: &NodeIdentity, to: &NodeIdentity) {
        self.inner
            .blocked
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((from.clone(), to.clone()));
    }

    /// Restore the link from `from` to `to`
    pub fn unblock(&self, from: &NodeIdentity, to: &NodeIdentity) {
        self.inner
            .blocked
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(from.clone(), to.clone()));
    }

    /// Deliver every envelope twice while enabled
    pub fn set_duplicate(&self, duplicate: bool) {
        self.inner.duplicate.store(duplicate, Ordering::SeqCst);
    }
}

impl RouterInner {
    fn deliver(&self, target: &NodeIdentity, envelope: Envelope) {
        let link = (envelope.from.clone(), target.clone());
        if self
            .blocked
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&link)
        {
            trace!(
                "Dropping {} from {} to {}",
                envelope.message.type_name(),
                envelope.from,
                target
            );
            return;
        }

        let inboxes = self.inboxes.read().unwrap_or_else(|e| e.into_inner());
        let Some(inbox) = inboxes.get(target) else {
            trace!("No route to {}", target);
            return;
        };

        if self.duplicate.load(Ordering::SeqCst) {
            let _ = inbox.send(envelope.clone());
        }
        let _ = inbox.send(envelope);
    }
}
