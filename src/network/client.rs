//! Network Client
//!
//! TCP client delivering outbound envelopes to peer nodes.

use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{write_envelope, Envelope, Outbound};
use crate::error::{Error, Result};
use crate::id::NodeIdentity;

/// Network client for connecting to peer nodes.
///
/// One connection is kept per peer, so envelopes to the same node are
/// delivered in the order they were queued.
pub struct NetworkClient {
    /// Peer addresses by node id
    addresses: HashMap<String, String>,
    /// Open connections by address
    pool: HashMap<String, TcpStream>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Peers a delivery failed for
    failures: Option<mpsc::UnboundedSender<NodeIdentity>>,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(peers: impl IntoIterator<Item = (NodeIdentity, String)>, connect_timeout: Duration) -> Self {
        Self {
            addresses: peers
                .into_iter()
                .map(|(identity, address)| (identity.id, address))
                .collect(),
            pool: HashMap::new(),
            connect_timeout,
            failures: None,
        }
    }

    /// Report every peer a delivery fails for on `failures`
    pub fn with_failure_reports(mut self, failures: mpsc::UnboundedSender<NodeIdentity>) -> Self {
        self.failures = Some(failures);
        self
    }

    /// Drain an outbox until every sender is gone
    pub async fn run(mut self, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        while let Some((target, envelope)) = outbound.recv().await {
            if let Err(e) = self.send(&target, &envelope).await {
                tracing::warn!(
                    "Dropping {} to {}: {}",
                    envelope.message.type_name(),
                    target,
                    e
                );
                if let Some(failures) = &self.failures {
                    let _ = failures.send(target);
                }
            }
        }
        self.close_all();
    }

    /// Send one envelope, reconnecting once if the pooled connection is dead
    pub async fn send(&mut self, target: &NodeIdentity, envelope: &Envelope) -> Result<()> {
        let address = self
            .addresses
            .get(&target.id)
            .cloned()
            .ok_or_else(|| Error::Network(format!("No address known for {}", target)))?;

        if let Some(stream) = self.pool.get_mut(&address) {
            if write_envelope(stream, envelope).await.is_ok() {
                return Ok(());
            }
            // Connection is dead, remove and reconnect
            self.pool.remove(&address);
        }

        let mut stream = self.connect(&address).await?;
        write_envelope(&mut stream, envelope).await?;
        self.pool.insert(address, stream);
        Ok(())
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Close all connections
    pub fn close_all(&mut self) {
        self.pool.clear();
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.pool.len()
    }
}
