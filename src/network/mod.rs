//! Network Module
//!
//! Message transport between nodes. The replication actors only ever talk
//! to an [`Outbox`]; what carries the envelopes (the in-process
//! [`LocalRouter`] or TCP) is decided when the node is assembled.

mod client;
mod local;
pub mod protocol;
mod server;

pub use client::NetworkClient;
pub use local::LocalRouter;
pub use protocol::{Envelope, FrameHeader, Message};
pub use server::NetworkServer;

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Error, Result};
use crate::id::{LogId, NodeIdentity, SessionOperationId};
use crate::operation::{OperationFrame, RaftOperation, SubmitRequest, SubmitResponse};
use crate::state::SharedConfiguration;

/// An envelope addressed to a node
pub type Outbound = (NodeIdentity, Envelope);

/// Read a framed envelope from a reader
pub async fn read_envelope<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    Ok(Envelope::deserialize(&body)?)
}

/// Write a framed envelope to a writer
pub async fn write_envelope<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = envelope.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

/// Sending side of the network contract used by the replication actors.
///
/// Sends never block: envelopes are queued for the transport, which
/// delivers them in order per destination.
#[derive(Clone)]
pub struct Outbox {
    identity: NodeIdentity,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Outbox {
    /// Create an outbox and the receiving end a transport drains
    pub fn new(identity: NodeIdentity) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { identity, tx }, rx)
    }

    /// Identity stamped on every envelope
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Queue a message for one node
    pub fn send(&self, target: &NodeIdentity, message: Message) -> Result<()> {
        trace!("Sending {} to {}", message.type_name(), target);
        self.tx
            .send((
                target.clone(),
                Envelope::new(self.identity.clone(), message),
            ))
            .map_err(|_| Error::Network("Transport closed".into()))
    }

    /// Send a proposed operation to every target
    pub fn propagate<'a>(
        &self,
        targets: impl IntoIterator<Item = &'a NodeIdentity>,
        log_id: LogId,
        operation: &RaftOperation,
    ) -> Result<()> {
        let frame = OperationFrame::encode(operation)?;
        for target in targets {
            self.send(
                target,
                Message::OperationRequest {
                    log_id,
                    operation: frame.clone(),
                },
            )?;
        }
        Ok(())
    }

    /// Tell every target that operations up to `log_id` are committed
    pub fn confirm<'a>(
        &self,
        targets: impl IntoIterator<Item = &'a NodeIdentity>,
        log_id: LogId,
    ) -> Result<()> {
        for target in targets {
            self.send(target, Message::Confirm { log_id })?;
        }
        Ok(())
    }

    /// Acknowledge a logged operation to the leader
    pub fn ack(&self, leader: &NodeIdentity, log_id: LogId) -> Result<()> {
        self.send(leader, Message::OperationAck { log_id })
    }

    /// Answer a relayed client request
    pub fn reply(
        &self,
        requester: &NodeIdentity,
        operation_id: SessionOperationId,
        response: SubmitResponse,
    ) -> Result<()> {
        self.send(
            requester,
            Message::SubmitResponse {
                operation_id,
                response,
            },
        )
    }

    /// Announce the leader's log position to every target
    pub fn notify_last_structural_operation<'a>(
        &self,
        targets: impl IntoIterator<Item = &'a NodeIdentity>,
        last_log: Option<LogId>,
        last_confirmed: Option<LogId>,
    ) -> Result<()> {
        for target in targets {
            self.send(
                target,
                Message::LastOperation {
                    last_log,
                    last_confirmed,
                },
            )?;
        }
        Ok(())
    }

    /// Relay a client request to the leader
    pub fn submit(
        &self,
        leader: &NodeIdentity,
        operation_id: SessionOperationId,
        request: SubmitRequest,
    ) -> Result<()> {
        self.send(
            leader,
            Message::Submit {
                operation_id,
                request,
            },
        )
    }

    /// Ask the leader to re-send everything after `last_known`
    pub fn request_resync(&self, leader: &NodeIdentity, last_known: Option<LogId>) -> Result<()> {
        self.send(leader, Message::ResyncRequest { last_known })
    }

    /// Send the whole shared configuration to one node
    pub fn send_full_configuration(
        &self,
        target: &NodeIdentity,
        configuration: SharedConfiguration,
    ) -> Result<()> {
        self.send(target, Message::FullConfiguration { configuration })
    }

    /// Ask the leader to admit this node
    pub fn join(&self, leader: &NodeIdentity) -> Result<()> {
        self.send(leader, Message::Join)
    }

    /// Replay a committed operation to one node
    pub fn recover(
        &self,
        target: &NodeIdentity,
        log_id: LogId,
        operation: &RaftOperation,
    ) -> Result<()> {
        self.send(
            target,
            Message::Recover {
                log_id,
                operation: OperationFrame::encode(operation)?,
            },
        )
    }
}
