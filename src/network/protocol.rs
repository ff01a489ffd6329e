//! Replication Protocol
//!
//! Defines the wire protocol for communication between nodes.

use serde::{Deserialize, Serialize};

use crate::id::{LogId, NodeIdentity, SessionOperationId};
use crate::operation::{OperationFrame, SubmitRequest, SubmitResponse};
use crate::state::SharedConfiguration;

/// Protocol messages for node communication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // ========== Log Replication ==========
    /// Proposed operation (leader to followers)
    OperationRequest {
        log_id: LogId,
        operation: OperationFrame,
    },

    /// Operation durably logged (follower to leader)
    OperationAck { log_id: LogId },

    /// Operations up to `log_id` reached quorum (leader to followers)
    Confirm { log_id: LogId },

    /// Periodic announcement of the leader's log position
    LastOperation {
        last_log: Option<LogId>,
        last_confirmed: Option<LogId>,
    },

    // ========== Catch-up ==========
    /// Follower asks to be re-sent everything after `last_known`
    ResyncRequest { last_known: Option<LogId> },

    /// Whole shared configuration, sent when incremental catch-up is impossible
    FullConfiguration { configuration: SharedConfiguration },

    /// Already committed operation replayed to a lagging follower
    Recover {
        log_id: LogId,
        operation: OperationFrame,
    },

    // ========== Client Requests ==========
    /// Client request relayed to the leader
    Submit {
        operation_id: SessionOperationId,
        request: SubmitRequest,
    },

    /// Leader's answer to a relayed request
    SubmitResponse {
        operation_id: SessionOperationId,
        response: SubmitResponse,
    },

    // ========== Membership ==========
    /// Node asks to take part in the cluster
    Join,
}

impl Message {
    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::OperationRequest { .. } => "OperationRequest",
            Message::OperationAck { .. } => "OperationAck",
            Message::Confirm { .. } => "Confirm",
            Message::LastOperation { .. } => "LastOperation",
            Message::ResyncRequest { .. } => "ResyncRequest",
            Message::FullConfiguration { .. } => "FullConfiguration",
            Message::Recover { .. } => "Recover",
            Message::Submit { .. } => "Submit",
            Message::SubmitResponse { .. } => "SubmitResponse",
            Message::Join => "Join",
        }
    }
}

/// A message together with its sender, as carried between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeIdentity,
    pub message: Message,
}

impl Envelope {
    pub fn new(from: NodeIdentity, message: Message) -> Self {
        Self { from, message }
    }

    /// Serialize envelope to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize envelope from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest accepted frame body
    pub const MAX_LENGTH: u32 = 64 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
