//! Structural Operations
//!
//! The closed set of cluster-level commands replicated through the
//! structural log, their binary wire format and how they are applied to
//! the shared cluster state.

pub mod codec;
mod submit;

pub use submit::{SubmitRequest, SubmitResponse};

use std::collections::BTreeMap;
use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{LogId, NodeIdentity, SessionOperationId};
use crate::state::ClusterContext;

/// Request type code of [`RaftOperation::CreateDatabase`]
pub const CREATE_DATABASE_REQUEST: i32 = 1;
/// Request type code of [`RaftOperation::DropDatabase`]
pub const DROP_DATABASE_REQUEST: i32 = 2;
/// Request type code of [`RaftOperation::NodeJoin`]
pub const NODE_JOIN_REQUEST: i32 = 3;

/// A replicated structural command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftOperation {
    /// Create a database on every node
    CreateDatabase {
        operation_id: SessionOperationId,
        database: String,
        db_type: String,
        config: BTreeMap<String, String>,
    },

    /// Drop a database on every node
    DropDatabase {
        operation_id: SessionOperationId,
        database: String,
    },

    /// Register a node in the shared configuration
    NodeJoin { identity: NodeIdentity },
}

impl RaftOperation {
    /// Wire tag used to pick the decoder on the receiving side
    pub fn request_type(&self) -> i32 {
        match self {
            RaftOperation::CreateDatabase { .. } => CREATE_DATABASE_REQUEST,
            RaftOperation::DropDatabase { .. } => DROP_DATABASE_REQUEST,
            RaftOperation::NodeJoin { .. } => NODE_JOIN_REQUEST,
        }
    }

    /// The client call this operation originated from, if any.
    ///
    /// Internally generated operations such as node joins have none.
    pub fn requester_sequential(&self) -> Option<&SessionOperationId> {
        match self {
            RaftOperation::CreateDatabase { operation_id, .. }
            | RaftOperation::DropDatabase { operation_id, .. } => Some(operation_id),
            RaftOperation::NodeJoin { .. } => None,
        }
    }

    /// Apply this operation as log entry `log_id`.
    ///
    /// The storage engine runs first. The registry change and the new
    /// `last_update_id` then land in a single shared configuration write, so
    /// a restart never replays an entry whose effect is already recorded.
    /// An engine failure leaves the registry as it was but still advances
    /// `last_update_id`; it is returned as the inner error. The outer error
    /// means the state itself could not be written.
    pub fn apply(&self, ctx: &dyn ClusterContext, log_id: LogId) -> Result<Result<()>> {
        let engine = match self {
            RaftOperation::CreateDatabase {
                database,
                db_type,
                config,
                ..
            } => ctx.internal_create_database(database, db_type, config),
            RaftOperation::DropDatabase { database, .. } => ctx.internal_drop_database(database),
            RaftOperation::NodeJoin { .. } => Ok(()),
        };

        let registered = engine.is_ok();
        ctx.modify_shared_configuration(&mut |shared| {
            if registered {
                match self {
                    RaftOperation::CreateDatabase {
                        database,
                        db_type,
                        config,
                        ..
                    } => shared.add_database(database, db_type, config.clone()),
                    RaftOperation::DropDatabase { database, .. } => {
                        shared.remove_database(database);
                    }
                    RaftOperation::NodeJoin { identity } => shared.add_node(identity.clone()),
                }
            }
            if let Some(requester) = self.requester_sequential() {
                shared.record_applied(requester);
            }
            shared.set_last_update_id(Some(log_id));
        })?;
        Ok(engine)
    }

    /// Encode the operation body (without its request type tag)
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            RaftOperation::CreateDatabase {
                operation_id,
                database,
                db_type,
                config,
            } => {
                codec::write_session_operation_id(&mut out, operation_id)?;
                codec::write_utf(&mut out, database)?;
                codec::write_utf(&mut out, db_type)?;
                let count = i32::try_from(config.len())
                    .map_err(|_| Error::Codec("too many configuration entries".into()))?;
                codec::write_i32(&mut out, count)?;
                for (key, value) in config {
                    codec::write_utf(&mut out, key)?;
                    codec::write_utf(&mut out, value)?;
                }
            }
            RaftOperation::DropDatabase {
                operation_id,
                database,
            } => {
                codec::write_session_operation_id(&mut out, operation_id)?;
                codec::write_utf(&mut out, database)?;
            }
            RaftOperation::NodeJoin { identity } => {
                codec::write_node_identity(&mut out, identity)?;
            }
        }
        Ok(out)
    }

    /// Decode an operation body previously tagged with `request_type`
    pub fn deserialize(request_type: i32, payload: &[u8]) -> Result<Self> {
        let mut input = Cursor::new(payload);
        let operation = match request_type {
            CREATE_DATABASE_REQUEST => {
                let operation_id = codec::read_session_operation_id(&mut input)?;
                let database = codec::read_utf(&mut input)?;
                let db_type = codec::read_utf(&mut input)?;
                let count = codec::read_i32(&mut input)?;
                if count < 0 {
                    return Err(Error::Codec(format!("negative configuration count {}", count)));
                }
                let mut config = BTreeMap::new();
                for _ in 0..count {
                    let key = codec::read_utf(&mut input)?;
                    let value = codec::read_utf(&mut input)?;
                    config.insert(key, value);
                }
                RaftOperation::CreateDatabase {
                    operation_id,
                    database,
                    db_type,
                    config,
                }
            }
            DROP_DATABASE_REQUEST => RaftOperation::DropDatabase {
                operation_id: codec::read_session_operation_id(&mut input)?,
                database: codec::read_utf(&mut input)?,
            },
            NODE_JOIN_REQUEST => RaftOperation::NodeJoin {
                identity: codec::read_node_identity(&mut input)?,
            },
            other => return Err(Error::Codec(format!("unknown request type {}", other))),
        };

        if (input.position() as usize) != payload.len() {
            return Err(Error::Codec(format!(
                "{} trailing bytes after request type {}",
                payload.len() - input.position() as usize,
                request_type
            )));
        }

        Ok(operation)
    }

    /// Short name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            RaftOperation::CreateDatabase { .. } => "CreateDatabase",
            RaftOperation::DropDatabase { .. } => "DropDatabase",
            RaftOperation::NodeJoin { .. } => "NodeJoin",
        }
    }
}

/// A tagged, encoded operation as carried over the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFrame {
    pub request_type: i32,
    pub payload: Vec<u8>,
}

impl OperationFrame {
    pub fn encode(operation: &RaftOperation) -> Result<Self> {
        Ok(Self {
            request_type: operation.request_type(),
            payload: operation.serialize()?,
        })
    }

    pub fn decode(&self) -> Result<RaftOperation> {
        RaftOperation::deserialize(self.request_type, &self.payload)
    }
}
