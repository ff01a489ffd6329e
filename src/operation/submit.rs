//! Client submit records relayed from a follower node to the leader.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A client-facing structural request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitRequest {
    CreateDatabase {
        name: String,
        db_type: String,
        config: BTreeMap<String, String>,
    },
    DropDatabase {
        name: String,
    },
}

impl SubmitRequest {
    /// Name of the database this request targets
    pub fn database(&self) -> &str {
        match self {
            SubmitRequest::CreateDatabase { name, .. } | SubmitRequest::DropDatabase { name } => {
                name
            }
        }
    }
}

/// Typed outcome of a submit request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub message: String,
}

impl SubmitResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}
