//! Shared Configuration
//!
//! The cluster-wide structural state: registered nodes, existing databases
//! and the quorum size. Every node holds a copy, mutated only by applying
//! structural operations or by installing a full copy from the leader.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::id::{LogId, NodeIdentity, SessionOperationId};

/// Registry entry for a database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    pub db_type: String,
    pub config: BTreeMap<String, String>,
}

/// Cluster-wide structural configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedConfiguration {
    nodes: BTreeSet<NodeIdentity>,
    databases: BTreeMap<String, DatabaseDescriptor>,
    /// Configured quorum, 0 means majority of registered nodes
    quorum: usize,
    /// Id of the last operation reflected in this configuration
    last_update_id: Option<LogId>,
    /// Highest applied request sequential per origin node id
    #[serde(default)]
    applied_sequentials: BTreeMap<String, u64>,
}

impl SharedConfiguration {
    pub fn new(quorum: usize) -> Self {
        Self {
            quorum,
            ..Default::default()
        }
    }

    pub fn exists_database(&self, name: &str) -> bool {
        self.databases.contains_key(name)
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseDescriptor> {
        self.databases.get(name)
    }

    pub fn databases(&self) -> &BTreeMap<String, DatabaseDescriptor> {
        &self.databases
    }

    pub fn exists_node(&self, identity: &NodeIdentity) -> bool {
        self.nodes.contains(identity)
    }

    pub fn nodes(&self) -> &BTreeSet<NodeIdentity> {
        &self.nodes
    }

    /// Check if a node may take part in the cluster.
    ///
    /// Node names are unique: a node is refused when a different identity
    /// already holds its name.
    pub fn can_add_node(&self, identity: &NodeIdentity) -> bool {
        !self
            .nodes
            .iter()
            .any(|n| n.name == identity.name && n.id != identity.id)
    }

    /// Number of distinct acknowledgments needed to commit
    pub fn quorum(&self) -> usize {
        if self.quorum > 0 {
            self.quorum
        } else {
            (self.nodes.len() / 2 + 1).max(1)
        }
    }

    pub fn set_quorum(&mut self, quorum: usize) {
        self.quorum = quorum;
    }

    /// The configured quorum value (0 = majority)
    pub fn configured_quorum(&self) -> usize {
        self.quorum
    }

    pub fn add_node(&mut self, identity: NodeIdentity) {
        self.nodes.insert(identity);
    }

    pub fn add_database(&mut self, name: &str, db_type: &str, config: BTreeMap<String, String>) {
        self.databases.insert(
            name.to_string(),
            DatabaseDescriptor {
                db_type: db_type.to_string(),
                config,
            },
        );
    }

    pub fn remove_database(&mut self, name: &str) -> Option<DatabaseDescriptor> {
        self.databases.remove(name)
    }

    pub fn last_update_id(&self) -> Option<LogId> {
        self.last_update_id
    }

    pub fn set_last_update_id(&mut self, log_id: Option<LogId>) {
        self.last_update_id = log_id;
    }

    /// Remember that the request `operation_id` is reflected here
    pub fn record_applied(&mut self, operation_id: &SessionOperationId) {
        let highest = self
            .applied_sequentials
            .entry(operation_id.node_id.clone())
            .or_insert(operation_id.sequential);
        *highest = (*highest).max(operation_id.sequential);
    }

    /// Highest applied request sequential that originated on `node_id`
    pub fn applied_sequential(&self, node_id: &str) -> Option<u64> {
        self.applied_sequentials.get(node_id).copied()
    }

    pub fn applied_sequentials(&self) -> &BTreeMap<String, u64> {
        &self.applied_sequentials
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority_quorum() {
        let mut shared = SharedConfiguration::default();
        assert_eq!(shared.quorum(), 1);

        for i in 1..=3 {
            shared.add_node(NodeIdentity::new(format!("id-{}", i), format!("node-{}", i)));
        }
        assert_eq!(shared.quorum(), 2);

        shared.add_node(NodeIdentity::new("id-4", "node-4"));
        assert_eq!(shared.quorum(), 3);

        shared.set_quorum(2);
        assert_eq!(shared.quorum(), 2);
    }

    #[test]
    fn test_can_add_node() {
        let mut shared = SharedConfiguration::default();
        let node = NodeIdentity::new("id-1", "node-1");
        assert!(shared.can_add_node(&node));

        shared.add_node(node.clone());
        // Re-adding the same identity is allowed
        assert!(shared.can_add_node(&node));
        // A different identity under the same name is not
        assert!(!shared.can_add_node(&NodeIdentity::new("id-9", "node-1")));
    }

    #[test]
    fn test_applied_sequentials_only_grow() {
        let mut shared = SharedConfiguration::default();
        assert_eq!(shared.applied_sequential("id-1"), None);

        shared.record_applied(&SessionOperationId::new("id-1", 9));
        shared.record_applied(&SessionOperationId::new("id-1", 4));
        shared.record_applied(&SessionOperationId::new("id-2", 1));
        assert_eq!(shared.applied_sequential("id-1"), Some(9));
        assert_eq!(shared.applied_sequential("id-2"), Some(1));
    }

    #[test]
    fn test_database_registry() {
        let mut shared = SharedConfiguration::default();
        shared.add_database("X", "graph", BTreeMap::new());
        assert!(shared.exists_database("X"));
        assert_eq!(shared.database("X").unwrap().db_type, "graph");

        assert!(shared.remove_database("X").is_some());
        assert!(!shared.exists_database("X"));
        assert!(shared.remove_database("X").is_none());
    }
}
