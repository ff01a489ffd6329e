//! WolfMeta Configuration
//!
//! This module provides configuration structures for the WolfMeta
//! structural replication service.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::id::NodeIdentity;
use crate::replication::ReplicationConfig;

/// Main WolfMeta configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfMetaConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    pub cluster: ClusterConfig,

    /// Operation log configuration
    #[serde(default)]
    pub oplog: OplogConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable node identifier
    pub id: String,

    /// Node name, unique within the cluster
    pub name: String,

    /// Address to bind for cluster communication
    pub bind_address: String,

    /// Data directory for the operation log and state storage
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Name of the statically designated structural leader
    pub leader: String,

    /// Acks needed to commit (0 = majority of configured nodes)
    #[serde(default)]
    pub quorum: usize,

    /// How long the leader waits for a quorum before abandoning an operation
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Interval of the leader's last-operation announcement
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// How long a relayed client request waits for the leader's answer
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,

    /// Other cluster members
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// A remote cluster member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub name: String,
    pub address: String,
}

/// Operation log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OplogConfig {
    /// Records per segment file before rotating
    #[serde(default = "default_entries_per_segment")]
    pub entries_per_segment: usize,

    /// Sync every append to disk before acknowledging it
    #[serde(default = "default_true")]
    pub fsync: bool,

    /// LZ4-compress record payloads
    #[serde(default)]
    pub compression: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_operation_timeout_ms() -> u64 {
    5000
}

fn default_ping_interval_ms() -> u64 {
    1000
}

fn default_submit_timeout_ms() -> u64 {
    10000
}

fn default_entries_per_segment() -> usize {
    16384
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfmeta")
}

impl Default for OplogConfig {
    fn default() -> Self {
        Self {
            entries_per_segment: default_entries_per_segment(),
            fsync: true,
            compression: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfMetaConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfMetaConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfMetaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Sample configuration for a new single-node cluster
    pub fn sample(name: &str, bind_address: &str) -> Self {
        let identity = NodeIdentity::generate(name);
        Self {
            node: NodeConfig {
                id: identity.id,
                name: identity.name,
                bind_address: bind_address.to_string(),
                data_dir: default_data_dir(),
            },
            cluster: ClusterConfig {
                leader: name.to_string(),
                quorum: 0,
                operation_timeout_ms: default_operation_timeout_ms(),
                ping_interval_ms: default_ping_interval_ms(),
                submit_timeout_ms: default_submit_timeout_ms(),
                peers: Vec::new(),
            },
            oplog: OplogConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.name.is_empty() {
            return Err(crate::Error::Config("node.name cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        names.insert(self.node.name.as_str());
        ids.insert(self.node.id.as_str());
        for peer in &self.cluster.peers {
            if !names.insert(peer.name.as_str()) {
                return Err(crate::Error::Config(format!(
                    "duplicate node name '{}'",
                    peer.name
                )));
            }
            if !ids.insert(peer.id.as_str()) {
                return Err(crate::Error::Config(format!(
                    "duplicate node id '{}'",
                    peer.id
                )));
            }
        }

        if !names.contains(self.cluster.leader.as_str()) {
            return Err(crate::Error::Config(format!(
                "cluster.leader '{}' is neither this node nor a peer",
                self.cluster.leader
            )));
        }

        if self.cluster.quorum > self.node_count() {
            return Err(crate::Error::Config(format!(
                "cluster.quorum {} exceeds the {} configured nodes",
                self.cluster.quorum,
                self.node_count()
            )));
        }

        if self.oplog.entries_per_segment == 0 {
            return Err(crate::Error::Config(
                "oplog.entries_per_segment must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Identity of the local node
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::new(self.node.id.clone(), self.node.name.clone())
    }

    /// Identities of the configured peers
    pub fn peer_identities(&self) -> Vec<NodeIdentity> {
        self.cluster
            .peers
            .iter()
            .map(|p| NodeIdentity::new(p.id.clone(), p.name.clone()))
            .collect()
    }

    /// Identity of the structural leader
    pub fn leader_identity(&self) -> NodeIdentity {
        if self.is_leader() {
            return self.identity();
        }
        self.peer_identities()
            .into_iter()
            .find(|p| p.name == self.cluster.leader)
            .unwrap_or_else(|| self.identity())
    }

    /// Whether this node is the structural leader
    pub fn is_leader(&self) -> bool {
        self.cluster.leader == self.node.name
    }

    /// Number of configured nodes, this one included
    pub fn node_count(&self) -> usize {
        self.cluster.peers.len() + 1
    }

    /// Acks needed to commit, with 0 resolved against the configured nodes
    pub fn quorum(&self) -> usize {
        match self.cluster.quorum {
            0 => self.node_count() / 2 + 1,
            quorum => quorum,
        }
    }

    /// Get the operation log directory path
    pub fn oplog_dir(&self) -> PathBuf {
        self.node.data_dir.join("oplog")
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Get operation timeout as Duration
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.operation_timeout_ms)
    }

    /// Get ping interval as Duration
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.ping_interval_ms)
    }

    /// Get submit timeout as Duration
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.submit_timeout_ms)
    }

    /// Timing settings for the replication actors
    pub fn replication(&self) -> ReplicationConfig {
        ReplicationConfig {
            operation_timeout: self.operation_timeout(),
            ping_interval: self.ping_interval(),
            submit_timeout: self.submit_timeout(),
        }
    }
}
