//! In-process cluster harness shared by the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use wolfmeta::id::NodeIdentity;
use wolfmeta::lock::LocalLockManager;
use wolfmeta::network::LocalRouter;
use wolfmeta::node::StructuralNode;
use wolfmeta::oplog::InMemoryOperationLog;
use wolfmeta::replication::ReplicationConfig;
use wolfmeta::state::{ClusterContext, InMemoryClusterContext, SharedConfiguration};
use wolfmeta::Result;

pub struct TestNode {
    pub node: StructuralNode,
    pub cluster: Arc<InMemoryClusterContext>,
    pub oplog: Arc<InMemoryOperationLog>,
    pub dispatcher: JoinHandle<()>,
    pub role_task: JoinHandle<Result<()>>,
}

impl TestNode {
    pub fn identity(&self) -> &NodeIdentity {
        self.node.identity()
    }

    pub fn shared(&self) -> SharedConfiguration {
        self.cluster.read_shared_configuration()
    }
}

pub struct TestCluster {
    pub router: LocalRouter,
    /// `nodes[0]` is the leader
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    pub fn leader(&self) -> &TestNode {
        &self.nodes[0]
    }

    /// Wait until every follower has applied what the leader has
    pub async fn converged(&self) {
        eventually("followers catch up with the leader", || {
            let target = self.leader().shared().last_update_id();
            self.nodes.iter().all(|n| n.shared().last_update_id() == target)
        })
        .await;
    }
}

pub fn identity(index: usize) -> NodeIdentity {
    NodeIdentity::new(format!("id-{}", index), format!("node-{}", index))
}

pub fn fast_config() -> ReplicationConfig {
    ReplicationConfig {
        operation_timeout: Duration::from_secs(2),
        ping_interval: Duration::from_millis(50),
        submit_timeout: Duration::from_secs(5),
    }
}

/// Start node `index` on `router`; node 0 is always the leader
pub fn start_node(
    router: &LocalRouter,
    index: usize,
    quorum: usize,
    config: ReplicationConfig,
) -> TestNode {
    let me = identity(index);
    let (outbox, inbox) = router.register(me.clone());
    let cluster = Arc::new(InMemoryClusterContext::with_configuration(
        SharedConfiguration::new(quorum),
    ));
    let oplog = Arc::new(InMemoryOperationLog::new());
    let (node, role_task) = StructuralNode::start(
        me,
        identity(0),
        oplog.clone(),
        cluster.clone(),
        Arc::new(LocalLockManager::new()),
        outbox,
        config,
    )
    .unwrap();
    let dispatcher = node.spawn(inbox);
    TestNode {
        node,
        cluster,
        oplog,
        dispatcher,
        role_task,
    }
}

/// Start `size` nodes with node 0 as the leader and wait for all joins
pub async fn start_cluster(size: usize, quorum: usize, config: ReplicationConfig) -> TestCluster {
    let router = LocalRouter::new();
    let nodes: Vec<_> = (0..size)
        .map(|index| start_node(&router, index, quorum, config.clone()))
        .collect();

    let peers: Vec<_> = (1..size).map(identity).collect();
    nodes[0].node.announce(&peers).await.unwrap();
    for node in &nodes[1..] {
        node.node.announce(&[]).await.unwrap();
    }

    let cluster = TestCluster { router, nodes };
    eventually("every node joins", || cluster.leader().shared().nodes().len() == size).await;
    cluster.converged().await;
    cluster
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting until {}", what);
}
