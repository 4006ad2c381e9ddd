//! Shared harness for the end-to-end scenarios in `tests/`: spins up a
//! cluster of `Node`s wired together over an in-process `LoopbackNetwork`
//! and an in-memory `MemStore` per node, the same "no real sockets, no real
//! disk" combination the corpus uses for multi-node integration coverage.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use raftkv::transport::loopback::LoopbackNetwork;
use raftkv::Config;
use raftkv::Node;
use raftkv::NodeId;
use raftkv::PersistentStore;
use raftkv::Role;
use raftkv_memstore::MemStore;

pub fn addr(port: u16) -> NodeId {
    NodeId::parse(&format!("/ip4/127.0.0.1/tcp/{port}")).unwrap()
}

/// A running node plus the store backing it, so scenarios can inspect
/// persisted state directly (e.g. scenario 4's "state namespace contains all
/// 30 keys").
pub struct ClusterMember {
    pub id: NodeId,
    pub node: Node,
    pub store: Arc<MemStore>,
}

pub struct Cluster {
    pub network: Arc<LoopbackNetwork>,
    pub members: Vec<ClusterMember>,
}

impl Cluster {
    /// Starts `ids.len()` nodes, each already aware of every other id as a
    /// peer (§3: a cluster is bootstrapped with its full membership known
    /// up front; `Join` is for adding a node afterward).
    pub async fn start(ids: &[NodeId], config: Config) -> Self {
        let network = LoopbackNetwork::new();
        let mut members = Vec::with_capacity(ids.len());
        for id in ids {
            let store = Arc::new(MemStore::new());
            let peers: Vec<NodeId> = ids.iter().filter(|p| *p != id).cloned().collect();
            store.persist_peers(&peers).await.unwrap();

            let transport = Arc::new(network.transport_for(id.clone()));
            let (node, inbound_tx) = Node::start(id.clone(), config.clone(), store.clone(), transport)
                .await
                .unwrap();
            network.register(id.clone(), inbound_tx);
            members.push(ClusterMember {
                id: id.clone(),
                node,
                store,
            });
        }
        Self { network, members }
    }

    /// Registers and starts one additional node aware of the current full
    /// membership (used for scenario 4's join-after-the-fact).
    pub async fn join_new_member(&mut self, id: NodeId, config: Config) -> &ClusterMember {
        let store = Arc::new(MemStore::new());
        let transport = Arc::new(self.network.transport_for(id.clone()));
        let (node, inbound_tx) = Node::start(id.clone(), config, store.clone(), transport).await.unwrap();
        self.network.register(id.clone(), inbound_tx);
        self.members.push(ClusterMember { id, node, store });
        self.members.last().unwrap()
    }

    pub fn member(&self, id: &NodeId) -> &ClusterMember {
        self.members.iter().find(|m| &m.id == id).unwrap()
    }

    /// Polls metrics until exactly one member reports `Leader`, or panics
    /// after `timeout` (scenario 1).
    pub async fn wait_for_leader(&self, timeout: Duration) -> NodeId {
        tokio::time::timeout(timeout, async {
            loop {
                let leaders: Vec<NodeId> = self
                    .members
                    .iter()
                    .filter(|m| m.node.metrics().borrow().role == Role::Leader)
                    .map(|m| m.id.clone())
                    .collect();
                if leaders.len() == 1 {
                    return leaders.into_iter().next().unwrap();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("a single leader to emerge before the timeout")
    }

    pub async fn stop_all(self) {
        for member in self.members {
            member.node.stop().await;
        }
    }
}

pub fn fast_test_config() -> Config {
    let mut config = Config::default();
    config.heartbeat_timeout_min_ms = 40;
    config.heartbeat_timeout_max_ms = 80;
    config.election_timeout_min_ms = 40;
    config.election_timeout_max_ms = 80;
    config.append_entries_interval_ms = 10;
    config.rpc_timeout_ms = 500;
    config
}

pub fn distinct_voters(ids: &[NodeId]) -> HashSet<NodeId> {
    ids.iter().cloned().collect()
}
