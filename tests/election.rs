//! Cluster-level election behavior over the in-process network.
//!
//! These tests run real node workers at millisecond timing and observe them
//! through their control handles, the way the binaries do.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{sleep, Instant};

use mesh_kv::config::Timing;
use mesh_kv::node::RoleKind;
use mesh_kv::runtime::{spawn_node, NodeHandle, NodeStatus};
use mesh_kv::transport::MemoryNetwork;

const UNIT: Duration = Duration::from_millis(25);
const WAIT: Duration = Duration::from_secs(5);

struct ClusterNode {
    id: String,
    addr: SocketAddr,
    handle: NodeHandle,
}

/// Test harness for a cluster of real node workers on a memory network.
struct TestCluster {
    network: MemoryNetwork,
    nodes: Vec<ClusterNode>,
}

impl TestCluster {
    /// Spawns one node per identifier on sequential fake addresses.
    fn spawn(ids: &[&str]) -> Self {
        let network = MemoryNetwork::new();
        let nodes = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let addr: SocketAddr = format!("10.1.0.{}:7700", i + 1).parse().unwrap();
                let (transport, inbound) = network.attach(addr);
                let handle = spawn_node(id.to_string(), Timing::fast(UNIT), transport, inbound);
                ClusterNode {
                    id: id.to_string(),
                    addr,
                    handle,
                }
            })
            .collect();
        Self { network, nodes }
    }

    fn node(&self, id: &str) -> &ClusterNode {
        self.nodes
            .iter()
            .find(|node| node.id == id)
            .expect("unknown node id")
    }

    /// Simulates a crash: the worker stops and the address goes dark.
    fn kill(&self, id: &str) {
        let node = self.node(id);
        node.handle.shutdown();
        self.network.detach(node.addr);
    }

    /// Statuses of every node whose worker is still running.
    async fn live_statuses(&self) -> Vec<NodeStatus> {
        let mut statuses = Vec::new();
        for node in &self.nodes {
            if let Ok(status) = node.handle.status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Polls until every live node has settled and exactly one is master.
    async fn wait_for_single_master(&self) -> Result<NodeStatus> {
        let deadline = Instant::now() + WAIT;
        loop {
            anyhow::ensure!(
                Instant::now() < deadline,
                "timed out waiting for a single master"
            );
            let statuses = self.live_statuses().await;
            let settled =
                !statuses.is_empty() && statuses.iter().all(|status| status.role != RoleKind::Start);
            let mut masters = statuses
                .iter()
                .filter(|status| status.role == RoleKind::Master);
            if let (true, Some(master), None) = (settled, masters.next(), masters.next()) {
                return Ok(master.clone());
            }
            sleep(UNIT).await;
        }
    }

    /// Polls until every live node except the master follows `master_id`
    /// and the master's peer list covers all of them.
    async fn wait_for_followers(&self, master_id: &str) -> Result<()> {
        let deadline = Instant::now() + WAIT;
        loop {
            anyhow::ensure!(
                Instant::now() < deadline,
                "timed out waiting for followers of {master_id}"
            );
            let statuses = self.live_statuses().await;
            let slaves: Vec<&NodeStatus> = statuses
                .iter()
                .filter(|status| status.role == RoleKind::Slave)
                .collect();
            let all_following = slaves.iter().all(|status| {
                status.master.as_ref().map(|master| master.id.as_str()) == Some(master_id)
            });
            let master_covers = statuses
                .iter()
                .filter(|status| status.role == RoleKind::Master)
                .all(|status| status.peers.len() == slaves.len());
            let one_master = statuses
                .iter()
                .filter(|status| status.role == RoleKind::Master)
                .count()
                == 1;
            if one_master && all_following && master_covers && slaves.len() + 1 == statuses.len() {
                return Ok(());
            }
            sleep(UNIT).await;
        }
    }

    fn shutdown(self) {
        for node in &self.nodes {
            node.handle.shutdown();
        }
    }
}

#[tokio::test]
async fn lone_node_becomes_master() -> Result<()> {
    let cluster = TestCluster::spawn(&["solo"]);

    let master = cluster.wait_for_single_master().await?;
    assert_eq!(master.id, "solo");
    assert!(master.peers.is_empty());

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn highest_identifier_wins_with_three_nodes() -> Result<()> {
    let cluster = TestCluster::spawn(&["a", "b", "c"]);

    let master = cluster.wait_for_single_master().await?;
    assert_eq!(master.id, "c", "the maximum identifier must lead");
    cluster.wait_for_followers("c").await?;

    let master = cluster.node("c").handle.status().await?;
    let peer_ids: Vec<&str> = master.peers.iter().map(|peer| peer.id.as_str()).collect();
    assert_eq!(peer_ids, vec!["b", "a"], "peer list is descending and excludes the master");

    for id in ["a", "b"] {
        let status = cluster.node(id).handle.status().await?;
        assert_eq!(status.role, RoleKind::Slave);
        assert_eq!(status.master.as_ref().map(|m| m.id.as_str()), Some("c"));
    }

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn followers_assemble_the_propagated_peer_list() -> Result<()> {
    let cluster = TestCluster::spawn(&["a", "b", "c"]);
    cluster.wait_for_followers("c").await?;

    // each follower eventually sees the other follower, never itself
    let deadline = Instant::now() + WAIT;
    loop {
        anyhow::ensure!(Instant::now() < deadline, "timed out waiting for membership");
        let a = cluster.node("a").handle.status().await?;
        let b = cluster.node("b").handle.status().await?;
        let a_sees: Vec<&str> = a.peers.iter().map(|peer| peer.id.as_str()).collect();
        let b_sees: Vec<&str> = b.peers.iter().map(|peer| peer.id.as_str()).collect();
        if a_sees == vec!["b"] && b_sees == vec!["a"] {
            break;
        }
        sleep(UNIT).await;
    }

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn master_silence_triggers_reelection() -> Result<()> {
    let cluster = TestCluster::spawn(&["a", "b", "c"]);
    let master = cluster.wait_for_single_master().await?;
    assert_eq!(master.id, "c");

    cluster.kill("c");

    // survivors notice the silence, re-run discovery, and elect the next
    // highest identifier
    let master = cluster.wait_for_single_master().await?;
    assert_eq!(master.id, "b");
    cluster.wait_for_followers("b").await?;

    let master = cluster.node("b").handle.status().await?;
    let peer_ids: Vec<&str> = master.peers.iter().map(|peer| peer.id.as_str()).collect();
    assert_eq!(peer_ids, vec!["a"]);

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn silent_follower_is_evicted() -> Result<()> {
    let cluster = TestCluster::spawn(&["b", "c"]);
    let master = cluster.wait_for_single_master().await?;
    assert_eq!(master.id, "c");
    cluster.wait_for_followers("c").await?;

    cluster.kill("b");

    let deadline = Instant::now() + WAIT;
    loop {
        anyhow::ensure!(Instant::now() < deadline, "timed out waiting for eviction");
        let status = cluster.node("c").handle.status().await?;
        if status.peers.is_empty() {
            assert_eq!(status.role, RoleKind::Master, "the master stays up alone");
            break;
        }
        sleep(UNIT).await;
    }

    cluster.shutdown();
    Ok(())
}
