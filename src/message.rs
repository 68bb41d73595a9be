//! JSON wire contract shared by cluster nodes and clients.
//!
//! Every datagram carries one tagged [`Message`]. Node-originated messages
//! name their sender so a node can discard its own broadcasts when they come
//! back around; client requests (`get`, `put`, `delete`) carry no sender and
//! are answered at the datagram's source address.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Globally unique, lexicographically ordered node identifier.
///
/// Assigned once at process start; the maximum identifier wins elections.
pub type NodeId = String;

/// A cluster member as seen by some node: identifier plus datagram address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// Collapses peer observations into the canonical list shape: descending by
/// identifier, one entry per identifier.
pub fn order_peers(peers: impl IntoIterator<Item = Peer>) -> Vec<Peer> {
    let mut list: Vec<Peer> = Vec::new();
    for peer in peers {
        if !list.iter().any(|known| known.id == peer.id) {
            list.push(peer);
        }
    }
    list.sort_by(|a, b| b.id.cmp(&a.id));
    list
}

/// The closed message schema.
///
/// Unrecognized `type` tags decode to [`Message::Unknown`] and are ignored;
/// any other decode failure means the datagram is malformed and gets dropped
/// at ingress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Discovery beacon broadcast while a node looks for a cluster.
    Hello { sender: NodeId },
    /// Leadership announcement with the authoritative member count.
    LeaderIsHere {
        sender: NodeId,
        timestamp: u64,
        peer_count: u32,
    },
    /// One indexed fragment of the master's peer list (1-based).
    PeerList {
        sender: NodeId,
        timestamp: u64,
        index: u32,
        peer_id: NodeId,
        peer_addr: SocketAddr,
    },
    HeartbeatPing { sender: NodeId, timestamp: u64 },
    HeartbeatPong { sender: NodeId, timestamp: u64 },
    /// A replica reporting its applied-write counter to the master.
    DataCounter { sender: NodeId, counter: u64 },
    /// A slave lost its master; everyone should restart discovery.
    NewLeaderElection { sender: NodeId },
    /// The master evicted the receiver from the cluster.
    YouAreRejected { sender: NodeId },

    Get { key: String },
    GetRelayed {
        sender: NodeId,
        client_addr: SocketAddr,
        key: String,
    },
    GetAsk {
        sender: NodeId,
        client_addr: SocketAddr,
        key: String,
    },
    GetSuccess {
        sender: NodeId,
        key: String,
        value: String,
    },

    Put { key: String, value: String },
    PutRelayed {
        sender: NodeId,
        client_addr: SocketAddr,
        key: String,
        value: String,
    },
    /// A write the master routed to a lagging replica for it to apply.
    PutFinal {
        sender: NodeId,
        client_addr: SocketAddr,
        key: String,
        value: String,
    },
    PutSuccess { sender: NodeId },

    /// Accepted but currently has no effect on the store.
    Delete { key: String },

    #[serde(other)]
    Unknown,
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// The originating node, when the message names one. Client requests
    /// do not, and are exempt from the own-broadcast filter.
    pub fn sender(&self) -> Option<&str> {
        match self {
            Message::Hello { sender }
            | Message::LeaderIsHere { sender, .. }
            | Message::PeerList { sender, .. }
            | Message::HeartbeatPing { sender, .. }
            | Message::HeartbeatPong { sender, .. }
            | Message::DataCounter { sender, .. }
            | Message::NewLeaderElection { sender }
            | Message::YouAreRejected { sender }
            | Message::GetRelayed { sender, .. }
            | Message::GetAsk { sender, .. }
            | Message::GetSuccess { sender, .. }
            | Message::PutRelayed { sender, .. }
            | Message::PutFinal { sender, .. }
            | Message::PutSuccess { sender } => Some(sender),
            Message::Get { .. }
            | Message::Put { .. }
            | Message::Delete { .. }
            | Message::Unknown => None,
        }
    }
}
