//! Worker loop wiring a node to its transport and timers.
//!
//! The worker task owns the [`Node`] outright. Inbound datagrams, timer
//! firings, and control requests all arrive over channels and are processed
//! one at a time, so the protocol code never needs a lock. Binaries and
//! tests talk to a running node through the [`NodeHandle`].

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::config::Timing;
use crate::message::{NodeId, Peer};
use crate::node::{Node, RoleKind};
use crate::timer::Timers;
use crate::transport::{Datagram, Transport};

/// Point-in-time snapshot of a node's externally visible state.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: RoleKind,
    pub master: Option<Peer>,
    pub peers: Vec<Peer>,
    pub write_counter: u64,
    pub store: BTreeMap<String, String>,
}

enum Control {
    Status {
        respond_to: oneshot::Sender<NodeStatus>,
    },
    Shutdown,
}

/// Handle for interacting with a running node worker.
#[derive(Clone)]
pub struct NodeHandle {
    control_tx: mpsc::UnboundedSender<Control>,
}

impl NodeHandle {
    /// Asks the worker for a snapshot of its current state.
    pub async fn status(&self) -> Result<NodeStatus> {
        let (respond_to, reply) = oneshot::channel();
        self.control_tx
            .send(Control::Status { respond_to })
            .map_err(|_| anyhow!("node worker is gone"))?;
        reply.await.map_err(|_| anyhow!("node worker is gone"))
    }

    /// Stops the worker. Context timers are cancelled on the way out.
    pub fn shutdown(&self) {
        let _ = self.control_tx.send(Control::Shutdown);
    }
}

/// Spawns the worker for a node and returns its control handle.
///
/// `inbound` is the raw datagram stream produced by the transport's reader
/// (see [`crate::transport::UdpTransport::bind`] and
/// [`crate::transport::MemoryNetwork::attach`]).
pub fn spawn_node<T: Transport>(
    id: NodeId,
    timing: Timing,
    transport: T,
    mut inbound: mpsc::UnboundedReceiver<Datagram>,
) -> NodeHandle {
    let (timers, mut timer_rx) = Timers::new();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let mut node = Node::new(id, timing, transport, timers);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                datagram = inbound.recv() => match datagram {
                    Some((payload, from)) => node.handle_datagram(&payload, from),
                    None => break, // transport reader is gone
                },
                fired = timer_rx.recv() => match fired {
                    Some(fired) => node.handle_timer(fired),
                    None => break,
                },
                request = control_rx.recv() => match request {
                    Some(Control::Status { respond_to }) => {
                        let _ = respond_to.send(snapshot(&node));
                    }
                    Some(Control::Shutdown) | None => break,
                },
            }
        }
        node.shutdown();
        info!(id = %node.id(), "node worker stopped");
    });

    NodeHandle { control_tx }
}

fn snapshot<T: Transport>(node: &Node<T>) -> NodeStatus {
    NodeStatus {
        id: node.id().to_string(),
        role: node.role(),
        master: node.master().cloned(),
        peers: node.peers().to_vec(),
        write_counter: node.write_counter(),
        store: node.store_snapshot(),
    }
}
