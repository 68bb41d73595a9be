//! Datagram transport: UDP for real clusters, an in-process network for
//! deterministic local ones.
//!
//! Sending is fire-and-forget; delivery failures are logged and dropped, the
//! protocol's failure detector handles the rest. Inbound datagrams flow into
//! the worker through an unbounded channel so the socket reader never runs
//! protocol code.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::warn;

use crate::message::Message;

/// Raw inbound datagram: payload plus source address.
pub type Datagram = (Vec<u8>, SocketAddr);

const MAX_DATAGRAM: usize = 64 * 1024;

/// Where an outbound message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dest {
    Peer(SocketAddr),
    Broadcast,
}

/// Fire-and-forget datagram sender.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, message: &Message, dest: Dest);
}

/// UDP transport with a configurable broadcast address.
///
/// The same socket carries cluster traffic and client requests, so replies
/// go straight back to whatever address a datagram came from.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
}

impl UdpTransport {
    /// Binds `bind_addr` with broadcast enabled and spawns the reader task.
    /// Returns the transport plus the inbound datagram stream.
    pub async fn bind(
        bind_addr: SocketAddr,
        broadcast_addr: SocketAddr,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<Datagram>)> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        socket.set_broadcast(true)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = Arc::clone(&socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match reader.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        if tx.send((buf[..len].to_vec(), from)).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "udp receive failed"),
                }
            }
        });

        Ok((
            Self {
                socket,
                broadcast_addr,
            },
            rx,
        ))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    fn send(&self, message: &Message, dest: Dest) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode outbound message");
                return;
            }
        };
        let target = match dest {
            Dest::Peer(addr) => addr,
            Dest::Broadcast => self.broadcast_addr,
        };
        if let Err(err) = self.socket.try_send_to(&payload, target) {
            warn!(target = %target, error = %err, "udp send failed");
        }
    }
}

/// In-process datagram fabric with the same unicast/broadcast semantics as
/// UDP. Endpoints receive their own broadcasts, like a real broadcast
/// socket; the node's own-sender filter discards them. Traffic to a
/// detached address is silently dropped, which doubles as a crude partition
/// switch in tests.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an endpoint at `addr`, returning its transport and inbound
    /// stream. Attaching the same address again replaces the old endpoint.
    pub fn attach(&self, addr: SocketAddr) -> (MemoryTransport, mpsc::UnboundedReceiver<Datagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.lock().unwrap().insert(addr, tx);
        (
            MemoryTransport {
                addr,
                network: self.clone(),
            },
            rx,
        )
    }

    pub fn detach(&self, addr: SocketAddr) {
        self.endpoints.lock().unwrap().remove(&addr);
    }

    fn deliver(&self, payload: &[u8], from: SocketAddr, dest: Dest) {
        let endpoints = self.endpoints.lock().unwrap();
        match dest {
            Dest::Peer(addr) => {
                if let Some(tx) = endpoints.get(&addr) {
                    let _ = tx.send((payload.to_vec(), from));
                }
            }
            Dest::Broadcast => {
                for tx in endpoints.values() {
                    let _ = tx.send((payload.to_vec(), from));
                }
            }
        }
    }
}

/// One endpoint of a [`MemoryNetwork`].
pub struct MemoryTransport {
    addr: SocketAddr,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Transport for MemoryTransport {
    fn send(&self, message: &Message, dest: Dest) {
        match message.encode() {
            Ok(payload) => self.network.deliver(&payload, self.addr, dest),
            Err(err) => warn!(error = %err, "failed to encode outbound message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{last}:7700").parse().unwrap()
    }

    #[tokio::test]
    async fn unicast_reaches_only_the_target() {
        let network = MemoryNetwork::new();
        let (sender, _sender_rx) = network.attach(addr(1));
        let (_a, mut a_rx) = network.attach(addr(2));
        let (_b, mut b_rx) = network.attach(addr(3));

        sender.send(&Message::Hello { sender: "n1".into() }, Dest::Peer(addr(2)));

        let (payload, from) = a_rx.recv().await.unwrap();
        assert_eq!(from, addr(1));
        assert_eq!(
            Message::decode(&payload).unwrap(),
            Message::Hello { sender: "n1".into() }
        );
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_including_the_sender() {
        let network = MemoryNetwork::new();
        let (sender, mut sender_rx) = network.attach(addr(1));
        let (_a, mut a_rx) = network.attach(addr(2));

        sender.send(&Message::Hello { sender: "n1".into() }, Dest::Broadcast);

        assert!(sender_rx.recv().await.is_some());
        assert!(a_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn detached_endpoints_drop_traffic() {
        let network = MemoryNetwork::new();
        let (sender, _sender_rx) = network.attach(addr(1));
        let (_a, mut a_rx) = network.attach(addr(2));

        network.detach(addr(2));
        sender.send(&Message::Hello { sender: "n1".into() }, Dest::Peer(addr(2)));

        assert!(a_rx.try_recv().is_err());
    }
}
