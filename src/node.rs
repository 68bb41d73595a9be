//! The role state machine at the heart of every cluster node.
//!
//! A node is always in exactly one of three roles. `Start` runs discovery
//! and the election, `Master` owns the authoritative store and watches its
//! followers, `Slave` replicates and watches the master. Each role keeps its
//! mutable state in a context that is replaced wholesale on every
//! transition; the outgoing context's timers are cancelled before the new
//! context is installed.
//!
//! All state lives behind one `&mut self`: the worker feeds the node one
//! inbound message or timer firing at a time, and handlers react by sending
//! messages and arming timers. A timer firing that raced a transition is
//! recognized by its token (stale epoch, or a sequence number that is no
//! longer the armed one) and ignored.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::Timing;
use crate::message::{order_peers, Message, NodeId, Peer};
use crate::store::KvStore;
use crate::timer::{TimerFired, TimerHandle, TimerKind, Timers};
use crate::transport::{Dest, Transport};

/// The externally visible role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Start,
    Master,
    Slave,
}

/// Discovery state: what has been heard while looking for a cluster.
struct StartContext {
    observed: Vec<(NodeId, SocketAddr)>,
    hello_job: TimerHandle,
    deadline: TimerHandle,
}

impl StartContext {
    fn cancel(&self) {
        self.hello_job.cancel();
        self.deadline.cancel();
    }
}

/// Leader state: membership, per-peer liveness, and the write ledger.
struct MasterContext {
    peers: Vec<Peer>,
    timestamp: u64,
    ping_job: TimerHandle,
    peer_deadlines: HashMap<NodeId, TimerHandle>,
    replica_counters: HashMap<NodeId, u64>,
    counter: u64,
    store: KvStore,
}

impl MasterContext {
    fn cancel(&self) {
        self.ping_job.cancel();
        for deadline in self.peer_deadlines.values() {
            deadline.cancel();
        }
    }
}

/// Follower state: the recorded master, the membership view assembled from
/// fragments, and the local replica.
///
/// `announced` stays `None` when the master was chosen by discovery alone;
/// the heartbeat loop only starts once the master's own announcement
/// arrives.
struct SlaveContext {
    peers: Vec<Peer>,
    fragments: HashMap<u32, Peer>,
    peer_count: u32,
    master: Peer,
    announced: Option<u64>,
    ping_job: Option<TimerHandle>,
    liveness: Option<TimerHandle>,
    counter: u64,
    store: KvStore,
}

impl SlaveContext {
    fn cancel(&self) {
        if let Some(job) = &self.ping_job {
            job.cancel();
        }
        if let Some(deadline) = &self.liveness {
            deadline.cancel();
        }
    }
}

enum Role {
    Start(StartContext),
    Master(MasterContext),
    Slave(SlaveContext),
}

impl Role {
    fn cancel(&self) {
        match self {
            Role::Start(ctx) => ctx.cancel(),
            Role::Master(ctx) => ctx.cancel(),
            Role::Slave(ctx) => ctx.cancel(),
        }
    }

    fn kind(&self) -> RoleKind {
        match self {
            Role::Start(_) => RoleKind::Start,
            Role::Master(_) => RoleKind::Master,
            Role::Slave(_) => RoleKind::Slave,
        }
    }
}

fn arm_start(timers: &mut Timers, timing: &Timing, epoch: u64) -> StartContext {
    StartContext {
        observed: Vec::new(),
        hello_job: timers.every(timing.hello_interval, epoch, TimerKind::HelloTick),
        deadline: timers.after(timing.discovery_window, epoch, TimerKind::DiscoveryDeadline),
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

/// One cluster node. Owns all mutable state; driven by a single worker,
/// one event at a time.
pub struct Node<T: Transport> {
    id: NodeId,
    timing: Timing,
    transport: T,
    timers: Timers,
    epoch: u64,
    role: Role,
}

impl<T: Transport> Node<T> {
    /// Creates a node in the start role with discovery already armed.
    pub fn new(id: NodeId, timing: Timing, transport: T, mut timers: Timers) -> Self {
        let epoch = 1;
        let role = Role::Start(arm_start(&mut timers, &timing, epoch));
        info!(id = %id, "starting discovery");
        Self {
            id,
            timing,
            transport,
            timers,
            epoch,
            role,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> RoleKind {
        self.role.kind()
    }

    /// The recorded master, when following one.
    pub fn master(&self) -> Option<&Peer> {
        match &self.role {
            Role::Slave(ctx) => Some(&ctx.master),
            _ => None,
        }
    }

    pub fn peers(&self) -> &[Peer] {
        match &self.role {
            Role::Start(_) => &[],
            Role::Master(ctx) => &ctx.peers,
            Role::Slave(ctx) => &ctx.peers,
        }
    }

    pub fn write_counter(&self) -> u64 {
        match &self.role {
            Role::Start(_) => 0,
            Role::Master(ctx) => ctx.counter,
            Role::Slave(ctx) => ctx.counter,
        }
    }

    pub fn store_snapshot(&self) -> BTreeMap<String, String> {
        match &self.role {
            Role::Start(_) => BTreeMap::new(),
            Role::Master(ctx) => ctx.store.snapshot(),
            Role::Slave(ctx) => ctx.store.snapshot(),
        }
    }

    /// Cancels the active context's timers. The worker calls this once when
    /// it stops.
    pub fn shutdown(&mut self) {
        self.role.cancel();
    }

    /// Ingress for one raw datagram.
    pub fn handle_datagram(&mut self, payload: &[u8], from: SocketAddr) {
        match Message::decode(payload) {
            Ok(message) => self.handle_message(message, from),
            Err(err) => warn!(from = %from, error = %err, "dropping malformed datagram"),
        }
    }

    /// Dispatches one inbound message against the current role.
    pub fn handle_message(&mut self, message: Message, from: SocketAddr) {
        // own broadcasts come back around on a broadcast transport
        if message.sender() == Some(self.id.as_str()) {
            return;
        }
        match message {
            Message::Hello { sender } => self.on_hello(sender, from),
            Message::LeaderIsHere {
                sender,
                timestamp,
                peer_count,
            } => self.on_leader_announcement(sender, from, timestamp, peer_count),
            Message::PeerList {
                sender,
                index,
                peer_id,
                peer_addr,
                ..
            } => self.on_peer_fragment(
                sender,
                index,
                Peer {
                    id: peer_id,
                    addr: peer_addr,
                },
            ),
            Message::HeartbeatPing { .. } => {
                let pong = Message::HeartbeatPong {
                    sender: self.id.clone(),
                    timestamp: now_micros(),
                };
                self.transport.send(&pong, Dest::Peer(from));
            }
            Message::HeartbeatPong { sender, .. } => self.on_pong(sender),
            Message::DataCounter { sender, counter } => self.on_counter_report(sender, counter),
            Message::NewLeaderElection { sender } => {
                info!(sender = %sender, "election reset requested");
                self.enter_start();
            }
            Message::YouAreRejected { sender } => {
                warn!(master = %sender, "rejected by the master");
                self.enter_start();
            }
            Message::Get { key } => self.on_get(key, from),
            Message::GetRelayed {
                client_addr, key, ..
            } => self.on_get_relayed(key, client_addr),
            Message::GetAsk {
                client_addr, key, ..
            } => self.on_get_ask(key, client_addr),
            Message::Put { key, value } => self.on_put(key, value, from),
            Message::PutRelayed {
                client_addr,
                key,
                value,
                ..
            } => self.on_put_relayed(key, value, client_addr),
            Message::PutFinal {
                client_addr,
                key,
                value,
                ..
            } => self.on_put_final(key, value, client_addr),
            Message::Delete { key } => {
                debug!(key = %key, "delete accepted; deletion is not implemented");
            }
            // client-bound replies and unrecognized types are not for us
            Message::GetSuccess { .. } | Message::PutSuccess { .. } | Message::Unknown => {}
        }
    }

    /// Dispatches one timer firing, dropping tokens from replaced contexts.
    pub fn handle_timer(&mut self, fired: TimerFired) {
        if fired.token.epoch != self.epoch {
            return;
        }
        match fired.kind {
            TimerKind::HelloTick => self.on_hello_tick(),
            TimerKind::DiscoveryDeadline => self.on_discovery_deadline(fired.token.seq),
            TimerKind::HeartbeatTick => self.on_heartbeat_tick(),
            TimerKind::PeerTimeout(peer_id) => self.on_peer_timeout(peer_id, fired.token.seq),
            TimerKind::MasterTimeout => self.on_master_timeout(fired.token.seq),
        }
    }

    fn on_hello(&mut self, sender: NodeId, from: SocketAddr) {
        let mut admitted = false;
        match &mut self.role {
            Role::Start(ctx) => ctx.observed.push((sender, from)),
            Role::Master(ctx) => {
                if !ctx.peers.iter().any(|peer| peer.id == sender) {
                    info!(peer = %sender, addr = %from, "admitting new peer");
                    ctx.peers.push(Peer {
                        id: sender,
                        addr: from,
                    });
                    ctx.peers.sort_by(|a, b| b.id.cmp(&a.id));
                    admitted = true;
                }
            }
            Role::Slave(_) => {}
        }
        if admitted {
            self.propagate_membership();
        }
    }

    fn on_leader_announcement(
        &mut self,
        sender: NodeId,
        from: SocketAddr,
        timestamp: u64,
        peer_count: u32,
    ) {
        let accept = match &self.role {
            Role::Start(_) => true,
            Role::Slave(ctx) => ctx.announced.map_or(true, |seen| seen < timestamp),
            // a competing master is left to the failure detector
            Role::Master(_) => false,
        };
        if !accept {
            debug!(sender = %sender, timestamp, "ignoring stale leader announcement");
            return;
        }
        self.adopt_master(
            Peer {
                id: sender,
                addr: from,
            },
            peer_count,
            timestamp,
        );
    }

    fn on_peer_fragment(&mut self, sender: NodeId, index: u32, peer: Peer) {
        let Role::Slave(ctx) = &mut self.role else {
            return;
        };
        if ctx.master.id != sender {
            debug!(sender = %sender, "discarding peer fragment from a stale master");
            return;
        }
        ctx.fragments.insert(index, peer);
        if ctx.fragments.len() as u32 + 1 != ctx.peer_count {
            return;
        }
        let members = ctx
            .fragments
            .values()
            .filter(|member| member.id != self.id)
            .cloned();
        ctx.peers = order_peers(members);
        info!(master = %ctx.master.id, peers = ctx.peers.len(), "membership converged");
    }

    fn on_pong(&mut self, sender: NodeId) {
        match &mut self.role {
            Role::Master(ctx) => {
                if let Some(deadline) = ctx.peer_deadlines.get(&sender) {
                    deadline.cancel();
                    let fresh = self.timers.after(
                        self.timing.failure_timeout,
                        self.epoch,
                        TimerKind::PeerTimeout(sender.clone()),
                    );
                    ctx.peer_deadlines.insert(sender, fresh);
                }
            }
            Role::Slave(ctx) => {
                if ctx.master.id == sender {
                    if let Some(deadline) = &ctx.liveness {
                        deadline.cancel();
                    }
                    ctx.liveness = Some(self.timers.after(
                        self.timing.failure_timeout,
                        self.epoch,
                        TimerKind::MasterTimeout,
                    ));
                }
            }
            Role::Start(_) => {}
        }
    }

    fn on_counter_report(&mut self, sender: NodeId, counter: u64) {
        let Role::Master(ctx) = &mut self.role else {
            return;
        };
        if ctx.peers.iter().any(|peer| peer.id == sender) {
            ctx.replica_counters.insert(sender, counter);
        } else {
            debug!(sender = %sender, "counter report from an untracked peer");
        }
    }

    fn on_get(&mut self, key: String, client_addr: SocketAddr) {
        match &self.role {
            Role::Slave(ctx) => {
                let relayed = Message::GetRelayed {
                    sender: self.id.clone(),
                    client_addr,
                    key,
                };
                self.transport.send(&relayed, Dest::Peer(ctx.master.addr));
            }
            Role::Master(_) => self.serve_get(key, client_addr),
            Role::Start(_) => {}
        }
    }

    fn on_get_relayed(&mut self, key: String, client_addr: SocketAddr) {
        if let Role::Master(_) = self.role {
            self.serve_get(key, client_addr);
        }
    }

    /// Master-side read: answer from the local map, or fan the request out
    /// so a replica holding the key can answer the client directly.
    fn serve_get(&self, key: String, client_addr: SocketAddr) {
        let Role::Master(ctx) = &self.role else {
            return;
        };
        if let Some(value) = ctx.store.get(&key) {
            let reply = Message::GetSuccess {
                sender: self.id.clone(),
                key,
                value: value.to_string(),
            };
            self.transport.send(&reply, Dest::Peer(client_addr));
            return;
        }
        for peer in &ctx.peers {
            let ask = Message::GetAsk {
                sender: self.id.clone(),
                client_addr,
                key: key.clone(),
            };
            self.transport.send(&ask, Dest::Peer(peer.addr));
        }
    }

    fn on_get_ask(&mut self, key: String, client_addr: SocketAddr) {
        let Role::Slave(ctx) = &self.role else {
            return;
        };
        if let Some(value) = ctx.store.get(&key) {
            let reply = Message::GetSuccess {
                sender: self.id.clone(),
                key,
                value: value.to_string(),
            };
            self.transport.send(&reply, Dest::Peer(client_addr));
        }
    }

    fn on_put(&mut self, key: String, value: String, client_addr: SocketAddr) {
        match &self.role {
            Role::Slave(ctx) => {
                let relayed = Message::PutRelayed {
                    sender: self.id.clone(),
                    client_addr,
                    key,
                    value,
                };
                self.transport.send(&relayed, Dest::Peer(ctx.master.addr));
            }
            Role::Master(_) => self.commit_put(key, value, client_addr),
            Role::Start(_) => {}
        }
    }

    fn on_put_relayed(&mut self, key: String, value: String, client_addr: SocketAddr) {
        if let Role::Master(_) = self.role {
            self.commit_put(key, value, client_addr);
        }
    }

    /// Master-side write path.
    ///
    /// The master applies a write itself only while it is provably behind
    /// every replica that has reported a counter. Otherwise the write is
    /// routed to the most-behind replica as a final write, which bounds how
    /// far the master can run ahead of its slowest replica.
    fn commit_put(&mut self, key: String, value: String, client_addr: SocketAddr) {
        let Role::Master(ctx) = &mut self.role else {
            return;
        };

        let mut laggard: Option<(usize, u64)> = None;
        for (position, peer) in ctx.peers.iter().enumerate() {
            if let Some(count) = ctx.replica_counters.get(&peer.id) {
                if laggard.map_or(true, |(_, best)| *count < best) {
                    laggard = Some((position, *count));
                }
            }
        }

        let commit_locally = match laggard {
            None => true,
            Some((_, behind_count)) => ctx.counter < behind_count,
        };

        if commit_locally {
            ctx.store.put(key, value);
            ctx.counter += 1;
            debug!(counter = ctx.counter, "write committed locally");
            let done = Message::PutSuccess {
                sender: self.id.clone(),
            };
            self.transport.send(&done, Dest::Peer(client_addr));
            return;
        }

        let (position, behind_count) = laggard.expect("laggard exists when not committing locally");
        let replica = ctx.peers[position].clone();
        let routed = Message::PutFinal {
            sender: self.id.clone(),
            client_addr,
            key,
            value,
        };
        self.transport.send(&routed, Dest::Peer(replica.addr));
        ctx.replica_counters.insert(replica.id.clone(), behind_count + 1);
        info!(replica = %replica.id, counter = behind_count + 1, "write routed to most-behind replica");
    }

    fn on_put_final(&mut self, key: String, value: String, client_addr: SocketAddr) {
        let Role::Slave(ctx) = &mut self.role else {
            return;
        };
        ctx.store.put(key, value);
        let done = Message::PutSuccess {
            sender: self.id.clone(),
        };
        self.transport.send(&done, Dest::Peer(client_addr));
    }

    fn on_hello_tick(&mut self) {
        if let Role::Start(_) = self.role {
            let hello = Message::Hello {
                sender: self.id.clone(),
            };
            self.transport.send(&hello, Dest::Broadcast);
        }
    }

    /// Discovery is over: the highest identifier observed (or this node, if
    /// nothing higher was heard) becomes master.
    fn on_discovery_deadline(&mut self, seq: u64) {
        let observed = match &self.role {
            Role::Start(ctx) if ctx.deadline.seq() == seq => {
                ctx.hello_job.cancel();
                ctx.observed.clone()
            }
            _ => return,
        };

        if observed.is_empty() {
            info!("no peers discovered; forming a cluster of one");
            self.become_master(Vec::new());
            return;
        }

        let mut best: Option<(&NodeId, SocketAddr)> = None;
        for (id, addr) in &observed {
            if *id > self.id && best.map_or(true, |(leader, _)| id > leader) {
                best = Some((id, *addr));
            }
        }

        match best {
            Some((id, addr)) => {
                info!(master = %id, "deferring to a higher identifier");
                let master = Peer {
                    id: id.clone(),
                    addr,
                };
                self.await_master(master);
            }
            None => {
                let peers = order_peers(observed.into_iter().map(|(id, addr)| Peer { id, addr }));
                info!(peers = peers.len(), "this node holds the highest identifier");
                self.become_master(peers);
            }
        }
    }

    fn on_heartbeat_tick(&mut self) {
        let ping = Message::HeartbeatPing {
            sender: self.id.clone(),
            timestamp: now_micros(),
        };
        match &self.role {
            Role::Master(ctx) => {
                for peer in &ctx.peers {
                    self.transport.send(&ping, Dest::Peer(peer.addr));
                }
            }
            Role::Slave(ctx) => {
                self.transport.send(&ping, Dest::Peer(ctx.master.addr));
            }
            Role::Start(_) => {}
        }
    }

    fn on_peer_timeout(&mut self, peer_id: NodeId, seq: u64) {
        let evicted = {
            let Role::Master(ctx) = &mut self.role else {
                return;
            };
            match ctx.peer_deadlines.get(&peer_id) {
                Some(deadline) if deadline.seq() == seq => {}
                _ => return,
            }
            let Some(position) = ctx.peers.iter().position(|peer| peer.id == peer_id) else {
                return;
            };
            ctx.peer_deadlines.remove(&peer_id);
            ctx.peers.remove(position)
        };
        warn!(peer = %evicted.id, addr = %evicted.addr, "peer went silent; evicting");
        let rejection = Message::YouAreRejected {
            sender: self.id.clone(),
        };
        self.transport.send(&rejection, Dest::Peer(evicted.addr));
        self.propagate_membership();
    }

    fn on_master_timeout(&mut self, seq: u64) {
        {
            let Role::Slave(ctx) = &self.role else {
                return;
            };
            match &ctx.liveness {
                Some(deadline) if deadline.seq() == seq => {}
                _ => return,
            }
        }
        warn!("master went silent; calling a new election");
        let reset = Message::NewLeaderElection {
            sender: self.id.clone(),
        };
        self.transport.send(&reset, Dest::Broadcast);
        self.enter_start();
    }

    /// Re-announces leadership and the peer list after any membership
    /// change. Clears liveness deadlines and replica counters; replicas
    /// re-report their counters in response to the announcement.
    fn propagate_membership(&mut self) {
        let Role::Master(ctx) = &mut self.role else {
            return;
        };
        for deadline in ctx.peer_deadlines.values() {
            deadline.cancel();
        }
        ctx.peer_deadlines.clear();
        ctx.replica_counters.clear();
        // strictly increasing even across back-to-back updates
        ctx.timestamp = now_micros().max(ctx.timestamp + 1);

        let announce = Message::LeaderIsHere {
            sender: self.id.clone(),
            timestamp: ctx.timestamp,
            peer_count: ctx.peers.len() as u32 + 1,
        };
        self.transport.send(&announce, Dest::Broadcast);
        info!(peers = ctx.peers.len(), timestamp = ctx.timestamp, "announced leadership");

        for (position, peer) in ctx.peers.iter().enumerate() {
            let deadline = self.timers.after(
                self.timing.failure_timeout,
                self.epoch,
                TimerKind::PeerTimeout(peer.id.clone()),
            );
            ctx.peer_deadlines.insert(peer.id.clone(), deadline);
            let fragment = Message::PeerList {
                sender: self.id.clone(),
                timestamp: ctx.timestamp,
                index: position as u32 + 1,
                peer_id: peer.id.clone(),
                peer_addr: peer.addr,
            };
            self.transport.send(&fragment, Dest::Broadcast);
        }
    }

    /// Tears down the active context and restarts discovery.
    fn enter_start(&mut self) {
        self.role.cancel();
        self.epoch += 1;
        self.role = Role::Start(arm_start(&mut self.timers, &self.timing, self.epoch));
        info!(id = %self.id, "restarting discovery");
    }

    fn become_master(&mut self, peers: Vec<Peer>) {
        self.role.cancel();
        self.epoch += 1;
        let ctx = MasterContext {
            peers,
            timestamp: 0,
            ping_job: self.timers.every(
                self.timing.hello_interval,
                self.epoch,
                TimerKind::HeartbeatTick,
            ),
            peer_deadlines: HashMap::new(),
            replica_counters: HashMap::new(),
            counter: 0,
            store: KvStore::new(),
        };
        self.role = Role::Master(ctx);
        info!(id = %self.id, "assuming leadership");
        self.propagate_membership();
    }

    /// Adopts an announced master and starts the steady-state loop. The
    /// write-counter survives successive announcements; everything else in
    /// the follower context starts fresh.
    fn adopt_master(&mut self, master: Peer, peer_count: u32, timestamp: u64) {
        let carried = match &self.role {
            Role::Slave(ctx) => ctx.counter,
            _ => 0,
        };
        self.role.cancel();
        self.epoch += 1;
        let ctx = SlaveContext {
            peers: Vec::new(),
            fragments: HashMap::new(),
            peer_count,
            master: master.clone(),
            announced: Some(timestamp),
            ping_job: Some(self.timers.every(
                self.timing.hello_interval,
                self.epoch,
                TimerKind::HeartbeatTick,
            )),
            liveness: Some(self.timers.after(
                self.timing.failure_timeout,
                self.epoch,
                TimerKind::MasterTimeout,
            )),
            counter: carried,
            store: KvStore::new(),
        };
        self.role = Role::Slave(ctx);
        let report = Message::DataCounter {
            sender: self.id.clone(),
            counter: carried,
        };
        self.transport.send(&report, Dest::Peer(master.addr));
        info!(master = %master.id, peer_count, timestamp, "following master");
    }

    /// Records the discovery winner without starting the steady-state loop;
    /// that waits for the winner's own announcement.
    fn await_master(&mut self, master: Peer) {
        self.role.cancel();
        self.epoch += 1;
        self.role = Role::Slave(SlaveContext {
            peers: Vec::new(),
            fragments: HashMap::new(),
            peer_count: 0,
            master: master.clone(),
            announced: None,
            ping_job: None,
            liveness: None,
            counter: 0,
            store: KvStore::new(),
        });
        info!(master = %master.id, addr = %master.addr, "awaiting leader announcement");
    }
}
