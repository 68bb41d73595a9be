//! Self-organizing replicated key-value cluster.
//!
//! Peer nodes discover each other over a broadcast transport, elect the
//! highest identifier as master, watch one another with heartbeat
//! ping/pong, and replicate a small key-value store from the master to its
//! followers. Clients talk to any node with plain JSON datagrams; requests
//! are routed to wherever they can be served, and whichever node serves one
//! answers the client directly.
//!
//! Each module owns one concern:
//!
//! - [`message`] is the JSON wire contract shared by nodes and clients.
//! - [`config`] holds the timing profile for discovery, heartbeats, and
//!   failure detection.
//! - [`store`] is the key-value map owned by the active role.
//! - [`timer`] schedules one-shot and periodic firings into the worker's
//!   event queue.
//! - [`transport`] carries datagrams over UDP or an in-process network.
//! - [`node`] is the role state machine: election, heartbeats, membership
//!   propagation, and write routing.
//! - [`runtime`] runs a node over its transport and timers and exposes a
//!   control handle.
//! - [`console`] parses the client console's commands.

pub mod config;
pub mod console;
pub mod message;
pub mod node;
pub mod runtime;
pub mod store;
pub mod timer;
pub mod transport;
