//! Cluster node daemon.
//!
//! Binds one UDP socket for cluster and client traffic, joins discovery on
//! the broadcast address, and runs until ctrl-c.
//!
//! # Example usage
//!
//! ```bash
//! # one node per machine on a shared LAN segment
//! cargo run --bin node -- --bind 0.0.0.0:7700 --broadcast 255.255.255.255:7700
//!
//! # faster timings for a local demo
//! RUST_LOG=mesh_kv=debug cargo run --bin node -- \
//!   --bind 0.0.0.0:7700 --broadcast 255.255.255.255:7700 \
//!   --hello-ms 500 --discovery-ms 1000 --failure-ms 2500
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use nanoid::nanoid;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mesh_kv::config::Timing;
use mesh_kv::runtime::spawn_node;
use mesh_kv::transport::UdpTransport;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a mesh-kv cluster node")]
struct Args {
    /// Address to bind for cluster and client datagrams
    #[arg(long, default_value = "0.0.0.0:7700")]
    bind: SocketAddr,

    /// Broadcast address the cluster discovers itself on
    #[arg(long, default_value = "255.255.255.255:7700")]
    broadcast: SocketAddr,

    /// Fixed node identifier (random when omitted)
    #[arg(long)]
    id: Option<String>,

    /// Hello and heartbeat interval, in milliseconds
    #[arg(long, default_value_t = 4000)]
    hello_ms: u64,

    /// Discovery window, in milliseconds
    #[arg(long, default_value_t = 8000)]
    discovery_ms: u64,

    /// Failure timeout, in milliseconds
    #[arg(long, default_value_t = 20000)]
    failure_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let id = args.id.unwrap_or_else(|| nanoid!());
    let timing = Timing {
        hello_interval: Duration::from_millis(args.hello_ms),
        discovery_window: Duration::from_millis(args.discovery_ms),
        failure_timeout: Duration::from_millis(args.failure_ms),
    };

    let (transport, inbound) = UdpTransport::bind(args.bind, args.broadcast).await?;
    info!(id = %id, addr = %transport.local_addr()?, broadcast = %args.broadcast, "node up");

    let handle = spawn_node(id, timing, transport, inbound);

    tokio::signal::ctrl_c().await?;
    if let Ok(status) = handle.status().await {
        info!(role = ?status.role, keys = status.store.len(), "shutting down");
    }
    handle.shutdown();
    Ok(())
}
