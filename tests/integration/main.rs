//! Trellis integration test harness.
//!
//! Every test runs its nodes in-process on loopback TCP with ephemeral
//! ports, so tests are independent and need no setup:
//!
//!   cargo test --test integration
//!
//! Nodes use plain connections and small numeric ids unless a test is
//! specifically about encryption.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use trellis_core::config::ConnectionType;
use trellis_core::{Key, NodeAddress};
use trellis_services::{launch, NodeOptions, RunningNode, TransportSettings};

mod encrypted;
mod join;
mod maintenance;
mod transport;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Transport settings with short timeouts for loopback tests.
pub fn test_transport(kind: ConnectionType) -> TransportSettings {
    TransportSettings {
        connection_type: kind,
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(5),
        ..TransportSettings::default()
    }
}

pub fn plain_options(id: u64) -> NodeOptions {
    NodeOptions {
        id: Some(Key::from_u64(id)),
        transport: test_transport(ConnectionType::Plain),
        network_id: "test".into(),
        ..NodeOptions::default()
    }
}

/// Launch a plain node with id `id` on an ephemeral loopback port.
pub async fn plain_node(id: u64) -> RunningNode {
    launch(plain_options(id)).await.expect("node should launch")
}

/// An address for `id` on a loopback port nothing is listening on.
pub async fn dead_address(id: u64) -> NodeAddress {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr: SocketAddr = listener.local_addr().expect("local addr");
    drop(listener);
    NodeAddress::new(Key::from_u64(id), addr)
}

pub async fn shutdown_all(nodes: Vec<RunningNode>) {
    for node in nodes {
        node.shutdown().await.expect("clean shutdown");
    }
}
