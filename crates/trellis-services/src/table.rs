//! Neighbour table — the node's partial view of the overlay.
//!
//! Routing maintenance only talks to the table through `NeighbourTable`.
//! `FlatNeighbourTable` is the in-memory implementation the daemon ships:
//! it keeps every known peer and routes by plain numeric distance, with no
//! prefix structure.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use trellis_core::{NodeAddress, NodeId};

pub trait NeighbourTable: Send + Sync {
    /// The next hop toward `destination`, or `None` when this node is root.
    fn next_hop(&self, destination: &NodeId) -> Option<NodeAddress>;

    fn is_root(&self, destination: &NodeId) -> bool {
        self.next_hop(destination).is_none()
    }

    /// Add a peer. Returns true if it was not already present.
    fn add(&self, address: NodeAddress) -> bool;

    /// Remove a peer. Returns true if it was present.
    fn remove(&self, address: &NodeAddress) -> bool;

    fn contains(&self, id: &NodeId) -> bool;

    fn addresses(&self) -> HashSet<NodeAddress>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every known peer in one map. The next hop is the peer numerically closest
/// to the destination, provided it is strictly closer than this node.
pub struct FlatNeighbourTable {
    local: NodeAddress,
    peers: Arc<DashMap<NodeId, NodeAddress>>,
}

impl FlatNeighbourTable {
    pub fn new(local: NodeAddress) -> Self {
        Self {
            local,
            peers: Arc::new(DashMap::new()),
        }
    }

    pub fn with_peers(local: NodeAddress, peers: impl IntoIterator<Item = NodeAddress>) -> Self {
        let table = Self::new(local);
        for peer in peers {
            table.add(peer);
        }
        table
    }
}

impl NeighbourTable for FlatNeighbourTable {
    fn next_hop(&self, destination: &NodeId) -> Option<NodeAddress> {
        let own = self.local.id().distance(destination);
        self.peers
            .iter()
            .map(|entry| (entry.key().distance(destination), entry.value().clone()))
            .filter(|(distance, _)| *distance < own)
            .min_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, address)| address)
    }

    fn add(&self, address: NodeAddress) -> bool {
        if address.id() == self.local.id() {
            return false;
        }
        let id = *address.id();
        let fresh = self.peers.insert(id, address).is_none();
        if fresh {
            tracing::debug!(peer = %id.short(), "neighbour added");
        }
        fresh
    }

    fn remove(&self, address: &NodeAddress) -> bool {
        let removed = self.peers.remove(address.id()).is_some();
        if removed {
            tracing::debug!(peer = %address.id().short(), "neighbour removed");
        }
        removed
    }

    fn contains(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    fn addresses(&self) -> HashSet<NodeAddress> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    fn len(&self) -> usize {
        self.peers.len()
    }
}
