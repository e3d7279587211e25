//! Census — catalogue of node properties gathered by gossip.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use trellis_core::message::{CensusSnapshot, Properties};
use trellis_core::NodeId;

pub trait Census: Send + Sync {
    /// Up to `limit` entries (all when `None`), skipping `exclude`.
    fn snapshot(&self, limit: Option<usize>, exclude: &HashSet<NodeId>) -> CensusSnapshot;

    /// Fold entries learned from a peer into the local catalogue.
    fn merge_local(&self, entries: CensusSnapshot);
}

#[derive(Clone, Default)]
pub struct MemoryCensus {
    nodes: Arc<DashMap<NodeId, Properties>>,
}

impl MemoryCensus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, id: NodeId, properties: Properties) {
        self.nodes.insert(id, properties);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Census for MemoryCensus {
    fn snapshot(&self, limit: Option<usize>, exclude: &HashSet<NodeId>) -> CensusSnapshot {
        self.nodes
            .iter()
            .filter(|e| !exclude.contains(e.key()))
            .take(limit.unwrap_or(usize::MAX))
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    fn merge_local(&self, entries: CensusSnapshot) {
        for (id, properties) in entries {
            self.nodes.entry(id).or_default().extend(properties);
        }
    }
}
