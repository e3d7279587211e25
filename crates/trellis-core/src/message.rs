//! Payloads for the routing-maintenance operations.
//!
//! All of these ride in an envelope payload, encoded with
//! [`encode_payload`](crate::envelope::encode_payload).

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::address::NodeAddress;
use crate::key::{NodeId, ObjectId};

/// Service name and operation names for routing maintenance.
pub mod subjects {
    pub const ROUTING: &str = "routing";
    pub const JOIN: &str = "join";
    pub const PING: &str = "ping";
}

/// One node's claim that it serves an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublishRecord {
    pub object_id: ObjectId,
    pub publisher: NodeId,
    /// Milliseconds since the Unix epoch after which the record lapses.
    pub expires_at_ms: u64,
}

impl PublishRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// Object id → publish records held for it.
pub type Publications = HashMap<ObjectId, HashSet<PublishRecord>>;

/// Free-form properties a node reports about itself.
pub type Properties = BTreeMap<String, String>;

/// Node id → properties, as gathered by the census.
pub type CensusSnapshot = HashMap<NodeId, Properties>;

/// Join carries nothing beyond its envelope; the joiner is the source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinRequest;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinResponse {
    pub network_id: String,
    /// Union of the neighbour sets of every hop on the join path.
    pub neighbours: HashSet<NodeAddress>,
    /// Publications rooted at the answering node.
    pub publications: Publications,
    pub census: CensusSnapshot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingRequest {
    pub probe: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingResponse {
    pub neighbours: HashSet<NodeAddress>,
    pub publications: Publications,
}
