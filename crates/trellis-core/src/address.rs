//! Node addresses.
//!
//! A `NodeAddress` binds an overlay identifier to the endpoints where the node
//! can be reached. Two addresses naming the same node id are the same peer,
//! regardless of endpoint, so equality and hashing look at the id only.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::{KeyParseError, NodeId};

#[derive(Clone, Serialize, Deserialize)]
pub struct NodeAddress {
    id: NodeId,
    message: SocketAddr,
    admin: Option<SocketAddr>,
}

impl NodeAddress {
    pub fn new(id: NodeId, message: SocketAddr) -> Self {
        Self {
            id,
            message,
            admin: None,
        }
    }

    pub fn with_admin(mut self, admin: SocketAddr) -> Self {
        self.admin = Some(admin);
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Endpoint that speaks the framed message protocol.
    pub fn message(&self) -> SocketAddr {
        self.message
    }

    /// Administrative endpoint, if the node advertises one.
    pub fn admin(&self) -> Option<SocketAddr> {
        self.admin
    }
}

impl PartialEq for NodeAddress {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeAddress {}

impl Hash for NodeAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.short(), self.message)
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({}@{})", self.id.short(), self.message)
    }
}

#[derive(Debug, Error)]
pub enum AddressParseError {
    #[error("expected <node-id-hex>@<host:port>")]
    MissingSeparator,
    #[error("bad node id: {0}")]
    Id(#[from] KeyParseError),
    #[error("bad endpoint: {0}")]
    Endpoint(#[from] std::net::AddrParseError),
}

/// Parses the `<node-id-hex>@<host:port>` form used for gateways in config.
impl FromStr for NodeAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, endpoint) = s
            .trim()
            .split_once('@')
            .ok_or(AddressParseError::MissingSeparator)?;
        Ok(NodeAddress::new(id.parse()?, endpoint.parse()?))
    }
}
