//! Message envelope — routing metadata plus an opaque payload.
//!
//! The header travels in the frame's header section as bincode; the payload
//! travels untouched in the frame's payload section. Decoding always goes
//! through size-bounded bincode options so a hostile length prefix cannot
//! force a large allocation.

use std::time::{SystemTime, UNIX_EPOCH};

use bincode::Options;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::NodeAddress;
use crate::frame::Frame;
use crate::key::NodeId;

pub const WIRE_VERSION: u8 = 1;

/// Hop budget given to a fresh request.
pub const DEFAULT_TIME_TO_LIVE: u8 = 64;

/// Upper bound on an encoded header.
pub const MAX_HEADER_SIZE: u64 = 64 * 1024;

// ── Header fields ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    Request,
    Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    /// The destination was reached but the operation failed.
    Failed,
    /// No node on the path could deliver the message.
    Undeliverable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transmission {
    Unicast,
    Multicast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Routing {
    /// Only the root of the destination may answer.
    Exact,
    /// The closest reachable node may answer when the root is unreachable.
    Loose,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub service: String,
    pub operation: String,
}

impl Subject {
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub version: u8,
    pub kind: Kind,
    pub status: Status,
    pub trace: bool,
    pub source: NodeAddress,
    pub destination: NodeId,
    pub subject: Subject,
    pub transmission: Transmission,
    pub routing: Routing,
    pub time_to_live: u8,
    /// Milliseconds since the Unix epoch at the originator.
    pub timestamp_ms: u64,
}

// ── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Envelope {
    pub header: Header,
    pub payload: Bytes,
}

impl Envelope {
    /// A unicast, exact-routed request with a full hop budget.
    pub fn request(
        source: NodeAddress,
        destination: NodeId,
        subject: Subject,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            header: Header {
                version: WIRE_VERSION,
                kind: Kind::Request,
                status: Status::Ok,
                trace: false,
                source,
                destination,
                subject,
                transmission: Transmission::Unicast,
                routing: Routing::Exact,
                time_to_live: DEFAULT_TIME_TO_LIVE,
                timestamp_ms: unix_millis(),
            },
            payload: payload.into(),
        }
    }

    pub fn with_transmission(mut self, transmission: Transmission) -> Self {
        self.header.transmission = transmission;
        self
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.header.routing = routing;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.header.trace = trace;
        self
    }

    pub fn with_time_to_live(mut self, ttl: u8) -> Self {
        self.header.time_to_live = ttl;
        self
    }

    /// Same header, different payload. Used when a relay annotates a reply.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Build the reply to this request, addressed back to its source.
    pub fn compose_reply(
        &self,
        local: &NodeAddress,
        status: Status,
        payload: impl Into<Bytes>,
    ) -> Envelope {
        Envelope {
            header: Header {
                version: WIRE_VERSION,
                kind: Kind::Reply,
                status,
                trace: self.header.trace,
                source: local.clone(),
                destination: *self.header.source.id(),
                subject: self.header.subject.clone(),
                transmission: Transmission::Unicast,
                routing: Routing::Exact,
                time_to_live: DEFAULT_TIME_TO_LIVE,
                timestamp_ms: unix_millis(),
            },
            payload: payload.into(),
        }
    }

    /// Copy of this request with one hop spent, or `None` if none remain.
    pub fn forwarded(&self) -> Option<Envelope> {
        let ttl = self.header.time_to_live.checked_sub(1)?;
        let mut next = self.clone();
        next.header.time_to_live = ttl;
        Some(next)
    }

    pub fn is_ok(&self) -> bool {
        self.header.status == Status::Ok
    }

    pub fn to_frame(&self) -> Result<Frame, WireError> {
        let header = bounded(MAX_HEADER_SIZE)
            .serialize(&self.header)
            .map_err(WireError::Encode)?;
        Ok(Frame::new(header, self.payload.clone()))
    }

    pub fn from_frame(frame: &Frame) -> Result<Envelope, WireError> {
        let header: Header = bounded(MAX_HEADER_SIZE)
            .deserialize(&frame.header)
            .map_err(WireError::Decode)?;
        if header.version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(header.version));
        }
        Ok(Envelope {
            header,
            payload: frame.payload.clone(),
        })
    }
}

// ── Payload helpers ──────────────────────────────────────────────────────────

fn bounded(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit)
        .with_fixint_encoding()
}

/// Encode an operation argument or result for an envelope payload.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Bytes, WireError> {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .serialize(value)
        .map(Bytes::from)
        .map_err(WireError::Encode)
}

/// Decode a payload. No allocation may exceed the payload's own length.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, WireError> {
    bounded(payload.len() as u64)
        .deserialize(payload)
        .map_err(WireError::Decode)
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode: {0}")]
    Encode(bincode::Error),

    #[error("failed to decode: {0}")]
    Decode(bincode::Error),

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),
}

// ── Tests ────────────────────────────────────────────────────────────────────
