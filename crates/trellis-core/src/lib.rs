//! trellis-core — identifiers, wire format, and cryptographic primitives.
//! All other Trellis crates depend on this one.

pub mod address;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod frame;
pub mod key;
pub mod message;

pub use address::NodeAddress;
pub use envelope::{Envelope, Routing, Status, Subject, Transmission};
pub use frame::{Frame, FrameError, FrameParser};
pub use key::{Key, NodeId, ObjectId};
