//! Overlay identifiers.
//!
//! Every node and every published object is named by a 256-bit key. Keys are
//! compared as big-endian unsigned integers, which makes the derived `Ord`
//! on the byte array the numeric order as well.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A 256-bit overlay key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(pub [u8; 32]);

/// Identifier of a node in the overlay.
pub type NodeId = Key;

/// Identifier of an object published into the overlay.
pub type ObjectId = Key;

impl Key {
    pub const LEN: usize = 32;
    pub const ZERO: Key = Key([0u8; 32]);

    /// Node id for a Noise static public key: BLAKE3(public key).
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Key whose low 64 bits hold `value`. Handy for small test topologies.
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Numeric distance |self - other|.
    pub fn distance(&self, other: &Key) -> Key {
        let (hi, lo) = if self >= other {
            (self, other)
        } else {
            (other, self)
        };
        let mut out = [0u8; 32];
        let mut borrow = 0i16;
        for i in (0..32).rev() {
            let mut d = hi.0[i] as i16 - lo.0[i] as i16 - borrow;
            if d < 0 {
                d += 256;
                borrow = 1;
            } else {
                borrow = 0;
            }
            out[i] = d as u8;
        }
        Key(out)
    }

    /// First eight hex digits, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.short())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("key is not valid hex")]
    NotHex,
    #[error("key must be {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
}

impl FromStr for Key {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|_| KeyParseError::NotHex)?;
        let array: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyParseError::WrongLength {
                expected: Key::LEN,
                actual: bytes.len(),
            })?;
        Ok(Key(array))
    }
}
