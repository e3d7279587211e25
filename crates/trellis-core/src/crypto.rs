//! Cryptographic primitives for encrypted connections.
//!
//! Two things live here:
//!   1. The node's long-term X25519 keypair. A node id in encrypted mode is
//!      BLAKE3(public key), so a peer proves its id by completing a handshake.
//!   2. Noise_XX session establishment and the record cipher used afterwards.
//!
//! Handshake messages on a TCP stream:
//!   msg1 (initiator → responder): [nonce 16][u16 BE len][noise msg1]
//!   msg2 (responder → initiator): [nonce 16][u16 BE len][noise msg2]
//!   msg3 (initiator → responder): [u16 BE len][noise msg3]
//!
//! The framing is done by the connection layer; this module only produces and
//! consumes the Noise bytes and nonces. Private key material is zeroized on
//! drop. There is no unsafe code in this module.

use std::path::Path;

use rand::RngCore;
use snow::{Builder, HandshakeState, StatelessTransportState};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Noise_XX: mutual authentication, both static keys transmitted encrypted.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Largest plaintext sealed into one record.
pub const MAX_RECORD_PLAINTEXT: usize = 16 * 1024;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Explicit nonce carried in front of each record.
pub const NONCE_LEN: usize = 8;

/// Largest record on the wire: nonce, sealed plaintext, tag.
pub const MAX_RECORD_CIPHERTEXT: usize = NONCE_LEN + MAX_RECORD_PLAINTEXT + TAG_LEN;

/// Upper bound for any single Noise handshake message.
pub const MAX_HANDSHAKE_MESSAGE: usize = 1024;

// ── Keypair ───────────────────────────────────────────────────────────────────

/// Long-term static X25519 key. The secret half is wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    secret: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl Keypair {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut bytes[..]);
        Self::from_secret_bytes(*bytes)
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let public = PublicKey::from(&StaticSecret::from(bytes)).to_bytes();
        Self {
            secret: Zeroizing::new(bytes),
            public,
        }
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        self.secret.clone()
    }

    /// Load the secret stored at `path`, or generate one and store it.
    ///
    /// The file holds the raw 32 secret bytes and is created with mode 0600.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let raw = Zeroizing::new(std::fs::read(path).map_err(CryptoError::KeyFile)?);
            let bytes: [u8; 32] = raw
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::BadKeyFile(raw.len()))?;
            return Ok(Self::from_secret_bytes(bytes));
        }

        let keypair = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(CryptoError::KeyFile)?;
        }
        std::fs::write(path, &keypair.secret[..]).map_err(CryptoError::KeyFile)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(CryptoError::KeyFile)?;
        }
        Ok(keypair)
    }
}

// ── Handshake ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the TCP connection.
    Initiator,
    /// Accepted it.
    Responder,
}

/// One side of a Noise_XX exchange, driven message by message.
///
/// The initiator writes, reads, writes; the responder reads, writes, reads.
/// Each side also learns the other's 16-byte nonce out of band (it travels
/// in front of the first two Noise messages) and hands it over with
/// [`Handshake::set_peer_nonce`] before calling [`Handshake::complete`].
pub struct Handshake {
    role: Role,
    state: HandshakeState,
    nonce: [u8; 16],
    peer_nonce: Option<[u8; 16]>,
}

impl Handshake {
    pub fn new(keypair: &Keypair, role: Role) -> Result<Self, CryptoError> {
        let params = NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?;
        let builder = Builder::new(params).local_private_key(&keypair.secret[..]);
        let state = match role {
            Role::Initiator => builder.build_initiator(),
            Role::Responder => builder.build_responder(),
        }?;
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        Ok(Self {
            role,
            state,
            nonce,
            peer_nonce: None,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// This side's nonce, to be sent alongside its first message.
    pub fn nonce(&self) -> &[u8; 16] {
        &self.nonce
    }

    pub fn set_peer_nonce(&mut self, nonce: [u8; 16]) {
        self.peer_nonce = Some(nonce);
    }

    /// Produce the next outgoing handshake message.
    pub fn write(&mut self) -> Result<Vec<u8>, CryptoError> {
        let mut out = vec![0u8; MAX_HANDSHAKE_MESSAGE];
        let len = self.state.write_message(&[], &mut out)?;
        out.truncate(len);
        Ok(out)
    }

    /// Consume the next incoming handshake message.
    pub fn read(&mut self, message: &[u8]) -> Result<(), CryptoError> {
        if message.len() > MAX_HANDSHAKE_MESSAGE {
            return Err(CryptoError::HandshakeTooLarge(message.len()));
        }
        let mut scratch = vec![0u8; MAX_HANDSHAKE_MESSAGE];
        self.state.read_message(message, &mut scratch)?;
        Ok(())
    }

    /// Switch to transport mode once all three messages have passed.
    pub fn complete(self) -> Result<Session, CryptoError> {
        if !self.state.is_handshake_finished() {
            return Err(CryptoError::Unfinished);
        }
        let peer_nonce = self.peer_nonce.ok_or(CryptoError::MissingPeerNonce)?;
        let remote_static: [u8; 32] = self
            .state
            .get_remote_static()
            .and_then(|k| k.try_into().ok())
            .ok_or(CryptoError::MissingRemoteKey)?;

        // both ends hash the nonces in dialling order
        let mut hasher = blake3::Hasher::new();
        match self.role {
            Role::Initiator => hasher.update(&self.nonce).update(&peer_nonce),
            Role::Responder => hasher.update(&peer_nonce).update(&self.nonce),
        };
        let id = *hasher.finalize().as_bytes();

        Ok(Session {
            id,
            remote_static,
            transport: self.state.into_stateless_transport_mode()?,
            next_send: 0,
            lowest_acceptable: 0,
        })
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

/// Record cipher for one established connection.
///
/// A record is `[u64 LE counter][ciphertext + 16-byte tag]`. Counters must
/// strictly increase; anything at or below the last opened one is refused.
pub struct Session {
    id: [u8; 32],
    remote_static: [u8; 32],
    transport: StatelessTransportState,
    next_send: u64,
    lowest_acceptable: u64,
}

impl Session {
    /// Identifier shared by both ends, for correlating logs.
    pub fn id(&self) -> &[u8; 32] {
        &self.id
    }

    /// The peer's static public key, authenticated by the handshake.
    pub fn remote_static(&self) -> &[u8; 32] {
        &self.remote_static
    }

    /// Seal at most `MAX_RECORD_PLAINTEXT` bytes into a fresh record in `out`.
    pub fn seal(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if plaintext.len() > MAX_RECORD_PLAINTEXT {
            return Err(CryptoError::RecordTooLarge(plaintext.len()));
        }
        let counter = self.next_send;
        self.next_send = counter.checked_add(1).ok_or(CryptoError::CounterExhausted)?;

        out.resize(NONCE_LEN + plaintext.len() + TAG_LEN, 0);
        out[..NONCE_LEN].copy_from_slice(&counter.to_le_bytes());
        let sealed = self
            .transport
            .write_message(counter, plaintext, &mut out[NONCE_LEN..])?;
        out.truncate(NONCE_LEN + sealed);
        Ok(())
    }

    /// Open one record into `out`.
    pub fn open(&mut self, record: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if record.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::TooShort);
        }
        let (header, body) = record.split_at(NONCE_LEN);
        let counter = u64::from_le_bytes(header.try_into().map_err(|_| CryptoError::TooShort)?);
        if counter < self.lowest_acceptable {
            return Err(CryptoError::Replay);
        }

        out.resize(body.len(), 0);
        let opened = self.transport.read_message(counter, body, out)?;
        out.truncate(opened);
        self.lowest_acceptable = counter + 1;
        Ok(())
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid Noise pattern string")]
    BadPattern,

    #[error("noise: {0}")]
    Noise(#[from] snow::Error),

    #[error("handshake message of {0} bytes is too large")]
    HandshakeTooLarge(usize),

    #[error("handshake is not finished")]
    Unfinished,

    #[error("peer nonce was never received")]
    MissingPeerNonce,

    #[error("handshake finished without a remote static key")]
    MissingRemoteKey,

    #[error("record shorter than counter plus tag")]
    TooShort,

    #[error("record of {0} bytes exceeds the record size limit")]
    RecordTooLarge(usize),

    #[error("record counter already used")]
    Replay,

    #[error("send counter exhausted")]
    CounterExhausted,

    #[error("key file: {0}")]
    KeyFile(std::io::Error),

    #[error("key file holds {0} bytes, expected 32")]
    BadKeyFile(usize),
}
