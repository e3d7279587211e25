//! Message service — request/reply over pooled framed connections.
//!
//! `transmit` takes a connection from the socket cache (or dials one),
//! writes one request frame, and waits for exactly one reply frame on the
//! same connection. Failures are classified before anything is retried:
//!
//!   - unreachable (timeout, refused, no route): returned at once
//!   - decode (malformed frame or envelope): returned at once
//!   - transient (reset, broken pipe, early close, failed handshake): the
//!     connection is thrown away and the exchange is retried on a fresh one
//!     while the caller's retry budget allows
//!
//! A peer whose handshake key does not match the id being dialled is
//! unreachable, not transient.
//!
//! A connection goes back to the cache only after a clean exchange.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use trellis_core::crypto::CryptoError;
use trellis_core::envelope::WireError;
use trellis_core::{Envelope, Frame, FrameError, FrameParser, NodeAddress, NodeId};

use crate::channel::BoxChannel;
use crate::connector::Connector;
use crate::settings::TransportSettings;

const READ_CHUNK: usize = 16 * 1024;

/// Pause before retry N is N × this, capped at ten steps.
const RETRY_PAUSE: Duration = Duration::from_millis(50);

// ── Retry budget ─────────────────────────────────────────────────────────────

/// Caller-owned bound on transient-failure retries. `None` fields are
/// unbounded; both `None` retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub max_attempts: Option<u32>,
    pub max_elapsed: Option<Duration>,
}

impl RetryBudget {
    pub const fn unbounded() -> Self {
        Self {
            max_attempts: None,
            max_elapsed: None,
        }
    }

    pub const fn attempts(n: u32) -> Self {
        Self {
            max_attempts: Some(n),
            max_elapsed: None,
        }
    }

    pub fn within(mut self, elapsed: Duration) -> Self {
        self.max_elapsed = Some(elapsed);
        self
    }

    /// Whether another attempt may start after `made` attempts and `elapsed`.
    pub fn allows_another(&self, made: u32, elapsed: Duration) -> bool {
        self.max_attempts.map_or(true, |max| made < max)
            && self.max_elapsed.map_or(true, |max| elapsed < max)
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        RetryBudget::attempts(8).within(Duration::from_secs(30))
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth another try on a fresh connection.
    Transient,
    /// The peer cannot be reached right now; retrying will not help.
    Unreachable,
    /// The peer spoke something we could not understand.
    Decode,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{peer} did not answer within {after:?}")]
    Timeout { peer: SocketAddr, after: Duration },

    #[error("i/o error with {peer}: {source}")]
    Io {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{0} closed the connection before replying")]
    Closed(SocketAddr),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("envelope error: {0}")]
    Wire(#[from] WireError),

    #[error("handshake with {peer} failed: {source}")]
    Handshake {
        peer: SocketAddr,
        #[source]
        source: CryptoError,
    },

    #[error("{peer} authenticated as {presented}, expected {expected}")]
    IdentityMismatch {
        peer: SocketAddr,
        expected: NodeId,
        presented: NodeId,
    },

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<TransportError>,
    },

    #[error("encrypted connections need a keypair")]
    MissingKeypair,

    #[error("worker pool is closed")]
    PoolClosed,
}

impl TransportError {
    pub fn class(&self) -> FailureClass {
        match self {
            TransportError::Timeout { .. }
            | TransportError::IdentityMismatch { .. }
            | TransportError::MissingKeypair
            | TransportError::PoolClosed => FailureClass::Unreachable,
            TransportError::Io { source, .. } => classify_io(source),
            TransportError::Closed(_) | TransportError::Handshake { .. } => FailureClass::Transient,
            TransportError::Frame(_) | TransportError::Wire(_) => FailureClass::Decode,
            TransportError::Exhausted { last, .. } => last.class(),
        }
    }
}

fn classify_io(e: &io::Error) -> FailureClass {
    use io::ErrorKind::*;
    match e.kind() {
        ConnectionRefused | HostUnreachable | NetworkUnreachable | AddrNotAvailable | TimedOut => {
            FailureClass::Unreachable
        }
        InvalidData => FailureClass::Decode,
        _ => FailureClass::Transient,
    }
}

// ── Message service ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MessageService {
    connector: Arc<Connector>,
}

impl MessageService {
    pub fn new(connector: Arc<Connector>) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// Send a locally originated request. Takes a worker slot first, so
    /// originated traffic competes with inbound connections for capacity.
    pub async fn send(&self, address: &NodeAddress, request: &Envelope) -> Result<Envelope, TransportError> {
        let _slot = self.connector.pool().acquire().await?;
        self.transmit(address, request).await
    }

    /// Exchange one request for one reply, retrying within the configured
    /// default budget. Relays inside inbound handlers call this directly and
    /// ride on the handler's slot.
    pub async fn transmit(&self, address: &NodeAddress, request: &Envelope) -> Result<Envelope, TransportError> {
        let budget = self.connector.settings().retry;
        self.transmit_with(address, request, budget).await
    }

    pub async fn transmit_with(
        &self,
        address: &NodeAddress,
        request: &Envelope,
        budget: RetryBudget,
    ) -> Result<Envelope, TransportError> {
        let frame = request.to_frame()?.encode()?;
        let settings = self.connector.settings();
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let error = match self.attempt(address, &frame, &settings).await {
                Ok(reply) => {
                    if attempts > 1 {
                        tracing::debug!(peer = %address, attempts, "transmit recovered");
                    }
                    return Ok(reply);
                }
                Err(e) => e,
            };

            match error.class() {
                FailureClass::Transient if budget.allows_another(attempts, started.elapsed()) => {
                    tracing::debug!(peer = %address, attempt = attempts, error = %error, "transient failure, retrying");
                    tokio::time::sleep(RETRY_PAUSE * attempts.min(10)).await;
                }
                FailureClass::Transient => {
                    tracing::debug!(peer = %address, attempts, error = %error, "retry budget exhausted");
                    return Err(TransportError::Exhausted {
                        attempts,
                        last: Box::new(error),
                    });
                }
                class => {
                    tracing::debug!(peer = %address, ?class, error = %error, "transmit failed");
                    return Err(error);
                }
            }
        }
    }

    async fn attempt(
        &self,
        address: &NodeAddress,
        frame: &[u8],
        settings: &TransportSettings,
    ) -> Result<Envelope, TransportError> {
        let mut channel = self.connector.get_and_remove(address).await?;
        match exchange(&mut channel, frame, settings.max_frame_bytes, settings.request_timeout).await {
            Ok(reply) => {
                self.connector.add_and_evict_old(address, channel);
                Ok(reply)
            }
            Err(e) => {
                self.connector.dispose_item(address, channel);
                Err(e)
            }
        }
    }
}

/// Write one frame and read back exactly one.
async fn exchange(
    channel: &mut BoxChannel,
    frame: &[u8],
    max_frame: usize,
    timeout: Duration,
) -> Result<Envelope, TransportError> {
    let peer = channel.peer();
    channel
        .write_all(frame)
        .await
        .map_err(|source| TransportError::Io { peer, source })?;

    let reply = tokio::time::timeout(timeout, read_frame(channel, max_frame))
        .await
        .map_err(|_| TransportError::Timeout { peer, after: timeout })??;

    Ok(Envelope::from_frame(&reply)?)
}

async fn read_frame(channel: &mut BoxChannel, max_frame: usize) -> Result<Frame, TransportError> {
    let peer = channel.peer();
    let mut parser = FrameParser::new(max_frame);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = channel
            .read(&mut buf)
            .await
            .map_err(|source| TransportError::Io { peer, source })?;
        if n == 0 {
            return Err(TransportError::Closed(peer));
        }
        if let Some(frame) = parser.feed(&buf[..n])?.into_iter().next() {
            return Ok(frame);
        }
    }
}
