//! Byte channels over TCP: plain, and Noise-encrypted.
//!
//! Both present the same `Channel` surface so framing, caching and dispatch
//! never care which one they hold. Reads are cancel-safe: a read future
//! dropped inside `select!` loses no data.
//!
//! Encrypted record format on the stream:
//!   [u32 BE record length][u64 LE nonce][ciphertext + 16-byte MAC]

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use trellis_core::crypto::{Session, MAX_RECORD_CIPHERTEXT, MAX_RECORD_PLAINTEXT};

use crate::socket_cache::Poolable;

#[async_trait]
pub trait Channel: Send {
    /// Read some bytes. `Ok(0)` means the peer closed the connection.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    fn peer(&self) -> SocketAddr;

    /// The peer's authenticated static key, for encrypted channels.
    fn remote_key(&self) -> Option<&[u8; 32]> {
        None
    }

    fn is_usable(&self) -> bool;
}

pub type BoxChannel = Box<dyn Channel>;

impl Poolable for BoxChannel {
    fn is_usable(&self) -> bool {
        (**self).is_usable()
    }
}

/// Non-blocking liveness probe: an idle connection must have nothing to
/// read. EOF, stray bytes, or an error all mean it cannot be reused.
fn idle_stream_is_open(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    matches!(stream.try_read(&mut probe), Err(e) if e.kind() == io::ErrorKind::WouldBlock)
}

// ── Plain ────────────────────────────────────────────────────────────────────

pub struct PlainChannel {
    stream: TcpStream,
    peer: SocketAddr,
    broken: bool,
}

impl PlainChannel {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            broken: false,
        }
    }
}

#[async_trait]
impl Channel for PlainChannel {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.stream.read(buf).await;
        match &result {
            Ok(0) | Err(_) => self.broken = true,
            Ok(_) => {}
        }
        result
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let result = self.stream.write_all(data).await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn is_usable(&self) -> bool {
        !self.broken && idle_stream_is_open(&self.stream)
    }
}

// ── Encrypted ────────────────────────────────────────────────────────────────

pub struct SecureChannel {
    stream: TcpStream,
    session: Session,
    peer: SocketAddr,
    /// Ciphertext received but not yet opened.
    raw: BytesMut,
    /// Plaintext opened but not yet handed to the caller.
    plain: BytesMut,
    scratch: Vec<u8>,
    broken: bool,
}

impl SecureChannel {
    pub fn new(stream: TcpStream, session: Session, peer: SocketAddr) -> Self {
        Self {
            stream,
            session,
            peer,
            raw: BytesMut::with_capacity(MAX_RECORD_CIPHERTEXT + 4),
            plain: BytesMut::new(),
            scratch: Vec::new(),
            broken: false,
        }
    }

    /// Open every complete record sitting in `raw`.
    fn open_buffered(&mut self) -> io::Result<()> {
        loop {
            if self.raw.len() < 4 {
                return Ok(());
            }
            let len = u32::from_be_bytes([self.raw[0], self.raw[1], self.raw[2], self.raw[3]]) as usize;
            if len > MAX_RECORD_CIPHERTEXT {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("record of {len} bytes exceeds limit"),
                ));
            }
            if self.raw.len() < 4 + len {
                return Ok(());
            }
            self.raw.advance(4);
            let record = self.raw.split_to(len);
            self.session
                .open(&record, &mut self.scratch)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.plain.extend_from_slice(&self.scratch);
        }
    }
}

#[async_trait]
impl Channel for SecureChannel {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.plain.is_empty() {
                let n = buf.len().min(self.plain.len());
                buf[..n].copy_from_slice(&self.plain[..n]);
                self.plain.advance(n);
                return Ok(n);
            }
            if let Err(e) = self.open_buffered() {
                self.broken = true;
                return Err(e);
            }
            if !self.plain.is_empty() {
                continue;
            }
            match self.stream.read_buf(&mut self.raw).await {
                Ok(0) if self.raw.is_empty() => {
                    self.broken = true;
                    return Ok(0);
                }
                Ok(0) => {
                    self.broken = true;
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-record",
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    self.broken = true;
                    return Err(e);
                }
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let records = data.len().div_ceil(MAX_RECORD_PLAINTEXT).max(1);
        let mut out = Vec::with_capacity(data.len() + records * (4 + MAX_RECORD_CIPHERTEXT - MAX_RECORD_PLAINTEXT));
        let mut sealed = Vec::new();
        for chunk in data.chunks(MAX_RECORD_PLAINTEXT) {
            self.session
                .seal(chunk, &mut sealed)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            out.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
            out.extend_from_slice(&sealed);
        }
        let result = self.stream.write_all(&out).await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn remote_key(&self) -> Option<&[u8; 32]> {
        Some(self.session.remote_static())
    }

    fn is_usable(&self) -> bool {
        !self.broken && self.raw.is_empty() && self.plain.is_empty() && idle_stream_is_open(&self.stream)
    }
}
