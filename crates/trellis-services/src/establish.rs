//! Connection establishment strategies.
//!
//! The connector is the same for every transport variant; only this step
//! differs. `PlainEstablish` hands back the TCP stream as-is.
//! `NoiseEstablish` runs a Noise_XX handshake on it and, when dialling,
//! checks that the responder's static key hashes to the node id being dialled.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use trellis_core::config::ConnectionType;
use trellis_core::crypto::{Handshake, Keypair, Role, MAX_HANDSHAKE_MESSAGE};
use trellis_core::{NodeAddress, NodeId};

use crate::channel::{BoxChannel, PlainChannel, SecureChannel};
use crate::transport::TransportError;

#[async_trait]
pub trait Establish: Send + Sync {
    fn connection_type(&self) -> ConnectionType;

    /// Dial `address` and complete any handshake within `timeout`.
    async fn connect(&self, address: &NodeAddress, timeout: Duration) -> Result<BoxChannel, TransportError>;

    /// Complete the server side of an accepted stream within `timeout`.
    async fn accept(&self, stream: TcpStream, peer: SocketAddr, timeout: Duration) -> Result<BoxChannel, TransportError>;
}

/// Strategy for the configured connection type.
pub fn for_connection_type(kind: ConnectionType, keypair: Option<Arc<Keypair>>) -> Result<Arc<dyn Establish>, TransportError> {
    match (kind, keypair) {
        (ConnectionType::Plain, _) => Ok(Arc::new(PlainEstablish)),
        (ConnectionType::Encrypted, Some(keypair)) => Ok(Arc::new(NoiseEstablish::new(keypair))),
        (ConnectionType::Encrypted, None) => Err(TransportError::MissingKeypair),
    }
}

async fn dial(address: &NodeAddress, timeout: Duration) -> Result<TcpStream, TransportError> {
    let peer = address.message();
    let stream = tokio::time::timeout(timeout, TcpStream::connect(peer))
        .await
        .map_err(|_| TransportError::Timeout { peer, after: timeout })?
        .map_err(|source| TransportError::Io { peer, source })?;
    tune(&stream, peer);
    Ok(stream)
}

fn tune(stream: &TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer = %peer, error = %e, "set_nodelay failed");
    }
    if let Err(e) = socket2::SockRef::from(stream).set_keepalive(true) {
        tracing::debug!(peer = %peer, error = %e, "set_keepalive failed");
    }
}

// ── Plain ────────────────────────────────────────────────────────────────────

pub struct PlainEstablish;

#[async_trait]
impl Establish for PlainEstablish {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Plain
    }

    async fn connect(&self, address: &NodeAddress, timeout: Duration) -> Result<BoxChannel, TransportError> {
        let stream = dial(address, timeout).await?;
        Ok(Box::new(PlainChannel::new(stream, address.message())))
    }

    async fn accept(&self, stream: TcpStream, peer: SocketAddr, _timeout: Duration) -> Result<BoxChannel, TransportError> {
        tune(&stream, peer);
        Ok(Box::new(PlainChannel::new(stream, peer)))
    }
}

// ── Noise ────────────────────────────────────────────────────────────────────

pub struct NoiseEstablish {
    keypair: Arc<Keypair>,
}

impl NoiseEstablish {
    pub fn new(keypair: Arc<Keypair>) -> Self {
        Self { keypair }
    }

    async fn initiate(&self, mut stream: TcpStream, address: &NodeAddress) -> Result<BoxChannel, TransportError> {
        let peer = address.message();
        let io_err = |source| TransportError::Io { peer, source };
        let crypto_err = |source| TransportError::Handshake { peer, source };

        let mut handshake = Handshake::new(&self.keypair, Role::Initiator).map_err(crypto_err)?;
        let first = handshake.write().map_err(crypto_err)?;
        write_handshake(&mut stream, Some(handshake.nonce()), &first).await.map_err(io_err)?;

        let (responder_nonce, second) = read_handshake(&mut stream, true).await.map_err(io_err)?;
        handshake.set_peer_nonce(responder_nonce);
        handshake.read(&second).map_err(crypto_err)?;
        let third = handshake.write().map_err(crypto_err)?;
        write_handshake(&mut stream, None, &third).await.map_err(io_err)?;
        let session = handshake.complete().map_err(crypto_err)?;

        let presented = NodeId::from_public_key(session.remote_static());
        if presented != *address.id() {
            return Err(TransportError::IdentityMismatch {
                peer,
                expected: *address.id(),
                presented,
            });
        }
        tracing::debug!(
            peer = %address,
            session = %hex::encode(&session.id()[..8]),
            "noise session established"
        );
        Ok(Box::new(SecureChannel::new(stream, session, peer)))
    }

    async fn respond(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<BoxChannel, TransportError> {
        let io_err = |source| TransportError::Io { peer, source };
        let crypto_err = |source| TransportError::Handshake { peer, source };

        let (initiator_nonce, first) = read_handshake(&mut stream, true).await.map_err(io_err)?;
        let mut handshake = Handshake::new(&self.keypair, Role::Responder).map_err(crypto_err)?;
        handshake.set_peer_nonce(initiator_nonce);
        handshake.read(&first).map_err(crypto_err)?;
        let second = handshake.write().map_err(crypto_err)?;
        write_handshake(&mut stream, Some(handshake.nonce()), &second).await.map_err(io_err)?;

        let (_, third) = read_handshake(&mut stream, false).await.map_err(io_err)?;
        handshake.read(&third).map_err(crypto_err)?;
        let session = handshake.complete().map_err(crypto_err)?;
        tracing::debug!(
            peer = %peer,
            remote = %NodeId::from_public_key(session.remote_static()).short(),
            "noise session accepted"
        );
        Ok(Box::new(SecureChannel::new(stream, session, peer)))
    }
}

#[async_trait]
impl Establish for NoiseEstablish {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Encrypted
    }

    async fn connect(&self, address: &NodeAddress, timeout: Duration) -> Result<BoxChannel, TransportError> {
        let peer = address.message();
        tokio::time::timeout(timeout, async {
            let stream = dial(address, timeout).await?;
            self.initiate(stream, address).await
        })
        .await
        .map_err(|_| TransportError::Timeout { peer, after: timeout })?
    }

    async fn accept(&self, stream: TcpStream, peer: SocketAddr, timeout: Duration) -> Result<BoxChannel, TransportError> {
        tune(&stream, peer);
        tokio::time::timeout(timeout, self.respond(stream, peer))
            .await
            .map_err(|_| TransportError::Timeout { peer, after: timeout })?
    }
}

async fn write_handshake(stream: &mut TcpStream, nonce: Option<&[u8; 16]>, msg: &[u8]) -> io::Result<()> {
    let mut buf = Vec::with_capacity(16 + 2 + msg.len());
    if let Some(nonce) = nonce {
        buf.extend_from_slice(nonce);
    }
    buf.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    buf.extend_from_slice(msg);
    stream.write_all(&buf).await
}

async fn read_handshake(stream: &mut TcpStream, with_nonce: bool) -> io::Result<([u8; 16], Vec<u8>)> {
    let mut nonce = [0u8; 16];
    if with_nonce {
        stream.read_exact(&mut nonce).await?;
    }
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let len = u16::from_be_bytes(len) as usize;
    if len > MAX_HANDSHAKE_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("handshake message of {len} bytes"),
        ));
    }
    let mut msg = vec![0u8; len];
    stream.read_exact(&mut msg).await?;
    Ok((nonce, msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use trellis_core::Key;

    async fn pair(
        server: Arc<dyn Establish>,
        client: Arc<dyn Establish>,
        target_id: NodeId,
    ) -> (Result<BoxChannel, TransportError>, Result<BoxChannel, TransportError>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            server.accept(stream, peer, Duration::from_secs(5)).await
        });
        let target = NodeAddress::new(target_id, addr);
        let dialled = client.connect(&target, Duration::from_secs(5)).await;
        (dialled, accept.await.unwrap())
    }

    #[tokio::test]
    async fn noise_channel_carries_large_writes() {
        let server_kp = Arc::new(Keypair::generate());
        let client_kp = Arc::new(Keypair::generate());
        let server_id = NodeId::from_public_key(&server_kp.public);
        let client_pub = client_kp.public;

        let (client, server) = pair(
            Arc::new(NoiseEstablish::new(server_kp)),
            Arc::new(NoiseEstablish::new(client_kp)),
            server_id,
        )
        .await;
        let mut client = client.unwrap();
        let mut server = server.unwrap();
        assert_eq!(server.remote_key(), Some(&client_pub));

        let message: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&message).await.unwrap();

        let mut received = Vec::new();
        let mut buf = vec![0u8; 7000];
        while received.len() < message.len() {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, message);
        assert!(client.is_usable());
    }

    #[tokio::test]
    async fn noise_rejects_wrong_identity() {
        let server_kp = Arc::new(Keypair::generate());
        let (client, _server) = pair(
            Arc::new(NoiseEstablish::new(server_kp)),
            Arc::new(NoiseEstablish::new(Arc::new(Keypair::generate()))),
            Key::from_u64(1),
        )
        .await;
        assert!(matches!(client, Err(TransportError::IdentityMismatch { .. })));
    }

    #[tokio::test]
    async fn plain_channel_reports_close() {
        let (client, server) = pair(Arc::new(PlainEstablish), Arc::new(PlainEstablish), Key::from_u64(1)).await;
        let mut client = client.unwrap();
        drop(server);
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert!(!client.is_usable());
    }

    #[test]
    fn encrypted_without_keypair_is_refused() {
        assert!(matches!(
            for_connection_type(ConnectionType::Encrypted, None),
            Err(TransportError::MissingKeypair)
        ));
        assert!(for_connection_type(ConnectionType::Plain, None).is_ok());
    }
}
