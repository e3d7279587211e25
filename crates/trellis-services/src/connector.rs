//! Connector — the node's TCP edge.
//!
//! Outbound: hands connections to the message service through the socket
//! cache, dialling through the configured `Establish` strategy on a miss.
//!
//! Inbound: an accept loop that reserves a worker slot *before* each accept,
//! so at most `max_inbound_connections` handlers (plus originated sends) run
//! at once. While the pool is saturated the loop accepts at most one
//! connection and queues it for the next free slot; further clients wait in
//! the kernel backlog. Each handler parses frames off its connection,
//! dispatches every request to local delivery concurrently, and writes
//! replies back in request order. After each reply the handler checks the
//! pool; if work is queued for a slot it closes the connection and gives its
//! slot up. Shutdown closes every open connection.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{FuturesOrdered, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use trellis_core::config::ConnectionType;
use trellis_core::{Envelope, Frame, FrameParser, NodeAddress};

use crate::channel::BoxChannel;
use crate::establish::Establish;
use crate::pool::{WorkerPermit, WorkerPool};
use crate::settings::{snapshot, SharedTransportSettings, TransportSettings};
use crate::socket_cache::{CacheStats, SocketCache};
use crate::transport::TransportError;

const READ_CHUNK: usize = 16 * 1024;
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);
const MIN_REAP_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Where inbound requests go once decoded. Always produces a reply.
#[async_trait]
pub trait LocalDelivery: Send + Sync + 'static {
    async fn deliver(&self, request: Envelope) -> Envelope;
}

pub struct Connector {
    establish: Arc<dyn Establish>,
    cache: SocketCache<BoxChannel>,
    pool: Arc<WorkerPool>,
    settings: SharedTransportSettings,
}

impl Connector {
    pub fn new(establish: Arc<dyn Establish>, settings: TransportSettings) -> Arc<Self> {
        Arc::new(Self {
            cache: SocketCache::new(settings.socket_cache_capacity, settings.socket_idle_timeout),
            pool: WorkerPool::new(settings.max_inbound_connections),
            establish,
            settings: Arc::new(RwLock::new(settings)),
        })
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.establish.connection_type()
    }

    pub fn settings(&self) -> TransportSettings {
        snapshot(&self.settings)
    }

    /// Change transport settings on a running node. Cache capacity and idle
    /// timeout apply immediately; the worker pool keeps its start-up size.
    pub fn update_settings(&self, change: impl FnOnce(&mut TransportSettings)) {
        let updated = {
            let mut guard = match self.settings.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            change(&mut guard);
            guard.clone()
        };
        self.cache.set_capacity(updated.socket_cache_capacity);
        self.cache.set_idle_timeout(updated.socket_idle_timeout);
        tracing::info!(
            cache_capacity = updated.socket_cache_capacity,
            idle_timeout = ?updated.socket_idle_timeout,
            "transport settings updated"
        );
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    /// A connection to `address`: the cached one if usable, else a new one.
    pub async fn get_and_remove(&self, address: &NodeAddress) -> Result<BoxChannel, TransportError> {
        if let Some(channel) = self.cache.take(address) {
            return Ok(channel);
        }
        let timeout = self.settings().connect_timeout;
        let channel = self.establish.connect(address, timeout).await?;
        self.cache.note_established();
        tracing::debug!(peer = %address, "connection established");
        Ok(channel)
    }

    pub fn add_and_evict_old(&self, address: &NodeAddress, channel: BoxChannel) {
        self.cache.add_and_evict_old(address, channel);
    }

    pub fn dispose_item(&self, address: &NodeAddress, channel: BoxChannel) {
        self.cache.dispose_item(address, channel);
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    /// Accept connections until shutdown fires, then close every open
    /// connection and wait for its handler to finish.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        delivery: Arc<dyn LocalDelivery>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(
            addr = %local,
            kind = ?self.connection_type(),
            workers = self.pool.capacity(),
            "connector listening"
        );
        let reaper = tokio::spawn(reap_idle(Arc::downgrade(&self)));
        let mut handlers = JoinSet::new();

        loop {
            let admission = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                Some(done) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = done {
                        tracing::error!(error = %e, "connection handler failed");
                    }
                    continue;
                }
                permit = self.pool.reserve() => Admission::Slot(permit),
                accepted = listener.accept() => Admission::Queued(accepted),
            };

            let (permit, stream, peer) = match admission {
                Admission::Slot(Err(e)) => {
                    tracing::warn!(error = %e, "worker pool closed, no longer accepting");
                    break;
                }
                Admission::Slot(Ok(permit)) => {
                    let accepted = tokio::select! {
                        _ = shutdown.recv() => break,
                        accepted = listener.accept() => accepted,
                    };
                    match accepted {
                        Ok((stream, peer)) => (permit, stream, peer),
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            drop(permit);
                            tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                            continue;
                        }
                    }
                }
                Admission::Queued(Err(e)) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    continue;
                }
                // every slot was taken; this connection now waits as counted
                // work so a busy handler hands its slot over
                Admission::Queued(Ok((stream, peer))) => {
                    tracing::debug!(peer = %peer, "worker pool saturated, connection queued");
                    let permit = tokio::select! {
                        _ = shutdown.recv() => break,
                        permit = self.pool.acquire() => permit,
                    };
                    match permit {
                        Ok(permit) => (permit, stream, peer),
                        Err(e) => {
                            tracing::warn!(error = %e, "worker pool closed, no longer accepting");
                            break;
                        }
                    }
                }
            };

            tracing::debug!(peer = %peer, in_use = self.pool.in_use(), "accepted connection");
            handlers.spawn(self.clone().handle_connection(
                stream,
                peer,
                delivery.clone(),
                permit,
                shutdown.resubscribe(),
            ));
        }

        reaper.abort();
        drop(listener);
        tracing::info!(addr = %local, open = handlers.len(), "connector shutting down");
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(open = handlers.len(), "connections did not close in time, aborting");
            handlers.shutdown().await;
        }
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        delivery: Arc<dyn LocalDelivery>,
        permit: WorkerPermit,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let settings = self.settings();
        let accepted = tokio::select! {
            _ = shutdown.recv() => return,
            accepted = self.establish.accept(stream, peer, settings.connect_timeout) => accepted,
        };
        let mut channel = match accepted {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "inbound connection setup failed");
                return;
            }
        };

        let mut parser = FrameParser::new(settings.max_frame_bytes);
        let mut buf = vec![0u8; READ_CHUNK];
        let mut in_flight: FuturesOrdered<JoinHandle<Result<Bytes, TransportError>>> = FuturesOrdered::new();
        let mut served = 0u64;

        loop {
            let event = tokio::select! {
                _ = shutdown.recv() => Event::Shutdown,
                read = channel.read(&mut buf) => Event::Read(read),
                Some(done) = in_flight.next(), if !in_flight.is_empty() => Event::Processed(done),
                _ = tokio::time::sleep(settings.connection_idle_timeout), if in_flight.is_empty() => Event::Idle,
            };

            match event {
                Event::Read(Ok(0)) => {
                    if !parser.is_idle() {
                        tracing::debug!(peer = %peer, "peer closed mid-frame");
                    }
                    break;
                }
                Event::Read(Ok(n)) => match parser.feed(&buf[..n]) {
                    Ok(frames) => {
                        for frame in frames {
                            in_flight.push_back(tokio::spawn(process(delivery.clone(), frame)));
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "bad frame, closing connection");
                        break;
                    }
                },
                Event::Read(Err(e)) => {
                    if e.kind() != io::ErrorKind::ConnectionReset {
                        tracing::debug!(peer = %peer, error = %e, "read failed");
                    }
                    break;
                }
                Event::Processed(Ok(Ok(reply))) => {
                    if let Err(e) = channel.write_all(&reply).await {
                        tracing::debug!(peer = %peer, error = %e, "reply write failed");
                        break;
                    }
                    served += 1;
                    if in_flight.is_empty() && self.pool.is_congested() {
                        tracing::debug!(peer = %peer, "worker pool congested, releasing connection");
                        break;
                    }
                }
                Event::Processed(Ok(Err(e))) => {
                    tracing::warn!(peer = %peer, error = %e, "undecodable request, closing connection");
                    break;
                }
                Event::Processed(Err(e)) => {
                    tracing::error!(peer = %peer, error = %e, "request task failed");
                    break;
                }
                Event::Idle => {
                    tracing::debug!(peer = %peer, "idle timeout");
                    break;
                }
                Event::Shutdown => {
                    tracing::debug!(peer = %peer, pending = in_flight.len(), "closing for shutdown");
                    break;
                }
            }
        }

        tracing::debug!(peer = %peer, served, "connection closed");
        drop(permit);
    }
}

enum Admission {
    Slot(Result<WorkerPermit, TransportError>),
    Queued(io::Result<(TcpStream, SocketAddr)>),
}

enum Event {
    Read(io::Result<usize>),
    Processed(Result<Result<Bytes, TransportError>, JoinError>),
    Idle,
    Shutdown,
}

/// Decode one request, deliver it, and encode the reply.
async fn process(delivery: Arc<dyn LocalDelivery>, frame: Frame) -> Result<Bytes, TransportError> {
    let request = Envelope::from_frame(&frame)?;
    let reply = delivery.deliver(request).await;
    Ok(reply.to_frame()?.encode()?)
}

async fn reap_idle(connector: std::sync::Weak<Connector>) {
    loop {
        let interval = match connector.upgrade() {
            Some(c) => (c.settings().socket_idle_timeout / 2).max(MIN_REAP_INTERVAL),
            None => return,
        };
        tokio::time::sleep(interval).await;
        match connector.upgrade() {
            Some(c) => {
                c.cache.evict_idle();
            }
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::establish::PlainEstablish;
    use crate::transport::MessageService;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trellis_core::envelope::Status;
    use trellis_core::{Key, Subject};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LocalDelivery for Echo {
        async fn deliver(&self, request: Envelope) -> Envelope {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let payload = request.payload.clone();
            let local = NodeAddress::new(request.header.destination, "127.0.0.1:2".parse().unwrap());
            request.compose_reply(&local, Status::Ok, payload)
        }
    }

    async fn start(settings: TransportSettings) -> (Arc<Connector>, NodeAddress, Arc<Echo>, broadcast::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = Connector::new(Arc::new(PlainEstablish), settings);
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let (tx, rx) = broadcast::channel(1);
        tokio::spawn(connector.clone().serve(listener, echo.clone(), rx));
        (connector, NodeAddress::new(Key::from_u64(9), addr), echo, tx)
    }

    fn request(to: &NodeAddress, body: &'static [u8]) -> Envelope {
        let from = NodeAddress::new(Key::from_u64(1), "127.0.0.1:1".parse().unwrap());
        Envelope::request(from, *to.id(), Subject::new("echo", "echo"), Bytes::from_static(body))
    }

    #[tokio::test]
    async fn connections_are_reused() {
        let (server, addr, echo, _shutdown) = start(TransportSettings::default()).await;
        let client = MessageService::new(Connector::new(Arc::new(PlainEstablish), TransportSettings::default()));

        for body in [&b"one"[..], b"two", b"three"] {
            let reply = client.transmit(&addr, &request(&addr, body)).await.unwrap();
            assert_eq!(&reply.payload[..], body);
        }
        let stats = client.connector().cache_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.idle, 1);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 3);
        assert!(server.pool().in_use() <= 1);
    }

    #[tokio::test]
    async fn pipelined_requests_reply_in_order() {
        let (_server, addr, _echo, _shutdown) = start(TransportSettings::default()).await;
        let mut stream = TcpStream::connect(addr.message()).await.unwrap();

        let mut wire = Vec::new();
        for i in 0..5u8 {
            let body: &'static [u8] = match i {
                0 => b"0",
                1 => b"1",
                2 => b"2",
                3 => b"3",
                _ => b"4",
            };
            wire.extend_from_slice(&request(&addr, body).to_frame().unwrap().encode().unwrap());
        }
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream.write_all(&wire).await.unwrap();

        let mut parser = FrameParser::new(1 << 20);
        let mut replies = Vec::new();
        let mut buf = [0u8; 4096];
        while replies.len() < 5 {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0);
            replies.extend(parser.feed(&buf[..n]).unwrap());
        }
        let bodies: Vec<Vec<u8>> = replies
            .iter()
            .map(|f| Envelope::from_frame(f).unwrap().payload.to_vec())
            .collect();
        assert_eq!(bodies, vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]);
    }

    #[tokio::test]
    async fn garbage_closes_the_connection() {
        let (_server, addr, echo, _shutdown) = start(TransportSettings::default()).await;
        let mut stream = TcpStream::connect(addr.message()).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream.write_all(&[0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn one_worker() -> TransportSettings {
        TransportSettings {
            max_inbound_connections: 1,
            ..TransportSettings::default()
        }
    }

    #[tokio::test]
    async fn inbound_handlers_are_bounded() {
        let (server, addr, _echo, _shutdown) = start(one_worker()).await;

        let _first = TcpStream::connect(addr.message()).await.unwrap();
        wait_until(|| server.pool().is_saturated()).await;
        // an idle listener is not queued work
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.pool().in_use(), 1);
        assert_eq!(server.pool().waiting(), 0);
        assert!(!server.pool().is_congested());

        let _second = TcpStream::connect(addr.message()).await.unwrap();
        wait_until(|| server.pool().is_congested()).await;
        assert_eq!(server.pool().in_use(), 1);
    }

    #[tokio::test]
    async fn single_client_keeps_its_connection_at_capacity() {
        let (_server, addr, echo, _shutdown) = start(one_worker()).await;
        let client = MessageService::new(Connector::new(Arc::new(PlainEstablish), TransportSettings::default()));

        for _ in 0..5 {
            client.transmit(&addr, &request(&addr, b"again")).await.unwrap();
        }
        let stats = client.connector().cache_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 4);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn busy_handler_hands_its_slot_to_a_queued_client() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (server, addr, _echo, _shutdown) = start(one_worker()).await;
        let client = MessageService::new(Connector::new(Arc::new(PlainEstablish), TransportSettings::default()));
        client.transmit(&addr, &request(&addr, b"first")).await.unwrap();

        let mut queued = TcpStream::connect(addr.message()).await.unwrap();
        queued
            .write_all(&request(&addr, b"queued").to_frame().unwrap().encode().unwrap())
            .await
            .unwrap();
        wait_until(|| server.pool().is_congested()).await;

        // served on the cached connection, which the server then releases
        client.transmit(&addr, &request(&addr, b"second")).await.unwrap();

        let mut parser = FrameParser::new(1 << 20);
        let mut buf = [0u8; 4096];
        let reply = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let n = queued.read(&mut buf).await.unwrap();
                assert!(n > 0, "queued client was dropped");
                if let Some(frame) = parser.feed(&buf[..n]).unwrap().pop() {
                    return Envelope::from_frame(&frame).unwrap();
                }
            }
        })
        .await
        .expect("queued client is served");
        assert_eq!(&reply.payload[..], b"queued");
    }

    #[tokio::test]
    async fn idle_connection_is_closed() {
        use tokio::io::AsyncReadExt;

        let settings = TransportSettings {
            connection_idle_timeout: Duration::from_millis(100),
            ..TransportSettings::default()
        };
        let (_server, addr, _echo, _shutdown) = start(settings).await;
        let mut stream = TcpStream::connect(addr.message()).await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("server closes an idle connection")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn shutdown_closes_open_connections() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NodeAddress::new(Key::from_u64(9), listener.local_addr().unwrap());
        let connector = Connector::new(Arc::new(PlainEstablish), TransportSettings::default());
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let (tx, rx) = broadcast::channel(1);
        let served = tokio::spawn(connector.clone().serve(listener, echo.clone(), rx));

        let mut stream = TcpStream::connect(addr.message()).await.unwrap();
        stream
            .write_all(&request(&addr, b"hello").to_frame().unwrap().encode().unwrap())
            .await
            .unwrap();
        let mut buf = [0u8; 4096];
        assert!(stream.read(&mut buf).await.unwrap() > 0);

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), served)
            .await
            .expect("serve returns once connections close")
            .unwrap()
            .unwrap();

        let n = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(TcpStream::connect(addr.message()).await.is_err());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn settings_update_resizes_cache() {
        let connector = Connector::new(Arc::new(PlainEstablish), TransportSettings::default());
        connector.update_settings(|s| s.socket_cache_capacity = 3);
        assert_eq!(connector.cache_stats().capacity, 3);
        assert_eq!(connector.settings().socket_cache_capacity, 3);
    }
}
