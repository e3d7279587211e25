use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use trellis_core::config::ConnectionType;
use trellis_core::{Envelope, FrameParser, Key, NodeAddress, Status, Subject};
use trellis_services::establish::PlainEstablish;
use trellis_services::{Connector, FailureClass, MessageService, RetryBudget, TransportError, TransportSettings};

use crate::*;

fn client() -> MessageService {
    MessageService::new(Connector::new(
        Arc::new(PlainEstablish),
        test_transport(ConnectionType::Plain),
    ))
}

fn echo_request(to: &NodeAddress, body: &'static [u8]) -> Envelope {
    let from = NodeAddress::new(Key::from_u64(1), "127.0.0.1:1".parse().unwrap());
    Envelope::request(from, *to.id(), Subject::new("echo", "echo"), Bytes::from_static(body))
}

/// Answer every request on `stream` with its own payload.
async fn echo(mut stream: TcpStream, local: NodeAddress) {
    let mut parser = FrameParser::new(1 << 20);
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        for frame in parser.feed(&buf[..n]).unwrap() {
            let request = Envelope::from_frame(&frame).unwrap();
            let payload = request.payload.clone();
            let reply = request.compose_reply(&local, Status::Ok, payload);
            let wire = reply.to_frame().unwrap().encode().unwrap();
            if stream.write_all(&wire).await.is_err() {
                return;
            }
        }
    }
}

/// A server that drops the first `bad` connections after reading from them,
/// then echoes. Returns the address and the count of accepted connections.
async fn flaky_server(bad: usize) -> (NodeAddress, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = NodeAddress::new(Key::from_u64(7), listener.local_addr().unwrap());
    let accepted = Arc::new(AtomicUsize::new(0));
    let count = accepted.clone();
    let me = local.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let n = count.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= bad {
                let mut buf = [0u8; 4];
                let _ = stream.read(&mut buf).await;
                drop(stream);
            } else {
                tokio::spawn(echo(stream, me.clone()));
            }
        }
    });
    (local, accepted)
}

/// A server that accepts and reads but never answers.
async fn silent_server() -> (NodeAddress, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = NodeAddress::new(Key::from_u64(8), listener.local_addr().unwrap());
    let accepted = Arc::new(AtomicUsize::new(0));
    let count = accepted.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            count.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });
    (local, accepted)
}

#[tokio::test]
async fn refused_destination_fails_fast_without_retry() {
    let target = dead_address(9).await;
    let started = Instant::now();
    let result = client().transmit(&target, &echo_request(&target, b"hi")).await;

    let err = result.expect_err("nothing is listening");
    assert_eq!(err.class(), FailureClass::Unreachable);
    assert!(!matches!(err, TransportError::Exhausted { .. }), "refusal must not be retried: {err}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn dropped_connection_is_retried_on_a_fresh_one() {
    let (server, accepted) = flaky_server(1).await;
    let client = client();

    let reply = client
        .transmit(&server, &echo_request(&server, b"payload"))
        .await
        .expect("second connection should answer");
    assert_eq!(&reply.payload[..], b"payload");
    assert_eq!(accepted.load(Ordering::SeqCst), 2);

    // the good connection went back to the cache and is reused
    client.transmit(&server, &echo_request(&server, b"again")).await.unwrap();
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    assert_eq!(client.connector().cache_stats().hits, 1);
}

#[tokio::test]
async fn retry_budget_bounds_attempts() {
    let (server, accepted) = flaky_server(usize::MAX).await;
    let err = client()
        .transmit_with(&server, &echo_request(&server, b"x"), RetryBudget::attempts(3))
        .await
        .expect_err("server never answers");

    match err {
        TransportError::Exhausted { attempts, ref last } => {
            assert_eq!(attempts, 3);
            assert_eq!(last.class(), FailureClass::Transient);
        }
        other => panic!("expected exhaustion, got {other}"),
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn large_payload_crosses_a_node() {
    let node = plain_node(42).await;
    let body = vec![0x5au8; 3 * 1024 * 1024];
    let request = Envelope::request(
        NodeAddress::new(Key::from_u64(1), "127.0.0.1:1".parse().unwrap()),
        *node.address().id(),
        Subject::new("no-such-service", "x"),
        body,
    );
    // unknown service still produces a reply, proving the full frame was parsed
    let reply = client().transmit(node.address(), &request).await.unwrap();
    assert_eq!(reply.header.status, Status::Failed);
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn request_timeout_is_not_retried() {
    let (server, accepted) = silent_server().await;
    let client = MessageService::new(Connector::new(
        Arc::new(PlainEstablish),
        TransportSettings {
            request_timeout: Duration::from_millis(200),
            ..test_transport(ConnectionType::Plain)
        },
    ));

    let err = client
        .transmit(&server, &echo_request(&server, b"anyone?"))
        .await
        .expect_err("server never replies");
    assert!(matches!(err, TransportError::Timeout { .. }), "got {err}");
    assert_eq!(err.class(), FailureClass::Unreachable);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(client.connector().cache_stats().idle, 0);
}

#[tokio::test]
async fn node_closes_idle_connections() {
    let mut options = plain_options(43);
    options.transport.connection_idle_timeout = Duration::from_millis(100);
    let node = launch(options).await.unwrap();

    let mut stream = TcpStream::connect(node.address().message()).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("idle connection is closed")
        .unwrap_or(0);
    assert_eq!(n, 0);

    node.shutdown().await.unwrap();
}
