use std::sync::Arc;

use trellis_core::crypto::Keypair;
use trellis_core::{Key, NodeId};
use trellis_services::FailureClass;

use crate::*;

async fn encrypted_node() -> RunningNode {
    launch(NodeOptions {
        keypair: Some(Arc::new(Keypair::generate())),
        transport: test_transport(ConnectionType::Encrypted),
        network_id: "test".into(),
        ..NodeOptions::default()
    })
    .await
    .expect("encrypted node should launch")
}

#[tokio::test]
async fn encrypted_nodes_ping_and_join() {
    let a = encrypted_node().await;
    let b = encrypted_node().await;
    let c = encrypted_node().await;

    assert!(a.protocol().ping(b.address()).await.is_some());
    assert!(b.context().table.contains(a.address().id()));

    let response = c.join(b.address()).await.unwrap().unwrap();
    assert!(response.neighbours.iter().any(|n| n.id() == a.address().id()));

    shutdown_all(vec![a, b, c]).await;
}

#[tokio::test]
async fn node_id_comes_from_the_keypair() {
    let keypair = Arc::new(Keypair::generate());
    let expected = NodeId::from_public_key(&keypair.public);
    let node = launch(NodeOptions {
        keypair: Some(keypair.clone()),
        transport: test_transport(ConnectionType::Encrypted),
        ..NodeOptions::default()
    })
    .await
    .unwrap();
    assert_eq!(*node.address().id(), expected);
    node.shutdown().await.unwrap();

    let mismatched = launch(NodeOptions {
        id: Some(Key::from_u64(1)),
        keypair: Some(keypair),
        transport: test_transport(ConnectionType::Encrypted),
        ..NodeOptions::default()
    })
    .await;
    assert!(mismatched.is_err());
}

#[tokio::test]
async fn impostor_address_is_rejected() {
    let a = encrypted_node().await;
    let b = encrypted_node().await;

    // b's endpoint, but claiming a different identity
    let impostor = NodeAddress::new(Key::from_u64(77), b.address().message());
    assert!(a.protocol().ping(&impostor).await.is_none());
    assert!(!a.context().table.contains(impostor.id()));

    let request = trellis_core::Envelope::request(
        a.address().clone(),
        *impostor.id(),
        trellis_core::Subject::new("routing", "ping"),
        bytes::Bytes::new(),
    );
    let err = a.context().messages.transmit(&impostor, &request).await.unwrap_err();
    assert_eq!(err.class(), FailureClass::Unreachable);

    shutdown_all(vec![a, b]).await;
}

#[tokio::test]
async fn encrypted_without_keypair_does_not_launch() {
    let result = launch(NodeOptions {
        transport: test_transport(ConnectionType::Encrypted),
        ..NodeOptions::default()
    })
    .await;
    assert!(result.is_err());
}
