use std::collections::HashSet;

use trellis_core::envelope::unix_millis;
use trellis_core::message::PublishRecord;
use trellis_core::{Key, NodeId};

use crate::*;

fn ids(addresses: impl IntoIterator<Item = NodeAddress>) -> HashSet<NodeId> {
    addresses.into_iter().map(|a| *a.id()).collect()
}

/// J(100) joins through A(150). The join travels A → B(110) → C(101); C has
/// no closer neighbour than itself and answers; each hop on the way back
/// adds its own neighbours.
#[tokio::test]
async fn join_collects_neighbours_along_the_path() {
    let joiner = plain_node(100).await;
    let a = plain_node(150).await;
    let b = plain_node(110).await;
    let c = plain_node(101).await;
    let d = plain_node(200).await;

    a.context().table.add(b.address().clone());
    b.context().table.add(c.address().clone());
    c.context().table.add(d.address().clone());

    let response = joiner
        .join(a.address())
        .await
        .expect("join succeeds")
        .expect("gateway is not self");

    let expected: HashSet<NodeId> = [110, 101, 200].into_iter().map(Key::from_u64).collect();
    assert_eq!(response.neighbours.len(), 3);
    assert_eq!(ids(response.neighbours.clone()), expected);
    assert_eq!(response.network_id, "test");
    assert_eq!(ids(joiner.context().table.addresses()), expected);

    shutdown_all(vec![joiner, a, b, c, d]).await;
}

#[tokio::test]
async fn join_carries_root_publications() {
    let joiner = plain_node(100).await;
    let root = plain_node(101).await;

    let object = Key::from_u64(101);
    let record = PublishRecord {
        object_id: object,
        publisher: Key::from_u64(300),
        expires_at_ms: unix_millis() + 3_600_000,
    };
    root.context()
        .publications
        .merge(object, HashSet::from([record.clone()]))
        .unwrap();

    let response = joiner.join(root.address()).await.unwrap().unwrap();
    assert!(response.publications.contains_key(&object));
    assert!(joiner.context().publications.publishers_of(&object).contains(&record));

    shutdown_all(vec![joiner, root]).await;
}

#[tokio::test]
async fn join_routes_around_a_dead_hop() {
    let joiner = plain_node(100).await;
    let a = plain_node(150).await;
    let b = plain_node(110).await;
    let dead = dead_address(105).await;

    a.context().table.add(dead.clone());
    a.context().table.add(b.address().clone());

    let response = joiner.join(a.address()).await.unwrap().unwrap();
    assert_eq!(ids(response.neighbours), HashSet::from([Key::from_u64(110)]));
    assert!(!a.context().table.contains(dead.id()));

    shutdown_all(vec![joiner, a, b]).await;
}

#[tokio::test]
async fn join_through_self_is_refused() {
    let node = plain_node(100).await;
    assert!(node.join(node.address()).await.unwrap().is_none());
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn join_through_dead_gateway_fails() {
    let joiner = plain_node(100).await;
    let gateway = dead_address(150).await;
    assert!(joiner.join(&gateway).await.is_err());
    assert!(joiner.context().table.is_empty());
    joiner.shutdown().await.unwrap();
}
