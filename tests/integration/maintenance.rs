use std::time::Duration;

use trellis_core::envelope::unix_millis;
use trellis_services::daemons::LifecycleError;
use trellis_services::{DaemonPhase, IntroductionPass, Metric, RoutingSettings};

use crate::*;

#[tokio::test]
async fn ping_updates_both_sides() {
    let a = plain_node(10).await;
    let b = plain_node(20).await;

    let response = a.protocol().ping(b.address()).await.expect("b answers");
    assert!(response.neighbours.iter().any(|n| n.id() == a.address().id()));

    assert!(a.context().table.contains(b.address().id()));
    assert!(b.context().table.contains(a.address().id()));

    let entry = a.context().dossier.entry(b.address().id()).expect("dossier entry");
    assert_eq!(entry.counter(Metric::Available).successes, 1);
    assert!(entry.average(Metric::Latency).is_some());

    shutdown_all(vec![a, b]).await;
}

#[tokio::test]
async fn failed_ping_counts_against_the_peer() {
    let a = plain_node(10).await;
    let dead = dead_address(30).await;

    assert!(a.protocol().ping(&dead).await.is_none());
    let entry = a.context().dossier.entry(dead.id()).expect("fresh entry is kept");
    assert_eq!(entry.counter(Metric::Available).attempts, 1);
    assert_eq!(entry.counter(Metric::Available).successes, 0);
    assert!(!a.context().table.contains(dead.id()));

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn shut_down_node_stops_answering() {
    let a = plain_node(10).await;
    let b = plain_node(20).await;
    let b_address = b.address().clone();

    // leaves a's connection to b open in its cache
    assert!(a.protocol().ping(&b_address).await.is_some());
    assert_eq!(a.connector().cache_stats().idle, 1);

    b.shutdown().await.unwrap();
    assert!(a.protocol().ping(&b_address).await.is_none());
    let entry = a.context().dossier.entry(b_address.id()).unwrap();
    assert_eq!(entry.counter(Metric::Available).attempts, 2);
    assert_eq!(entry.counter(Metric::Available).successes, 1);

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn reunion_expires_only_silent_stale_entries() {
    let node = plain_node(10).await;
    let live = plain_node(20).await;
    let dead = dead_address(30).await;

    for peer in [live.address(), &dead] {
        node.context().dossier.with_entry(peer, &mut |entry| entry.last_contact_ms = 0);
    }

    let pass = node.protocol().reunite().await;
    assert_eq!(pass.attempted, 2);
    assert_eq!(pass.recovered, 1);

    assert!(node.context().dossier.entry(dead.id()).is_none());
    let kept = node.context().dossier.entry(live.address().id()).expect("live entry kept");
    assert!(unix_millis() - kept.last_contact_ms < 60_000);
    assert!(node.context().table.contains(live.address().id()));

    shutdown_all(vec![node, live]).await;
}

#[tokio::test]
async fn introduction_learns_neighbours_of_neighbours() {
    let a = plain_node(10).await;
    let b = plain_node(20).await;
    let c = plain_node(30).await;
    let d = plain_node(40).await;
    let dead = dead_address(50).await;

    a.context().table.add(b.address().clone());
    a.context().table.add(c.address().clone());
    a.context().table.add(dead.clone());
    b.context().table.add(d.address().clone());

    let pass = a.protocol().introduce().await;
    assert_eq!(pass, IntroductionPass::Swept { pinged: 3, lost: 1, added: 1 });

    let table = &a.context().table;
    assert!(table.contains(d.address().id()));
    assert!(!table.contains(dead.id()));
    assert_eq!(table.len(), 3);

    shutdown_all(vec![a, b, c, d]).await;
}

#[tokio::test]
async fn lonely_introduction_does_nothing() {
    let a = plain_node(10).await;
    let b = plain_node(20).await;
    a.context().table.add(b.address().clone());
    assert_eq!(a.protocol().introduce().await, IntroductionPass::TooFewNeighbours);
    shutdown_all(vec![a, b]).await;
}

#[tokio::test]
async fn daemons_ramp_wake_and_stop() {
    let mut options = plain_options(10);
    options.routing = RoutingSettings {
        introduction_floor: Duration::from_millis(20),
        introduction_ceiling: Duration::from_millis(80),
        reunion_interval: Duration::from_secs(3600),
        ..RoutingSettings::default()
    };
    let mut node = launch(options).await.unwrap();
    let service = node.maintenance_mut();
    service.start().unwrap();
    assert_eq!(service.start(), Err(LifecycleError::AlreadyRunning));

    let mut intro = service.watch_introduction().unwrap();
    let ramp = tokio::time::timeout(Duration::from_secs(5), intro.wait_for(|s| s.runs >= 3))
        .await
        .expect("three introduction passes")
        .unwrap()
        .interval;
    assert_eq!(ramp, Duration::from_millis(80));

    // an empty table wakes reunion long before its hour is up
    let mut reunion = service.watch_reunion().unwrap();
    tokio::time::timeout(Duration::from_secs(5), reunion.wait_for(|s| s.runs >= 1))
        .await
        .expect("reunion woken")
        .unwrap();

    assert!(service.wake_introduction());
    service.stop().await;
    assert!(!service.is_running());
    assert!(!service.wake_reunion());
    assert_eq!(intro.borrow().phase, DaemonPhase::Stopped);
    assert_eq!(service.start(), Err(LifecycleError::Stopped));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn ramp_status_tracks_doubling() {
    let mut options = plain_options(11);
    options.routing.introduction_floor = Duration::from_secs(1);
    options.routing.introduction_ceiling = Duration::from_secs(3600);
    let mut node = launch(options).await.unwrap();
    node.maintenance_mut().start().unwrap();

    let mut intro = node.maintenance().watch_introduction().unwrap();
    let status = tokio::time::timeout(Duration::from_secs(5), intro.wait_for(|s| s.runs >= 1))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(status.interval, Duration::from_secs(2));
    assert_eq!(status.phase, DaemonPhase::Sleeping);

    // waking skips the sleep; the next pass doubles again
    assert!(node.maintenance().wake_introduction());
    let status = tokio::time::timeout(Duration::from_secs(5), intro.wait_for(|s| s.runs >= 2))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(status.interval, Duration::from_secs(4));

    node.maintenance_mut().stop().await;
    node.shutdown().await.unwrap();
}
