use super::*;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::test_helpers::{MockConnector, MockServer, MockTokenSource, location_frame};
use tokio_tungstenite::tungstenite::Message;

fn live(ids: &[&str]) -> LiveIds {
    Arc::new(ids.iter().map(|id| (*id).to_owned()).collect::<BTreeSet<_>>())
}

fn new_pool(
    tokens: &Arc<MockTokenSource>,
    connector: &Arc<MockConnector>,
) -> (ConnectionPool, mpsc::UnboundedReceiver<PoolEvent>) {
    ConnectionPool::new(Role::Admin, tokens.clone(), connector.clone(), RelayTuning::default())
}

/// Feed events back into the pool until `n` pooled buses have been handed a relay URL.
async fn pump_tokens(pool: &mut ConnectionPool, events: &mut mpsc::UnboundedReceiver<PoolEvent>, n: usize) {
    let started = |pool: &ConnectionPool| {
        pool.statuses()
            .values()
            .filter(|state| **state != ConnectionState::Idle)
            .count()
    };
    while started(pool) < n {
        let event = events.recv().await.unwrap();
        pool.handle_event(event);
    }
}

/// Pump tokens for `n` buses and accept their sockets.
async fn open_all(
    pool: &mut ConnectionPool,
    events: &mut mpsc::UnboundedReceiver<PoolEvent>,
    connector: &MockConnector,
    n: usize,
) -> Vec<MockServer> {
    pump_tokens(pool, events, n).await;
    let mut servers = Vec::new();
    for _ in 0..n {
        servers.push(connector.accept().await);
    }
    servers
}

async fn expect_close(server: &mut MockServer) {
    loop {
        match server.recv().await {
            Some(Message::Close(_)) => return,
            Some(_) => {}
            None => panic!("socket ended without a close frame"),
        }
    }
}

#[tokio::test]
async fn new_bus_is_pooled_before_token_resolves() {
    let tokens = MockTokenSource::new();
    tokens.hold();
    let connector = MockConnector::new();
    let (mut pool, _events) = new_pool(&tokens, &connector);

    let summary = pool.reconcile(&live(&["B1"]));
    assert_eq!(summary.connected, vec!["B1".to_owned()]);
    assert!(pool.contains("B1"));
    assert_eq!(pool.connection_state("B1"), Some(ConnectionState::Idle));
    assert_eq!(connector.connects(), 0);
}

#[tokio::test]
async fn rapid_second_pass_does_not_duplicate() {
    let tokens = MockTokenSource::new();
    tokens.hold();
    let connector = MockConnector::new();
    let (mut pool, mut events) = new_pool(&tokens, &connector);

    pool.reconcile(&live(&["B1"]));
    let second = pool.reconcile(&live(&["B1"]));
    assert!(second.is_empty());

    tokens.release();
    let mut servers = open_all(&mut pool, &mut events, &connector, 1).await;
    assert_eq!(tokens.calls_for("B1"), 1);
    assert_eq!(connector.connects_matching("/B1?"), 1);
    assert!(servers.pop().unwrap().url.contains("role=admin"));
}

#[tokio::test]
async fn same_live_arc_is_a_noop() {
    let tokens = MockTokenSource::new();
    let connector = MockConnector::new();
    let (mut pool, _events) = new_pool(&tokens, &connector);

    let ids = live(&["B1"]);
    assert!(!pool.reconcile(&ids).is_empty());
    assert!(pool.reconcile(&ids).is_empty());
}

#[tokio::test]
async fn location_frames_route_to_owner() {
    let tokens = MockTokenSource::new();
    let connector = MockConnector::new();
    let (mut pool, mut events) = new_pool(&tokens, &connector);

    pool.reconcile(&live(&["B1"]));
    let servers = open_all(&mut pool, &mut events, &connector, 1).await;
    servers[0].send_text(r#"{"type":"pong"}"#);
    servers[0].send_json(&location_frame(10.0, 20.0, 15.0));

    let first = pool.handle_event(events.recv().await.unwrap());
    assert_eq!(first, None);
    let (bus_id, update) = pool.handle_event(events.recv().await.unwrap()).unwrap();
    assert_eq!(bus_id, "B1");
    assert_eq!((update.lat, update.lng, update.speed_mph), (10.0, 20.0, 15.0));
}

#[tokio::test(start_paused = true)]
async fn bus_leaving_live_set_is_disconnected_once() {
    let tokens = MockTokenSource::new();
    let connector = MockConnector::new();
    let (mut pool, mut events) = new_pool(&tokens, &connector);

    pool.reconcile(&live(&["B1"]));
    let mut servers = open_all(&mut pool, &mut events, &connector, 1).await;

    let summary = pool.reconcile(&live(&[]));
    assert_eq!(summary.disconnected, vec!["B1".to_owned()]);
    assert!(pool.is_empty());
    expect_close(&mut servers[0]).await;

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.connects(), 1);
    assert!(pool.reconcile(&live(&[])).is_empty());
}

#[tokio::test]
async fn token_failure_removes_bus_and_retries_next_pass() {
    let tokens = MockTokenSource::new();
    tokens.fail_for("B1", true);
    let connector = MockConnector::new();
    let (mut pool, mut events) = new_pool(&tokens, &connector);

    let ids = live(&["B1", "B2"]);
    pool.reconcile(&ids);
    let _servers = open_all(&mut pool, &mut events, &connector, 1).await;
    // B2 opened; B1's failure may still be queued
    while pool.contains("B1") {
        let event = events.recv().await.unwrap();
        pool.handle_event(event);
    }
    assert!(pool.contains("B2"));
    assert_eq!(connector.connects_matching("/B1?"), 0);

    tokens.fail_for("B1", false);
    let retry = pool.reconcile(&ids);
    assert_eq!(retry.connected, vec!["B1".to_owned()]);
    assert!(retry.disconnected.is_empty());

    pump_tokens(&mut pool, &mut events, 2).await;
    let _b1 = connector.accept().await;
    assert_eq!(tokens.calls_for("B1"), 2);
    assert_eq!(tokens.calls_for("B2"), 1);
    assert_eq!(connector.connects_matching("/B1?"), 1);
    assert_eq!(connector.connects_matching("/B2?"), 1);
}

#[tokio::test]
async fn leaving_during_token_fetch_never_connects() {
    let tokens = MockTokenSource::new();
    tokens.hold();
    let connector = MockConnector::new();
    let (mut pool, mut events) = new_pool(&tokens, &connector);

    pool.reconcile(&live(&["B1"]));
    pool.reconcile(&live(&[]));
    assert!(pool.is_empty());

    pool.reconcile(&live(&["B1"]));
    tokens.release();
    let _servers = open_all(&mut pool, &mut events, &connector, 1).await;
    assert_eq!(connector.connects(), 1);
    assert!(pool.contains("B1"));
}

#[tokio::test]
async fn stale_generation_events_are_dropped() {
    let tokens = MockTokenSource::new();
    tokens.hold();
    let connector = MockConnector::new();
    let (mut pool, _events) = new_pool(&tokens, &connector);
    pool.reconcile(&live(&["B1"]));

    let stale_token = PoolEvent::TokenReady {
        bus_id: "B1".into(),
        generation: 999,
        result: Ok("ws://relay.test/B1?token=old".into()),
    };
    assert_eq!(pool.handle_event(stale_token), None);
    assert_eq!(pool.connection_state("B1"), Some(ConnectionState::Idle));

    let stale_frame = PoolEvent::Inbound {
        bus_id: "B1".into(),
        generation: 999,
        message: Inbound::BusLocationUpdate(LocationUpdate { lat: 1.0, lng: 1.0, speed_mph: 0.0, heading: 0.0 }),
    };
    assert_eq!(pool.handle_event(stale_frame), None);
}

#[tokio::test(start_paused = true)]
async fn dispose_disconnects_everything() {
    let tokens = MockTokenSource::new();
    let connector = MockConnector::new();
    let (mut pool, mut events) = new_pool(&tokens, &connector);

    pool.reconcile(&live(&["B1", "B2", "B3"]));
    let mut servers = open_all(&mut pool, &mut events, &connector, 3).await;
    assert_eq!(pool.len(), 3);

    pool.dispose();
    assert!(pool.is_empty());
    assert!(pool.statuses().is_empty());
    for server in &mut servers {
        expect_close(server).await;
    }

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.connects(), 3);
}

#[tokio::test]
async fn dispose_aborts_pending_token_fetches() {
    let tokens = MockTokenSource::new();
    tokens.hold();
    let connector = MockConnector::new();
    let (mut pool, mut events) = new_pool(&tokens, &connector);

    pool.reconcile(&live(&["B1", "B2"]));
    tokio::task::yield_now().await;
    pool.dispose();
    tokens.release();
    tokio::task::yield_now().await;

    while let Ok(event) = events.try_recv() {
        pool.handle_event(event);
    }
    assert!(pool.is_empty());
    assert_eq!(connector.connects(), 0);
}

#[tokio::test]
async fn dropping_pool_closes_sockets() {
    let tokens = MockTokenSource::new();
    let connector = MockConnector::new();
    let (mut pool, mut events) = new_pool(&tokens, &connector);

    pool.reconcile(&live(&["B1"]));
    let mut servers = open_all(&mut pool, &mut events, &connector, 1).await;
    drop(pool);
    expect_close(&mut servers[0]).await;
}

#[tokio::test]
async fn statuses_report_each_bus() {
    let tokens = MockTokenSource::new();
    let connector = MockConnector::new();
    let (mut pool, mut events) = new_pool(&tokens, &connector);

    pool.reconcile(&live(&["B1"]));
    let _servers = open_all(&mut pool, &mut events, &connector, 1).await;
    while pool.connection_state("B1") != Some(ConnectionState::Open) {
        tokio::task::yield_now().await;
    }
    let statuses = pool.statuses();
    assert_eq!(statuses.get("B1"), Some(&ConnectionState::Open));
}
