use std::time::Duration;

use circle_shared::domain::CircleId;
use tokio::time::Instant;

use super::*;
use crate::test_support::{credentials, fast_policy, FakeTransport};

fn join(circle: &str) -> ClientRequest {
    ClientRequest::JoinCircle {
        circle_id: CircleId::from(circle),
    }
}

fn leave(circle: &str) -> ClientRequest {
    ClientRequest::LeaveCircle {
        circle_id: CircleId::from(circle),
    }
}

async fn next_state(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    events.recv().await.expect("connection event")
}

#[tokio::test(start_paused = true)]
async fn connect_walks_through_connecting_to_connected() {
    let (transport, _peers) = FakeTransport::new();
    let (manager, _inbound) = ConnectionManager::new(transport, fast_policy());
    let mut events = manager.subscribe_events();

    let handle = manager.connect(credentials()).await.expect("connect");

    assert_eq!(handle.state(), ConnectionState::Connected);
    assert_eq!(handle.user_id().as_str(), "me");
    assert_eq!(
        next_state(&mut events).await,
        ConnectionEvent::StateChanged(ConnectionState::Connecting)
    );
    assert_eq!(
        next_state(&mut events).await,
        ConnectionEvent::StateChanged(ConnectionState::Connected)
    );
}

#[tokio::test(start_paused = true)]
async fn auth_failure_is_returned_without_retry() {
    let (transport, _peers) = FakeTransport::new();
    transport.script([Err(EngineError::Auth("expired token".into()))]);
    let (manager, _inbound) = ConnectionManager::new(transport.clone(), fast_policy());

    let err = manager.connect(credentials()).await.err().expect("auth error");

    assert!(err.is_auth());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn first_connect_retries_network_failures_with_backoff() {
    let (transport, mut peers) = FakeTransport::new();
    transport.script([
        Err(EngineError::Network("refused".into())),
        Err(EngineError::Network("refused".into())),
    ]);
    let (manager, _inbound) = ConnectionManager::new(transport.clone(), fast_policy());
    let started = Instant::now();

    let handle = manager.connect(credentials()).await.expect("connect");

    assert_eq!(handle.state(), ConnectionState::Connected);
    assert_eq!(transport.opens(), 3);
    // Immediate first attempt, then 1s + 2s of backoff.
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(peers.recv().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn first_connect_gives_up_after_bounded_attempts() {
    let (transport, _peers) = FakeTransport::new();
    transport.script((0..6).map(|_| Err(EngineError::Network("refused".into()))));
    let (manager, _inbound) = ConnectionManager::new(transport.clone(), fast_policy());
    let mut state = manager.watch_state();

    let err = manager.connect(credentials()).await.err().expect("network error");

    assert!(err.is_retryable());
    assert_eq!(transport.opens(), 6);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(state.has_changed().expect("sender alive"));
    assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected);
    assert_eq!(
        manager.send(join("1")).await.err(),
        Some(EngineError::NotConnected)
    );
}

#[tokio::test(start_paused = true)]
async fn auth_rejection_after_network_retries_stops_the_first_connect() {
    let (transport, _peers) = FakeTransport::new();
    transport.script([
        Err(EngineError::Network("refused".into())),
        Err(EngineError::Auth("revoked".into())),
    ]);
    let (manager, _inbound) = ConnectionManager::new(transport.clone(), fast_policy());

    let err = manager.connect(credentials()).await.err().expect("auth error");

    assert!(err.is_auth());
    assert_eq!(transport.opens(), 2);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn requests_sent_while_connecting_are_flushed_in_order() {
    let (transport, mut peers) = FakeTransport::new();
    transport.set_open_delay(Duration::from_secs(5));
    let (manager, _inbound) = ConnectionManager::new(transport, fast_policy());
    let mut state = manager.watch_state();

    let connecting = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.connect(credentials()).await.map(|_| ()) }
    });
    state
        .wait_for(|s| *s == ConnectionState::Connecting)
        .await
        .expect("connecting");

    let first = manager.send(join("1")).await.expect("queued");
    let second = manager.send(leave("1")).await.expect("queued");
    assert_eq!(manager.state(), ConnectionState::Connecting);

    connecting.await.expect("task").expect("connect");
    let mut peer = peers.recv().await.expect("session");
    assert_eq!(peer.next_request().await, join("1"));
    assert_eq!(peer.next_request().await, leave("1"));
    first.delivered().await.expect("flushed");
    second.delivered().await.expect("flushed");
}

#[tokio::test(start_paused = true)]
async fn cancelled_request_is_dropped_from_the_reconnect_queue() {
    let (transport, mut peers) = FakeTransport::new();
    let (manager, _inbound) = ConnectionManager::new(transport.clone(), fast_policy());
    manager.connect(credentials()).await.expect("connect");
    let first = peers.recv().await.expect("first session");

    transport.script([Err(EngineError::Network("refused".into()))]);
    drop(first);
    let mut state = manager.watch_state();
    state
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .expect("reconnecting");

    let withdrawn = manager.send(join("1")).await.expect("queued");
    let kept = manager.send(leave("2")).await.expect("queued");
    manager.cancel(withdrawn.ticket()).await;

    let mut second = peers.recv().await.expect("second session");
    assert_eq!(second.next_request().await, leave("2"));
    kept.delivered().await.expect("flushed");
    assert_eq!(withdrawn.delivered().await, Err(EngineError::NotConnected));
    assert!(second.requests.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn send_before_connect_is_rejected() {
    let (transport, _peers) = FakeTransport::new();
    let (manager, _inbound) = ConnectionManager::new(transport, fast_policy());

    let err = manager.send(join("1")).await.err().expect("not connected");
    assert_eq!(err, EngineError::NotConnected);
}

#[tokio::test(start_paused = true)]
async fn delivers_requests_and_forwards_server_events() {
    let (transport, mut peers) = FakeTransport::new();
    let (manager, mut inbound) = ConnectionManager::new(transport, fast_policy());
    manager.connect(credentials()).await.expect("connect");
    let mut peer = peers.recv().await.expect("session");

    let receipt = manager.send(join("1")).await.expect("queued");
    receipt.delivered().await.expect("delivered");
    assert_eq!(peer.next_request().await, join("1"));

    peer.push(ServerEvent::Presence {
        circle_id: CircleId::from("1"),
        online_count: 4,
    })
    .await;
    assert_eq!(
        inbound.recv().await,
        Some(ServerEvent::Presence {
            circle_id: CircleId::from("1"),
            online_count: 4,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_replays_resume_then_flushes_queue_in_order() {
    let (transport, mut peers) = FakeTransport::new();
    let (manager, _inbound) = ConnectionManager::new(transport.clone(), fast_policy());
    manager.connect(credentials()).await.expect("connect");
    manager.set_resume(Some(join("2"))).await;
    let first = peers.recv().await.expect("first session");

    transport.script([Err(EngineError::Network("refused".into()))]);
    drop(first);

    let mut state = manager.watch_state();
    state
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .expect("reconnecting");
    let queued_leave = manager.send(leave("1")).await.expect("queued");
    let queued_join = manager.send(join("2")).await.expect("queued");

    let mut second = peers.recv().await.expect("second session");
    assert_eq!(second.next_request().await, join("2"));
    assert_eq!(second.next_request().await, leave("1"));
    assert_eq!(second.next_request().await, join("2"));
    queued_leave.delivered().await.expect("flushed");
    queued_join.delivered().await.expect("flushed");
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(transport.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_bounded_attempts_and_fails_queued_sends() {
    let (transport, mut peers) = FakeTransport::new();
    let (manager, _inbound) = ConnectionManager::new(transport.clone(), fast_policy());
    manager.connect(credentials()).await.expect("connect");
    let mut events = manager.subscribe_events();
    let peer = peers.recv().await.expect("session");

    transport.script((0..5).map(|_| Err(EngineError::Network("refused".into()))));
    let started = Instant::now();
    drop(peer);

    let mut state = manager.watch_state();
    state
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .expect("reconnecting");
    let receipt = manager.send(join("1")).await.expect("queued");

    assert_eq!(
        receipt.delivered().await,
        Err(EngineError::ConnectionLost { attempts: 5 })
    );
    // 1s + 2s + 4s + 8s + 16s of backoff.
    assert!(started.elapsed() >= Duration::from_secs(31));

    let mut saw_lost = false;
    while let Ok(event) = events.try_recv() {
        if event == (ConnectionEvent::ConnectionLost { attempts: 5 }) {
            saw_lost = true;
        }
    }
    assert!(saw_lost);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(transport.opens(), 6);

    let err = manager.send(join("1")).await.err().expect("supervisor gone");
    assert_eq!(err, EngineError::NotConnected);
}

#[tokio::test(start_paused = true)]
async fn auth_rejection_during_reconnect_is_terminal() {
    let (transport, mut peers) = FakeTransport::new();
    let (manager, _inbound) = ConnectionManager::new(transport.clone(), fast_policy());
    manager.connect(credentials()).await.expect("connect");
    let peer = peers.recv().await.expect("session");

    transport.script([Err(EngineError::Auth("revoked".into()))]);
    drop(peer);

    let mut state = manager.watch_state();
    state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .expect("disconnected");
    assert_eq!(transport.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn can_connect_again_after_connection_lost() {
    let (transport, mut peers) = FakeTransport::new();
    let policy = ReconnectPolicy {
        max_attempts: 1,
        ..fast_policy()
    };
    let (manager, _inbound) = ConnectionManager::new(transport.clone(), policy);
    manager.connect(credentials()).await.expect("connect");
    let peer = peers.recv().await.expect("session");
    transport.script([Err(EngineError::Network("refused".into()))]);
    drop(peer);

    let mut state = manager.watch_state();
    state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .expect("gave up");

    manager.connect(credentials()).await.expect("fresh connect");
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent() {
    let (transport, _peers) = FakeTransport::new();
    let (manager, _inbound) = ConnectionManager::new(transport, fast_policy());

    manager.disconnect().await;
    manager.connect(credentials()).await.expect("connect");
    manager.disconnect().await;
    manager.disconnect().await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(
        manager.send(join("1")).await.err(),
        Some(EngineError::NotConnected)
    );
}
