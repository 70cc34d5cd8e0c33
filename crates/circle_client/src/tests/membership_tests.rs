use std::time::Duration;

use super::*;
use crate::{
    directory::MissingCircleDirectory,
    error::JoinError,
    test_support::{credentials, fast_policy, payload, FakeDirectory, FakePeer, FakeTransport},
    types::TimelineSnapshot,
};

struct Harness {
    controller: MembershipController,
    directory: Arc<FakeDirectory>,
    sync: Arc<MessageSync>,
    peer: FakePeer,
    events: broadcast::Receiver<ClientEvent>,
}

async fn harness_with(directory: Arc<dyn CircleDirectory>, fake: Arc<FakeDirectory>) -> Harness {
    let (transport, mut peers) = FakeTransport::new();
    let (connection, _inbound) = ConnectionManager::new(transport, fast_policy());
    connection.connect(credentials()).await.expect("connect");
    let peer = peers.recv().await.expect("session");
    let (events_tx, events) = broadcast::channel(64);
    let sync = MessageSync::new(
        Arc::clone(&connection),
        events_tx.clone(),
        credentials(),
        Duration::from_secs(10),
        Duration::from_secs(15),
        "Anonymous User",
    );
    let presence = Arc::new(Mutex::new(PresenceTracker::new(UserId::from("me"))));
    let controller = MembershipController::new(
        directory,
        connection,
        Arc::clone(&sync),
        presence,
        FallbackStore::new(),
        events_tx,
        UserId::from("me"),
        50,
    );
    Harness {
        controller,
        directory: fake,
        sync,
        peer,
        events,
    }
}

async fn harness() -> Harness {
    let directory = FakeDirectory::new();
    harness_with(directory.clone(), directory).await
}

fn timeline(h: &Harness) -> Arc<TimelineSnapshot> {
    h.sync.snapshot()
}

#[tokio::test]
async fn join_loads_backlog_and_subscribes() {
    let mut h = harness().await;
    h.directory.set_history(
        "circle-42",
        Ok(vec![
            payload("s1", "circle-42", "sarah", "morning"),
            payload("s2", "circle-42", "alex", "hey"),
        ]),
    );

    let handle = h
        .controller
        .join(CircleId::from("circle-42"))
        .await
        .expect("join");

    assert_eq!(handle.mode, MembershipMode::Live);
    assert_eq!(handle.online_count, 3);
    assert_eq!(
        h.peer.next_request().await,
        ClientRequest::JoinCircle {
            circle_id: CircleId::from("circle-42")
        }
    );
    let snapshot = timeline(&h);
    assert_eq!(snapshot.circle_id, Some(CircleId::from("circle-42")));
    assert_eq!(snapshot.len(), 2);
    assert!(!snapshot.is_seeded());
    assert_eq!(h.controller.active().await, Some(handle));
}

#[tokio::test]
async fn unreachable_backend_degrades_to_seeded_active_membership() {
    let fake = FakeDirectory::new();
    let mut h = harness_with(Arc::new(MissingCircleDirectory), fake).await;

    let handle = h
        .controller
        .join(CircleId::from("circle-42"))
        .await
        .expect("join still succeeds");

    assert_eq!(handle.mode, MembershipMode::Fallback);
    let expected = FallbackStore::new().get_seed_messages(&CircleId::from("circle-42"));
    let snapshot = timeline(&h);
    assert_eq!(snapshot.len(), expected.len());
    assert!(snapshot.is_seeded());
    let bodies: Vec<_> = snapshot.messages.iter().map(|m| m.body.as_str()).collect();
    let expected_bodies: Vec<_> = expected.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, expected_bodies);
    assert!(h.controller.active().await.is_some());
    assert!(matches!(
        h.events.recv().await,
        Ok(ClientEvent::MembershipChanged(Some(_)))
    ));
}

#[tokio::test]
async fn empty_history_is_seeded() {
    let h = harness().await;
    let handle = h
        .controller
        .join(CircleId::from("quiet"))
        .await
        .expect("join");

    assert_eq!(handle.mode, MembershipMode::Fallback);
    assert!(timeline(&h).is_seeded());
}

#[tokio::test]
async fn switching_circles_leaves_before_joining() {
    let mut h = harness().await;
    h.controller.join(CircleId::from("a")).await.expect("join a");
    h.peer.next_request().await;

    h.controller.join(CircleId::from("b")).await.expect("join b");

    assert_eq!(
        h.peer.next_request().await,
        ClientRequest::LeaveCircle {
            circle_id: CircleId::from("a")
        }
    );
    assert_eq!(
        h.peer.next_request().await,
        ClientRequest::JoinCircle {
            circle_id: CircleId::from("b")
        }
    );
    assert!(h.peer.requests.try_recv().is_err());
    assert_eq!(timeline(&h).circle_id, Some(CircleId::from("b")));
    assert_eq!(
        h.controller.active().await.map(|m| m.circle_id),
        Some(CircleId::from("b"))
    );
}

#[tokio::test]
async fn joining_the_active_circle_again_is_a_no_op() {
    let mut h = harness().await;
    let first = h.controller.join(CircleId::from("a")).await.expect("join");
    h.peer.next_request().await;

    let again = h.controller.join(CircleId::from("a")).await.expect("join");

    assert_eq!(first, again);
    assert_eq!(h.directory.joins().len(), 1);
    assert!(h.peer.requests.try_recv().is_err());
}

#[tokio::test]
async fn rejected_join_keeps_current_membership_and_offers_seed() {
    let mut h = harness().await;
    h.directory
        .set_history("a", Ok(vec![payload("s1", "a", "sarah", "still here")]));
    h.controller.join(CircleId::from("a")).await.expect("join a");
    h.peer.next_request().await;
    while h.events.try_recv().is_ok() {}
    let before = timeline(&h);

    h.directory.set_join(
        "full",
        Err(JoinError::CircleFull {
            circle_id: CircleId::from("full"),
        }
        .into()),
    );

    let err = h
        .controller
        .join(CircleId::from("full"))
        .await
        .err()
        .expect("rejected");

    assert!(matches!(err, EngineError::Join(JoinError::CircleFull { .. })));
    assert!(!err.is_retryable());
    assert_eq!(timeline(&h), before);
    assert_eq!(
        h.controller.active().await.map(|m| m.circle_id),
        Some(CircleId::from("a"))
    );
    assert!(h.peer.requests.try_recv().is_err());
    match h.events.recv().await.expect("event") {
        ClientEvent::JoinRejected { error, seed } => {
            assert_eq!(error.circle_id(), &CircleId::from("full"));
            assert!(!seed.is_empty());
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn auth_failure_on_join_changes_nothing() {
    let h = harness().await;
    h.directory
        .set_join("a", Err(EngineError::Auth("token expired".into())));

    let err = h.controller.join(CircleId::from("a")).await.err().expect("auth");

    assert!(err.is_auth());
    assert!(h.controller.active().await.is_none());
    assert!(timeline(&h).circle_id.is_none());
}

#[tokio::test]
async fn leave_is_idempotent() {
    let mut h = harness().await;
    h.controller.leave().await;
    assert!(h.peer.requests.try_recv().is_err());

    h.controller.join(CircleId::from("a")).await.expect("join");
    h.peer.next_request().await;
    h.controller.leave().await;
    h.controller.leave().await;

    assert_eq!(
        h.peer.next_request().await,
        ClientRequest::LeaveCircle {
            circle_id: CircleId::from("a")
        }
    );
    assert!(h.peer.requests.try_recv().is_err());
    assert!(h.controller.active().await.is_none());
    assert!(timeline(&h).is_empty());
    assert!(timeline(&h).circle_id.is_none());
}
