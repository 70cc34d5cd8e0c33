//! In-process fakes for the transport and directory seams.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use circle_shared::{
    domain::{Circle, CircleId, ServerMessageId, UserId},
    protocol::{ClientRequest, JoinCircleResponse, MessagePayload, ServerEvent},
};
use tokio::sync::mpsc;

use crate::{
    config::ReconnectPolicy,
    directory::CircleDirectory,
    error::EngineError,
    transport::{Transport, TransportSession},
    types::Credentials,
};

/// Server side of one fake session.
pub struct FakePeer {
    pub requests: mpsc::Receiver<ClientRequest>,
    pub events: mpsc::Sender<ServerEvent>,
}

impl FakePeer {
    pub async fn next_request(&mut self) -> ClientRequest {
        tokio::time::timeout(Duration::from_secs(60), self.requests.recv())
            .await
            .expect("request within timeout")
            .expect("session open")
    }

    pub async fn push(&self, event: ServerEvent) {
        self.events.send(event).await.expect("client listening");
    }
}

pub struct FakeTransport {
    outcomes: Mutex<VecDeque<Result<(), EngineError>>>,
    opens: AtomicU32,
    open_delay: Mutex<Duration>,
    peers: mpsc::UnboundedSender<FakePeer>,
}

impl FakeTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakePeer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            outcomes: Mutex::new(VecDeque::new()),
            opens: AtomicU32::new(0),
            open_delay: Mutex::new(Duration::ZERO),
            peers,
        });
        (transport, peer_rx)
    }

    /// Outcomes for the next `open` calls; once exhausted every open succeeds.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Result<(), EngineError>>) {
        self.outcomes.lock().unwrap().extend(outcomes);
    }

    /// Makes every later `open` take `delay` before resolving.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = delay;
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, _credentials: &Credentials) -> Result<TransportSession, EngineError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let outcome = self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()));
        outcome?;
        let (session, requests, events) = TransportSession::channel_pair();
        let _ = self.peers.send(FakePeer { requests, events });
        Ok(session)
    }
}

pub struct FakeDirectory {
    pub circles: Mutex<Result<Vec<Circle>, EngineError>>,
    pub join_outcomes: Mutex<HashMap<CircleId, Result<JoinCircleResponse, EngineError>>>,
    pub histories: Mutex<HashMap<CircleId, Result<Vec<MessagePayload>, EngineError>>>,
    pub joins: Mutex<Vec<CircleId>>,
}

impl FakeDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            circles: Mutex::new(Ok(Vec::new())),
            join_outcomes: Mutex::new(HashMap::new()),
            histories: Mutex::new(HashMap::new()),
            joins: Mutex::new(Vec::new()),
        })
    }

    pub fn set_join(&self, circle_id: &str, outcome: Result<JoinCircleResponse, EngineError>) {
        self.join_outcomes
            .lock()
            .unwrap()
            .insert(CircleId::from(circle_id), outcome);
    }

    pub fn set_history(&self, circle_id: &str, outcome: Result<Vec<MessagePayload>, EngineError>) {
        self.histories
            .lock()
            .unwrap()
            .insert(CircleId::from(circle_id), outcome);
    }

    pub fn joins(&self) -> Vec<CircleId> {
        self.joins.lock().unwrap().clone()
    }
}

#[async_trait]
impl CircleDirectory for FakeDirectory {
    async fn list_circles(&self, _interest: Option<&str>) -> Result<Vec<Circle>, EngineError> {
        self.circles.lock().unwrap().clone()
    }

    async fn join_circle(
        &self,
        circle_id: &CircleId,
        _user_id: &UserId,
    ) -> Result<JoinCircleResponse, EngineError> {
        self.joins.lock().unwrap().push(circle_id.clone());
        self.join_outcomes
            .lock()
            .unwrap()
            .get(circle_id)
            .cloned()
            .unwrap_or_else(|| {
                Ok(JoinCircleResponse {
                    success: true,
                    online_count: Some(3),
                    ..JoinCircleResponse::default()
                })
            })
    }

    async fn fetch_history(
        &self,
        circle_id: &CircleId,
        _limit: u32,
    ) -> Result<Vec<MessagePayload>, EngineError> {
        self.histories
            .lock()
            .unwrap()
            .get(circle_id)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

pub fn credentials() -> Credentials {
    Credentials::new("me", "Me", "token")
}

pub fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        base: Duration::from_secs(1),
        cap: Duration::from_secs(30),
        max_attempts: 5,
    }
}

pub fn anchor() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).expect("valid timestamp")
}

pub fn payload(server_id: &str, circle_id: &str, author: &str, body: &str) -> MessagePayload {
    let sent_at = anchor();
    MessagePayload {
        server_id: ServerMessageId::from(server_id),
        circle_id: CircleId::from(circle_id),
        author_id: UserId::from(author),
        display_name: author.to_string(),
        body: body.to_string(),
        sent_at,
        server_timestamp: sent_at + TimeDelta::milliseconds(400),
        is_anonymous: false,
    }
}

/// Echo of a `send_message` frame as the server would broadcast it.
pub fn echo_of(request: &ClientRequest, server_id: &str) -> ServerEvent {
    match request {
        ClientRequest::SendMessage {
            circle_id,
            author_id,
            display_name,
            body,
            sent_at,
            is_anonymous,
        } => ServerEvent::Message(MessagePayload {
            server_id: ServerMessageId::from(server_id),
            circle_id: circle_id.clone(),
            author_id: author_id.clone(),
            display_name: display_name.clone(),
            body: body.clone(),
            sent_at: *sent_at,
            server_timestamp: Utc::now(),
            is_anonymous: *is_anonymous,
        }),
        other => panic!("not a send_message frame: {other:?}"),
    }
}
