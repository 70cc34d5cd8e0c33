use std::sync::Arc;

use circle_shared::{
    domain::{Circle, CircleId},
    error::ApiError,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod fallback;
pub mod membership;
pub mod presence;
pub mod reconcile;
pub mod sync;
pub mod transport;
pub mod types;

pub use config::{load_settings, ClientSettings, ReconnectPolicy};
pub use connection::{
    ConnectionEvent, ConnectionHandle, ConnectionManager, DeliveryReceipt, SendTicket,
};
pub use directory::{CircleDirectory, HttpCircleDirectory, MissingCircleDirectory};
pub use error::{EngineError, JoinError};
pub use fallback::FallbackStore;
pub use membership::MembershipController;
pub use presence::PresenceTracker;
pub use sync::MessageSync;
pub use transport::{MissingTransport, Transport, TransportSession, WsTransport};
pub use types::{
    ConnectionState, Credentials, LocalId, MembershipHandle, MembershipMode, Message,
    MessageOrigin, PresenceSnapshot, TimelineSnapshot,
};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionState),
    /// Reconnection gave up after `attempts`; queued sends were failed.
    ConnectionLost {
        attempts: u32,
    },
    MembershipChanged(Option<MembershipHandle>),
    /// The server refused the join. `seed` is display-only content for the
    /// refused circle; membership did not change.
    JoinRejected {
        error: JoinError,
        seed: Vec<Message>,
    },
    SendFailed {
        local_id: LocalId,
        error: EngineError,
    },
    PresenceChanged(PresenceSnapshot),
    ServerError(ApiError),
}

/// One user's session against the circles backend: a single transport
/// connection, at most one active circle, one reconciled timeline.
pub struct CircleClient {
    credentials: Credentials,
    connection: Arc<ConnectionManager>,
    directory: Arc<dyn CircleDirectory>,
    sync: Arc<MessageSync>,
    membership: MembershipController,
    presence: Arc<Mutex<PresenceTracker>>,
    fallback: FallbackStore,
    events: broadcast::Sender<ClientEvent>,
    dispatcher: JoinHandle<()>,
}

impl CircleClient {
    pub fn new(settings: ClientSettings, credentials: Credentials) -> Result<Self, EngineError> {
        settings.validate()?;
        let transport = Arc::new(WsTransport::new(
            settings.server_url.clone(),
            settings.handshake_timeout(),
        ));
        let directory = Arc::new(
            HttpCircleDirectory::new(settings.server_url.clone())
                .with_token(credentials.token.clone()),
        );
        Ok(Self::new_with_dependencies(
            settings,
            credentials,
            transport,
            directory,
        ))
    }

    /// Wires the engine around caller-provided adapters. Must be called from
    /// within a tokio runtime.
    pub fn new_with_dependencies(
        settings: ClientSettings,
        credentials: Credentials,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn CircleDirectory>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (connection, inbound) = ConnectionManager::new(transport, settings.reconnect_policy());
        let sync = MessageSync::new(
            Arc::clone(&connection),
            events.clone(),
            credentials.clone(),
            settings.matching_window(),
            settings.send_timeout(),
            settings.anonymous_alias.clone(),
        );
        let presence = Arc::new(Mutex::new(PresenceTracker::new(
            credentials.user_id.clone(),
        )));
        let fallback = FallbackStore::new();
        let membership = MembershipController::new(
            Arc::clone(&directory),
            Arc::clone(&connection),
            Arc::clone(&sync),
            Arc::clone(&presence),
            fallback,
            events.clone(),
            credentials.user_id.clone(),
            settings.history_limit,
        );
        let dispatcher = tokio::spawn(dispatch(
            inbound,
            connection.subscribe_events(),
            Arc::clone(&sync),
            Arc::clone(&presence),
            events.clone(),
        ));

        Self {
            credentials,
            connection,
            directory,
            sync,
            membership,
            presence,
            fallback,
            events,
            dispatcher,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Connects, retrying network failures with the configured backoff.
    pub async fn connect(&self) -> Result<ConnectionHandle, EngineError> {
        self.connection.connect(self.credentials.clone()).await
    }

    /// Leaves the active circle and releases the transport. Idempotent.
    pub async fn disconnect(&self) {
        self.membership.leave().await;
        self.connection.disconnect().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Lists circles from the directory, degrading to the built-in catalogue
    /// when the directory is unreachable or empty.
    pub async fn list_circles(&self, interest: Option<&str>) -> Vec<Circle> {
        match self.directory.list_circles(interest).await {
            Ok(circles) if !circles.is_empty() => circles
                .into_iter()
                .filter(|circle| circle.matches_interest(interest))
                .collect(),
            Ok(_) => {
                debug!(?interest, "directory returned no circles, using fallback catalogue");
                self.fallback.seed_circles(interest)
            }
            Err(err) => {
                warn!(%err, ?interest, "circle listing failed, using fallback catalogue");
                self.fallback.seed_circles(interest)
            }
        }
    }

    pub async fn join(&self, circle_id: impl Into<CircleId>) -> Result<MembershipHandle, EngineError> {
        self.membership.join(circle_id.into()).await
    }

    pub async fn leave(&self) {
        self.membership.leave().await;
    }

    pub async fn active_membership(&self) -> Option<MembershipHandle> {
        self.membership.active().await
    }

    pub async fn send_message(&self, body: &str, is_anonymous: bool) -> Result<LocalId, EngineError> {
        self.sync.send_local(body, is_anonymous).await
    }

    pub async fn retry(&self, local_id: LocalId) -> Result<LocalId, EngineError> {
        self.sync.retry(local_id).await
    }

    /// Tells the other members of the active circle whether this user is
    /// typing. Not retried; a frame lost with the connection is simply gone.
    pub async fn set_typing(&self, is_typing: bool) -> Result<(), EngineError> {
        let circle_id = self
            .membership
            .active()
            .await
            .ok_or(EngineError::NotJoined)?
            .circle_id;
        let display_name = self.credentials.display_name.clone();
        let request = if is_typing {
            ClientRequest::TypingStart {
                circle_id,
                display_name,
            }
        } else {
            ClientRequest::TypingStop {
                circle_id,
                display_name,
            }
        };
        self.connection.send(request).await.map(|_| ())
    }

    pub fn timeline(&self) -> Arc<TimelineSnapshot> {
        self.sync.snapshot()
    }

    pub fn watch_timeline(&self) -> watch::Receiver<Arc<TimelineSnapshot>> {
        self.sync.subscribe()
    }

    pub async fn presence(&self) -> PresenceSnapshot {
        self.presence.lock().await.snapshot()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

impl Drop for CircleClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(
    mut inbound: mpsc::UnboundedReceiver<ServerEvent>,
    mut connection_events: broadcast::Receiver<ConnectionEvent>,
    sync: Arc<MessageSync>,
    presence: Arc<Mutex<PresenceTracker>>,
    events: broadcast::Sender<ClientEvent>,
) {
    loop {
        tokio::select! {
            event = inbound.recv() => match event {
                Some(event) => handle_server_event(event, &sync, &presence, &events).await,
                None => break,
            },
            event = connection_events.recv() => match event {
                Ok(ConnectionEvent::StateChanged(state)) => {
                    let snapshot = {
                        let mut presence = presence.lock().await;
                        presence.connection_changed(state);
                        presence.snapshot()
                    };
                    let _ = events.send(ClientEvent::ConnectionStateChanged(state));
                    let _ = events.send(ClientEvent::PresenceChanged(snapshot));
                }
                Ok(ConnectionEvent::ConnectionLost { attempts }) => {
                    let _ = events.send(ClientEvent::ConnectionLost { attempts });
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "connection events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("event dispatcher stopped");
}

async fn handle_server_event(
    event: ServerEvent,
    sync: &MessageSync,
    presence: &Mutex<PresenceTracker>,
    events: &broadcast::Sender<ClientEvent>,
) {
    let snapshot = match event {
        ServerEvent::Message(payload) => {
            sync.on_remote_message(&payload).await;
            return;
        }
        ServerEvent::MemberJoined { circle_id, user_id } => {
            let mut presence = presence.lock().await;
            presence.member_joined(&circle_id, &user_id);
            presence.snapshot()
        }
        ServerEvent::MemberLeft { circle_id, user_id } => {
            let mut presence = presence.lock().await;
            presence.member_left(&circle_id, &user_id);
            presence.snapshot()
        }
        ServerEvent::Presence {
            circle_id,
            online_count,
        } => {
            let mut presence = presence.lock().await;
            presence.server_count(&circle_id, online_count);
            presence.snapshot()
        }
        ServerEvent::UserTyping {
            circle_id,
            user_id,
            display_name,
        } => {
            let mut presence = presence.lock().await;
            if !presence.typing_started(&circle_id, &user_id, &display_name) {
                return;
            }
            presence.snapshot()
        }
        ServerEvent::UserTypingStop { circle_id, user_id } => {
            let mut presence = presence.lock().await;
            if !presence.typing_stopped(&circle_id, &user_id) {
                return;
            }
            presence.snapshot()
        }
        ServerEvent::Status { status, user_id } => {
            info!(%status, user_id = %user_id, "server status");
            return;
        }
        ServerEvent::Error(error) => {
            warn!(code = ?error.code, message = %error.message, "server reported an error");
            let _ = events.send(ClientEvent::ServerError(error));
            return;
        }
    };
    debug!(
        online = snapshot.online_count,
        typing = snapshot.typing.len(),
        "presence: updated"
    );
    let _ = events.send(ClientEvent::PresenceChanged(snapshot));
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
