use std::sync::Arc;

use circle_shared::{
    domain::{CircleId, UserId},
    protocol::ClientRequest,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    connection::ConnectionManager,
    directory::CircleDirectory,
    error::EngineError,
    fallback::FallbackStore,
    presence::PresenceTracker,
    sync::MessageSync,
    types::{ConnectionState, MembershipHandle, MembershipMode},
    ClientEvent,
};

/// Tracks the single active circle. Joins and leaves are serialized by the
/// `active` lock, so a switch from A to B always leaves A before B is entered.
pub struct MembershipController {
    directory: Arc<dyn CircleDirectory>,
    connection: Arc<ConnectionManager>,
    sync: Arc<MessageSync>,
    presence: Arc<Mutex<PresenceTracker>>,
    fallback: FallbackStore,
    events: broadcast::Sender<ClientEvent>,
    user_id: UserId,
    history_limit: u32,
    active: Mutex<Option<MembershipHandle>>,
}

impl MembershipController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<dyn CircleDirectory>,
        connection: Arc<ConnectionManager>,
        sync: Arc<MessageSync>,
        presence: Arc<Mutex<PresenceTracker>>,
        fallback: FallbackStore,
        events: broadcast::Sender<ClientEvent>,
        user_id: UserId,
        history_limit: u32,
    ) -> Self {
        Self {
            directory,
            connection,
            sync,
            presence,
            fallback,
            events,
            user_id,
            history_limit,
            active: Mutex::new(None),
        }
    }

    pub async fn active(&self) -> Option<MembershipHandle> {
        self.active.lock().await.clone()
    }

    pub async fn join(&self, circle_id: CircleId) -> Result<MembershipHandle, EngineError> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref().filter(|h| h.circle_id == circle_id) {
            debug!(circle_id = %circle_id, "membership: already active");
            return Ok(current.clone());
        }

        info!(circle_id = %circle_id, "membership: joining");
        let baseline = match self.directory.join_circle(&circle_id, &self.user_id).await {
            Ok(response) => Some(
                response
                    .online_count
                    .or(response.circle.map(|circle| circle.online_count)),
            ),
            Err(EngineError::Join(err)) => {
                warn!(circle_id = %circle_id, %err, "membership: join rejected");
                let seed = self.fallback.get_seed_messages(&circle_id);
                let _ = self.events.send(ClientEvent::JoinRejected {
                    error: err.clone(),
                    seed,
                });
                return Err(err.into());
            }
            Err(err @ EngineError::Auth(_)) => return Err(err),
            Err(err) => {
                warn!(circle_id = %circle_id, %err, "membership: directory unreachable, using fallback");
                None
            }
        };

        if let Some(previous) = active.take() {
            self.release(&previous).await;
        }

        let epoch = self.sync.enter_circle(circle_id.clone()).await;
        {
            let mut presence = self.presence.lock().await;
            let connected = self.connection.state() == ConnectionState::Connected;
            presence.enter(circle_id.clone(), baseline.flatten(), connected);
        }

        let join_frame = ClientRequest::JoinCircle {
            circle_id: circle_id.clone(),
        };
        self.connection.set_resume(Some(join_frame.clone())).await;
        if let Err(err) = self.connection.send(join_frame).await {
            debug!(circle_id = %circle_id, %err, "membership: join frame deferred until connected");
        }

        let history = match baseline {
            Some(_) => self
                .directory
                .fetch_history(&circle_id, self.history_limit)
                .await
                .map_err(|err| {
                    warn!(circle_id = %circle_id, %err, "membership: history fetch failed");
                })
                .ok(),
            None => None,
        };
        let mode = match history {
            Some(backlog) if !backlog.is_empty() => {
                let applied = self.sync.load_backlog(epoch, &backlog).await;
                debug!(circle_id = %circle_id, applied, "membership: backlog loaded");
                MembershipMode::Live
            }
            _ => {
                let seed = self.fallback.get_seed_messages(&circle_id);
                self.sync.load_seed(epoch, seed).await;
                MembershipMode::Fallback
            }
        };

        let online_count = self.presence.lock().await.online_count();

        let handle = MembershipHandle {
            circle_id,
            epoch,
            mode,
            online_count,
        };
        info!(circle_id = %handle.circle_id, ?mode, online_count, "membership: active");
        *active = Some(handle.clone());
        let _ = self
            .events
            .send(ClientEvent::MembershipChanged(Some(handle.clone())));
        Ok(handle)
    }

    /// Leaves the active circle, if any. Safe to call when not joined.
    pub async fn leave(&self) {
        let mut active = self.active.lock().await;
        let Some(previous) = active.take() else {
            return;
        };
        self.release(&previous).await;
        let _ = self.events.send(ClientEvent::MembershipChanged(None));
    }

    async fn release(&self, previous: &MembershipHandle) {
        info!(circle_id = %previous.circle_id, "membership: leaving");
        self.connection.set_resume(None).await;
        let leave_frame = ClientRequest::LeaveCircle {
            circle_id: previous.circle_id.clone(),
        };
        if let Err(err) = self.connection.send(leave_frame).await {
            debug!(circle_id = %previous.circle_id, %err, "membership: leave not dispatched");
        }
        self.sync.leave().await;
        self.presence.lock().await.exit();
    }
}

#[cfg(test)]
#[path = "tests/membership_tests.rs"]
mod tests;
