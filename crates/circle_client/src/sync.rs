//! Async shell around [`ReconciliationEngine`]: owns the timeline, dispatches
//! local sends through the connection, runs per-send failure timers and
//! publishes immutable snapshots for readers.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use circle_shared::{
    domain::CircleId,
    protocol::{ClientRequest, MessagePayload},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectionManager, DeliveryReceipt, SendTicket},
    error::EngineError,
    reconcile::{LocalDraft, Reconciled, ReconciliationEngine},
    types::{Credentials, LocalId, Message, MessageOrigin, TimelineSnapshot},
    ClientEvent,
};

struct SyncState {
    engine: ReconciliationEngine,
    timers: HashMap<LocalId, JoinHandle<()>>,
    tickets: HashMap<LocalId, SendTicket>,
}

impl SyncState {
    fn cancel_timers(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        self.tickets.clear();
    }
}

pub struct MessageSync {
    state: Mutex<SyncState>,
    send_order: Mutex<()>,
    timeline: watch::Sender<Arc<TimelineSnapshot>>,
    connection: Arc<ConnectionManager>,
    events: broadcast::Sender<ClientEvent>,
    identity: Credentials,
    send_timeout: Duration,
    anonymous_alias: String,
}

impl MessageSync {
    pub fn new(
        connection: Arc<ConnectionManager>,
        events: broadcast::Sender<ClientEvent>,
        identity: Credentials,
        matching_window: Duration,
        send_timeout: Duration,
        anonymous_alias: impl Into<String>,
    ) -> Arc<Self> {
        let engine = ReconciliationEngine::new(matching_window);
        let (timeline, _) = watch::channel(Arc::new(engine.snapshot()));
        Arc::new(Self {
            state: Mutex::new(SyncState {
                engine,
                timers: HashMap::new(),
                tickets: HashMap::new(),
            }),
            send_order: Mutex::new(()),
            timeline,
            connection,
            events,
            identity,
            send_timeout,
            anonymous_alias: anonymous_alias.into(),
        })
    }

    pub fn snapshot(&self) -> Arc<TimelineSnapshot> {
        self.timeline.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TimelineSnapshot>> {
        self.timeline.subscribe()
    }

    /// Appends an optimistic `LocalPending` entry and dispatches it. Dispatch
    /// problems never fail the call; they turn the entry into `SendFailed`.
    pub async fn send_local(
        self: &Arc<Self>,
        body: &str,
        is_anonymous: bool,
    ) -> Result<LocalId, EngineError> {
        let _order = self.send_order.lock().await;
        let display_name = if is_anonymous {
            self.anonymous_alias.clone()
        } else {
            self.identity.display_name.clone()
        };

        let (local_id, epoch, request) = {
            let mut state = self.state.lock().await;
            let local_id = state.engine.record_local(
                LocalDraft {
                    author_id: self.identity.user_id.clone(),
                    display_name,
                    body: body.to_string(),
                    is_anonymous,
                },
                Utc::now(),
            )?;
            let request = state
                .engine
                .get(local_id)
                .map(send_request)
                .ok_or(EngineError::UnknownMessage(local_id))?;
            self.publish(&state.engine);
            (local_id, state.engine.epoch(), request)
        };
        debug!(%local_id, epoch, "sync: local message recorded");

        match self.connection.send(request).await {
            Ok(receipt) => {
                let ticket = receipt.ticket();
                let timer = self.spawn_send_timer(epoch, local_id, receipt);
                let mut state = self.state.lock().await;
                let still_pending = state.engine.epoch() == epoch
                    && state
                        .engine
                        .get(local_id)
                        .is_some_and(|m| m.origin == MessageOrigin::LocalPending);
                if still_pending {
                    state.timers.insert(local_id, timer);
                    state.tickets.insert(local_id, ticket);
                } else {
                    timer.abort();
                    drop(state);
                    self.connection.cancel(ticket).await;
                }
            }
            Err(err) => self.fail_send(epoch, local_id, err).await,
        }
        Ok(local_id)
    }

    /// Re-sends a failed entry under a new local id; the failed entry is
    /// removed and its original frame, if still queued, is withdrawn first.
    pub async fn retry(self: &Arc<Self>, local_id: LocalId) -> Result<LocalId, EngineError> {
        let (failed, ticket) = {
            let mut state = self.state.lock().await;
            let failed = state
                .engine
                .take_failed(local_id)
                .ok_or(EngineError::UnknownMessage(local_id))?;
            self.publish(&state.engine);
            (failed, state.tickets.remove(&local_id))
        };
        if let Some(ticket) = ticket {
            self.connection.cancel(ticket).await;
        }
        info!(%local_id, "sync: retrying failed message");
        self.send_local(&failed.body, failed.is_anonymous).await
    }

    pub async fn on_remote_message(&self, payload: &MessagePayload) -> Reconciled {
        let mut state = self.state.lock().await;
        let outcome = state.engine.apply_remote(payload, Utc::now());
        match outcome {
            Reconciled::Promoted {
                local_id,
                ambiguous,
            } => {
                if let Some(timer) = state.timers.remove(&local_id) {
                    timer.abort();
                }
                state.tickets.remove(&local_id);
                if ambiguous {
                    warn!(
                        %local_id,
                        server_id = %payload.server_id,
                        "sync: reconciliation conflict, earliest pending send consumed"
                    );
                }
                debug!(%local_id, server_id = %payload.server_id, "sync: local message confirmed");
                self.publish(&state.engine);
            }
            Reconciled::Appended { local_id } => {
                debug!(%local_id, server_id = %payload.server_id, "sync: remote message appended");
                self.publish(&state.engine);
            }
            Reconciled::Duplicate => {
                debug!(server_id = %payload.server_id, "sync: duplicate delivery ignored");
            }
            Reconciled::Ignored => {
                debug!(
                    circle_id = %payload.circle_id,
                    server_id = %payload.server_id,
                    "sync: message for inactive circle ignored"
                );
            }
        }
        outcome
    }

    /// Starts a fresh timeline for `circle_id`. In-flight sends from the
    /// previous circle can no longer be confirmed or failed.
    pub async fn enter_circle(&self, circle_id: CircleId) -> u64 {
        let mut state = self.state.lock().await;
        state.cancel_timers();
        let epoch = state.engine.reset(Some(circle_id.clone()));
        debug!(circle_id = %circle_id, epoch, "sync: timeline reset");
        self.publish(&state.engine);
        epoch
    }

    pub async fn leave(&self) {
        let mut state = self.state.lock().await;
        state.cancel_timers();
        state.engine.reset(None);
        self.publish(&state.engine);
    }

    pub async fn load_backlog(&self, epoch: u64, payloads: &[MessagePayload]) -> usize {
        let mut state = self.state.lock().await;
        if state.engine.epoch() != epoch {
            return 0;
        }
        let applied = state.engine.apply_backlog(payloads, Utc::now());
        self.publish(&state.engine);
        applied
    }

    pub async fn load_seed(&self, epoch: u64, seed: Vec<Message>) -> bool {
        let mut state = self.state.lock().await;
        if state.engine.epoch() != epoch {
            return false;
        }
        let seeded = state.engine.seed(seed);
        if seeded {
            self.publish(&state.engine);
        } else {
            debug!("sync: seed skipped, timeline already has server data");
        }
        seeded
    }

    fn spawn_send_timer(
        self: &Arc<Self>,
        epoch: u64,
        local_id: LocalId,
        receipt: DeliveryReceipt,
    ) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        let timeout = self.send_timeout;
        tokio::spawn(async move {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            let error = tokio::select! {
                delivered = receipt.delivered() => match delivered {
                    Ok(()) => {
                        (&mut deadline).await;
                        EngineError::SendTimeout { local_id, timeout }
                    }
                    Err(err) => err,
                },
                _ = &mut deadline => EngineError::SendTimeout { local_id, timeout },
            };
            sync.fail_send(epoch, local_id, error).await;
        })
    }

    /// Marks the entry failed. A frame still waiting in the reconnect queue
    /// is withdrawn so a later retry cannot put two copies on the wire.
    async fn fail_send(&self, epoch: u64, local_id: LocalId, error: EngineError) {
        let ticket = {
            let mut state = self.state.lock().await;
            state.timers.remove(&local_id);
            let ticket = state.tickets.get(&local_id).copied();
            if state.engine.epoch() != epoch || !state.engine.mark_send_failed(local_id) {
                return;
            }
            warn!(%local_id, %error, "sync: message send failed");
            self.publish(&state.engine);
            ticket
        };
        if let Some(ticket) = ticket {
            self.connection.cancel(ticket).await;
        }
        let _ = self.events.send(ClientEvent::SendFailed { local_id, error });
    }

    fn publish(&self, engine: &ReconciliationEngine) {
        self.timeline.send_replace(Arc::new(engine.snapshot()));
    }
}

fn send_request(message: &Message) -> ClientRequest {
    ClientRequest::SendMessage {
        circle_id: message.circle_id.clone(),
        author_id: message.author_id.clone(),
        display_name: message.display_name.clone(),
        body: message.body.clone(),
        sent_at: message.sent_at,
        is_anonymous: message.is_anonymous,
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
