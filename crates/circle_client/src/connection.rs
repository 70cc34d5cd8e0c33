use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use circle_shared::{
    domain::UserId,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ReconnectPolicy,
    error::EngineError,
    transport::{Transport, TransportSession},
    types::{ConnectionState, Credentials},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// Reconnection gave up; queued operations were failed.
    ConnectionLost { attempts: u32 },
}

pub struct ConnectionHandle {
    user_id: UserId,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub async fn wait_for(&mut self, target: ConnectionState) -> Result<(), EngineError> {
        self.state
            .wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| EngineError::NotConnected)
    }
}

/// Identifies one queued send so it can be withdrawn before it reaches the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendTicket(u64);

/// Resolves once the request has been handed to a live session, or fails if
/// it was dropped (reconnection exhausted, explicit disconnect, cancelled).
pub struct DeliveryReceipt {
    ticket: SendTicket,
    rx: oneshot::Receiver<Result<(), EngineError>>,
}

impl DeliveryReceipt {
    pub fn ticket(&self) -> SendTicket {
        self.ticket
    }

    pub async fn delivered(self) -> Result<(), EngineError> {
        self.rx.await.unwrap_or(Err(EngineError::NotConnected))
    }
}

enum Command {
    Send {
        ticket: SendTicket,
        request: ClientRequest,
        ack: oneshot::Sender<Result<(), EngineError>>,
    },
    Cancel(SendTicket),
    Shutdown,
}

struct Pending {
    ticket: SendTicket,
    request: ClientRequest,
    ack: oneshot::Sender<Result<(), EngineError>>,
}

struct Control {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

struct Signals {
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Signals {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(?previous, ?next, "connection: state changed");
            let _ = self.events.send(ConnectionEvent::StateChanged(next));
        }
    }
}

/// Owns the single transport connection for a client session. All outbound
/// room traffic is serialized through one supervisor task.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    signals: Arc<Signals>,
    inbound_tx: mpsc::UnboundedSender<ServerEvent>,
    resume: Arc<Mutex<Option<ClientRequest>>>,
    control: Mutex<Option<Control>>,
    next_ticket: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            transport,
            policy,
            signals: Arc::new(Signals { state, events }),
            inbound_tx,
            resume: Arc::new(Mutex::new(None)),
            control: Mutex::new(None),
            next_ticket: AtomicU64::new(1),
        });
        (manager, inbound_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.signals.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.signals.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.signals.events.subscribe()
    }

    /// Opens the session, retrying network failures with the reconnect
    /// policy. Requests sent while this is in progress are queued and
    /// flushed in order once the session is up. Rejected credentials end the
    /// attempt immediately.
    pub async fn connect(&self, credentials: Credentials) -> Result<ConnectionHandle, EngineError> {
        let user_id = credentials.user_id.clone();
        let (commands, ready) = {
            let mut control = self.control.lock().await;
            if control.as_ref().is_some_and(|c| !c.task.is_finished()) {
                return Ok(self.handle(&user_id));
            }

            self.signals.set_state(ConnectionState::Connecting);
            let (commands, command_rx) = mpsc::unbounded_channel();
            let (ready_tx, ready) = oneshot::channel();
            let supervisor = Supervisor {
                transport: Arc::clone(&self.transport),
                policy: self.policy,
                credentials,
                signals: Arc::clone(&self.signals),
                inbound_tx: self.inbound_tx.clone(),
                resume: Arc::clone(&self.resume),
                queue: VecDeque::new(),
            };
            let task = tokio::spawn(supervisor.run(command_rx, ready_tx));
            *control = Some(Control {
                commands: commands.clone(),
                task,
            });
            (commands, ready)
        };

        let err = match ready.await {
            Ok(Ok(())) => return Ok(self.handle(&user_id)),
            Ok(Err(err)) => err,
            Err(_) => EngineError::NotConnected,
        };
        warn!(user_id = %user_id, %err, "connection: connect failed");
        let mut control = self.control.lock().await;
        if control
            .as_ref()
            .is_some_and(|c| c.commands.same_channel(&commands))
        {
            if let Some(finished) = control.take() {
                let _ = finished.task.await;
            }
        }
        Err(err)
    }

    /// Releases the transport. Safe to call repeatedly or before `connect`.
    pub async fn disconnect(&self) {
        let control = self.control.lock().await.take();
        if let Some(control) = control {
            let _ = control.commands.send(Command::Shutdown);
            let _ = control.task.await;
            info!("connection: disconnected");
        }
        self.signals.set_state(ConnectionState::Disconnected);
    }

    /// Queues `request` for delivery. While connecting or reconnecting it
    /// waits in order behind earlier requests; it never reaches the wire twice.
    pub async fn send(&self, request: ClientRequest) -> Result<DeliveryReceipt, EngineError> {
        let control = self.control.lock().await;
        let control = control.as_ref().ok_or(EngineError::NotConnected)?;
        let ticket = SendTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let (ack, rx) = oneshot::channel();
        control
            .commands
            .send(Command::Send {
                ticket,
                request,
                ack,
            })
            .map_err(|_| EngineError::NotConnected)?;
        Ok(DeliveryReceipt { ticket, rx })
    }

    /// Withdraws a queued request. Requests already handed to a session are
    /// unaffected. Commands are processed in order, so a cancel issued before
    /// a later `send` always takes effect first.
    pub async fn cancel(&self, ticket: SendTicket) {
        let control = self.control.lock().await;
        if let Some(control) = control.as_ref() {
            let _ = control.commands.send(Command::Cancel(ticket));
        }
    }

    /// Request replayed at the start of every new session (the active
    /// `join_circle`), ahead of anything queued.
    pub async fn set_resume(&self, request: Option<ClientRequest>) {
        *self.resume.lock().await = request;
    }

    fn handle(&self, user_id: &UserId) -> ConnectionHandle {
        ConnectionHandle {
            user_id: user_id.clone(),
            state: self.signals.state.subscribe(),
        }
    }
}

enum Attempt {
    Ready(TransportSession),
    Failed(EngineError),
    Shutdown,
}

struct Supervisor {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    credentials: Credentials,
    signals: Arc<Signals>,
    inbound_tx: mpsc::UnboundedSender<ServerEvent>,
    resume: Arc<Mutex<Option<ClientRequest>>>,
    queue: VecDeque<Pending>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        ready: oneshot::Sender<Result<(), EngineError>>,
    ) {
        let mut session = match self.establish(&mut commands, true).await {
            Ok(session) => {
                let _ = ready.send(Ok(()));
                session
            }
            Err(err) => {
                let _ = ready.send(Err(err));
                return;
            }
        };

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send { ticket, request, ack }) => {
                        if let Err(failed) = session.outbound.send(request).await {
                            self.queue.push_back(Pending { ticket, request: failed.0, ack });
                            match self.reconnect(&mut commands).await {
                                Some(next) => session = next,
                                None => return,
                            }
                        } else {
                            let _ = ack.send(Ok(()));
                        }
                    }
                    Some(Command::Cancel(ticket)) => self.cancel(ticket),
                    Some(Command::Shutdown) | None => {
                        self.shutdown();
                        return;
                    }
                },
                event = session.inbound.recv() => match event {
                    Some(event) => {
                        let _ = self.inbound_tx.send(event);
                    }
                    None => match self.reconnect(&mut commands).await {
                        Some(next) => session = next,
                        None => return,
                    },
                },
            }
        }
    }

    async fn reconnect(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Option<TransportSession> {
        warn!(
            user_id = %self.credentials.user_id,
            queued = self.queue.len(),
            "connection: transport lost, reconnecting"
        );
        self.establish(commands, false).await.ok()
    }

    /// Opens a session, retrying network failures with backoff. The first
    /// attempt of an initial connect is made without delay. On failure the
    /// queue has already been drained and the state is `Disconnected`.
    async fn establish(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        initial: bool,
    ) -> Result<TransportSession, EngineError> {
        let waiting = if initial {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        };
        self.signals.set_state(waiting);

        let mut last_error = EngineError::NotConnected;
        if initial {
            match self.attempt(commands, waiting).await {
                Attempt::Ready(session) => {
                    info!(user_id = %self.credentials.user_id, "connection: established");
                    return Ok(session);
                }
                Attempt::Shutdown => {
                    self.shutdown();
                    return Err(EngineError::NotConnected);
                }
                Attempt::Failed(EngineError::Auth(reason)) => {
                    error!(%reason, "connection: credentials rejected");
                    self.shutdown();
                    return Err(EngineError::Auth(reason));
                }
                Attempt::Failed(err) => {
                    warn!(%err, "connection: first connect attempt failed, retrying");
                    last_error = err;
                }
            }
        }

        let mut attempts = 0;
        while attempts < self.policy.max_attempts {
            attempts += 1;
            let delay = self.policy.delay_for(attempts);
            if !self.wait_queueing(commands, delay).await {
                self.shutdown();
                return Err(EngineError::NotConnected);
            }

            match self.attempt(commands, waiting).await {
                Attempt::Ready(session) => {
                    info!(attempts, "connection: established after retry");
                    return Ok(session);
                }
                Attempt::Shutdown => {
                    self.shutdown();
                    return Err(EngineError::NotConnected);
                }
                Attempt::Failed(EngineError::Auth(reason)) => {
                    error!(%reason, "connection: credentials rejected during reconnect");
                    last_error = EngineError::Auth(reason);
                    break;
                }
                Attempt::Failed(err) => {
                    warn!(attempts, ?delay, %err, "connection: connect attempt failed");
                    last_error = err;
                }
            }
        }

        self.give_up(attempts);
        Err(last_error)
    }

    /// One open. A fresh session first picks up commands that arrived while
    /// the open was in flight, then replays the resume request and flushes
    /// the queue.
    async fn attempt(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        waiting: ConnectionState,
    ) -> Attempt {
        let session = match self.transport.open(&self.credentials).await {
            Ok(session) => session,
            Err(err) => return Attempt::Failed(err),
        };
        if !self.drain_commands(commands) {
            return Attempt::Shutdown;
        }
        self.signals.set_state(ConnectionState::Connected);
        if self.replay_resume(&session).await && self.flush(&session).await {
            return Attempt::Ready(session);
        }
        self.signals.set_state(waiting);
        Attempt::Failed(EngineError::Network(
            "session closed while flushing".to_string(),
        ))
    }

    /// Sleeps for `delay` while queueing any sends that arrive. Returns false
    /// if a shutdown was requested.
    async fn wait_queueing(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        delay: Duration,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.queue_command(command) {
                            return false;
                        }
                    }
                    None => return false,
                },
            }
        }
    }

    /// Moves every already-received command into the queue without waiting.
    fn drain_commands(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
        loop {
            match commands.try_recv() {
                Ok(command) => {
                    if !self.queue_command(command) {
                        return false;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn queue_command(&mut self, command: Command) -> bool {
        match command {
            Command::Send {
                ticket,
                request,
                ack,
            } => {
                debug!(event = request.event_name(), "connection: queued until connected");
                self.queue.push_back(Pending {
                    ticket,
                    request,
                    ack,
                });
                true
            }
            Command::Cancel(ticket) => {
                self.cancel(ticket);
                true
            }
            Command::Shutdown => false,
        }
    }

    fn cancel(&mut self, ticket: SendTicket) {
        if let Some(index) = self.queue.iter().position(|p| p.ticket == ticket) {
            if let Some(pending) = self.queue.remove(index) {
                debug!(event = pending.request.event_name(), "connection: queued request withdrawn");
            }
        }
    }

    async fn replay_resume(&self, session: &TransportSession) -> bool {
        let resume = self.resume.lock().await.clone();
        match resume {
            Some(request) => session.outbound.send(request).await.is_ok(),
            None => true,
        }
    }

    async fn flush(&mut self, session: &TransportSession) -> bool {
        while let Some(Pending {
            ticket,
            request,
            ack,
        }) = self.queue.pop_front()
        {
            match session.outbound.send(request).await {
                Ok(()) => {
                    let _ = ack.send(Ok(()));
                }
                Err(failed) => {
                    self.queue.push_front(Pending {
                        ticket,
                        request: failed.0,
                        ack,
                    });
                    return false;
                }
            }
        }
        true
    }

    fn give_up(&mut self, attempts: u32) {
        error!(
            attempts,
            dropped = self.queue.len(),
            "connection: connect attempts exhausted"
        );
        for pending in self.queue.drain(..) {
            let _ = pending.ack.send(Err(EngineError::ConnectionLost { attempts }));
        }
        self.signals.set_state(ConnectionState::Disconnected);
        let _ = self
            .signals
            .events
            .send(ConnectionEvent::ConnectionLost { attempts });
    }

    fn shutdown(&mut self) {
        for pending in self.queue.drain(..) {
            let _ = pending.ack.send(Err(EngineError::NotConnected));
        }
        self.signals.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
