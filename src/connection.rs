//! Connection manager: one logical realtime connection per session.
//!
//! DESIGN
//! ======
//! `ConnectionManager` is a cheap `Clone` handle over shared state. A single
//! driver task owns the transport; callers never touch it:
//! - `send` stamps the envelope and appends it to the outbound queue. While
//!   connected the driver is nudged and drains the queue immediately, so
//!   queued and live sends share one FIFO.
//! - `on` registers a typed handler; the driver decodes each text frame and
//!   dispatches it.
//! - Phase changes are published on a `watch` channel, the only way
//!   connection-lifecycle errors reach callers.
//!
//! LIFECYCLE
//! =========
//! ```text
//! Idle ──connect()──▶ Connecting ──open──▶ Connected
//!                        │                    │ close / error / liveness
//!                        ▼ attempt failed     ▼
//!                     Disconnected ◀──────────┘
//!                        │ backoff elapsed (auto-reconnect, budget left)
//!                        └──▶ Connecting
//! Disconnected ──budget spent──▶ Failed      (terminal until connect())
//! any ──disconnect()──▶ Disconnected         (auto-reconnect off)
//! ```
//!
//! Each failed attempt counts against `max_reconnect_attempts`; the counter
//! resets on open and on explicit `connect()`. Dropping an established
//! session schedules the first reconnect at the base delay without counting
//! as a failure.
//!
//! Every driver owns a generation number. `disconnect()` retires the current
//! generation, so a driver that is still unwinding can never overwrite state
//! that belongs to its successor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use envelopes::{Envelope, Event, EventKind, decode_envelope, encode_envelope};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::config::{ConnectionConfig, OverflowPolicy};
use crate::dispatch::{Dispatcher, Inbound, Subscription};
use crate::lock;
use crate::transport::{Connector, Incoming, Transport, TransportError, WebSocketConnector};

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }
}

/// Why the last connection ended. Clean and dirty closes reconnect alike;
/// the distinction is kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The server sent a close frame.
    ServerClosed { code: Option<u16>, reason: String },
    /// Connect or I/O failure.
    TransportError { message: String },
    /// The stream ended without a close frame.
    StreamEnded,
    /// No inbound traffic within the configured liveness timeout.
    LivenessTimeout,
    /// `disconnect()` was called.
    LocalRequest,
}

impl DisconnectReason {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::ServerClosed { .. } | Self::LocalRequest)
    }
}

/// Snapshot published on every phase change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub phase: Phase,
    pub reconnect_attempts: u32,
    pub last_disconnect: Option<DisconnectReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("connection attempt failed: {0}")]
    Transport(TransportError),
    #[error("connect cancelled by disconnect")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue full ({capacity} envelopes)")]
    QueueFull { capacity: usize },
}

// =============================================================================
// SHARED
// =============================================================================

enum Command {
    /// New envelopes are queued.
    Flush,
    /// Skip the remaining backoff delay.
    ConnectNow,
    Shutdown,
}

struct DriverHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

type Waiter = oneshot::Sender<Result<(), ConnectError>>;

struct Inner {
    phase: Phase,
    reconnect_attempts: u32,
    last_disconnect: Option<DisconnectReason>,
    auto_reconnect: bool,
    queue: VecDeque<Envelope>,
    driver: Option<DriverHandle>,
    generation: u64,
    waiters: Vec<Waiter>,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.driver.as_ref().is_some_and(|driver| driver.generation == generation)
    }

    fn snapshot(&self) -> ConnectionState {
        ConnectionState {
            phase: self.phase,
            reconnect_attempts: self.reconnect_attempts,
            last_disconnect: self.last_disconnect.clone(),
        }
    }
}

struct Shared {
    config: ConnectionConfig,
    backoff: Backoff,
    session_id: String,
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn publish(&self, inner: &Inner) {
        self.state_tx.send_replace(inner.snapshot());
    }

    /// Transition to `Connected` if `generation` is still current.
    fn mark_connected(&self, generation: u64) -> bool {
        let waiters = {
            let mut inner = lock(&self.inner);
            if !inner.is_current(generation) {
                return false;
            }
            inner.phase = Phase::Connected;
            inner.reconnect_attempts = 0;
            self.publish(&inner);
            std::mem::take(&mut inner.waiters)
        };
        resolve(waiters, &Ok(()));
        true
    }

    fn fail_waiters(&self, generation: u64, error: &TransportError) {
        let waiters = {
            let mut inner = lock(&self.inner);
            if !inner.is_current(generation) {
                return;
            }
            std::mem::take(&mut inner.waiters)
        };
        resolve(waiters, &Err(ConnectError::Transport(error.clone())));
    }

    /// Record the end of a connection and decide what happens next.
    /// Returns the backoff delay when another attempt is scheduled.
    fn after_close(&self, generation: u64, reason: DisconnectReason, attempt_failed: bool) -> Option<Duration> {
        let mut inner = lock(&self.inner);
        if !inner.is_current(generation) {
            return None;
        }
        if attempt_failed {
            inner.reconnect_attempts = inner.reconnect_attempts.saturating_add(1);
        }
        inner.last_disconnect = Some(reason);

        if !inner.auto_reconnect {
            inner.phase = Phase::Disconnected;
            inner.driver = None;
            self.publish(&inner);
            info!(session_id = %self.session_id, "realtime: disconnected, auto-reconnect off");
            return None;
        }
        if inner.reconnect_attempts >= self.config.max_reconnect_attempts {
            inner.phase = Phase::Failed;
            inner.driver = None;
            self.publish(&inner);
            warn!(
                session_id = %self.session_id,
                attempts = inner.reconnect_attempts,
                "realtime: reconnect attempts exhausted"
            );
            return None;
        }

        inner.phase = Phase::Disconnected;
        self.publish(&inner);
        let delay = self.backoff.delay(inner.reconnect_attempts.saturating_sub(1));
        info!(
            session_id = %self.session_id,
            attempts = inner.reconnect_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "realtime: reconnect scheduled"
        );
        Some(delay)
    }

    /// Move from backoff into the next attempt, unless retired meanwhile.
    fn begin_reconnect(&self, generation: u64) -> bool {
        let waiters = {
            let mut inner = lock(&self.inner);
            if !inner.is_current(generation) {
                return false;
            }
            if inner.auto_reconnect {
                inner.phase = Phase::Connecting;
                self.publish(&inner);
                return true;
            }
            inner.driver = None;
            std::mem::take(&mut inner.waiters)
        };
        resolve(waiters, &Err(ConnectError::Cancelled));
        false
    }

    fn dispatch_text(&self, text: &str) {
        let envelope = match decode_envelope(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, len = text.len(), "realtime: dropping malformed frame");
                return;
            }
        };
        let kind = envelope.kind.clone();
        match Inbound::from_envelope(envelope) {
            Ok(inbound) => {
                trace!(%kind, "realtime: dispatching");
                self.dispatcher.dispatch(&inbound);
            }
            Err(error) => warn!(%kind, %error, "realtime: dropping frame with invalid payload"),
        }
    }
}

fn resolve(waiters: Vec<Waiter>, result: &Result<(), ConnectError>) {
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}

// =============================================================================
// CONNECTION MANAGER
// =============================================================================

/// Handle to one logical realtime connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Manager that connects over WebSocket.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, WebSocketConnector)
    }

    /// Manager over a custom transport.
    #[must_use]
    pub fn with_connector(config: ConnectionConfig, connector: impl Connector) -> Self {
        let auto_reconnect = config.auto_reconnect;
        let (state_tx, _) = watch::channel(ConnectionState::default());
        Self {
            shared: Arc::new(Shared {
                backoff: Backoff::from_config(&config),
                config,
                session_id: Uuid::new_v4().to_string(),
                connector: Arc::new(connector),
                dispatcher: Dispatcher::new(),
                state_tx,
                inner: Mutex::new(Inner {
                    phase: Phase::Idle,
                    reconnect_attempts: 0,
                    last_disconnect: None,
                    auto_reconnect,
                    queue: VecDeque::new(),
                    driver: None,
                    generation: 0,
                    waiters: Vec::new(),
                }),
            }),
        }
    }

    /// Identifier stamped on every outbound envelope from this manager.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    /// Connection-state event stream.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    #[must_use]
    pub fn queued_len(&self) -> usize {
        lock(&self.shared.inner).queue.len()
    }

    /// Drop every queued envelope. Returns how many were discarded.
    pub fn clear_queue(&self) -> usize {
        let mut inner = lock(&self.shared.inner);
        let dropped = inner.queue.len();
        inner.queue.clear();
        dropped
    }

    /// Enable or disable automatic reconnect. Takes effect at the next close;
    /// re-enabling does not start a connection by itself.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        lock(&self.shared.inner).auto_reconnect = enabled;
    }

    /// Register a handler for inbound events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Inbound) + Send + Sync + 'static,
    {
        self.shared.dispatcher.subscribe(kind, handler)
    }

    /// Stamp and send an event. Queued while not connected.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::QueueFull`] when the queue is at capacity and the
    /// overflow policy is [`OverflowPolicy::RejectNew`]. Transport failures
    /// never surface here.
    pub fn send(&self, event: Event) -> Result<(), SendError> {
        let envelope = Envelope::stamp(event, &self.shared.session_id);
        let capacity = self.shared.config.queue_capacity;

        let mut inner = lock(&self.shared.inner);
        if inner.queue.len() >= capacity {
            match self.shared.config.overflow {
                OverflowPolicy::RejectNew => {
                    warn!(kind = %envelope.kind, capacity, "realtime: outbound queue full, rejecting");
                    return Err(SendError::QueueFull { capacity });
                }
                OverflowPolicy::DropOldest => {
                    if let Some(dropped) = inner.queue.pop_front() {
                        warn!(kind = %dropped.kind, capacity, "realtime: outbound queue full, dropping oldest");
                    }
                }
            }
        }
        inner.queue.push_back(envelope);

        if inner.phase == Phase::Connected {
            if let Some(driver) = &inner.driver {
                let _ = driver.commands.send(Command::Flush);
            }
        }
        Ok(())
    }

    /// Open the connection, or join the attempt already in flight.
    ///
    /// Resets the failed-attempt counter and re-enables auto-reconnect per
    /// config. While a reconnect is pending this skips the remaining delay.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Transport`] if the attempt fails (the driver
    /// keeps retrying in the background when allowed) and
    /// [`ConnectError::Cancelled`] if `disconnect()` intervenes.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let waiter = {
            let mut inner = lock(&self.shared.inner);
            match (inner.phase, inner.driver.is_some()) {
                (Phase::Connected, true) => return Ok(()),
                (Phase::Connecting, true) => {}
                (Phase::Disconnected, true) => {
                    inner.reconnect_attempts = 0;
                    inner.auto_reconnect = self.shared.config.auto_reconnect;
                    self.shared.publish(&inner);
                    if let Some(driver) = &inner.driver {
                        let _ = driver.commands.send(Command::ConnectNow);
                    }
                }
                _ => self.start_driver(&mut inner),
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(tx);
            rx
        };
        waiter.await.unwrap_or(Err(ConnectError::Cancelled))
    }

    fn start_driver(&self, inner: &mut Inner) {
        inner.generation += 1;
        let generation = inner.generation;
        let (commands, command_rx) = mpsc::unbounded_channel();
        inner.reconnect_attempts = 0;
        inner.auto_reconnect = self.shared.config.auto_reconnect;
        inner.phase = Phase::Connecting;
        self.shared.publish(inner);

        info!(session_id = %self.shared.session_id, url = %self.shared.config.url, "realtime: connecting");
        let task = tokio::spawn(run_driver(Arc::clone(&self.shared), generation, command_rx));
        inner.driver = Some(DriverHandle { generation, commands, task });
    }

    /// Close the connection and disable auto-reconnect. Queued envelopes stay
    /// queued for the next successful connect.
    pub fn disconnect(&self) {
        drop(self.stop_driver());
    }

    /// [`ConnectionManager::disconnect`], then wait until the driver has
    /// finished the envelope in flight and closed the transport.
    pub async fn shutdown(&self) {
        if let Some(task) = self.stop_driver() {
            if let Err(error) = task.await {
                warn!(%error, "realtime: driver task ended abnormally");
            }
        }
    }

    fn stop_driver(&self) -> Option<JoinHandle<()>> {
        let (waiters, task) = {
            let mut inner = lock(&self.shared.inner);
            inner.auto_reconnect = false;
            let task = inner.driver.take().map(|driver| {
                let _ = driver.commands.send(Command::Shutdown);
                driver.task
            });
            inner.phase = Phase::Disconnected;
            inner.last_disconnect = Some(DisconnectReason::LocalRequest);
            self.shared.publish(&inner);
            (std::mem::take(&mut inner.waiters), task)
        };
        resolve(waiters, &Err(ConnectError::Cancelled));
        info!(session_id = %self.shared.session_id, "realtime: disconnect requested");
        task
    }
}

// =============================================================================
// DRIVER
// =============================================================================

enum SessionEnd {
    Closed(DisconnectReason),
    Shutdown,
}

async fn run_driver(shared: Arc<Shared>, generation: u64, mut commands: mpsc::UnboundedReceiver<Command>) {
    loop {
        let attempt = tokio::select! {
            result = shared.connector.connect(&shared.config.url) => result,
            () = wait_for_shutdown(&mut commands) => return,
        };

        let (reason, attempt_failed) = match attempt {
            Ok(mut transport) => {
                if !shared.mark_connected(generation) {
                    transport.close().await;
                    return;
                }
                info!(session_id = %shared.session_id, "realtime: connected");
                match run_session(&shared, transport.as_mut(), &mut commands).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Closed(reason) => {
                        info!(session_id = %shared.session_id, ?reason, "realtime: connection closed");
                        (reason, false)
                    }
                }
            }
            Err(error) => {
                warn!(session_id = %shared.session_id, %error, "realtime: connect attempt failed");
                shared.fail_waiters(generation, &error);
                (DisconnectReason::TransportError { message: error.to_string() }, true)
            }
        };

        let Some(delay) = shared.after_close(generation, reason, attempt_failed) else {
            return;
        };

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            proceed = wait_for_wakeup(&mut commands) => {
                if !proceed {
                    return;
                }
            }
        }

        if !shared.begin_reconnect(generation) {
            return;
        }
    }
}

/// Resolve once the manager asks this driver to stop. Other commands are
/// irrelevant while no session is open and are dropped.
async fn wait_for_shutdown(commands: &mut mpsc::UnboundedReceiver<Command>) {
    loop {
        match commands.recv().await {
            Some(Command::Shutdown) | None => return,
            Some(Command::Flush | Command::ConnectNow) => {}
        }
    }
}

/// During backoff: `true` to reconnect now, `false` to stop.
async fn wait_for_wakeup(commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    loop {
        match commands.recv().await {
            Some(Command::ConnectNow) => return true,
            Some(Command::Shutdown) | None => return false,
            Some(Command::Flush) => {}
        }
    }
}

async fn run_session(
    shared: &Shared,
    transport: &mut dyn Transport,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    if let Err(reason) = flush_queue(shared, transport).await {
        return SessionEnd::Closed(reason);
    }

    let period = shared.config.heartbeat_interval.max(Duration::from_millis(1));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_inbound = Instant::now();

    loop {
        let liveness_deadline = shared.config.liveness_timeout.map(|timeout| last_inbound + timeout);

        tokio::select! {
            incoming = transport.recv() => match incoming {
                Some(Ok(Incoming::Text(text))) => {
                    last_inbound = Instant::now();
                    shared.dispatch_text(&text);
                }
                Some(Ok(Incoming::Keepalive)) => last_inbound = Instant::now(),
                Some(Ok(Incoming::Closed { code, reason })) => {
                    return SessionEnd::Closed(DisconnectReason::ServerClosed { code, reason });
                }
                Some(Err(error)) => {
                    return SessionEnd::Closed(DisconnectReason::TransportError { message: error.to_string() });
                }
                None => return SessionEnd::Closed(DisconnectReason::StreamEnded),
            },
            command = commands.recv() => match command {
                Some(Command::Flush) => {
                    if let Err(reason) = flush_queue(shared, transport).await {
                        return SessionEnd::Closed(reason);
                    }
                }
                Some(Command::ConnectNow) => {}
                Some(Command::Shutdown) | None => {
                    transport.close().await;
                    return SessionEnd::Shutdown;
                }
            },
            _ = heartbeat.tick() => {
                let envelope = Envelope::stamp(Event::Heartbeat, &shared.session_id);
                if let Err(error) = transport.send_text(encode_envelope(&envelope)).await {
                    return SessionEnd::Closed(DisconnectReason::TransportError { message: error.to_string() });
                }
                trace!(session_id = %shared.session_id, "realtime: heartbeat sent");
            }
            () = sleep_until_deadline(liveness_deadline) => {
                warn!(session_id = %shared.session_id, "realtime: no inbound traffic, closing session");
                transport.close().await;
                return SessionEnd::Closed(DisconnectReason::LivenessTimeout);
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Transmit queued envelopes in FIFO order. An envelope whose send fails goes
/// back to the front of the queue.
async fn flush_queue(shared: &Shared, transport: &mut dyn Transport) -> Result<(), DisconnectReason> {
    let mut sent = 0_usize;
    loop {
        let next = lock(&shared.inner).queue.pop_front();
        let Some(envelope) = next else {
            break;
        };
        if let Err(error) = transport.send_text(encode_envelope(&envelope)).await {
            lock(&shared.inner).queue.push_front(envelope);
            return Err(DisconnectReason::TransportError { message: error.to_string() });
        }
        sent += 1;
    }
    if sent > 0 {
        debug!(session_id = %shared.session_id, sent, "realtime: outbound queue flushed");
    }
    Ok(())
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
