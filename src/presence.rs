//! Presence tracking on top of a [`ConnectionManager`].
//!
//! DESIGN
//! ======
//! The tracker keeps two things behind one lock: the local participant's
//! record and the last-known record of every other participant. Inbound
//! `presence` envelopes upsert by identity; `participant_left` removes.
//! Echoes of this session's own envelopes are ignored.
//!
//! STALENESS
//! =========
//! Each remote record carries the local monotonic time it was last received.
//! `online()` filters lazily at query time; there is no sweep timer, so a
//! record that went quiet stays in memory (and in `get`) until it is replaced
//! or removed, it just stops counting as online.
//!
//! CURSOR THROTTLE
//! ===============
//! Cursor moves pass through a [`MinIntervalGate`]. A move inside the window
//! updates the local record and schedules a single trailing broadcast for
//! when the window reopens; further moves before then ride along with it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use envelopes::{Cursor, Event, EventKind, Participant, PresenceRecord, PresenceStatus, now_ms};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PresenceConfig;
use crate::connection::{ConnectionManager, SendError};
use crate::dispatch::{Inbound, Subscription};
use crate::lock;
use crate::throttle::{Admission, MinIntervalGate};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresenceError {
    #[error("announce_self has not been called")]
    NotAnnounced,
    #[error(transparent)]
    Send(#[from] SendError),
}

/// What happened to a cursor update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorUpdate {
    /// Broadcast immediately.
    Sent,
    /// Inside the throttle window; a trailing broadcast is now scheduled.
    Deferred,
    /// Folded into the trailing broadcast that was already scheduled.
    Coalesced,
}

// =============================================================================
// STATE
// =============================================================================

struct Tracked {
    record: PresenceRecord,
    received_at: Instant,
}

struct PresenceState {
    local: Option<PresenceRecord>,
    remote: HashMap<String, Tracked>,
    gate: MinIntervalGate,
    trailing: Option<JoinHandle<()>>,
    announcer: Option<JoinHandle<()>>,
}

impl PresenceState {
    fn upsert_at(&mut self, record: PresenceRecord, now: Instant) {
        let identity = record.identity().to_owned();
        self.remote.insert(identity, Tracked { record, received_at: now });
    }

    fn remove(&mut self, identity: &str) -> bool {
        self.remote.remove(identity).is_some()
    }

    fn online_at(&self, now: Instant, threshold: Duration) -> Vec<PresenceRecord> {
        let mut online: Vec<PresenceRecord> = self
            .remote
            .values()
            .filter(|tracked| tracked.record.status != PresenceStatus::Offline)
            .filter(|tracked| now.saturating_duration_since(tracked.received_at) < threshold)
            .map(|tracked| tracked.record.clone())
            .collect();
        online.sort_by(|a, b| a.identity().cmp(b.identity()));
        online
    }

    /// Refresh `last_seen` on the local record and return a copy to send.
    fn touch_local(&mut self) -> Option<PresenceRecord> {
        let local = self.local.as_mut()?;
        local.last_seen = now_ms();
        Some(local.clone())
    }

    fn stop_timers(&mut self) {
        for task in [self.announcer.take(), self.trailing.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

// =============================================================================
// TRACKER
// =============================================================================

/// Live view of who is online, where, and what they are pointing at.
pub struct PresenceTracker {
    connection: ConnectionManager,
    config: PresenceConfig,
    state: Arc<Mutex<PresenceState>>,
    subscriptions: Vec<Subscription>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(connection: ConnectionManager, config: PresenceConfig) -> Self {
        let state = Arc::new(Mutex::new(PresenceState {
            local: None,
            remote: HashMap::new(),
            gate: MinIntervalGate::new(config.cursor_min_interval),
            trailing: None,
            announcer: None,
        }));

        let on_presence = {
            let state = Arc::clone(&state);
            let session_id = connection.session_id().to_owned();
            connection.on(EventKind::Presence, move |inbound: &Inbound| {
                if inbound.origin_session_id == session_id {
                    return;
                }
                if let Event::Presence(record) = &inbound.event {
                    lock(&state).upsert_at(record.clone(), Instant::now());
                }
            })
        };
        let on_left = {
            let state = Arc::clone(&state);
            connection.on(EventKind::ParticipantLeft, move |inbound: &Inbound| {
                if let Event::ParticipantLeft { identity } = &inbound.event {
                    if lock(&state).remove(identity) {
                        debug!(%identity, "presence: participant left");
                    }
                }
            })
        };

        Self { connection, config, state, subscriptions: vec![on_presence, on_left] }
    }

    /// Publish the local participant and keep re-announcing every
    /// `announce_interval`. Calling it again replaces the local record.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::Send`] if the outbound queue rejects the
    /// announcement. The local record and re-announcement are set up anyway.
    pub fn announce_self(&self, participant: Participant, status: PresenceStatus) -> Result<(), PresenceError> {
        let record = PresenceRecord::new(participant, status);
        info!(identity = %record.identity(), status = status.as_str(), "presence: announcing");
        {
            let mut state = lock(&self.state);
            state.local = Some(record.clone());
            if let Some(previous) = state.announcer.take() {
                previous.abort();
            }
            state.announcer = Some(self.spawn_announcer());
        }
        self.connection.send(Event::Presence(record))?;
        Ok(())
    }

    fn spawn_announcer(&self) -> JoinHandle<()> {
        let period = self.config.announce_interval.max(Duration::from_millis(1));
        let state = Arc::clone(&self.state);
        let connection = self.connection.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(record) = lock(&state).touch_local() else {
                    return;
                };
                if let Err(error) = connection.send(Event::Presence(record)) {
                    warn!(%error, "presence: re-announce dropped");
                }
            }
        })
    }

    /// # Errors
    ///
    /// [`PresenceError::NotAnnounced`] before [`PresenceTracker::announce_self`];
    /// [`PresenceError::Send`] if the outbound queue rejects the update.
    pub fn set_status(&self, status: PresenceStatus) -> Result<(), PresenceError> {
        self.update_local(|local| local.status = status)
    }

    /// # Errors
    ///
    /// Same as [`PresenceTracker::set_status`].
    pub fn set_current_page(&self, page: impl Into<String>) -> Result<(), PresenceError> {
        let page = page.into();
        self.update_local(|local| local.current_page = page)
    }

    fn update_local(&self, apply: impl FnOnce(&mut PresenceRecord)) -> Result<(), PresenceError> {
        let record = {
            let mut state = lock(&self.state);
            let local = state.local.as_mut().ok_or(PresenceError::NotAnnounced)?;
            apply(local);
            state.touch_local().ok_or(PresenceError::NotAnnounced)?
        };
        self.connection.send(Event::Presence(record))?;
        Ok(())
    }

    /// Move the local cursor, broadcasting at most once per
    /// `cursor_min_interval`. The latest position is always delivered.
    ///
    /// # Errors
    ///
    /// Same as [`PresenceTracker::set_status`]. Send errors from a trailing
    /// broadcast are logged, not returned.
    pub fn set_cursor(&self, x: f64, y: f64) -> Result<CursorUpdate, PresenceError> {
        let record = {
            let mut state = lock(&self.state);
            let local = state.local.as_mut().ok_or(PresenceError::NotAnnounced)?;
            local.cursor = Some(Cursor { x, y });

            match state.gate.admit() {
                Admission::Open => state.touch_local().ok_or(PresenceError::NotAnnounced)?,
                Admission::Wait(_) if state.trailing.as_ref().is_some_and(|task| !task.is_finished()) => {
                    return Ok(CursorUpdate::Coalesced);
                }
                Admission::Wait(delay) => {
                    state.trailing = Some(self.spawn_trailing(delay));
                    return Ok(CursorUpdate::Deferred);
                }
            }
        };
        self.connection.send(Event::Presence(record))?;
        Ok(CursorUpdate::Sent)
    }

    fn spawn_trailing(&self, delay: Duration) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let connection = self.connection.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let record = {
                let mut state = lock(&state);
                state.trailing = None;
                state.gate.mark_at(Instant::now());
                state.touch_local()
            };
            if let Some(record) = record {
                if let Err(error) = connection.send(Event::Presence(record)) {
                    warn!(%error, "presence: trailing cursor update dropped");
                }
            }
        })
    }

    /// Other participants that are not offline and were heard from within
    /// `staleness_threshold`, ordered by identity.
    #[must_use]
    pub fn online(&self) -> Vec<PresenceRecord> {
        lock(&self.state).online_at(Instant::now(), self.config.staleness_threshold)
    }

    /// [`PresenceTracker::online`] restricted to an exact page.
    #[must_use]
    pub fn on_page(&self, page: &str) -> Vec<PresenceRecord> {
        let mut online = self.online();
        online.retain(|record| record.current_page == page);
        online
    }

    /// Last-known record for `identity`, stale or not.
    #[must_use]
    pub fn get(&self, identity: &str) -> Option<PresenceRecord> {
        lock(&self.state).remote.get(identity).map(|tracked| tracked.record.clone())
    }

    #[must_use]
    pub fn local(&self) -> Option<PresenceRecord> {
        lock(&self.state).local.clone()
    }

    /// Announce departure, stop timers and stop listening.
    pub fn destroy(self) {
        let identity = lock(&self.state).local.as_ref().map(|local| local.identity().to_owned());
        if let Some(identity) = identity {
            info!(%identity, "presence: leaving");
            if let Err(error) = self.connection.send(Event::ParticipantLeft { identity }) {
                warn!(%error, "presence: participant_left dropped");
            }
        }
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        lock(&self.state).stop_timers();
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
