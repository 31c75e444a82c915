//! Bounded, most-recent-first marketplace activity log.
//!
//! Local broadcasts are inserted before they are sent so the origin sees its
//! own activity immediately; the server echo is then recognized by id and
//! skipped. Listeners get the full list on registration and after every
//! change.

use std::collections::{HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use envelopes::{ActivityKind, ActivityRecord, Event, EventKind, Participant, now_ms};
use serde_json::{Map, Value};
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::FeedConfig;
use crate::connection::{ConnectionManager, SendError};
use crate::dispatch::{Inbound, Subscription};
use crate::lock;

/// An activity before it is assigned an id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityDraft {
    pub kind: ActivityKind,
    pub actor: Participant,
    pub payload: Value,
}

impl ActivityDraft {
    #[must_use]
    pub fn new(kind: ActivityKind, actor: Participant) -> Self {
        Self { kind, actor, payload: Value::Object(Map::new()) }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

type Listener = Arc<dyn Fn(&[ActivityRecord]) + Send + Sync>;

struct FeedState {
    capacity: usize,
    records: VecDeque<ActivityRecord>,
    ids: HashSet<String>,
    next_listener: u64,
    listeners: Vec<(u64, Listener)>,
}

impl FeedState {
    /// Insert at the front unless the id is already present.
    fn insert(&mut self, record: ActivityRecord) -> bool {
        if !self.ids.insert(record.id.clone()) {
            return false;
        }
        self.records.push_front(record);
        while self.records.len() > self.capacity {
            if let Some(evicted) = self.records.pop_back() {
                self.ids.remove(&evicted.id);
            }
        }
        true
    }

    fn snapshot(&self) -> (Vec<ActivityRecord>, Vec<Listener>) {
        let records = self.records.iter().cloned().collect();
        let listeners = self.listeners.iter().map(|(_, listener)| Arc::clone(listener)).collect();
        (records, listeners)
    }
}

fn notify(records: &[ActivityRecord], listeners: Vec<Listener>) {
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(records))).is_err() {
            error!("activity: listener panicked; continuing with remaining listeners");
        }
    }
}

/// Insert and notify. Listeners run after the lock is released.
fn record_activity(state: &Mutex<FeedState>, record: ActivityRecord) -> bool {
    let (records, listeners) = {
        let mut state = lock(state);
        if !state.insert(record) {
            return false;
        }
        state.snapshot()
    };
    notify(&records, listeners);
    true
}

pub struct ActivityFeed {
    connection: ConnectionManager,
    state: Arc<Mutex<FeedState>>,
    subscription: Option<Subscription>,
}

impl ActivityFeed {
    #[must_use]
    pub fn new(connection: ConnectionManager, config: FeedConfig) -> Self {
        let state = Arc::new(Mutex::new(FeedState {
            capacity: config.capacity.max(1),
            records: VecDeque::with_capacity(config.capacity),
            ids: HashSet::new(),
            next_listener: 0,
            listeners: Vec::new(),
        }));

        let subscription = {
            let state = Arc::clone(&state);
            connection.on(EventKind::Activity, move |inbound: &Inbound| {
                if let Event::Activity(record) = &inbound.event {
                    if !record_activity(&state, record.clone()) {
                        debug!(id = %record.id, "activity: duplicate ignored");
                    }
                }
            })
        };

        Self { connection, state, subscription: Some(subscription) }
    }

    /// Stamp `draft`, show it locally, then send it.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the outbound queue rejects the envelope. The
    /// record stays in the local feed either way.
    pub fn broadcast(&self, draft: ActivityDraft) -> Result<ActivityRecord, SendError> {
        let record = ActivityRecord {
            id: Uuid::new_v4().to_string(),
            kind: draft.kind,
            actor: draft.actor,
            timestamp: now_ms(),
            payload: draft.payload,
        };
        record_activity(&self.state, record.clone());
        self.connection.send(Event::Activity(record.clone()))?;
        Ok(record)
    }

    /// Register `callback`; it runs right away with the current list and
    /// again after every change.
    pub fn subscribe<F>(&self, callback: F) -> FeedSubscription
    where
        F: Fn(&[ActivityRecord]) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(callback);
        let (id, records) = {
            let mut state = lock(&self.state);
            state.next_listener += 1;
            let id = state.next_listener;
            state.listeners.push((id, Arc::clone(&listener)));
            (id, state.records.iter().cloned().collect::<Vec<_>>())
        };
        notify(&records, vec![listener]);
        FeedSubscription { id, state: Arc::downgrade(&self.state) }
    }

    /// Most-recent-first snapshot, optionally filtered by kind and truncated
    /// to `limit` entries.
    #[must_use]
    pub fn get_activities(&self, kind: Option<ActivityKind>, limit: Option<usize>) -> Vec<ActivityRecord> {
        let state = lock(&self.state);
        state
            .records
            .iter()
            .filter(|record| kind.is_none_or(|kind| record.kind == kind))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.state).records.is_empty()
    }

    /// Empty the feed and notify listeners.
    pub fn clear(&self) {
        let listeners = {
            let mut state = lock(&self.state);
            state.records.clear();
            state.ids.clear();
            state.snapshot().1
        };
        notify(&[], listeners);
    }

    /// Stop listening for inbound activity and drop every listener.
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for ActivityFeed {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        lock(&self.state).listeners.clear();
    }
}

/// Handle returned by [`ActivityFeed::subscribe`].
#[must_use = "dropping a FeedSubscription keeps the listener registered; call unsubscribe() to remove it"]
pub struct FeedSubscription {
    id: u64,
    state: Weak<Mutex<FeedState>>,
}

impl FeedSubscription {
    /// Remove the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let mut state = lock(&state);
        let before = state.listeners.len();
        state.listeners.retain(|(id, _)| *id != self.id);
        state.listeners.len() != before
    }
}

#[cfg(test)]
#[path = "activity_test.rs"]
mod tests;
