//! Typed publish/subscribe table for inbound events.
//!
//! DESIGN
//! ======
//! Handlers are keyed by [`EventKind`], so subscribing to a typo is a compile
//! error for every built-in kind; passthrough types use `EventKind::Other`.
//! Dispatch snapshots the handler list and releases the table lock before
//! calling out, so handlers may subscribe, unsubscribe, or send freely.
//!
//! ERROR HANDLING
//! ==============
//! Each handler call is isolated with `catch_unwind`. A panicking handler is
//! logged and skipped; the rest of the list still runs and the connection
//! driver survives.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use envelopes::{CodecError, Envelope, Event, EventKind};
use tracing::error;

use crate::lock;

/// An inbound event with the envelope metadata it arrived with.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub event: Event,
    /// Sender's creation time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub origin_session_id: String,
}

impl Inbound {
    /// Lift a decoded envelope into a typed inbound event.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Payload`] when a known type has a malformed payload.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, CodecError> {
        let event = Event::from_parts(&envelope.kind, envelope.payload)?;
        Ok(Self {
            event,
            timestamp: envelope.timestamp,
            origin_session_id: envelope.origin_session_id,
        })
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

type Handler = Arc<dyn Fn(&Inbound) + Send + Sync>;

#[derive(Default)]
struct SubscriberTable {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(u64, Handler)>>,
}

/// Fan-out table shared by a connection manager and its subscriptions.
#[derive(Clone, Default)]
pub struct Dispatcher {
    table: Arc<Mutex<SubscriberTable>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. Handlers for one kind run in
    /// registration order.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Inbound) + Send + Sync + 'static,
    {
        let mut table = lock(&self.table);
        table.next_id += 1;
        let id = table.next_id;
        table
            .handlers
            .entry(kind.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription { kind, id, table: Arc::downgrade(&self.table) }
    }

    /// Deliver `inbound` to every handler registered for its kind.
    ///
    /// Returns the number of handlers that ran to completion.
    pub fn dispatch(&self, inbound: &Inbound) -> usize {
        let kind = inbound.kind();
        let handlers: Vec<Handler> = lock(&self.table)
            .handlers
            .get(&kind)
            .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(inbound))).is_ok() {
                delivered += 1;
            } else {
                error!(%kind, "dispatch: handler panicked; continuing with remaining handlers");
            }
        }
        delivered
    }

    #[must_use]
    pub fn handler_count(&self, kind: &EventKind) -> usize {
        lock(&self.table).handlers.get(kind).map_or(0, Vec::len)
    }
}

/// Handle returned by `on`/`subscribe`. Dropping it keeps the handler
/// registered; call [`Subscription::unsubscribe`] to remove it.
#[must_use = "dropping a Subscription keeps the handler registered; call unsubscribe() to remove it"]
#[derive(Debug)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
    table: Weak<Mutex<SubscriberTable>>,
}

impl Subscription {
    #[must_use]
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Remove the handler. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(table) = self.table.upgrade() else {
            return false;
        };
        let mut table = lock(&table);
        let Some(list) = table.handlers.get_mut(&self.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != self.id);
        let removed = list.len() != before;
        if list.is_empty() {
            table.handlers.remove(&self.kind);
        }
        removed
    }
}

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod tests;
