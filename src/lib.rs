//! Realtime layer for the BIN bot marketplace.
//!
//! ARCHITECTURE
//! ============
//! Three cooperating components share one persistent connection:
//!
//! - [`ConnectionManager`] owns the transport. It connects, reconnects with
//!   capped backoff, sends heartbeats, queues outbound envelopes while
//!   offline, and fans inbound events out to typed subscribers.
//! - [`PresenceTracker`] announces the local participant and keeps the
//!   last-known status, page, and cursor of everyone else.
//! - [`ActivityFeed`] keeps a bounded, most-recent-first log of purchase,
//!   upload, join, and review events.
//!
//! UI code calls the tracker and the feed; they call the connection manager;
//! only the connection manager's driver task touches the socket.

pub mod activity;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod presence;
pub mod throttle;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use activity::{ActivityDraft, ActivityFeed, FeedSubscription};
pub use config::{ConfigError, ConnectionConfig, FeedConfig, OverflowPolicy, PresenceConfig, RealtimeConfig};
pub use connection::{ConnectError, ConnectionManager, ConnectionState, DisconnectReason, Phase, SendError};
pub use dispatch::{Inbound, Subscription};
pub use envelopes::{
    ActivityKind, ActivityRecord, Cursor, Envelope, Event, EventKind, Participant, PresenceRecord, PresenceStatus,
};
pub use presence::{CursorUpdate, PresenceError, PresenceTracker};
pub use transport::{Connector, Incoming, Transport, TransportError, WebSocketConnector};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
