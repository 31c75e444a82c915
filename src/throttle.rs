//! Minimum-interval gate for high-frequency updates such as cursor moves.
//!
//! DESIGN
//! ======
//! One timestamp, no window: the gate opens when at least `min_interval` has
//! passed since it last opened. A closed gate reports how long until it
//! reopens so callers can schedule one trailing update instead of dropping
//! the latest value.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The update may go out now; the gate has been re-armed.
    Open,
    /// The gate reopens after this long.
    Wait(Duration),
}

#[derive(Debug, Clone)]
pub struct MinIntervalGate {
    min_interval: Duration,
    last_open: Option<Instant>,
}

impl MinIntervalGate {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, last_open: None }
    }

    /// Check the gate now, re-arming it if it is open.
    pub fn admit(&mut self) -> Admission {
        self.admit_at(Instant::now())
    }

    /// Internal: check with an explicit timestamp (for testing).
    pub(crate) fn admit_at(&mut self, now: Instant) -> Admission {
        if let Some(last) = self.last_open {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.min_interval {
                return Admission::Wait(self.min_interval - elapsed);
            }
        }
        self.last_open = Some(now);
        Admission::Open
    }

    /// Record that an update went out at `now` without checking the gate.
    pub(crate) fn mark_at(&mut self, now: Instant) {
        self.last_open = Some(now);
    }

    pub fn reset(&mut self) {
        self.last_open = None;
    }
}

#[cfg(test)]
#[path = "throttle_test.rs"]
mod tests;
