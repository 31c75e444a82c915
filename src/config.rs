//! Realtime configuration with defaults and environment overrides.
//!
//! Every knob has a default; `from_env` reads `BIN_RT_*` variables on top.
//! Parsing goes through a lookup function so it can be exercised without
//! touching the process environment.
//!
//! Variables:
//! - `BIN_RT_URL` (required by `from_env`)
//! - `BIN_RT_AUTO_RECONNECT`: default `true`
//! - `BIN_RT_MAX_RECONNECT_ATTEMPTS`: default 5
//! - `BIN_RT_BASE_DELAY_MS`: default 1000
//! - `BIN_RT_MAX_DELAY_MS`: default 30000
//! - `BIN_RT_JITTER`: fraction in `[0, 1]`, default 0.2
//! - `BIN_RT_HEARTBEAT_INTERVAL_MS`: default 30000
//! - `BIN_RT_LIVENESS_TIMEOUT_MS`: unset or 0 disables (default)
//! - `BIN_RT_QUEUE_CAPACITY`: default 1000
//! - `BIN_RT_QUEUE_OVERFLOW`: `reject_new` (default) or `drop_oldest`
//! - `BIN_RT_ANNOUNCE_INTERVAL_MS`: default 60000
//! - `BIN_RT_STALENESS_MS`: default 300000
//! - `BIN_RT_CURSOR_MIN_INTERVAL_MS`: default 100
//! - `BIN_RT_FEED_CAPACITY`: default 100

use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_JITTER: f64 = 0.2;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;
pub const DEFAULT_ANNOUNCE_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_STALENESS_THRESHOLD_MS: u64 = 5 * 60 * 1_000;
pub const DEFAULT_CURSOR_MIN_INTERVAL_MS: u64 = 100;
pub const DEFAULT_FEED_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("BIN_RT_URL is required")]
    MissingUrl,
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// What `send` does when the outbound queue is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Refuse the new envelope and return `SendError::QueueFull`.
    #[default]
    RejectNew,
    /// Evict the oldest queued envelope to make room.
    DropOldest,
}

impl FromStr for OverflowPolicy {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reject_new" | "reject" => Ok(Self::RejectNew),
            "drop_oldest" | "drop" => Ok(Self::DropOldest),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    pub auto_reconnect: bool,
    /// Consecutive failed attempts tolerated before entering `Failed`.
    pub max_reconnect_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of each backoff delay that may be shaved off at random.
    pub jitter: f64,
    pub heartbeat_interval: Duration,
    /// Close a session that has been silent this long. `None` never does.
    pub liveness_timeout: Option<Duration>,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl ConnectionConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auto_reconnect: true,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            jitter: DEFAULT_JITTER,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            liveness_timeout: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::RejectNew,
        }
    }

    fn from_lookup(url: String, lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::new(url);

        let jitter = parse_or(lookup, "BIN_RT_JITTER", defaults.jitter)?;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(invalid(lookup, "BIN_RT_JITTER"));
        }
        let queue_capacity = parse_or(lookup, "BIN_RT_QUEUE_CAPACITY", defaults.queue_capacity)?;
        if queue_capacity == 0 {
            return Err(invalid(lookup, "BIN_RT_QUEUE_CAPACITY"));
        }
        let heartbeat_interval = parse_ms_or(lookup, "BIN_RT_HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval)?;
        if heartbeat_interval.is_zero() {
            return Err(invalid(lookup, "BIN_RT_HEARTBEAT_INTERVAL_MS"));
        }
        let liveness_ms = parse_or(lookup, "BIN_RT_LIVENESS_TIMEOUT_MS", 0_u64)?;

        Ok(Self {
            auto_reconnect: parse_or(lookup, "BIN_RT_AUTO_RECONNECT", defaults.auto_reconnect)?,
            max_reconnect_attempts: parse_or(lookup, "BIN_RT_MAX_RECONNECT_ATTEMPTS", defaults.max_reconnect_attempts)?,
            base_delay: parse_ms_or(lookup, "BIN_RT_BASE_DELAY_MS", defaults.base_delay)?,
            max_delay: parse_ms_or(lookup, "BIN_RT_MAX_DELAY_MS", defaults.max_delay)?,
            jitter,
            heartbeat_interval,
            liveness_timeout: (liveness_ms > 0).then(|| Duration::from_millis(liveness_ms)),
            queue_capacity,
            overflow: parse_or(lookup, "BIN_RT_QUEUE_OVERFLOW", defaults.overflow)?,
            url: defaults.url,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    pub announce_interval: Duration,
    /// Records older than this are left out of online queries.
    pub staleness_threshold: Duration,
    /// Minimum spacing between cursor broadcasts.
    pub cursor_min_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_millis(DEFAULT_ANNOUNCE_INTERVAL_MS),
            staleness_threshold: Duration::from_millis(DEFAULT_STALENESS_THRESHOLD_MS),
            cursor_min_interval: Duration::from_millis(DEFAULT_CURSOR_MIN_INTERVAL_MS),
        }
    }
}

impl PresenceConfig {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let announce_interval = parse_ms_or(lookup, "BIN_RT_ANNOUNCE_INTERVAL_MS", defaults.announce_interval)?;
        if announce_interval.is_zero() {
            return Err(invalid(lookup, "BIN_RT_ANNOUNCE_INTERVAL_MS"));
        }
        Ok(Self {
            announce_interval,
            staleness_threshold: parse_ms_or(lookup, "BIN_RT_STALENESS_MS", defaults.staleness_threshold)?,
            cursor_min_interval: parse_ms_or(lookup, "BIN_RT_CURSOR_MIN_INTERVAL_MS", defaults.cursor_min_interval)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedConfig {
    pub capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { capacity: DEFAULT_FEED_CAPACITY }
    }
}

impl FeedConfig {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let capacity = parse_or(lookup, "BIN_RT_FEED_CAPACITY", DEFAULT_FEED_CAPACITY)?;
        if capacity == 0 {
            return Err(invalid(lookup, "BIN_RT_FEED_CAPACITY"));
        }
        Ok(Self { capacity })
    }
}

/// Configuration for the whole realtime layer.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeConfig {
    pub connection: ConnectionConfig,
    pub presence: PresenceConfig,
    pub feed: FeedConfig,
}

impl RealtimeConfig {
    /// Build config from `BIN_RT_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingUrl`] without `BIN_RT_URL` and
    /// [`ConfigError::Invalid`] for unparseable or out-of-range values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(None, &|key| std::env::var(key).ok())
    }

    /// Like [`RealtimeConfig::from_env`], with the endpoint supplied by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unparseable or out-of-range values.
    pub fn from_env_with_url(url: impl Into<String>) -> Result<Self, ConfigError> {
        Self::from_lookup(Some(url.into()), &|key| std::env::var(key).ok())
    }

    fn from_lookup(url: Option<String>, lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = url
            .or_else(|| lookup("BIN_RT_URL"))
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::MissingUrl)?;
        Ok(Self {
            connection: ConnectionConfig::from_lookup(url, lookup)?,
            presence: PresenceConfig::from_lookup(lookup)?,
            feed: FeedConfig::from_lookup(lookup)?,
        })
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn parse_ms_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(lookup, key, default_ms).map(Duration::from_millis)
}

fn invalid(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> ConfigError {
    ConfigError::Invalid { key, value: lookup(key).unwrap_or_default() }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
