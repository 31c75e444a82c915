//! Shared envelope model and JSON codec for the marketplace realtime wire.
//!
//! This crate owns the wire representation used by both `bin-realtime` and
//! the `bin-live` CLI. Envelopes travel as one JSON object per UTF-8 text
//! frame and keep their payload flexible (`serde_json::Value`); [`Event`]
//! lifts the payloads this layer understands into typed records.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// WIRE TYPES
// =============================================================================

/// Envelope `type` for liveness heartbeats.
pub const HEARTBEAT: &str = "heartbeat";

/// Envelope `type` for participant presence announcements.
pub const PRESENCE: &str = "presence";

/// Envelope `type` for explicit participant departure.
pub const PARTICIPANT_LEFT: &str = "participant_left";

/// Envelope `type` for marketplace activity records.
pub const ACTIVITY: &str = "activity";

/// Error returned by [`decode_envelope`] and [`Event::from_parts`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame text is not valid JSON or does not match the envelope shape.
    #[error("failed to decode envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame has no usable `type` discriminator.
    #[error("envelope is missing a `type` discriminator")]
    MissingType,
    /// The payload does not match the shape required by its `type`.
    #[error("invalid `{kind}` payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A single message on the realtime wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Discriminator, e.g. `"presence"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload. Always an object on the way out.
    #[serde(default = "empty_payload")]
    pub payload: Value,
    /// Milliseconds since the Unix epoch when the sender created the envelope.
    #[serde(default)]
    pub timestamp: i64,
    /// Session that produced the envelope.
    #[serde(default)]
    pub origin_session_id: String,
}

impl Envelope {
    /// Wrap an event for transmission, stamping the current time and session.
    #[must_use]
    pub fn stamp(event: Event, origin_session_id: &str) -> Self {
        let (kind, payload) = event.into_parts();
        Self {
            kind,
            payload,
            timestamp: now_ms(),
            origin_session_id: origin_session_id.to_owned(),
        }
    }
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

/// Encode an envelope as a JSON text frame.
#[must_use]
pub fn encode_envelope(envelope: &Envelope) -> String {
    // Envelopes only hold strings, integers, and `Value` trees with string
    // keys, so serialization cannot fail.
    serde_json::to_string(envelope).unwrap_or_default()
}

/// Decode a JSON text frame into an envelope.
///
/// # Errors
///
/// Returns [`CodecError::Json`] for malformed text and
/// [`CodecError::MissingType`] when `type` is absent, empty, or not a string.
pub fn decode_envelope(text: &str) -> Result<Envelope, CodecError> {
    let value = serde_json::from_str::<Value>(text)?;
    match value.get("type").and_then(Value::as_str) {
        Some(kind) if !kind.is_empty() => {}
        _ => return Err(CodecError::MissingType),
    }
    Ok(serde_json::from_value(value)?)
}

/// Current time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(duration.as_millis()).unwrap_or(0)
}

// =============================================================================
// DOMAIN RECORDS
// =============================================================================

/// Caller-supplied identity. This layer never authenticates it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(rename = "identity")]
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Participant {
    #[must_use]
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self { id: id.into(), username: username.into(), avatar: None }
    }

    #[must_use]
    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// Availability a participant advertises.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Away,
    Busy,
    Offline,
}

impl PresenceStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }
}

/// Pointer position in page coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

/// Last-known presence of one participant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    #[serde(flatten)]
    pub participant: Participant,
    pub status: PresenceStatus,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub last_seen: i64,
    #[serde(default)]
    pub current_page: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

impl PresenceRecord {
    #[must_use]
    pub fn new(participant: Participant, status: PresenceStatus) -> Self {
        Self {
            participant,
            status,
            last_seen: now_ms(),
            current_page: String::new(),
            cursor: None,
        }
    }

    /// Identity key the record is tracked under.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.participant.id
    }
}

/// Kind of marketplace activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Purchase,
    Upload,
    Join,
    Review,
}

impl ActivityKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Upload => "upload",
            Self::Join => "join",
            Self::Review => "review",
        }
    }
}

/// One immutable entry of the activity log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub actor: Participant,
    pub timestamp: i64,
    #[serde(default = "empty_payload")]
    pub payload: Value,
}

/// Error returned when a status or activity kind name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what}: {value}")]
pub struct ParseValueError {
    pub what: &'static str,
    pub value: String,
}

impl FromStr for PresenceStatus {
    type Err = ParseValueError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(Self::Online),
            "away" => Ok(Self::Away),
            "busy" => Ok(Self::Busy),
            "offline" => Ok(Self::Offline),
            _ => Err(ParseValueError { what: "presence status", value: raw.to_owned() }),
        }
    }
}

impl FromStr for ActivityKind {
    type Err = ParseValueError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "purchase" => Ok(Self::Purchase),
            "upload" => Ok(Self::Upload),
            "join" => Ok(Self::Join),
            "review" => Ok(Self::Review),
            _ => Err(ParseValueError { what: "activity kind", value: raw.to_owned() }),
        }
    }
}

// =============================================================================
// TYPED EVENTS
// =============================================================================

/// Payload-free discriminant of an [`Event`]; the subscription key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Heartbeat,
    Presence,
    ParticipantLeft,
    Activity,
    /// Passthrough application type, e.g. `"chat"`.
    Other(String),
}

impl EventKind {
    /// Map a wire `type` string to its kind. Known names never become `Other`.
    #[must_use]
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            HEARTBEAT => Self::Heartbeat,
            PRESENCE => Self::Presence,
            PARTICIPANT_LEFT => Self::ParticipantLeft,
            ACTIVITY => Self::Activity,
            other => Self::Other(other.to_owned()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Heartbeat => HEARTBEAT,
            Self::Presence => PRESENCE,
            Self::ParticipantLeft => PARTICIPANT_LEFT,
            Self::Activity => ACTIVITY,
            Self::Other(kind) => kind,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed view of an envelope payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Heartbeat,
    Presence(PresenceRecord),
    ParticipantLeft { identity: String },
    Activity(ActivityRecord),
    Other { kind: String, payload: Value },
}

#[derive(Serialize, Deserialize)]
struct ParticipantLeftPayload {
    identity: String,
}

impl Event {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Heartbeat => EventKind::Heartbeat,
            Self::Presence(_) => EventKind::Presence,
            Self::ParticipantLeft { .. } => EventKind::ParticipantLeft,
            Self::Activity(_) => EventKind::Activity,
            Self::Other { kind, .. } => EventKind::from_wire(kind),
        }
    }

    /// Build a typed event from a wire `type` and payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Payload`] when a known type carries a payload of
    /// the wrong shape.
    pub fn from_parts(kind: &str, payload: Value) -> Result<Self, CodecError> {
        match kind {
            HEARTBEAT => Ok(Self::Heartbeat),
            PRESENCE => serde_json::from_value(payload)
                .map(Self::Presence)
                .map_err(|source| CodecError::Payload { kind: PRESENCE, source }),
            PARTICIPANT_LEFT => serde_json::from_value::<ParticipantLeftPayload>(payload)
                .map(|left| Self::ParticipantLeft { identity: left.identity })
                .map_err(|source| CodecError::Payload { kind: PARTICIPANT_LEFT, source }),
            ACTIVITY => serde_json::from_value(payload)
                .map(Self::Activity)
                .map_err(|source| CodecError::Payload { kind: ACTIVITY, source }),
            "" => Err(CodecError::MissingType),
            other => Ok(Self::Other { kind: other.to_owned(), payload }),
        }
    }

    /// Decode the typed event carried by an envelope.
    ///
    /// # Errors
    ///
    /// See [`Event::from_parts`].
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, CodecError> {
        Self::from_parts(&envelope.kind, envelope.payload.clone())
    }

    /// Split into wire `type` and payload.
    #[must_use]
    pub fn into_parts(self) -> (String, Value) {
        match self {
            Self::Heartbeat => (HEARTBEAT.to_owned(), empty_payload()),
            Self::Presence(record) => (PRESENCE.to_owned(), to_payload(&record)),
            Self::ParticipantLeft { identity } => {
                (PARTICIPANT_LEFT.to_owned(), to_payload(&ParticipantLeftPayload { identity }))
            }
            Self::Activity(record) => (ACTIVITY.to_owned(), to_payload(&record)),
            Self::Other { kind, payload } => (kind, payload),
        }
    }
}

fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|_| empty_payload())
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
