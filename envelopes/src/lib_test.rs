use super::*;
use serde_json::json;

fn sample_presence() -> PresenceRecord {
    PresenceRecord {
        participant: Participant::new("u1", "ada").with_avatar("https://cdn.example/ada.png"),
        status: PresenceStatus::Busy,
        last_seen: 1_700_000_000_000,
        current_page: "/bots/scraper".to_owned(),
        cursor: Some(Cursor { x: 12.5, y: 40.0 }),
    }
}

#[test]
fn encode_uses_camel_case_wire_keys() {
    let envelope = Envelope {
        kind: HEARTBEAT.to_owned(),
        payload: json!({}),
        timestamp: 42,
        origin_session_id: "session-1".to_owned(),
    };

    let value: Value = serde_json::from_str(&encode_envelope(&envelope)).expect("valid json");
    assert_eq!(value, json!({"type": "heartbeat", "payload": {}, "timestamp": 42, "originSessionId": "session-1"}));
}

#[test]
fn decode_rejects_non_json_text() {
    let err = decode_envelope("not json").expect_err("text should fail");
    assert!(matches!(err, CodecError::Json(_)));
}

#[test]
fn decode_rejects_missing_or_empty_type() {
    assert!(matches!(decode_envelope(r#"{"payload": {}}"#), Err(CodecError::MissingType)));
    assert!(matches!(decode_envelope(r#"{"type": ""}"#), Err(CodecError::MissingType)));
    assert!(matches!(decode_envelope(r#"{"type": 7}"#), Err(CodecError::MissingType)));
}

#[test]
fn decode_defaults_missing_metadata() {
    let envelope = decode_envelope(r#"{"type": "chat"}"#).expect("decode");
    assert_eq!(envelope.payload, json!({}));
    assert_eq!(envelope.timestamp, 0);
    assert_eq!(envelope.origin_session_id, "");
}

#[test]
fn presence_payload_flattens_participant_identity() {
    let (kind, payload) = Event::Presence(sample_presence()).into_parts();
    assert_eq!(kind, PRESENCE);
    assert_eq!(payload["identity"], "u1");
    assert_eq!(payload["username"], "ada");
    assert_eq!(payload["status"], "busy");
    assert_eq!(payload["currentPage"], "/bots/scraper");
    assert_eq!(payload["lastSeen"], 1_700_000_000_000_i64);
    assert_eq!(payload["cursor"], json!({"x": 12.5, "y": 40.0}));
}

#[test]
fn presence_event_survives_the_wire() {
    let envelope = Envelope::stamp(Event::Presence(sample_presence()), "session-1");
    let decoded = decode_envelope(&encode_envelope(&envelope)).expect("decode");
    assert_eq!(decoded.origin_session_id, "session-1");
    assert_eq!(Event::from_envelope(&decoded).expect("event"), Event::Presence(sample_presence()));
}

#[test]
fn presence_payload_tolerates_missing_optional_fields() {
    let event = Event::from_parts(PRESENCE, json!({"identity": "u2", "username": "bo", "status": "away"}))
        .expect("presence");
    let Event::Presence(record) = event else {
        panic!("expected presence event");
    };
    assert_eq!(record.identity(), "u2");
    assert_eq!(record.status, PresenceStatus::Away);
    assert_eq!(record.current_page, "");
    assert!(record.cursor.is_none());
    assert!(record.participant.avatar.is_none());
}

#[test]
fn known_type_with_wrong_payload_is_a_payload_error() {
    let err = Event::from_parts(PRESENCE, json!({"identity": 5})).expect_err("should fail");
    assert!(matches!(err, CodecError::Payload { kind: PRESENCE, .. }));

    let err = Event::from_parts(ACTIVITY, json!({"id": "a1", "type": "refund"})).expect_err("should fail");
    assert!(matches!(err, CodecError::Payload { kind: ACTIVITY, .. }));
}

#[test]
fn participant_left_carries_identity() {
    let event = Event::from_parts(PARTICIPANT_LEFT, json!({"identity": "u9"})).expect("left");
    assert_eq!(event, Event::ParticipantLeft { identity: "u9".to_owned() });

    let (kind, payload) = event.into_parts();
    assert_eq!(kind, PARTICIPANT_LEFT);
    assert_eq!(payload, json!({"identity": "u9"}));
}

#[test]
fn activity_record_uses_type_key() {
    let record = ActivityRecord {
        id: "a1".to_owned(),
        kind: ActivityKind::Purchase,
        actor: Participant::new("u1", "ada"),
        timestamp: 5,
        payload: json!({"bot": "scraper", "amount": 19.99}),
    };
    let (_, payload) = Event::Activity(record.clone()).into_parts();
    assert_eq!(payload["type"], "purchase");
    assert_eq!(payload["actor"]["identity"], "u1");

    let parsed = Event::from_parts(ACTIVITY, payload).expect("activity");
    assert_eq!(parsed, Event::Activity(record));
}

#[test]
fn unknown_types_pass_through_untouched() {
    let payload = json!({"text": "hello", "room": "lobby"});
    let event = Event::from_parts("chat", payload.clone()).expect("chat");
    assert_eq!(event.kind(), EventKind::Other("chat".to_owned()));
    assert_eq!(event.into_parts(), ("chat".to_owned(), payload));
}

#[test]
fn heartbeat_ignores_payload_and_sends_empty_object() {
    let event = Event::from_parts(HEARTBEAT, json!({"junk": true})).expect("heartbeat");
    assert_eq!(event, Event::Heartbeat);
    assert_eq!(event.into_parts().1, json!({}));
}

#[test]
fn event_kind_maps_known_names() {
    assert_eq!(EventKind::from_wire("presence"), EventKind::Presence);
    assert_eq!(EventKind::from_wire("participant_left"), EventKind::ParticipantLeft);
    assert_eq!(EventKind::from_wire("activity").as_str(), "activity");
    assert_eq!(EventKind::from_wire("chat").to_string(), "chat");
}

#[test]
fn status_and_kind_parse_case_insensitively() {
    assert_eq!("Away".parse::<PresenceStatus>(), Ok(PresenceStatus::Away));
    assert_eq!(" review ".parse::<ActivityKind>(), Ok(ActivityKind::Review));

    let err = "refund".parse::<ActivityKind>().expect_err("unknown kind");
    assert_eq!(err.to_string(), "unknown activity kind: refund");
}

#[test]
fn stamp_sets_wall_clock_timestamp() {
    let before = now_ms();
    let envelope = Envelope::stamp(Event::Heartbeat, "s");
    assert!(envelope.timestamp >= before);
    assert_eq!(envelope.kind, HEARTBEAT);
}
