use super::*;
use crate::test_support::{MockHandle, mock_manager, test_config};
use serde_json::json;
use tokio::time::timeout;

fn chat(n: u64) -> Event {
    Event::Other { kind: "chat".to_owned(), payload: json!({ "n": n }) }
}

fn chat_kind() -> EventKind {
    EventKind::Other("chat".to_owned())
}

fn number(envelope: &Envelope) -> u64 {
    envelope.payload["n"].as_u64().expect("numbered chat")
}

async fn wait_for(manager: &ConnectionManager, phase: Phase) -> ConnectionState {
    let mut rx = manager.watch_state();
    let state = timeout(Duration::from_secs(600), rx.wait_for(|state| state.phase == phase))
        .await
        .expect("timed out waiting for phase")
        .expect("state channel closed")
        .clone();
    state
}

async fn connected(config: ConnectionConfig) -> (ConnectionManager, MockHandle, crate::test_support::MockPeer) {
    let (manager, mut mock) = mock_manager(config);
    manager.connect().await.expect("connect");
    let peer = mock.next_peer().await;
    (manager, mock, peer)
}

/// Handler that forwards a label and the chat number for every event.
fn forward(
    tx: &mpsc::UnboundedSender<(&'static str, u64)>,
    label: &'static str,
) -> impl Fn(&Inbound) + Send + Sync + 'static {
    let tx = tx.clone();
    move |inbound: &Inbound| {
        if let Event::Other { payload, .. } = &inbound.event {
            let _ = tx.send((label, payload["n"].as_u64().unwrap_or_default()));
        }
    }
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[tokio::test(start_paused = true)]
async fn connect_reaches_connected() {
    let (manager, mock, _peer) = connected(test_config()).await;
    let state = manager.state();
    assert_eq!(state.phase, Phase::Connected);
    assert_eq!(state.reconnect_attempts, 0);
    assert_eq!(mock.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_is_idempotent() {
    let (manager, mock) = mock_manager(test_config());
    let (a, b) = tokio::join!(manager.connect(), manager.connect());
    assert_eq!(a, Ok(()));
    assert_eq!(b, Ok(()));
    assert_eq!(manager.connect().await, Ok(()));
    assert_eq!(mock.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn session_ids_are_unique_per_manager() {
    let (a, _) = mock_manager(test_config());
    let (b, _) = mock_manager(test_config());
    assert_ne!(a.session_id(), b.session_id());
    assert!(!a.session_id().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_attempts_count_up_then_reset_on_open() {
    let (manager, mut mock) = mock_manager(test_config());
    mock.fail_next(3);

    let mut rx = manager.watch_state();
    let recorder = tokio::spawn(async move {
        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            seen.push((state.phase, state.reconnect_attempts));
            if state.phase == Phase::Connected {
                break;
            }
        }
        seen
    });

    let started = Instant::now();
    let first = manager.connect().await;
    assert!(matches!(first, Err(ConnectError::Transport(_))), "got {first:?}");

    let _peer = mock.next_peer().await;
    let seen = recorder.await.expect("recorder");

    let failures: Vec<u32> = seen
        .iter()
        .filter(|(phase, _)| *phase == Phase::Disconnected)
        .map(|(_, attempts)| *attempts)
        .collect();
    assert_eq!(failures, vec![1, 2, 3]);
    assert_eq!(seen.last(), Some(&(Phase::Connected, 0)));
    assert_eq!(mock.attempts(), 4);

    // 1s + 2s + 4s of backoff.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(7) && elapsed < Duration::from_secs(8), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts_until_explicit_connect() {
    let config = ConnectionConfig { max_reconnect_attempts: 3, ..test_config() };
    let (manager, mut mock) = mock_manager(config);
    mock.fail_next(100);

    assert!(manager.connect().await.is_err());
    let state = wait_for(&manager, Phase::Failed).await;
    assert_eq!(state.reconnect_attempts, 3);
    assert!(matches!(state.last_disconnect, Some(DisconnectReason::TransportError { .. })));
    assert_eq!(mock.attempts(), 3);

    // Stays failed.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(mock.attempts(), 3);
    assert_eq!(manager.state().phase, Phase::Failed);

    mock.fail_next(0);
    manager.connect().await.expect("explicit connect");
    let _peer = mock.next_peer().await;
    assert_eq!(manager.state().reconnect_attempts, 0);
    assert_eq!(mock.attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn connect_during_backoff_skips_the_delay() {
    let (manager, mut mock) = mock_manager(test_config());
    mock.fail_next(1);

    assert!(manager.connect().await.is_err());
    assert_eq!(manager.state().phase, Phase::Disconnected);
    assert_eq!(manager.state().reconnect_attempts, 1);

    let started = Instant::now();
    manager.connect().await.expect("reconnect");
    assert!(started.elapsed() < Duration::from_secs(1));
    let _peer = mock.next_peer().await;
    assert_eq!(mock.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn connect_during_backoff_reenables_auto_reconnect() {
    let (manager, mut mock) = mock_manager(test_config());
    mock.fail_next(1);
    assert!(manager.connect().await.is_err());
    manager.set_auto_reconnect(false);

    let pending = manager.connect();
    tokio::pin!(pending);
    assert!(futures_util::poll!(pending.as_mut()).is_pending());
    let state = manager.state();
    assert_eq!(state.phase, Phase::Disconnected);
    assert_eq!(state.reconnect_attempts, 0);
    assert_eq!(manager.watch_state().borrow().reconnect_attempts, 0);

    timeout(Duration::from_secs(600), pending).await.expect("connect resolves").expect("reconnect");
    let peer = mock.next_peer().await;
    assert_eq!(mock.attempts(), 2);

    peer.drop_connection();
    wait_for(&manager, Phase::Disconnected).await;
    let _peer = mock.next_peer().await;
    assert_eq!(wait_for(&manager, Phase::Connected).await.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn turning_off_auto_reconnect_cancels_a_pending_connect() {
    let (manager, mock) = mock_manager(test_config());
    mock.fail_next(1);
    assert!(manager.connect().await.is_err());

    let pending = manager.connect();
    tokio::pin!(pending);
    assert!(futures_util::poll!(pending.as_mut()).is_pending());
    manager.set_auto_reconnect(false);

    let result = timeout(Duration::from_secs(600), pending).await.expect("connect resolves");
    assert_eq!(result, Err(ConnectError::Cancelled));
    assert_eq!(manager.state().phase, Phase::Disconnected);
    assert_eq!(mock.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_session_reconnects_at_base_delay() {
    let (manager, mut mock, peer) = connected(test_config()).await;
    peer.drop_connection();

    let state = wait_for(&manager, Phase::Disconnected).await;
    assert_eq!(state.last_disconnect, Some(DisconnectReason::StreamEnded));
    assert_eq!(state.reconnect_attempts, 0);

    let started = Instant::now();
    let _peer = mock.next_peer().await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2), "{elapsed:?}");
    assert_eq!(wait_for(&manager, Phase::Connected).await.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn server_close_is_recorded_as_clean() {
    let (manager, mut mock, peer) = connected(test_config()).await;
    peer.close_with(1000, "bye");

    let state = wait_for(&manager, Phase::Disconnected).await;
    let reason = state.last_disconnect.expect("reason");
    assert_eq!(reason, DisconnectReason::ServerClosed { code: Some(1000), reason: "bye".to_owned() });
    assert!(reason.is_clean());

    let _again = mock.next_peer().await;
    assert_eq!(mock.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_reconnecting_and_keeps_the_queue() {
    let (manager, mut mock, _peer) = connected(test_config()).await;
    manager.disconnect();

    let state = manager.state();
    assert_eq!(state.phase, Phase::Disconnected);
    assert_eq!(state.last_disconnect, Some(DisconnectReason::LocalRequest));

    manager.send(chat(7)).expect("queued");
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(mock.attempts(), 1);
    assert_eq!(manager.queued_len(), 1);

    manager.connect().await.expect("connect again");
    let mut peer = mock.next_peer().await;
    assert_eq!(number(&peer.next_message().await), 7);
    assert_eq!(manager.queued_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn auto_reconnect_off_leaves_connection_down() {
    let (manager, mock, peer) = connected(test_config()).await;
    manager.set_auto_reconnect(false);
    peer.close_with(1001, "going away");

    wait_for(&manager, Phase::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(mock.attempts(), 1);
    assert_eq!(manager.state().phase, Phase::Disconnected);
}

// =============================================================================
// OUTBOUND
// =============================================================================

#[tokio::test(start_paused = true)]
async fn sends_while_connected_arrive_in_order_and_stamped() {
    let (manager, _mock, mut peer) = connected(test_config()).await;
    for n in 1..=5 {
        manager.send(chat(n)).expect("send");
    }
    for n in 1..=5 {
        let envelope = peer.next_message().await;
        assert_eq!(envelope.kind, "chat");
        assert_eq!(number(&envelope), n);
        assert_eq!(envelope.origin_session_id, manager.session_id());
        assert!(envelope.timestamp > 0);
    }
}

#[tokio::test(start_paused = true)]
async fn sends_before_connect_flush_in_order() {
    let (manager, mut mock) = mock_manager(test_config());
    for n in 1..=3 {
        manager.send(chat(n)).expect("queue");
    }
    assert_eq!(manager.queued_len(), 3);

    manager.connect().await.expect("connect");
    let mut peer = mock.next_peer().await;
    manager.send(chat(4)).expect("send");

    for n in 1..=4 {
        assert_eq!(number(&peer.next_message().await), n);
    }
    assert_eq!(manager.queued_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn queue_survives_a_dropped_session() {
    let (manager, mut mock, peer) = connected(test_config()).await;
    peer.drop_connection();
    wait_for(&manager, Phase::Disconnected).await;

    manager.send(chat(1)).expect("queue");
    manager.send(chat(2)).expect("queue");

    let mut peer = mock.next_peer().await;
    assert_eq!(number(&peer.next_message().await), 1);
    assert_eq!(number(&peer.next_message().await), 2);
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_new_envelopes() {
    let config = ConnectionConfig { queue_capacity: 2, ..test_config() };
    let (manager, mut mock) = mock_manager(config);

    manager.send(chat(1)).expect("queue");
    manager.send(chat(2)).expect("queue");
    assert_eq!(manager.send(chat(3)), Err(SendError::QueueFull { capacity: 2 }));

    manager.connect().await.expect("connect");
    let mut peer = mock.next_peer().await;
    assert_eq!(number(&peer.next_message().await), 1);
    assert_eq!(number(&peer.next_message().await), 2);
    peer.expect_silence(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn full_queue_can_drop_oldest() {
    let config = ConnectionConfig { queue_capacity: 2, overflow: OverflowPolicy::DropOldest, ..test_config() };
    let (manager, mut mock) = mock_manager(config);

    for n in 1..=3 {
        manager.send(chat(n)).expect("queue");
    }
    assert_eq!(manager.queued_len(), 2);

    manager.connect().await.expect("connect");
    let mut peer = mock.next_peer().await;
    assert_eq!(number(&peer.next_message().await), 2);
    assert_eq!(number(&peer.next_message().await), 3);
}

#[tokio::test(start_paused = true)]
async fn clear_queue_discards_pending_envelopes() {
    let (manager, _mock) = mock_manager(test_config());
    manager.send(chat(1)).expect("queue");
    manager.send(chat(2)).expect("queue");
    assert_eq!(manager.clear_queue(), 2);
    assert_eq!(manager.queued_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn heartbeats_follow_the_interval_and_are_never_queued() {
    let config = ConnectionConfig { heartbeat_interval: Duration::from_secs(30), ..test_config() };

    let (idle, _idle_mock) = mock_manager(config.clone());
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(idle.queued_len(), 0);

    let (manager, _mock, mut peer) = connected(config).await;
    let started = Instant::now();
    let heartbeat = peer.next_envelope().await;
    assert_eq!(heartbeat.kind, envelopes::HEARTBEAT);
    assert_eq!(heartbeat.origin_session_id, manager.session_id());
    assert!(started.elapsed() >= Duration::from_secs(30));

    let next = peer.next_envelope().await;
    assert_eq!(next.kind, envelopes::HEARTBEAT);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(60) && elapsed < Duration::from_secs(61), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn silent_server_trips_liveness_timeout() {
    let config = ConnectionConfig { liveness_timeout: Some(Duration::from_secs(10)), ..test_config() };
    let (manager, mut mock, peer) = connected(config).await;

    tokio::time::sleep(Duration::from_secs(8)).await;
    peer.push_keepalive();
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(manager.state().phase, Phase::Connected);

    let state = wait_for(&manager, Phase::Disconnected).await;
    assert_eq!(state.last_disconnect, Some(DisconnectReason::LivenessTimeout));
    assert!(!DisconnectReason::LivenessTimeout.is_clean());

    let _again = mock.next_peer().await;
    assert_eq!(mock.attempts(), 2);
}

// =============================================================================
// INBOUND
// =============================================================================

#[tokio::test(start_paused = true)]
async fn handlers_run_in_order_until_unsubscribed() {
    let (manager, _mock, peer) = connected(test_config()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let first = manager.on(chat_kind(), forward(&tx, "first"));
    let _second = manager.on(chat_kind(), forward(&tx, "second"));

    peer.push_event(chat(1), "peer-session");
    assert_eq!(rx.recv().await, Some(("first", 1)));
    assert_eq!(rx.recv().await, Some(("second", 1)));

    assert!(first.unsubscribe());
    peer.push_event(chat(2), "peer-session");
    peer.push_event(chat(3), "peer-session");
    assert_eq!(rx.recv().await, Some(("second", 2)));
    assert_eq!(rx.recv().await, Some(("second", 3)));
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped() {
    let (manager, _mock, peer) = connected(test_config()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = manager.on(chat_kind(), forward(&tx, "chat"));

    peer.push_text("not json at all");
    peer.push_text(r#"{"payload":{"n":1}}"#);
    peer.push_text(r#"{"type":"presence","payload":{"status":"online"}}"#);
    peer.push_event(chat(4), "peer-session");

    assert_eq!(rx.recv().await, Some(("chat", 4)));
    assert_eq!(manager.state().phase, Phase::Connected);
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_does_not_stop_delivery() {
    let (manager, _mock, peer) = connected(test_config()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _boom = manager.on(chat_kind(), |_: &Inbound| panic!("handler bug"));
    let _ok = manager.on(chat_kind(), forward(&tx, "ok"));

    peer.push_event(chat(1), "peer-session");
    peer.push_event(chat(2), "peer-session");
    assert_eq!(rx.recv().await, Some(("ok", 1)));
    assert_eq!(rx.recv().await, Some(("ok", 2)));
    assert_eq!(manager.state().phase, Phase::Connected);
}

#[tokio::test(start_paused = true)]
async fn inbound_keeps_envelope_metadata() {
    let (manager, _mock, peer) = connected(test_config()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = manager.on(EventKind::ParticipantLeft, move |inbound: &Inbound| {
        let _ = tx.send(inbound.clone());
    });

    peer.push_event(Event::ParticipantLeft { identity: "u9".to_owned() }, "peer-session");
    let inbound = rx.recv().await.expect("inbound");
    assert_eq!(inbound.origin_session_id, "peer-session");
    assert_eq!(inbound.event, Event::ParticipantLeft { identity: "u9".to_owned() });
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_the_driver_to_close() {
    let (manager, mock, mut peer) = connected(test_config()).await;
    manager.send(chat(1)).expect("send");
    manager.shutdown().await;

    assert_eq!(number(&peer.next_message().await), 1);
    assert_eq!(manager.state().phase, Phase::Disconnected);
    assert_eq!(mock.attempts(), 1);

    // Nothing left to stop.
    manager.shutdown().await;
}
