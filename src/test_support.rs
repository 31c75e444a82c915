//! In-memory transport for exercising the connection state machine.
//!
//! `MockConnector` fails the next N attempts on request and otherwise hands
//! the test a [`MockPeer`] for every accepted connection: the server end of
//! an in-memory socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use envelopes::{Envelope, Event, decode_envelope, encode_envelope};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::ConnectionConfig;
use crate::connection::ConnectionManager;
use crate::transport::{Connector, Incoming, Transport, TransportError};

pub(crate) const TEST_URL: &str = "ws://mock.test/live";

/// Deterministic config: no jitter, 1s base delay, quiet heartbeats.
pub(crate) fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        jitter: 0.0,
        heartbeat_interval: Duration::from_secs(3600),
        ..ConnectionConfig::new(TEST_URL)
    }
}

pub(crate) struct MockHandle {
    pub failures: Arc<AtomicUsize>,
    pub attempts: Arc<AtomicUsize>,
    pub peers: mpsc::UnboundedReceiver<MockPeer>,
}

impl MockHandle {
    /// Make the next `n` connection attempts fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the next accepted connection.
    pub async fn next_peer(&mut self) -> MockPeer {
        timeout(Duration::from_secs(600), self.peers.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }
}

pub(crate) fn mock_manager(config: ConnectionConfig) -> (ConnectionManager, MockHandle) {
    let (peers_tx, peers) = mpsc::unbounded_channel();
    let connector = MockConnector {
        failures: Arc::new(AtomicUsize::new(0)),
        attempts: Arc::new(AtomicUsize::new(0)),
        peers: peers_tx,
    };
    let handle = MockHandle {
        failures: Arc::clone(&connector.failures),
        attempts: Arc::clone(&connector.attempts),
        peers,
    };
    (ConnectionManager::with_connector(config, connector), handle)
}

struct MockConnector {
    failures: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransportError::Connect { url: url.to_owned(), message: "connection refused".to_owned() });
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let _ = self.peers.send(MockPeer { sent: outbound_rx, inbound: inbound_tx });
        Ok(Box::new(MockTransport { outbound: outbound_tx, inbound: inbound_rx }))
    }
}

struct MockTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<Incoming>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(text)
            .map_err(|_| TransportError::Send("peer gone".to_owned()))
    }

    async fn recv(&mut self) -> Option<Result<Incoming, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Server side of one mock connection.
pub(crate) struct MockPeer {
    sent: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<Incoming>,
}

impl MockPeer {
    /// Next envelope the client transmitted, heartbeats included.
    pub async fn next_envelope(&mut self) -> Envelope {
        let text = timeout(Duration::from_secs(600), self.sent.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("client transport dropped");
        decode_envelope(&text).expect("client sent a malformed frame")
    }

    /// Next envelope the client transmitted, skipping heartbeats.
    pub async fn next_message(&mut self) -> Envelope {
        loop {
            let envelope = self.next_envelope().await;
            if envelope.kind != envelopes::HEARTBEAT {
                return envelope;
            }
        }
    }

    /// Assert nothing but heartbeats arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        let result = timeout(window, self.next_message()).await;
        assert!(result.is_err(), "unexpected frame: {:?}", result.ok());
    }

    pub fn push_text(&self, text: &str) {
        let _ = self.inbound.send(Incoming::Text(text.to_owned()));
    }

    /// Deliver an event as if another session had sent it.
    pub fn push_event(&self, event: Event, origin_session_id: &str) {
        let envelope = Envelope::stamp(event, origin_session_id);
        self.push_text(&encode_envelope(&envelope));
    }

    pub fn push_keepalive(&self) {
        let _ = self.inbound.send(Incoming::Keepalive);
    }

    /// Close with a close frame (clean).
    pub fn close_with(&self, code: u16, reason: &str) {
        let _ = self.inbound.send(Incoming::Closed { code: Some(code), reason: reason.to_owned() });
    }

    /// Drop the connection without a close frame.
    pub fn drop_connection(self) {}
}
