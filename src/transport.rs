//! Transport seam between the connection state machine and the socket.
//!
//! The connection manager only ever sees [`Connector`] and [`Transport`]:
//! text out, text (or close) in. [`WebSocketConnector`] is the production
//! implementation over `tokio-tungstenite`; tests plug in an in-memory one.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {message}")]
    Connect { url: String, message: String },
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
}

/// One inbound item from an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A UTF-8 text frame.
    Text(String),
    /// Protocol-level liveness traffic (ping/pong). Never dispatched.
    Keepalive,
    /// The peer closed the connection with a close frame.
    Closed { code: Option<u16>, reason: String },
}

/// An open, bidirectional text transport.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound item. `None` means the stream ended without a close frame.
    ///
    /// Must be cancel safe: the connection driver polls it inside `select!`.
    async fn recv(&mut self) -> Option<Result<Incoming, TransportError>>;

    async fn close(&mut self);
}

/// Opens transports to an endpoint URL.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}

// =============================================================================
// WEBSOCKET
// =============================================================================

/// `ws://` / `wss://` connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, response) = connect_async(url).await.map_err(|error| TransportError::Connect {
            url: url.to_owned(),
            message: error.to_string(),
        })?;
        debug!(%url, status = %response.status(), "transport: websocket open");
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| TransportError::Send(error.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Incoming, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(error) => return Some(Err(TransportError::Receive(error.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(Incoming::Text(text.as_str().to_owned()))),
                Message::Ping(_) | Message::Pong(_) => return Some(Ok(Incoming::Keepalive)),
                Message::Close(frame) => {
                    let (code, reason) = frame.map_or((None, String::new()), |frame| {
                        (Some(u16::from(frame.code)), frame.reason.as_str().to_owned())
                    });
                    return Some(Ok(Incoming::Closed { code, reason }));
                }
                Message::Binary(bytes) => {
                    warn!(len = bytes.len(), "transport: ignoring binary frame");
                }
                Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(error) = self.stream.close(None).await {
            debug!(%error, "transport: close handshake failed");
        }
    }
}
