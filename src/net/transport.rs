//! WebSocket transport seam for relay connections.
//!
//! `Connector` is the only place a socket gets opened. Production uses
//! `WsConnector` (tokio-tungstenite); tests substitute in-memory sockets built
//! from `futures` channels.

use std::pin::Pin;

use futures::{Sink, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

/// Outbound half of an open relay socket.
pub type RelaySink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
/// Inbound half of an open relay socket.
pub type RelayStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// Errors surfaced by the relay transport.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The socket could not be opened.
    #[error("websocket connect failed: {0}")]
    Connect(Box<tungstenite::Error>),
    /// The open socket reported an I/O or protocol error.
    #[error("websocket transport error: {0}")]
    Transport(Box<tungstenite::Error>),
}

/// An open socket, already split into its two halves.
pub struct RelaySocket {
    pub sink: RelaySink,
    pub stream: RelayStream,
}

impl RelaySocket {
    #[must_use]
    pub fn new(sink: RelaySink, stream: RelayStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens relay sockets. Implementations must be cheap to share across buses.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<RelaySocket, RelayError>;
}

/// `Connector` backed by `tokio_tungstenite::connect_async`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<RelaySocket, RelayError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| RelayError::Connect(Box::new(e)))?;
        let (sink, stream) = stream.split();
        Ok(RelaySocket::new(Box::pin(sink), Box::pin(stream)))
    }
}
