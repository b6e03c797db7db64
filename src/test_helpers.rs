//! In-memory collaborators for unit tests: sockets, token issuer, roster.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::mpsc as fmpsc;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use wire::Inbound;

use crate::net::api::{ApiError, RosterSource, TokenSource};
use crate::net::relay::RelayHandler;
use crate::net::transport::{Connector, RelayError, RelaySocket};
use crate::net::types::{Bus, Role};

// =============================================================================
// SOCKETS
// =============================================================================

/// Server side of one in-memory socket handed out by [`MockConnector`].
pub struct MockServer {
    pub url: String,
    to_client: fmpsc::UnboundedSender<Result<Message, tungstenite::Error>>,
    from_client: fmpsc::UnboundedReceiver<Message>,
}

impl MockServer {
    pub fn send_text(&self, text: &str) {
        let _ = self.to_client.unbounded_send(Ok(Message::text(text.to_owned())));
    }

    pub fn send_json(&self, value: &serde_json::Value) {
        self.send_text(&value.to_string());
    }

    /// Send a close frame with `code`, then end the stream.
    pub fn close(self, code: u16) {
        let frame = CloseFrame { code: CloseCode::from(code), reason: String::new().into() };
        let _ = self.to_client.unbounded_send(Ok(Message::Close(Some(frame))));
    }

    /// Surface a transport error on the client's stream.
    pub fn fail(&self) {
        let _ = self
            .to_client
            .unbounded_send(Err(tungstenite::Error::ConnectionClosed));
    }

    /// Next frame the client wrote, waiting for it.
    pub async fn recv(&mut self) -> Option<Message> {
        self.from_client.next().await
    }

    /// Next text frame the client wrote, skipping control frames.
    pub async fn recv_text(&mut self) -> Option<String> {
        while let Some(message) = self.from_client.next().await {
            if let Message::Text(text) = message {
                return Some(text.as_str().to_owned());
            }
        }
        None
    }

    /// Text frames already written by the client, without waiting.
    pub fn drain_text(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(Some(message)) = self.from_client.next().now_or_never() {
            if let Message::Text(text) = message {
                out.push(text.as_str().to_owned());
            }
        }
        out
    }
}

/// `Connector` that builds sockets from `futures` channels.
///
/// Every successful connect queues a [`MockServer`] that tests pick up with
/// [`MockConnector::accept`]. Unaccepted servers stay buffered, so their
/// sockets remain open.
pub struct MockConnector {
    connects: AtomicUsize,
    urls: Mutex<Vec<String>>,
    refuse_all: AtomicBool,
    refuse_next: AtomicUsize,
    servers_tx: mpsc::UnboundedSender<MockServer>,
    servers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockServer>>,
}

impl MockConnector {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
            refuse_all: AtomicBool::new(false),
            refuse_next: AtomicUsize::new(0),
            servers_tx,
            servers_rx: tokio::sync::Mutex::new(servers_rx),
        })
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.refuse_all.store(refuse, Ordering::SeqCst);
    }

    pub fn refuse_next(&self, count: usize) {
        self.refuse_next.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Connect attempts whose URL contains `needle`.
    #[must_use]
    pub fn connects_matching(&self, needle: &str) -> usize {
        self.urls
            .lock()
            .unwrap()
            .iter()
            .filter(|url| url.contains(needle))
            .count()
    }

    /// Wait for the next successfully opened socket.
    pub async fn accept(&self) -> MockServer {
        self.servers_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector keeps its own sender alive")
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<RelaySocket, RelayError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_owned());

        let scripted = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted || self.refuse_all.load(Ordering::SeqCst) {
            return Err(RelayError::Connect(Box::new(tungstenite::Error::ConnectionClosed)));
        }

        let (to_client, client_stream) = fmpsc::unbounded();
        let (client_sink, from_client) = fmpsc::unbounded::<Message>();
        let sink = client_sink.sink_map_err(|_| tungstenite::Error::ConnectionClosed);

        let _ = self.servers_tx.send(MockServer { url: url.to_owned(), to_client, from_client });
        Ok(RelaySocket::new(Box::pin(sink), Box::pin(client_stream)))
    }
}

// =============================================================================
// HANDLER
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum HandlerEvent {
    Open,
    Message(Inbound),
    Close(Option<u16>),
    Error,
}

/// `RelayHandler` that forwards every callback into a channel.
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<HandlerEvent>,
}

impl RecordingHandler {
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<HandlerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl RelayHandler for RecordingHandler {
    fn on_message(&self, message: Inbound) {
        let _ = self.tx.send(HandlerEvent::Message(message));
    }

    fn on_open(&self) {
        let _ = self.tx.send(HandlerEvent::Open);
    }

    fn on_close(&self, code: Option<u16>) {
        let _ = self.tx.send(HandlerEvent::Close(code));
    }

    fn on_error(&self, _error: &RelayError) {
        let _ = self.tx.send(HandlerEvent::Error);
    }
}

// =============================================================================
// BACKEND
// =============================================================================

/// `TokenSource` issuing `ws://relay.test/<bus>?...` URLs.
///
/// Buses can be set to fail, and issuance can be held open with [`hold`] to
/// simulate a slow token endpoint.
///
/// [`hold`]: MockTokenSource::hold
pub struct MockTokenSource {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    gate: watch::Sender<bool>,
}

impl MockTokenSource {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self { calls: Mutex::new(Vec::new()), failing: Mutex::new(HashSet::new()), gate })
    }

    pub fn fail_for(&self, bus_id: &str, fail: bool) {
        let mut failing = self.failing.lock().unwrap();
        if fail {
            failing.insert(bus_id.to_owned());
        } else {
            failing.remove(bus_id);
        }
    }

    /// Block issuance until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    #[must_use]
    pub fn calls_for(&self, bus_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == bus_id)
            .count()
    }
}

#[async_trait::async_trait]
impl TokenSource for MockTokenSource {
    async fn relay_url(&self, bus_id: &str, role: Role) -> Result<String, ApiError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(bus_id.to_owned());
            calls.len()
        };

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        if self.failing.lock().unwrap().contains(bus_id) {
            return Err(ApiError::Status { endpoint: "/api/relay/token".into(), status: 503, body: String::new() });
        }
        Ok(format!("ws://relay.test/{bus_id}?role={role}&token=t{call}"))
    }
}

/// `RosterSource` replaying scripted results; repeats the last roster once
/// the script runs out.
pub struct MockRoster {
    script: Mutex<VecDeque<Result<Vec<Bus>, String>>>,
    last: Mutex<Vec<Bus>>,
    fetches: AtomicUsize,
}

impl MockRoster {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self { script: Mutex::new(VecDeque::new()), last: Mutex::new(Vec::new()), fetches: AtomicUsize::new(0) })
    }

    pub fn push(&self, buses: Vec<Bus>) {
        self.script.lock().unwrap().push_back(Ok(buses));
    }

    pub fn push_error(&self, message: &str) {
        self.script.lock().unwrap().push_back(Err(message.to_owned()));
    }

    #[must_use]
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RosterSource for MockRoster {
    async fn fetch_roster(&self) -> Result<Vec<Bus>, ApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(buses)) => {
                *self.last.lock().unwrap() = buses.clone();
                Ok(buses)
            }
            Some(Err(message)) => Err(ApiError::Request(message)),
            None => Ok(self.last.lock().unwrap().clone()),
        }
    }
}

// =============================================================================
// FIXTURES
// =============================================================================

/// Roster entry with a trip, a status, and an optional `lastUpdated` in epoch ms.
#[must_use]
pub fn bus(id: &str, trip: Option<&str>, status: &str, last_updated_ms: Option<i64>) -> Bus {
    let mut bus = Bus::new(id, status);
    bus.active_trip_id = trip.map(str::to_owned);
    bus.last_updated = last_updated_ms.map(|ms| json!(ms));
    bus
}

/// A `bus_location_update` frame as the relay sends it.
#[must_use]
pub fn location_frame(lat: f64, lng: f64, speed_mph: f64) -> serde_json::Value {
    json!({ "type": "bus_location_update", "lat": lat, "lng": lng, "speedMph": speed_mph, "heading": 90 })
}
