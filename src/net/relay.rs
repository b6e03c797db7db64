//! Relay connection: one logical WebSocket session for one bus.
//!
//! DESIGN
//! ======
//! `RelayConnection` is a handle. `connect` spawns a driver task that owns the
//! socket and runs connect → open → (close → backoff → connect)... until it is
//! told to stop or runs out of attempts. Handle and driver share a small
//! mutex-guarded record (state, outbound queue, writer for the open socket) so
//! `send`/`is_connected` answer synchronously.
//!
//! LIFECYCLE
//! =========
//! Idle → Connecting → Open → Closing → Closed, plus Open → Connecting on any
//! close not requested through `disconnect()`. While Open a `ping` heartbeat
//! goes out every `heartbeat` (never more often than once a second). Messages
//! sent while not Open wait in a bounded queue (drop-oldest) and are flushed
//! FIFO right after the open event.
//!
//! The reconnect counter goes back to zero on the first inbound frame of a
//! session, not on open, so a relay that accepts and immediately hangs up
//! still walks the backoff ladder and hits the attempt cap.
//!
//! Each `connect` bumps an epoch. A driver only touches shared state while its
//! epoch is current, so a replaced driver winding down cannot clobber the new
//! session.
//!
//! ERROR HANDLING
//! ==============
//! Nothing here returns errors to the caller. Connect failures follow the
//! unexpected-close path, malformed inbound frames are logged and dropped,
//! socket write failures are logged (the frame is lost), and exhausting the
//! retry cap stops the driver silently.

#[cfg(test)]
#[path = "relay_test.rs"]
mod relay_test;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};
use wire::{Inbound, Outbound};

use super::transport::{Connector, RelayError, RelaySocket};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_millis(1000);
pub const DEFAULT_RECONNECT_MAX: Duration = Duration::from_millis(30_000);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 50;
/// Floor for `RelayTuning::heartbeat`; shorter values are raised to this.
pub const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

/// Timing and sizing knobs for a relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTuning {
    pub heartbeat: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub max_reconnect_attempts: u32,
    pub queue_capacity: usize,
}

impl Default for RelayTuning {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT,
            reconnect_base: DEFAULT_RECONNECT_BASE,
            reconnect_max: DEFAULT_RECONNECT_MAX,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

/// Socket readiness as seen by the handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, `connect` never called.
    #[default]
    Idle,
    /// Opening a socket, or waiting out a reconnect delay.
    Connecting,
    Open,
    /// `disconnect` called; the driver is sending the close frame.
    Closing,
    /// Terminal: disconnected, or retries exhausted.
    Closed,
}

/// Event callbacks for one relay session. Called from the driver task, in
/// arrival order; implementations must not block.
pub trait RelayHandler: Send + Sync + 'static {
    fn on_message(&self, message: Inbound);
    fn on_open(&self) {}
    fn on_close(&self, _code: Option<u16>) {}
    fn on_error(&self, _error: &RelayError) {}
}

/// Reconnect delay before attempt `attempt` (0-based): `base * 2^attempt`, capped at `max`.
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

// =============================================================================
// SHARED STATE
// =============================================================================

struct Shared {
    state: ConnectionState,
    epoch: u64,
    queue: VecDeque<String>,
    /// Writer into the open socket's send loop; `None` unless Open.
    writer: Option<mpsc::UnboundedSender<String>>,
    reconnect_attempts: u32,
    intentional_close: bool,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// HANDLE
// =============================================================================

pub struct RelayConnection {
    bus_id: String,
    tuning: RelayTuning,
    connector: Arc<dyn Connector>,
    shared: Arc<Mutex<Shared>>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl RelayConnection {
    #[must_use]
    pub fn new(bus_id: impl Into<String>, connector: Arc<dyn Connector>, tuning: RelayTuning) -> Self {
        Self {
            bus_id: bus_id.into(),
            tuning,
            connector,
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Idle,
                epoch: 0,
                queue: VecDeque::new(),
                writer: None,
                reconnect_attempts: 0,
                intentional_close: false,
            })),
            shutdown: None,
            task: None,
        }
    }

    #[must_use]
    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }

    /// Open a session to `url`. Replaces any existing socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&mut self, url: impl Into<String>, handler: Arc<dyn RelayHandler>) {
        self.signal_shutdown();

        let epoch = {
            let mut shared = lock(&self.shared);
            shared.epoch += 1;
            shared.reconnect_attempts = 0;
            shared.intentional_close = false;
            shared.writer = None;
            shared.state = ConnectionState::Connecting;
            shared.epoch
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let driver = Driver {
            bus_id: self.bus_id.clone(),
            url: url.into(),
            tuning: self.tuning,
            connector: Arc::clone(&self.connector),
            shared: Arc::clone(&self.shared),
            handler,
            epoch,
            shutdown: shutdown_rx,
        };

        debug!(bus_id = %self.bus_id, epoch, "relay: connect requested");
        self.shutdown = Some(shutdown_tx);
        self.task = Some(tokio::spawn(driver.run()));
    }

    /// Serialize and send `message`.
    ///
    /// Returns `true` only when the frame was handed to the open socket's
    /// writer. While not open the frame is queued (dropping the oldest when
    /// full) and this returns `false`. After `disconnect` frames are discarded.
    ///
    /// The write itself happens on the driver task, so `true` means accepted
    /// for delivery, not delivered: a socket error on that write is only
    /// logged, and the socket's close then takes the reconnect path.
    pub fn send(&self, message: &Outbound) -> bool {
        match wire::encode_outbound(message) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(bus_id = %self.bus_id, error = %e, "relay: outbound encode failed");
                false
            }
        }
    }

    fn send_text(&self, text: String) -> bool {
        let mut shared = lock(&self.shared);
        if shared.intentional_close {
            debug!(bus_id = %self.bus_id, "relay: send after disconnect ignored");
            return false;
        }

        if shared.state == ConnectionState::Open {
            if let Some(writer) = &shared.writer {
                if writer.send(text).is_ok() {
                    return true;
                }
                warn!(bus_id = %self.bus_id, "relay: write to open socket failed");
                return false;
            }
        }

        let capacity = self.tuning.queue_capacity.max(1);
        while shared.queue.len() >= capacity {
            shared.queue.pop_front();
            debug!(bus_id = %self.bus_id, capacity, "relay: outbound queue full; dropped oldest");
        }
        shared.queue.push_back(text);
        false
    }

    /// Close the session for good: no further reconnects, queue cleared.
    pub fn disconnect(&mut self) {
        let running = self.task.as_ref().is_some_and(|task| !task.is_finished());
        {
            let mut shared = lock(&self.shared);
            shared.intentional_close = true;
            shared.queue.clear();
            shared.writer = None;
            shared.state = if running { ConnectionState::Closing } else { ConnectionState::Closed };
        }
        self.signal_shutdown();
        info!(bus_id = %self.bus_id, "relay: disconnected");
    }

    /// Wait for the driver task to exit. Returns immediately if none is running.
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.shared).reconnect_attempts
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        lock(&self.shared).queue.len()
    }

    fn signal_shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        lock(&self.shared).intentional_close = true;
        self.signal_shutdown();
    }
}

// =============================================================================
// DRIVER
// =============================================================================

enum SessionEnd {
    /// Shutdown requested (disconnect, replacement, or dropped handle).
    Shutdown,
    /// The socket went away on its own; carries the close code if one was sent.
    Closed(Option<u16>),
}

struct Driver {
    bus_id: String,
    url: String,
    tuning: RelayTuning,
    connector: Arc<dyn Connector>,
    shared: Arc<Mutex<Shared>>,
    handler: Arc<dyn RelayHandler>,
    epoch: u64,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() || !self.mark_connecting() {
                break;
            }

            let connected = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                result = self.connector.connect(&self.url) => result,
            };

            match connected {
                Ok(socket) => match self.run_open(socket).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Closed(code) => {
                        info!(bus_id = %self.bus_id, ?code, "relay: socket closed unexpectedly");
                        self.handler.on_close(code);
                    }
                },
                Err(e) => {
                    warn!(bus_id = %self.bus_id, error = %e, "relay: connect failed");
                    self.handler.on_error(&e);
                }
            }

            if !self.wait_for_retry().await {
                break;
            }
        }

        self.finish();
    }

    /// Returns false if this driver has been superseded.
    fn mark_connecting(&self) -> bool {
        let mut shared = lock(&self.shared);
        if shared.epoch != self.epoch || shared.intentional_close {
            return false;
        }
        shared.state = ConnectionState::Connecting;
        true
    }

    /// Sleep out the backoff for the next attempt. False means stop.
    async fn wait_for_retry(&mut self) -> bool {
        let attempt = {
            let mut shared = lock(&self.shared);
            if shared.epoch != self.epoch || shared.intentional_close {
                return false;
            }
            if shared.reconnect_attempts >= self.tuning.max_reconnect_attempts {
                warn!(
                    bus_id = %self.bus_id,
                    attempts = shared.reconnect_attempts,
                    "relay: reconnect attempts exhausted; giving up"
                );
                return false;
            }
            let attempt = shared.reconnect_attempts;
            shared.reconnect_attempts += 1;
            shared.state = ConnectionState::Connecting;
            attempt
        };

        let delay = backoff_delay(attempt, self.tuning.reconnect_base, self.tuning.reconnect_max);
        info!(
            bus_id = %self.bus_id,
            attempt = attempt + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "relay: reconnect scheduled"
        );

        tokio::select! {
            biased;
            _ = self.shutdown.changed() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    async fn run_open(&mut self, socket: RelaySocket) -> SessionEnd {
        let RelaySocket { mut sink, mut stream } = socket;
        let (writer, mut outbound) = mpsc::unbounded_channel::<String>();

        // Going Open and draining the queue happen under one lock, so anything
        // sent afterwards lands in `outbound` behind the drained backlog.
        let backlog = {
            let mut shared = lock(&self.shared);
            if shared.epoch != self.epoch || shared.intentional_close {
                return SessionEnd::Shutdown;
            }
            shared.writer = Some(writer);
            shared.state = ConnectionState::Open;
            shared.queue.drain(..).collect::<Vec<_>>()
        };

        info!(bus_id = %self.bus_id, flushed = backlog.len(), "relay: open");
        self.handler.on_open();
        for text in backlog {
            if let Err(e) = sink.send(Message::text(text)).await {
                warn!(bus_id = %self.bus_id, error = %e, "relay: flush write failed");
            }
        }

        let period = self.tuning.heartbeat.max(MIN_HEARTBEAT);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heard_from_relay = false;

        let end = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    let frame = CloseFrame { code: CloseCode::Normal, reason: String::new().into() };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!(bus_id = %self.bus_id, error = %e, "relay: close frame not delivered");
                    }
                    let _ = sink.close().await;
                    break SessionEnd::Shutdown;
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Close(frame))) => break SessionEnd::Closed(frame.map(|f| u16::from(f.code))),
                    Some(Ok(message)) => {
                        if !heard_from_relay {
                            heard_from_relay = true;
                            self.reset_attempts();
                        }
                        if let Message::Text(text) = message {
                            self.dispatch(text.as_str());
                        }
                    }
                    Some(Err(e)) => {
                        let error = RelayError::Transport(Box::new(e));
                        warn!(bus_id = %self.bus_id, error = %error, "relay: transport error");
                        self.handler.on_error(&error);
                        break SessionEnd::Closed(None);
                    }
                    None => break SessionEnd::Closed(None),
                },
                Some(text) = outbound.recv() => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        warn!(bus_id = %self.bus_id, error = %e, "relay: write failed");
                    }
                }
                _ = heartbeat.tick() => {
                    if let Ok(ping) = wire::encode_outbound(&Outbound::Ping) {
                        if let Err(e) = sink.send(Message::text(ping)).await {
                            warn!(bus_id = %self.bus_id, error = %e, "relay: heartbeat write failed");
                        }
                    }
                }
            }
        };

        let mut shared = lock(&self.shared);
        if shared.epoch == self.epoch {
            shared.writer = None;
            if !shared.intentional_close {
                shared.state = ConnectionState::Connecting;
            }
        }
        end
    }

    fn reset_attempts(&self) {
        let mut shared = lock(&self.shared);
        if shared.epoch == self.epoch {
            shared.reconnect_attempts = 0;
        }
    }

    fn dispatch(&self, text: &str) {
        match wire::decode_inbound(text) {
            Ok(message) => self.handler.on_message(message),
            Err(e) => warn!(bus_id = %self.bus_id, error = %e, "relay: dropping malformed frame"),
        }
    }

    fn finish(&self) {
        let mut shared = lock(&self.shared);
        if shared.epoch == self.epoch {
            shared.writer = None;
            shared.state = ConnectionState::Closed;
        }
        debug!(bus_id = %self.bus_id, epoch = self.epoch, "relay: driver stopped");
    }
}
