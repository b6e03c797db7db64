//! Connection pool: one relay connection per live bus.
//!
//! DESIGN
//! ======
//! `reconcile` diffs the live-id set against the pooled ids. New buses get a
//! `RelayConnection` recorded immediately, before their token fetch resolves,
//! so a rapid second pass cannot open a duplicate. Buses that left the set are
//! disconnected and removed.
//!
//! The pool is the only writer of its map. Token fetches run as spawned tasks
//! and report back through the pool's event channel as `PoolEvent::TokenReady`;
//! relay handlers forward inbound frames the same way. Every entry carries a
//! generation number, and events for a generation no longer in the map are
//! dropped. That covers a bus leaving (and possibly re-entering) the live set
//! while its token request is still in flight.
//!
//! ERROR HANDLING
//! ==============
//! A failed token fetch removes the bus from the pool and marks the pool for a
//! retry on the next reconciliation pass, even when the live set itself has
//! not changed. One bus's failure never touches any other entry.
//!
//! LIFECYCLE
//! =========
//! `dispose()` (also run on drop) aborts pending token fetches and disconnects
//! every pooled connection regardless of liveness.

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wire::{Inbound, LocationUpdate};

use crate::net::api::{ApiError, TokenSource};
use crate::net::relay::{ConnectionState, RelayConnection, RelayHandler, RelayTuning};
use crate::net::transport::{Connector, RelayError};
use crate::net::types::Role;
use crate::state::liveness::LiveIds;

/// Work reported back to the pool by its spawned tasks and relay handlers.
#[derive(Debug)]
pub enum PoolEvent {
    TokenReady { bus_id: String, generation: u64, result: Result<String, ApiError> },
    Inbound { bus_id: String, generation: u64, message: Inbound },
}

/// What one reconciliation pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub connected: Vec<String>,
    pub disconnected: Vec<String>,
}

impl ReconcileSummary {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connected.is_empty() && self.disconnected.is_empty()
    }
}

struct PoolEntry {
    generation: u64,
    connection: RelayConnection,
    /// Pending token fetch; `None` once the token arrived.
    token_task: Option<JoinHandle<()>>,
}

// =============================================================================
// HANDLER
// =============================================================================

/// Forwards one connection's relay events into the pool's channel.
struct PoolHandler {
    bus_id: String,
    generation: u64,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl RelayHandler for PoolHandler {
    fn on_message(&self, message: Inbound) {
        let _ = self.events.send(PoolEvent::Inbound {
            bus_id: self.bus_id.clone(),
            generation: self.generation,
            message,
        });
    }

    fn on_open(&self) {
        debug!(bus_id = %self.bus_id, "pool: relay open");
    }

    fn on_close(&self, code: Option<u16>) {
        debug!(bus_id = %self.bus_id, ?code, "pool: relay closed");
    }

    fn on_error(&self, error: &RelayError) {
        debug!(bus_id = %self.bus_id, error = %error, "pool: relay error");
    }
}

// =============================================================================
// POOL
// =============================================================================

pub struct ConnectionPool {
    role: Role,
    tokens: Arc<dyn TokenSource>,
    connector: Arc<dyn Connector>,
    tuning: RelayTuning,
    entries: HashMap<String, PoolEntry>,
    live_ids: LiveIds,
    retry_pending: bool,
    next_generation: u64,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl ConnectionPool {
    /// Build an empty pool plus the receiver its events arrive on. The owner
    /// must feed every received event back into [`handle_event`].
    ///
    /// [`handle_event`]: ConnectionPool::handle_event
    #[must_use]
    pub fn new(
        role: Role,
        tokens: Arc<dyn TokenSource>,
        connector: Arc<dyn Connector>,
        tuning: RelayTuning,
    ) -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let pool = Self {
            role,
            tokens,
            connector,
            tuning,
            entries: HashMap::new(),
            live_ids: LiveIds::default(),
            retry_pending: false,
            next_generation: 0,
            events,
        };
        (pool, rx)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, bus_id: &str) -> bool {
        self.entries.contains_key(bus_id)
    }

    /// State of the pooled connection for `bus_id`. A bus still waiting for its
    /// token reports `Idle`.
    #[must_use]
    pub fn connection_state(&self, bus_id: &str) -> Option<ConnectionState> {
        self.entries.get(bus_id).map(|entry| entry.connection.state())
    }

    /// Every pooled bus with its connection state, ordered by id.
    #[must_use]
    pub fn statuses(&self) -> BTreeMap<String, ConnectionState> {
        self.entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.connection.state()))
            .collect()
    }

    /// Bring the pool in line with `live`.
    ///
    /// Passing the same `Arc` as last time is a no-op unless a token fetch
    /// failed since, in which case the missing buses are retried.
    pub fn reconcile(&mut self, live: &LiveIds) -> ReconcileSummary {
        if Arc::ptr_eq(live, &self.live_ids) && !self.retry_pending {
            return ReconcileSummary::default();
        }
        self.live_ids = Arc::clone(live);
        self.retry_pending = false;

        let to_connect: Vec<String> = live
            .iter()
            .filter(|id| !self.entries.contains_key(*id))
            .cloned()
            .collect();
        let mut to_disconnect: Vec<String> = self
            .entries
            .keys()
            .filter(|id| !live.contains(*id))
            .cloned()
            .collect();
        to_disconnect.sort();

        for bus_id in &to_connect {
            self.open(bus_id);
        }
        for bus_id in &to_disconnect {
            self.close(bus_id);
        }

        let summary = ReconcileSummary { connected: to_connect, disconnected: to_disconnect };
        if !summary.is_empty() {
            info!(
                connected = ?summary.connected,
                disconnected = ?summary.disconnected,
                pooled = self.entries.len(),
                "pool: reconciled"
            );
        }
        summary
    }

    /// Apply one event from the pool's channel.
    ///
    /// Returns the location update carried by an inbound relay frame, for the
    /// owner to merge into its roster.
    pub fn handle_event(&mut self, event: PoolEvent) -> Option<(String, LocationUpdate)> {
        match event {
            PoolEvent::TokenReady { bus_id, generation, result } => {
                self.token_ready(&bus_id, generation, result);
                None
            }
            PoolEvent::Inbound { bus_id, generation, message } => {
                if !self.is_current(&bus_id, generation) {
                    debug!(bus_id = %bus_id, generation, "pool: inbound frame from retired connection dropped");
                    return None;
                }
                match message {
                    Inbound::BusLocationUpdate(update) => Some((bus_id, update)),
                    Inbound::Pong => None,
                    Inbound::Unknown { kind, .. } => {
                        debug!(bus_id = %bus_id, kind = %kind, "pool: ignoring relay frame");
                        None
                    }
                }
            }
        }
    }

    /// Disconnect and forget every pooled connection.
    pub fn dispose(&mut self) {
        let count = self.entries.len();
        for (_, mut entry) in self.entries.drain() {
            if let Some(task) = entry.token_task.take() {
                task.abort();
            }
            entry.connection.disconnect();
        }
        self.live_ids = LiveIds::default();
        self.retry_pending = false;
        if count > 0 {
            info!(disconnected = count, "pool: disposed");
        }
    }

    fn is_current(&self, bus_id: &str, generation: u64) -> bool {
        self.entries
            .get(bus_id)
            .is_some_and(|entry| entry.generation == generation)
    }

    fn open(&mut self, bus_id: &str) {
        self.next_generation += 1;
        let generation = self.next_generation;

        let tokens = Arc::clone(&self.tokens);
        let events = self.events.clone();
        let role = self.role;
        let id = bus_id.to_owned();
        let token_task = tokio::spawn(async move {
            let result = tokens.relay_url(&id, role).await;
            let _ = events.send(PoolEvent::TokenReady { bus_id: id, generation, result });
        });

        let connection = RelayConnection::new(bus_id, Arc::clone(&self.connector), self.tuning);
        self.entries.insert(
            bus_id.to_owned(),
            PoolEntry { generation, connection, token_task: Some(token_task) },
        );
        debug!(bus_id, generation, "pool: token requested");
    }

    fn close(&mut self, bus_id: &str) {
        if let Some(mut entry) = self.entries.remove(bus_id) {
            if let Some(task) = entry.token_task.take() {
                task.abort();
            }
            entry.connection.disconnect();
        }
    }

    fn token_ready(&mut self, bus_id: &str, generation: u64, result: Result<String, ApiError>) {
        if !self.is_current(bus_id, generation) {
            debug!(bus_id, generation, "pool: token for retired entry ignored");
            return;
        }

        match result {
            Ok(url) => {
                let handler = Arc::new(PoolHandler {
                    bus_id: bus_id.to_owned(),
                    generation,
                    events: self.events.clone(),
                });
                if let Some(entry) = self.entries.get_mut(bus_id) {
                    entry.token_task = None;
                    entry.connection.connect(url, handler);
                }
            }
            Err(e) => {
                warn!(bus_id, error = %e, retryable = e.retryable(), "pool: token fetch failed; will retry");
                self.entries.remove(bus_id);
                self.retry_pending = true;
            }
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.dispose();
    }
}
