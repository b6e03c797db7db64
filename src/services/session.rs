//! Dashboard session: roster polling, liveness, pool and fleet in one owner.
//!
//! LIFECYCLE
//! =========
//! One session per dashboard view. `run_until` polls the roster on an
//! interval and drains pool events in the same `select!` loop, then disposes
//! the pool when the shutdown future resolves. Callers that drive the session
//! themselves use `poll_once` / `next_event` / `handle_pool_event` and must
//! call `dispose` (or drop the session) on the way out.
//!
//! ERROR HANDLING
//! ==============
//! A failed poll is logged and leaves the previous roster and connections in
//! place. Relay and token failures stay inside the pool.

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::pool::{ConnectionPool, PoolEvent, ReconcileSummary};
use crate::config::RelayConfig;
use crate::net::api::{ApiError, RosterSource, TokenSource};
use crate::net::transport::Connector;
use crate::net::types::now_ms;
use crate::state::fleet::{FleetState, FleetUpdate, StatusPatch};
use crate::state::liveness::{LiveBusSetTracker, LiveIds, LivenessPolicy};

/// Floor for the roster poll period.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct DashboardSession {
    roster: Arc<dyn RosterSource>,
    tracker: LiveBusSetTracker,
    pool: ConnectionPool,
    events: mpsc::UnboundedReceiver<PoolEvent>,
    fleet: FleetState,
    poll_interval: Duration,
}

impl DashboardSession {
    #[must_use]
    pub fn new(
        config: &RelayConfig,
        roster: Arc<dyn RosterSource>,
        tokens: Arc<dyn TokenSource>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (pool, events) = ConnectionPool::new(config.role, tokens, connector, config.relay);
        Self {
            roster,
            tracker: LiveBusSetTracker::new(LivenessPolicy::for_role(config.role)),
            pool,
            events,
            fleet: FleetState::new(),
            poll_interval: config.poll_interval,
        }
    }

    #[must_use]
    pub fn fleet(&self) -> &FleetState {
        &self.fleet
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    #[must_use]
    pub fn live(&self) -> LiveIds {
        self.tracker.live()
    }

    pub fn follow(&mut self, bus_id: &str) {
        self.fleet.follow(bus_id);
    }

    pub fn unfollow(&mut self) {
        self.fleet.unfollow();
    }

    /// Fetch the roster once, merge it, and reconcile connections.
    ///
    /// # Errors
    ///
    /// Returns the fetch error; the previous roster stays in place.
    pub async fn poll_once(&mut self) -> Result<ReconcileSummary, ApiError> {
        let buses = self.roster.fetch_roster().await?;
        self.fleet.apply(FleetUpdate::Roster(buses));
        Ok(self.refresh_live())
    }

    /// Merge a status change from the secondary listener.
    pub fn apply_status(&mut self, patch: StatusPatch) -> ReconcileSummary {
        if self.fleet.apply(FleetUpdate::Status(patch)) {
            self.refresh_live()
        } else {
            ReconcileSummary::default()
        }
    }

    /// Next event from the pool. Never resolves to `None` while the session lives.
    pub async fn next_event(&mut self) -> Option<PoolEvent> {
        self.events.recv().await
    }

    /// Apply one pool event; relay positions are merged into the fleet.
    /// Returns whether the fleet changed.
    pub fn handle_pool_event(&mut self, event: PoolEvent) -> bool {
        let Some((bus_id, update)) = self.pool.handle_event(event) else {
            return false;
        };
        debug!(
            bus_id = %bus_id,
            lat = update.lat,
            lng = update.lng,
            speed_mph = update.speed_mph,
            "session: location update"
        );
        self.fleet.apply(FleetUpdate::Location { bus_id, update, at_ms: now_ms() })
    }

    /// Poll and relay until `shutdown` resolves, then dispose.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let period = self.poll_interval.max(MIN_POLL_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(poll_secs = period.as_secs(), "session: started");
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, retryable = e.retryable(), "session: roster poll failed; keeping previous roster");
                    }
                }
                Some(event) = self.events.recv() => {
                    self.handle_pool_event(event);
                }
            }
        }

        self.dispose();
        info!("session: stopped");
    }

    /// Tear down every relay connection.
    pub fn dispose(&mut self) {
        self.pool.dispose();
    }

    fn refresh_live(&mut self) -> ReconcileSummary {
        let live = self.tracker.update(self.fleet.buses(), now_ms());
        self.pool.reconcile(&live)
    }
}
