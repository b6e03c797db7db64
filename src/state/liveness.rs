//! Live-bus set derivation.
//!
//! DESIGN
//! ======
//! A bus warrants a relay socket when it has an active trip, an on-trip
//! status, and a recent enough update. The policy knobs differ per viewer
//! role and are injected as one `LivenessPolicy` value.
//!
//! The tracker only re-evaluates when the liveness key of the roster changes:
//! the ordered `(id, activeTripId, status)` triples. Location, speed and
//! timestamps churn on every relay tick and must not cause reconnects, so an
//! unchanged key returns the previous set as the same `Arc`.

#[cfg(test)]
#[path = "liveness_test.rs"]
mod liveness_test;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::net::types::{Bus, BusStatus, Role, UpdateStamp};

const ADMIN_STALENESS: Duration = Duration::from_secs(30 * 60);
const STUDENT_STALENESS: Duration = Duration::from_secs(2 * 60);

pub type LiveIds = Arc<BTreeSet<String>>;

// =============================================================================
// POLICY
// =============================================================================

/// Role-specific liveness rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LivenessPolicy {
    /// Maximum age of the latest update for a bus to count as live.
    pub staleness: Duration,
    /// Statuses that count as on-trip.
    pub statuses: Vec<BusStatus>,
    /// Verdict when neither timestamp field is present.
    pub missing_timestamp_is_live: bool,
    /// Verdict when timestamps are present but none parse.
    pub unparseable_timestamp_is_live: bool,
}

impl LivenessPolicy {
    /// Tolerant: the relay is the primary freshness signal for operators.
    #[must_use]
    pub fn admin() -> Self {
        Self {
            staleness: ADMIN_STALENESS,
            statuses: vec![BusStatus::OnRoute, BusStatus::Active],
            missing_timestamp_is_live: true,
            unparseable_timestamp_is_live: true,
        }
    }

    #[must_use]
    pub fn student() -> Self {
        Self {
            staleness: STUDENT_STALENESS,
            statuses: vec![BusStatus::OnRoute],
            missing_timestamp_is_live: false,
            unparseable_timestamp_is_live: false,
        }
    }

    #[must_use]
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Admin => Self::admin(),
            Role::Student => Self::student(),
        }
    }

    /// Whether `bus` warrants a relay connection at wall-clock `now_ms`.
    ///
    /// Timestamps in the future count as fresh.
    #[must_use]
    pub fn is_live(&self, bus: &Bus, now_ms: i64) -> bool {
        if bus.trip_id().is_none() || !self.statuses.contains(&bus.status) {
            return false;
        }
        match bus.latest_update() {
            UpdateStamp::Missing => self.missing_timestamp_is_live,
            UpdateStamp::Unparseable => self.unparseable_timestamp_is_live,
            UpdateStamp::At(at_ms) => {
                let window = i64::try_from(self.staleness.as_millis()).unwrap_or(i64::MAX);
                now_ms.saturating_sub(at_ms) <= window
            }
        }
    }
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self::admin()
    }
}

// =============================================================================
// KEY
// =============================================================================

/// One roster entry's contribution to the liveness key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEntry {
    pub id: String,
    pub trip_id: Option<String>,
    pub status: BusStatus,
}

/// The ordered `(id, activeTripId, status)` triples of a roster.
#[must_use]
pub fn liveness_key(buses: &[Bus]) -> Vec<KeyEntry> {
    buses
        .iter()
        .map(|bus| KeyEntry { id: bus.id.clone(), trip_id: bus.active_trip_id.clone(), status: bus.status.clone() })
        .collect()
}

/// Ids of the live buses in `buses`.
#[must_use]
pub fn live_ids(policy: &LivenessPolicy, buses: &[Bus], now_ms: i64) -> BTreeSet<String> {
    buses
        .iter()
        .filter(|bus| policy.is_live(bus, now_ms))
        .map(|bus| bus.id.clone())
        .collect()
}

// =============================================================================
// TRACKER
// =============================================================================

/// Memoizes the live-id set on the roster's liveness key.
#[derive(Debug, Default)]
pub struct LiveBusSetTracker {
    policy: LivenessPolicy,
    last_key: Option<Vec<KeyEntry>>,
    live: LiveIds,
}

impl LiveBusSetTracker {
    #[must_use]
    pub fn new(policy: LivenessPolicy) -> Self {
        Self { policy, last_key: None, live: Arc::default() }
    }

    #[must_use]
    pub fn policy(&self) -> &LivenessPolicy {
        &self.policy
    }

    /// Current live-id set without re-evaluating.
    #[must_use]
    pub fn live(&self) -> LiveIds {
        Arc::clone(&self.live)
    }

    /// Re-evaluate against `buses` if their liveness key changed.
    ///
    /// Returns the live-id set; when the key is unchanged this is the very
    /// same `Arc` as the previous call. A changed key always produces a new
    /// `Arc`, even when the resulting set happens to be equal.
    pub fn update(&mut self, buses: &[Bus], now_ms: i64) -> LiveIds {
        let key = liveness_key(buses);
        if self.last_key.as_ref() == Some(&key) {
            return self.live();
        }

        let live = live_ids(&self.policy, buses, now_ms);
        debug!(roster = buses.len(), live = live.len(), "liveness: key changed; live set recomputed");
        self.last_key = Some(key);
        self.live = Arc::new(live);
        self.live()
    }
}
