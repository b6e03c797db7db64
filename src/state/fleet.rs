//! Merged fleet roster as the dashboard renders it.
//!
//! SYSTEM CONTEXT
//! ==============
//! Three writers feed the roster, and each owns a disjoint field subset:
//!
//! - the REST poll owns membership, order, and every field the core does
//!   not reason about;
//! - the secondary listener owns `status` and `activeTripId`;
//! - the relay owns `location`, `speed` and `lastUpdated`.
//!
//! Every change goes through `FleetState::apply` with a `FleetUpdate`, which
//! dispatches to one merge function per writer. A relay update never touches
//! the liveness key fields.

#[cfg(test)]
#[path = "fleet_test.rs"]
mod fleet_test;

use serde_json::Value;
use tracing::debug;
use wire::LocationUpdate;

use crate::net::types::{Bus, BusStatus, Location, UpdateStamp, parse_timestamp_ms};

/// Non-location fields pushed by the secondary real-time listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusPatch {
    pub bus_id: String,
    pub status: BusStatus,
    pub active_trip_id: Option<String>,
}

/// One write into the fleet state.
#[derive(Clone, Debug, PartialEq)]
pub enum FleetUpdate {
    /// Full roster from the REST poll.
    Roster(Vec<Bus>),
    Status(StatusPatch),
    /// Relay position for one bus, stamped with the receive time.
    Location { bus_id: String, update: LocationUpdate, at_ms: i64 },
}

#[derive(Clone, Debug, Default)]
pub struct FleetState {
    buses: Vec<Bus>,
    /// Bus the camera follows, if any.
    follow_bus_id: Option<String>,
    camera_target: Option<Location>,
    /// Bumped on every change; consumers re-render when it moves.
    rev: u64,
    relay_updates: u64,
}

impl FleetState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn buses(&self) -> &[Bus] {
        &self.buses
    }

    #[must_use]
    pub fn bus(&self, bus_id: &str) -> Option<&Bus> {
        self.buses.iter().find(|bus| bus.id == bus_id)
    }

    #[must_use]
    pub fn follow_bus_id(&self) -> Option<&str> {
        self.follow_bus_id.as_deref()
    }

    #[must_use]
    pub fn camera_target(&self) -> Option<Location> {
        self.camera_target
    }

    #[must_use]
    pub fn rev(&self) -> u64 {
        self.rev
    }

    /// Relay location updates applied so far.
    #[must_use]
    pub fn relay_updates(&self) -> u64 {
        self.relay_updates
    }

    /// Apply one write. Returns whether anything changed.
    pub fn apply(&mut self, update: FleetUpdate) -> bool {
        let changed = match update {
            FleetUpdate::Roster(polled) => self.merge_roster(polled),
            FleetUpdate::Status(patch) => self.merge_status(&patch),
            FleetUpdate::Location { bus_id, update, at_ms } => self.merge_location(&bus_id, update, at_ms),
        };
        if changed {
            self.rev += 1;
        }
        changed
    }

    /// Start following `bus_id`; the camera jumps to its last known position.
    pub fn follow(&mut self, bus_id: &str) {
        self.camera_target = self.bus(bus_id).and_then(|bus| bus.location);
        self.follow_bus_id = Some(bus_id.to_owned());
        self.rev += 1;
    }

    pub fn unfollow(&mut self) {
        if self.follow_bus_id.take().is_some() {
            self.camera_target = None;
            self.rev += 1;
        }
    }

    // =========================================================================
    // MERGES
    // =========================================================================

    fn merge_roster(&mut self, polled: Vec<Bus>) -> bool {
        let merged: Vec<Bus> = polled
            .into_iter()
            .map(|incoming| {
                let existing = self.buses.iter().find(|bus| bus.id == incoming.id);
                merge_polled_bus(existing, incoming)
            })
            .collect();

        if merged == self.buses {
            return false;
        }
        self.buses = merged;
        true
    }

    fn merge_status(&mut self, patch: &StatusPatch) -> bool {
        let Some(bus) = self.buses.iter_mut().find(|bus| bus.id == patch.bus_id) else {
            debug!(bus_id = %patch.bus_id, "fleet: status patch for unknown bus ignored");
            return false;
        };
        if bus.status == patch.status && bus.active_trip_id == patch.active_trip_id {
            return false;
        }
        bus.status = patch.status.clone();
        bus.active_trip_id.clone_from(&patch.active_trip_id);
        true
    }

    fn merge_location(&mut self, bus_id: &str, update: LocationUpdate, at_ms: i64) -> bool {
        let Some(bus) = self.buses.iter_mut().find(|bus| bus.id == bus_id) else {
            debug!(bus_id, "fleet: relay update for unknown bus ignored");
            return false;
        };

        let location = Location { lat: update.lat, lng: update.lng, heading: update.heading };
        bus.location = Some(location);
        bus.speed = Some(update.speed_mph);
        bus.last_updated = Some(Value::from(at_ms));
        self.relay_updates += 1;

        if self.follow_bus_id.as_deref() == Some(bus_id) {
            self.camera_target = Some(location);
        }
        true
    }
}

/// Poll result for one bus, keeping relay-owned fields when the relay's
/// stamp is newer than anything the poll carries.
fn merge_polled_bus(existing: Option<&Bus>, mut polled: Bus) -> Bus {
    let Some(existing) = existing else {
        return polled;
    };
    let Some(relay_ms) = existing.last_updated.as_ref().and_then(parse_timestamp_ms) else {
        return polled;
    };

    let poll_is_older = match polled.latest_update() {
        UpdateStamp::At(polled_ms) => polled_ms < relay_ms,
        UpdateStamp::Missing | UpdateStamp::Unparseable => true,
    };
    if poll_is_older && existing.location.is_some() {
        polled.location = existing.location;
        polled.speed = existing.speed;
        polled.last_updated.clone_from(&existing.last_updated);
    }
    polled
}
