//! Roster DTOs shared by the REST client, the liveness tracker and the fleet
//! reducer.
//!
//! DESIGN
//! ======
//! `Bus` keeps only the fields the relay core reasons about as typed fields;
//! everything else the backend sends rides along in `extra` so a round trip
//! through the core never drops data it does not own.

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::config::ConfigError;

/// Numbers below this magnitude are read as epoch seconds, above as epoch milliseconds.
const EPOCH_SECONDS_CUTOFF: f64 = 100_000_000_000.0;

// =============================================================================
// ROLE
// =============================================================================

/// Who is viewing the dashboard. Selects the liveness policy and the token scope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Role {
    #[default]
    Admin,
    Student,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Student => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "student" => Ok(Self::Student),
            other => Err(ConfigError::UnknownRole(other.to_owned())),
        }
    }
}

// =============================================================================
// BUS STATUS
// =============================================================================

/// Fleet status of a bus. Unrecognized values are passed through verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BusStatus {
    Active,
    OnRoute,
    Maintenance,
    Other(String),
}

impl BusStatus {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "ACTIVE",
            Self::OnRoute => "ON_ROUTE",
            Self::Maintenance => "MAINTENANCE",
            Self::Other(raw) => raw,
        }
    }
}

impl Default for BusStatus {
    fn default() -> Self {
        Self::Other(String::new())
    }
}

impl From<String> for BusStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "ACTIVE" => Self::Active,
            "ON_ROUTE" => Self::OnRoute,
            "MAINTENANCE" => Self::Maintenance,
            _ => Self::Other(raw),
        }
    }
}

impl From<&str> for BusStatus {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_owned())
    }
}

impl From<BusStatus> for String {
    fn from(status: BusStatus) -> Self {
        match status {
            BusStatus::Other(raw) => raw,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for BusStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// BUS
// =============================================================================

/// Last known position of a bus.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(alias = "latitude")]
    pub lat: f64,
    #[serde(alias = "longitude")]
    pub lng: f64,
    /// Degrees clockwise from north.
    #[serde(default)]
    pub heading: f64,
}

/// One entry of the fleet roster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bus {
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_status")]
    pub status: BusStatus,
    #[serde(default)]
    pub active_trip_id: Option<String>,
    /// Raw timestamp as the backend sent it; see [`parse_timestamp_ms`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_location_update: Option<Value>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub speed: Option<f64>,
    /// Fields the relay core does not own (plate, driver, route, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn deserialize_status<'de, D>(deserializer: D) -> Result<BusStatus, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?
        .map(BusStatus::from)
        .unwrap_or_default())
}

/// Outcome of reading a bus's freshness timestamps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateStamp {
    /// Neither timestamp field is present.
    Missing,
    /// At least one timestamp is present but none could be parsed.
    Unparseable,
    /// Most recent parseable timestamp, epoch milliseconds.
    At(i64),
}

impl Bus {
    /// Minimal roster entry, mostly for tests and fixtures.
    #[must_use]
    pub fn new(id: impl Into<String>, status: impl Into<BusStatus>) -> Self {
        Self {
            id: id.into(),
            status: status.into(),
            active_trip_id: None,
            last_updated: None,
            last_location_update: None,
            location: None,
            speed: None,
            extra: Map::new(),
        }
    }

    /// Active trip id, treating an empty or whitespace-only string as absent.
    #[must_use]
    pub fn trip_id(&self) -> Option<&str> {
        self.active_trip_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
    }

    /// Latest of `lastUpdated` and `lastLocationUpdate`.
    #[must_use]
    pub fn latest_update(&self) -> UpdateStamp {
        let present = [&self.last_updated, &self.last_location_update]
            .into_iter()
            .flatten()
            .filter(|v| !v.is_null())
            .collect::<Vec<_>>();
        if present.is_empty() {
            return UpdateStamp::Missing;
        }
        present
            .into_iter()
            .filter_map(parse_timestamp_ms)
            .max()
            .map_or(UpdateStamp::Unparseable, UpdateStamp::At)
    }
}

// =============================================================================
// TIMESTAMPS
// =============================================================================

/// Parse a backend timestamp into epoch milliseconds.
///
/// Accepts RFC 3339 strings, epoch seconds or milliseconds (as numbers or
/// numeric strings), and Firestore `{_seconds,_nanoseconds}` /
/// `{seconds,nanoseconds}` objects.
#[must_use]
pub fn parse_timestamp_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_f64().and_then(epoch_number_to_ms),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<f64>() {
                return epoch_number_to_ms(n);
            }
            let parsed = OffsetDateTime::parse(s, &Rfc3339).ok()?;
            i64::try_from(parsed.unix_timestamp_nanos() / 1_000_000).ok()
        }
        Value::Object(obj) => {
            let seconds = obj
                .get("_seconds")
                .or_else(|| obj.get("seconds"))
                .and_then(Value::as_i64)?;
            let nanos = obj
                .get("_nanoseconds")
                .or_else(|| obj.get("nanoseconds"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            seconds.checked_mul(1000)?.checked_add(nanos / 1_000_000)
        }
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn epoch_number_to_ms(n: f64) -> Option<i64> {
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    let ms = if n < EPOCH_SECONDS_CUTOFF { n * 1000.0 } else { n };
    if ms > i64::MAX as f64 {
        return None;
    }
    Some(ms.round() as i64)
}

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}
