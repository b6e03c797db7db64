//! JSON message model for the bus relay WebSocket.
//!
//! This crate owns the text-frame representation shared by dashboard viewers
//! and driver devices. Inbound decoding is lenient about key spelling: driver
//! builds in the field emit both `lat`/`latitude` and `speedMph`/`speed`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `type` tag of a live position broadcast.
pub const BUS_LOCATION_UPDATE: &str = "bus_location_update";
/// `type` tag of a heartbeat reply.
pub const PONG: &str = "pong";

/// Error returned by [`decode_inbound`] and [`encode_outbound`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The text frame is not valid JSON (or could not be serialized).
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame parsed, but the top level is not an object.
    #[error("frame is not a json object")]
    NotAnObject,
    /// The frame has no string `type` field.
    #[error("frame has no `type` field")]
    MissingType,
    /// A typed frame is missing a field it cannot be interpreted without.
    #[error("`{kind}` frame is missing `{field}`")]
    MissingField { kind: &'static str, field: &'static str },
}

// =============================================================================
// INBOUND
// =============================================================================

/// Normalized payload of a `bus_location_update` frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub lat: f64,
    pub lng: f64,
    /// Ground speed in mph, never negative.
    pub speed_mph: f64,
    /// Heading in degrees; `0.0` when the device did not report one.
    pub heading: f64,
}

/// A frame received from the relay.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    BusLocationUpdate(LocationUpdate),
    Pong,
    /// Any other well-formed frame. Kept so consumers can log or ignore it.
    Unknown { kind: String, data: Value },
}

impl Inbound {
    /// The frame's `type` tag.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::BusLocationUpdate(_) => BUS_LOCATION_UPDATE,
            Self::Pong => PONG,
            Self::Unknown { kind, .. } => kind,
        }
    }
}

/// Decode one inbound text frame.
///
/// # Errors
///
/// Returns [`CodecError::Json`] for malformed JSON, [`CodecError::NotAnObject`]
/// or [`CodecError::MissingType`] for frames without a `type` tag, and
/// [`CodecError::MissingField`] for a location update without coordinates.
pub fn decode_inbound(text: &str) -> Result<Inbound, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    let Some(obj) = value.as_object() else {
        return Err(CodecError::NotAnObject);
    };
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingType)?;

    match kind {
        BUS_LOCATION_UPDATE => parse_location_update(&value).map(Inbound::BusLocationUpdate),
        PONG => Ok(Inbound::Pong),
        other => Ok(Inbound::Unknown { kind: other.to_owned(), data: value.clone() }),
    }
}

fn parse_location_update(payload: &Value) -> Result<LocationUpdate, CodecError> {
    let lat = pick_number(payload, &["lat", "latitude"])
        .ok_or(CodecError::MissingField { kind: BUS_LOCATION_UPDATE, field: "lat" })?;
    let lng = pick_number(payload, &["lng", "longitude"])
        .ok_or(CodecError::MissingField { kind: BUS_LOCATION_UPDATE, field: "lng" })?;
    let speed_mph = pick_number(payload, &["speedMph", "speed"])
        .unwrap_or(0.0)
        .max(0.0);
    let heading = pick_number(payload, &["heading"]).unwrap_or(0.0);

    Ok(LocationUpdate { lat, lng, speed_mph, heading })
}

/// First finite number found under any of `keys`, in order. Numeric strings count.
#[must_use]
pub fn pick_number(payload: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .find_map(|value| match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .filter(|n| n.is_finite())
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Position report sent by a driver device while a trip is running.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverLocation {
    pub trip_id: String,
    pub lat: f64,
    pub lng: f64,
    pub speed_mps: f64,
    pub heading: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
    /// Milliseconds since the Unix epoch when the fix was taken.
    pub ts: i64,
}

/// A frame sent to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Ping,
    DriverLocation(DriverLocation),
}

/// Encode an outbound frame as JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if serialization fails (non-finite floats are
/// written as `null`, so this is effectively unreachable for the built-in variants).
pub fn encode_outbound(message: &Outbound) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
