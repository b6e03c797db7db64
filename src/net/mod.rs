//! Network edge: REST client, WebSocket transport, and relay connections.
//!
//! ARCHITECTURE
//! ============
//! `api` and `transport` are the seams to the outside world. `relay` drives
//! one bus's socket on top of `transport`; the pool in `services` owns the
//! relay handles.

pub mod api;
pub mod relay;
pub mod transport;
pub mod types;
