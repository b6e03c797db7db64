//! Client-side relay connection manager for live bus tracking.
//!
//! ARCHITECTURE
//! ============
//! - `net`: REST client, WebSocket transport, per-bus relay connections.
//! - `state`: pure roster state (liveness tracking, fleet reducer).
//! - `services`: the connection pool and the dashboard session that drives it.
//! - `config`: environment-driven runtime configuration.

pub mod config;
pub mod net;
pub mod services;
pub mod state;

#[cfg(test)]
#[path = "test_helpers.rs"]
pub mod test_helpers;
