//! Stateful services built on the network edge and the roster state.
//!
//! ARCHITECTURE
//! ============
//! `pool` owns the per-bus relay connections; `session` owns a pool together
//! with the roster poller, liveness tracker and fleet state for one view.

pub mod pool;
pub mod session;
