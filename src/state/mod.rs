//! Client-side roster state.
//!
//! SYSTEM CONTEXT
//! ==============
//! Pure data and reducers with no I/O: the liveness tracker decides which
//! buses deserve a relay socket, the fleet state holds the merged roster the
//! dashboard renders.

pub mod fleet;
pub mod liveness;
