//! Port Forwarding Module
//!
//! The forwarding engine of a tunnel: bounded accept loop plus one
//! bidirectional relay unit per accepted connection.

mod local;
mod stats;

pub use local::{bind_listener, run_accept_loop, ForwardContext, SessionSlot};
pub use stats::{ForwardStats, ForwardStatsSnapshot};
