//! Tunnel Module
//!
//! Named SSH-tunneled TCP forwarders and the registry that controls them.
//!
//! # Lifecycle
//! - `Stopped -> Starting`: relay session is dialed with retry
//! - `Starting -> Running`: listener bound, accept loop and keepalive
//!   monitor spawned
//! - `Running -> Stopping -> Stopped`: listener and session closed, every
//!   forwarding unit drained

mod error;
mod events;
mod lifecycle;
mod manager;
mod session;
mod state;

pub use error::TunnelError;
pub use events::{TunnelEvent, TunnelEventEmitter};
pub use lifecycle::{Tunnel, TunnelInfo};
pub use manager::TunnelManager;
pub use state::TunnelStatus;
