//! SSH module - relay sessions over russh
//!
//! # Features
//! - Password-authenticated client sessions
//! - direct-tcpip channels to the tunnel destination
//! - keepalive@openssh.com liveness probes
//! - `RelayConnector` / `RelaySession` seam so the forwarding engine can run
//!   against any relay implementation

mod client;
mod error;
mod handle_owner;
pub mod relay;

pub use client::{ClientHandler, RusshConnector};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use relay::{split_host_port, RelayConnector, RelayIo, RelaySession, RelayStream, RusshSession};
