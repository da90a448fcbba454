//! Command Handlers
//!
//! Operations the command line drives on top of the tunnel store and the
//! tunnel manager.

pub mod tunnels;

pub use tunnels::{
    create_tunnel, delete_tunnel, edit_tunnel, find_definition, CommandError, DefinitionEdit,
};
