//! Configuration Management Module
//!
//! Handles persistent storage of tunnel definitions and the runtime settings
//! applied to every tunnel.

pub mod storage;
pub mod types;

pub use storage::{
    app_config_file, config_dir, load_app_config, log_dir, tunnels_dir, StorageError, TunnelStore,
};
pub use types::{
    AppConfig, DefinitionError, KeepalivePolicy, TunnelConfig, TunnelDefinition, TunnelSettings,
    DEFAULT_BIND_HOST,
};
