//! Tunnel Definition Commands
//!
//! Create, edit and delete saved tunnels. The definition is written to disk
//! first, then the registry is brought in line with it.

use tracing::info;

use crate::config::{DefinitionError, StorageError, TunnelDefinition, TunnelStore};
use crate::tunnel::{TunnelError, TunnelManager};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("Invalid tunnel definition: {0}")]
    Invalid(#[from] DefinitionError),

    #[error("No saved tunnel named {0}")]
    NotFound(String),
}

/// Field changes for `edit_tunnel`. `None` keeps the saved value.
#[derive(Debug, Clone, Default)]
pub struct DefinitionEdit {
    pub config_name: Option<String>,
    pub remote_ip: Option<String>,
    pub remote_port: Option<String>,
    pub server_ip: Option<String>,
    pub server_port: Option<String>,
    pub user_name: Option<String>,
    pub password: Option<String>,
}

impl DefinitionEdit {
    fn apply(self, def: &mut TunnelDefinition) {
        let fields = [
            (self.config_name, &mut def.config_name),
            (self.remote_ip, &mut def.remote_ip),
            (self.remote_port, &mut def.remote_port),
            (self.server_ip, &mut def.server_ip),
            (self.server_port, &mut def.server_port),
            (self.user_name, &mut def.user_name),
            (self.password, &mut def.password),
        ];
        for (value, field) in fields {
            if let Some(value) = value {
                *field = value;
            }
        }
    }
}

/// Look up a saved definition by identifier
pub async fn find_definition(
    store: &TunnelStore,
    identifier: &str,
) -> Result<TunnelDefinition, CommandError> {
    store
        .load()
        .await?
        .into_iter()
        .find(|def| def.identifier == identifier)
        .ok_or_else(|| CommandError::NotFound(identifier.to_string()))
}

/// Validate, save and register a new tunnel.
///
/// Returns the saved definition with its assigned identifier and file name.
pub async fn create_tunnel(
    store: &TunnelStore,
    manager: &TunnelManager,
    mut def: TunnelDefinition,
) -> Result<TunnelDefinition, CommandError> {
    let config = def.to_config()?;
    if !def.identifier.is_empty() && manager.status_tunnel(&def.identifier).is_ok() {
        return Err(TunnelError::AlreadyExists(def.identifier).into());
    }

    store.save(&mut def).await?;
    manager.add_tunnel(def.identifier.clone(), config)?;
    info!("Created tunnel {} ({})", def.identifier, def.display_name());
    Ok(def)
}

/// Apply `edit` to a saved tunnel and re-register it.
///
/// A running tunnel is stopped first; it comes back `Stopped` with the new
/// settings.
pub async fn edit_tunnel(
    store: &TunnelStore,
    manager: &TunnelManager,
    identifier: &str,
    edit: DefinitionEdit,
) -> Result<TunnelDefinition, CommandError> {
    let mut def = find_definition(store, identifier).await?;
    edit.apply(&mut def);
    let config = def.to_config()?;

    store.update(&def).await?;
    unregister(manager, identifier).await?;
    manager.add_tunnel(identifier, config)?;
    info!("Updated tunnel {}", identifier);
    Ok(def)
}

/// Stop and unregister a tunnel, then delete its saved definition
pub async fn delete_tunnel(
    store: &TunnelStore,
    manager: &TunnelManager,
    identifier: &str,
) -> Result<(), CommandError> {
    let def = find_definition(store, identifier).await?;
    unregister(manager, identifier).await?;
    store.delete(&def).await?;
    info!("Deleted tunnel {}", identifier);
    Ok(())
}

// Saved but never registered (e.g. skipped at load) is fine
async fn unregister(manager: &TunnelManager, identifier: &str) -> Result<(), TunnelError> {
    match manager.remove_tunnel(identifier).await {
        Ok(()) | Err(TunnelError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
