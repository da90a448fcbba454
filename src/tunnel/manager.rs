//! Tunnel Manager
//!
//! Registry of named tunnels. Every registry mutation and lookup goes through
//! one lock; the lock is never held across a connect, a bind or a drain.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::error::TunnelError;
use super::events::{TunnelEvent, TunnelEventEmitter};
use super::lifecycle::{Tunnel, TunnelInfo};
use super::state::TunnelStatus;
use crate::config::{TunnelConfig, TunnelDefinition, TunnelSettings};
use crate::ssh::RelayConnector;

/// Tunnel manager
///
/// Owned by the composition root and shared by reference (or `Arc`) with
/// every caller. Safe for concurrent use.
pub struct TunnelManager {
    tunnels: Mutex<HashMap<String, Arc<Tunnel>>>,
    connector: Arc<dyn RelayConnector>,
    settings: TunnelSettings,
    events: TunnelEventEmitter,
}

impl TunnelManager {
    pub fn new(connector: Arc<dyn RelayConnector>, settings: TunnelSettings) -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
            connector,
            settings,
            events: TunnelEventEmitter::new(),
        }
    }

    /// Subscribe to lifecycle events of every tunnel
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Register a new tunnel in the `Stopped` state
    pub fn add_tunnel(
        &self,
        identifier: impl Into<String>,
        config: TunnelConfig,
    ) -> Result<(), TunnelError> {
        let identifier = identifier.into();
        let mut tunnels = self.tunnels.lock();
        if tunnels.contains_key(&identifier) {
            return Err(TunnelError::AlreadyExists(identifier));
        }

        let tunnel = Tunnel::new(
            identifier.clone(),
            config,
            self.settings.clone(),
            self.connector.clone(),
            self.events.clone(),
        );
        info!("Registered tunnel {}", identifier);
        tunnels.insert(identifier, Arc::new(tunnel));
        Ok(())
    }

    /// Register every valid definition, skipping invalid and duplicate ones.
    ///
    /// Returns the number of tunnels registered.
    pub fn load_definitions(&self, definitions: &[TunnelDefinition]) -> usize {
        let mut registered = 0;
        for def in definitions {
            if def.identifier.trim().is_empty() {
                warn!("Skipping tunnel definition {} without identifier", def.display_name());
                continue;
            }

            let config = match def.to_config() {
                Ok(config) => config,
                Err(source) => {
                    let err = TunnelError::InvalidDefinition {
                        identifier: def.identifier.clone(),
                        source,
                    };
                    warn!("Skipping tunnel definition: {}", err);
                    continue;
                }
            };

            match self.add_tunnel(def.identifier.clone(), config) {
                Ok(()) => registered += 1,
                Err(e) => warn!("Skipping tunnel definition: {}", e),
            }
        }
        info!("Loaded {} of {} tunnel definition(s)", registered, definitions.len());
        registered
    }

    fn lookup(&self, identifier: &str) -> Result<Arc<Tunnel>, TunnelError> {
        self.tunnels
            .lock()
            .get(identifier)
            .cloned()
            .ok_or_else(|| TunnelError::NotFound(identifier.to_string()))
    }

    /// Start a tunnel and wait for the outcome.
    ///
    /// The start runs on its own task so it completes even if the caller
    /// goes away.
    pub async fn start_tunnel(&self, identifier: &str) -> Result<(), TunnelError> {
        loop {
            let tunnel = self.lookup(identifier)?;
            let starting = tunnel.clone();
            let result = tokio::spawn(async move { starting.start().await })
                .await
                .map_err(|e| TunnelError::TaskFailed(e.to_string()))?;

            // Lost a race with stop_tunnel swapping the entry; use the new one
            if matches!(result, Err(TunnelError::NotFound(_))) && tunnel.is_retired() {
                debug!("Tunnel {} was replaced during start, retrying", identifier);
                continue;
            }
            return result;
        }
    }

    /// Stop a tunnel and replace its registry entry with a fresh `Stopped`
    /// tunnel built from the same configuration.
    pub async fn stop_tunnel(&self, identifier: &str) -> Result<(), TunnelError> {
        let tunnel = self.lookup(identifier)?;
        let stopping = tunnel.clone();
        tokio::spawn(async move { stopping.stop().await })
            .await
            .map_err(|e| TunnelError::TaskFailed(e.to_string()))?;

        let mut tunnels = self.tunnels.lock();
        // Only swap the exact tunnel we stopped, and only if nobody restarted
        // it in the meantime
        let still_current = tunnels
            .get(identifier)
            .is_some_and(|current| Arc::ptr_eq(current, &tunnel));
        if still_current && tunnel.try_retire() {
            tunnels.insert(identifier.to_string(), Arc::new(tunnel.successor()));
            debug!("Replaced registry entry for stopped tunnel {}", identifier);
        }
        Ok(())
    }

    /// Stop a tunnel and drop it from the registry
    pub async fn remove_tunnel(&self, identifier: &str) -> Result<(), TunnelError> {
        let tunnel = self.lookup(identifier)?;
        tokio::spawn(async move { tunnel.stop().await })
            .await
            .map_err(|e| TunnelError::TaskFailed(e.to_string()))?;

        let mut tunnels = self.tunnels.lock();
        let retired = match tunnels.get(identifier) {
            Some(current) => current.try_retire(),
            None => return Ok(()),
        };
        if !retired {
            // Restarted by another caller after our stop
            return Err(TunnelError::AlreadyActive(identifier.to_string()));
        }
        tunnels.remove(identifier);
        info!("Removed tunnel {}", identifier);
        Ok(())
    }

    pub fn status_tunnel(&self, identifier: &str) -> Result<TunnelStatus, TunnelError> {
        self.tunnels
            .lock()
            .get(identifier)
            .map(|t| t.status())
            .ok_or_else(|| TunnelError::NotFound(identifier.to_string()))
    }

    pub fn tunnel_info(&self, identifier: &str) -> Result<TunnelInfo, TunnelError> {
        self.lookup(identifier).map(|t| t.info())
    }

    /// Info of every registered tunnel, ordered by identifier
    pub fn list_tunnels(&self) -> Vec<TunnelInfo> {
        let tunnels: Vec<Arc<Tunnel>> = self.tunnels.lock().values().cloned().collect();
        let mut infos: Vec<TunnelInfo> = tunnels.iter().map(|t| t.info()).collect();
        infos.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        infos
    }

    /// Stop every registered tunnel concurrently. Entries stay registered.
    pub async fn stop_all(&self) {
        let tunnels: Vec<Arc<Tunnel>> = self.tunnels.lock().values().cloned().collect();
        info!("Stopping {} tunnel(s)", tunnels.len());

        let handles = tunnels.into_iter().map(|tunnel| {
            tokio::spawn(async move {
                tunnel.stop().await;
            })
        });

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Tunnel stop task failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("tunnels", &self.tunnels.lock().len())
            .field("settings", &self.settings)
            .finish()
    }
}
