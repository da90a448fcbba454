//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::error::SshError;
use super::handle_owner::spawn_handle_owner_task;
use super::relay::{RelayConnector, RelaySession, RusshSession};
use crate::config::TunnelConfig;

/// Transport-level keepalive sent by russh itself
const TRANSPORT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Missed transport keepalives before russh drops the session
const TRANSPORT_KEEPALIVE_MAX: usize = 3;

/// Connects to relay hosts with password authentication
#[derive(Debug, Clone, Default)]
pub struct RusshConnector;

impl RusshConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RelayConnector for RusshConnector {
    async fn connect(
        &self,
        tunnel_id: &str,
        config: &TunnelConfig,
        handshake_timeout: Duration,
    ) -> Result<Arc<dyn RelaySession>, SshError> {
        info!("[{}] Connecting to SSH relay at {}", tunnel_id, config.server_addr);

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(TRANSPORT_KEEPALIVE_INTERVAL),
            keepalive_max: TRANSPORT_KEEPALIVE_MAX,
            ..Default::default()
        };

        let handler = ClientHandler::new(config.server_addr.clone());

        // The timeout covers TCP connect, key exchange and authentication
        let handle = tokio::time::timeout(handshake_timeout, async {
            let mut handle =
                client::connect(Arc::new(ssh_config), config.server_addr.as_str(), handler)
                    .await
                    .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

            debug!("[{}] SSH handshake completed", tunnel_id);

            let authenticated = handle
                .authenticate_password(&config.username, &config.password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

            if !authenticated.success() {
                return Err(SshError::AuthenticationFailed(
                    "Authentication rejected by server".to_string(),
                ));
            }

            Ok(handle)
        })
        .await
        .map_err(|_| {
            SshError::Timeout(format!(
                "SSH handshake with {} exceeded {}s",
                config.server_addr,
                handshake_timeout.as_secs()
            ))
        })??;

        info!("[{}] SSH authentication successful", tunnel_id);

        let controller = spawn_handle_owner_task(handle, tunnel_id.to_string());
        Ok(Arc::new(RusshSession::new(controller)))
    }
}

/// Client handler for russh callbacks.
///
/// Host keys are accepted without pinning; relays are trusted by address.
pub struct ClientHandler {
    server_addr: String,
}

impl ClientHandler {
    pub fn new(server_addr: String) -> Self {
        Self { server_addr }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        warn!(
            "Accepting unverified host key for {} ({})",
            self.server_addr,
            server_public_key.algorithm()
        );
        Ok(true)
    }
}
