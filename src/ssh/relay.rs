//! Relay capability
//!
//! The tunnel engine never speaks SSH directly. It sees the relay as a
//! capability: connect with credentials, open a logical stream to a remote
//! `host:port`, probe liveness, close. `RusshConnector` provides it over a
//! real SSH session; tests plug in an in-process relay.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::SshError;
use super::handle_owner::{HandleController, PingResult};
use crate::config::TunnelConfig;

/// Byte stream returned by `RelaySession::open_stream`
pub trait RelayIo: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> RelayIo for T {}

pub type RelayStream = Pin<Box<dyn RelayIo>>;

/// An authenticated session with a relay host
#[async_trait]
pub trait RelaySession: Send + Sync {
    /// Dial `remote_addr` (`host:port`) through the relay
    async fn open_stream(
        &self,
        remote_addr: &str,
        originator: SocketAddr,
    ) -> Result<RelayStream, SshError>;

    /// Send one liveness probe
    async fn keepalive(&self) -> Result<(), SshError>;

    /// Close the session. Streams opened from it unwind.
    async fn close(&self);

    /// Token cancelled once the session is closed
    fn closed(&self) -> CancellationToken;
}

/// Dials relay hosts
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Open one authenticated session. `tunnel_id` is only used for logging.
    async fn connect(
        &self,
        tunnel_id: &str,
        config: &TunnelConfig,
        handshake_timeout: Duration,
    ) -> Result<Arc<dyn RelaySession>, SshError>;
}

/// Split `host:port`, accepting bracketed IPv6 hosts
pub fn split_host_port(addr: &str) -> Result<(String, u16), SshError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| SshError::InvalidAddress(addr.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(SshError::InvalidAddress(addr.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| SshError::InvalidAddress(addr.to_string()))?;
    Ok((host.to_string(), port))
}

/// Relay session backed by a russh handle owner task
pub struct RusshSession {
    controller: HandleController,
    closed: CancellationToken,
}

impl RusshSession {
    pub fn new(controller: HandleController) -> Self {
        let closed = CancellationToken::new();

        // The owner task announces teardown, whoever triggered it
        let mut disconnect_rx = controller.subscribe_disconnect();
        let token = closed.clone();
        tokio::spawn(async move {
            let _ = disconnect_rx.recv().await;
            token.cancel();
        });

        Self { controller, closed }
    }
}

#[async_trait]
impl RelaySession for RusshSession {
    async fn open_stream(
        &self,
        remote_addr: &str,
        originator: SocketAddr,
    ) -> Result<RelayStream, SshError> {
        let (host, port) = split_host_port(remote_addr)?;
        let channel = self
            .controller
            .open_direct_tcpip(
                &host,
                port as u32,
                &originator.ip().to_string(),
                originator.port() as u32,
            )
            .await?;
        debug!("Opened direct-tcpip channel to {}", remote_addr);
        Ok(Box::pin(channel.into_stream()))
    }

    async fn keepalive(&self) -> Result<(), SshError> {
        match self.controller.ping().await {
            PingResult::Ok => Ok(()),
            PingResult::Timeout => Err(SshError::Timeout("keepalive unanswered".into())),
            PingResult::IoError => Err(SshError::Disconnected),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        self.controller.disconnect().await;
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("10.0.0.5:5432").unwrap(),
            ("10.0.0.5".to_string(), 5432)
        );
        assert_eq!(
            split_host_port("db.internal:80").unwrap(),
            ("db.internal".to_string(), 80)
        );
        assert_eq!(split_host_port("[::1]:22").unwrap(), ("::1".to_string(), 22));
    }

    #[test]
    fn test_split_host_port_rejects_garbage() {
        assert!(matches!(
            split_host_port("no-port"),
            Err(SshError::InvalidAddress(_))
        ));
        assert!(matches!(
            split_host_port(":22"),
            Err(SshError::InvalidAddress(_))
        ));
        assert!(matches!(
            split_host_port("host:http"),
            Err(SshError::InvalidAddress(_))
        ));
    }
}
