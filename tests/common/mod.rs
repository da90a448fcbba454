//! Shared fixtures for tunnel integration tests.
//!
//! `DirectConnector` stands in for an SSH relay: its sessions "open a
//! channel" by dialing the destination over plain TCP, so the forwarding
//! engine runs over real sockets without an SSH server.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use xtunnel_lib::config::{TunnelConfig, TunnelSettings};
use xtunnel_lib::ssh::{RelayConnector, RelaySession, RelayStream, SshError};
use xtunnel_lib::TunnelEvent;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct DirectSession {
    healthy: AtomicBool,
    closed: CancellationToken,
    close_calls: AtomicU32,
}

impl DirectSession {
    fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            closed: CancellationToken::new(),
            close_calls: AtomicU32::new(0),
        }
    }

    /// Make every following keepalive probe fail
    pub fn break_keepalive(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    pub fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl RelaySession for DirectSession {
    async fn open_stream(
        &self,
        remote_addr: &str,
        _originator: SocketAddr,
    ) -> Result<RelayStream, SshError> {
        if self.closed.is_cancelled() {
            return Err(SshError::Disconnected);
        }
        let stream = TcpStream::connect(remote_addr)
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))?;
        Ok(Box::pin(stream))
    }

    async fn keepalive(&self) -> Result<(), SshError> {
        if self.healthy.load(Ordering::SeqCst) && !self.closed.is_cancelled() {
            Ok(())
        } else {
            Err(SshError::Timeout("keepalive unanswered".into()))
        }
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[derive(Default)]
pub struct DirectConnector {
    refuse: AtomicBool,
    delay: Duration,
    attempts: AtomicU32,
    sessions: Mutex<Vec<Arc<DirectSession>>>,
}

impl DirectConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refusing() -> Arc<Self> {
        let connector = Self::default();
        connector.refuse.store(true, Ordering::SeqCst);
        Arc::new(connector)
    }

    /// Every connect takes `delay` before the session is handed out
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<Arc<DirectSession>> {
        self.sessions.lock().clone()
    }

    pub fn latest_session(&self) -> Arc<DirectSession> {
        self.sessions
            .lock()
            .last()
            .cloned()
            .expect("no session opened yet")
    }
}

#[async_trait]
impl RelayConnector for DirectConnector {
    async fn connect(
        &self,
        _tunnel_id: &str,
        _config: &TunnelConfig,
        _handshake_timeout: Duration,
    ) -> Result<Arc<dyn RelaySession>, SshError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SshError::ConnectionFailed("connection refused".into()));
        }
        let session = Arc::new(DirectSession::new());
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

/// Settings with short retry delays and a keepalive that never fires
pub fn fast_settings() -> TunnelSettings {
    TunnelSettings {
        retry_delay_ms: 10,
        keepalive_interval_ms: 600_000,
        ..TunnelSettings::default()
    }
}

pub fn tunnel_config(local_addr: &str, remote_addr: SocketAddr) -> TunnelConfig {
    TunnelConfig::new(
        "deploy",
        "hunter2",
        local_addr,
        "relay.test:22",
        remote_addr.to_string(),
    )
}

/// Echo server on the far side of the relay; counts accepted connections
pub async fn spawn_echo_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
                let _ = write.shutdown().await;
            });
        }
    });

    (addr, accepted)
}

/// An address nothing listens on
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Send `payload` and read the same number of bytes back
pub async fn round_trip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("echo did not arrive")
        .unwrap();
    buf
}

/// Wait for the first event matching `pred`
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<TunnelEvent>, pred: F) -> TunnelEvent
where
    F: Fn(&TunnelEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {}", e),
            }
        }
    })
    .await
    .expect("expected event never arrived")
}
